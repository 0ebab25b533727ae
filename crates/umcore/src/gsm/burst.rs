// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Radio bursts.
//!
//! A normal burst: 3 tail bits, 57 data, the lower stealing flag, 26
//! training bits, the upper stealing flag, 57 data, 3 tail bits (plus the
//! 8.25-bit guard the transceiver owns).

use super::bits::{BitVec, SoftVec};
use super::time::GsmTime;
use crate::config::{HL_INDEX, HU_INDEX, SLOT_LEN, TRAINING_OFFSET};
use std::fmt;

/// One downlink timeslot of hard channel bits.
#[derive(Clone)]
pub struct TxBurst {
    bits: BitVec,
    time: GsmTime,
}

impl TxBurst {
    /// An empty burst with zeroed tails.
    pub fn new(time: GsmTime) -> Self {
        TxBurst {
            bits: BitVec::zeroed(SLOT_LEN),
            time,
        }
    }

    /// Wrap an existing 148-bit pattern.
    pub fn from_bits(bits: BitVec, time: GsmTime) -> Self {
        debug_assert_eq!(bits.len(), SLOT_LEN);
        TxBurst { bits, time }
    }

    pub fn time(&self) -> GsmTime {
        self.time
    }

    pub fn set_time(&mut self, time: GsmTime) {
        self.time = time;
    }

    pub fn bits(&self) -> &BitVec {
        &self.bits
    }

    pub fn bits_mut(&mut self) -> &mut BitVec {
        &mut self.bits
    }

    /// Set the upper stealing bit.
    pub fn set_hu(&mut self, v: bool) {
        self.bits.set_bit(HU_INDEX, u8::from(v));
    }

    /// Set the lower stealing bit.
    pub fn set_hl(&mut self, v: bool) {
        self.bits.set_bit(HL_INDEX, u8::from(v));
    }

    /// Write the training sequence at its normal-burst position.
    pub fn set_training(&mut self, ts: &BitVec) {
        debug_assert_eq!(ts.len(), 26);
        self.bits.copy_from(TRAINING_OFFSET, ts.as_slice());
    }

    /// Write the two 57-bit data fields.
    pub fn set_data(&mut self, data1: &[u8], data2: &[u8]) {
        debug_assert_eq!(data1.len(), 57);
        debug_assert_eq!(data2.len(), 57);
        self.bits.copy_from(3, data1);
        self.bits.copy_from(88, data2);
    }
}

impl fmt::Debug for TxBurst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxBurst time={} data=({:?})", self.time, self.bits)
    }
}

/// One uplink timeslot of soft channel bits with its measurements.
#[derive(Clone)]
pub struct RxBurst {
    soft: SoftVec,
    time: GsmTime,
    /// dB below full scale.
    rssi: f32,
    /// Symbol periods, negative means early.
    timing_error: f32,
    /// Demodulator SNR estimate, linear.
    snr: f32,
}

impl RxBurst {
    pub fn new(soft: SoftVec, time: GsmTime, rssi: f32, timing_error: f32, snr: f32) -> Self {
        debug_assert_eq!(soft.len(), SLOT_LEN);
        RxBurst {
            soft,
            time,
            rssi,
            timing_error,
            snr,
        }
    }

    /// A full-confidence copy of a TxBurst, for loopback tests.
    pub fn from_tx(tx: &TxBurst, rssi: f32, timing_error: f32) -> Self {
        RxBurst {
            soft: SoftVec::from_bits(tx.bits().as_slice()),
            time: tx.time(),
            rssi,
            timing_error,
            snr: 10.0,
        }
    }

    pub fn time(&self) -> GsmTime {
        self.time
    }

    pub fn rssi(&self) -> f32 {
        self.rssi
    }

    pub fn timing_error(&self) -> f32 {
        self.timing_error
    }

    pub fn snr(&self) -> f32 {
        self.snr
    }

    pub fn soft(&self) -> &SoftVec {
        &self.soft
    }

    /// First 57-bit data field.
    pub fn data1(&self) -> &[f32] {
        self.soft.segment(3, 57)
    }

    /// Second 57-bit data field.
    pub fn data2(&self) -> &[f32] {
        self.soft.segment(88, 57)
    }

    /// Upper stealing bit, hard-sliced.
    pub fn hu(&self) -> bool {
        self.soft.val(HU_INDEX) > 0.5
    }

    /// Lower stealing bit, hard-sliced.
    pub fn hl(&self) -> bool {
        self.soft.val(HL_INDEX) > 0.5
    }

    /// An access-burst segment (RACH and handover access decode from
    /// offset 49, 36 coded bits).
    pub fn access_segment(&self) -> &[f32] {
        self.soft.segment(49, 36)
    }
}

impl fmt::Debug for RxBurst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RxBurst time={} RSSI={} timing={}",
            self.time, self.rssi, self.timing_error
        )
    }
}
