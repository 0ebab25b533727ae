// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RACH and handover access-burst decoding (GSM 05.03 4.6, 4.9).
//!
//! An access burst carries 8 payload bits and 6 parity bits XOR'd with
//! the BSIC, convolutionally coded into 36 channel bits. With 4 tail bits
//! and the 6-bit parity the false-alarm rate on random input is 2^-10.

use super::{DecoderCore, L1FecShared};
use crate::gsm::burst::RxBurst;
use crate::gsm::parity::BlockParity;
use crate::gsm::radio::BurstSink;
use crate::gsm::tdma::TdmaMapping;
use crate::gsm::time::GsmTime;
use crate::gsm::viterbi::GSM_RATE2;
use crate::gsm::bits::{BitVec, SoftVec};
use std::sync::Arc;

/// Decode 36 soft access-burst bits against `bsic`. Returns the RA byte
/// and the corrected-bit count, or None when the tail or parity check
/// fails.
pub fn decode_access_burst(soft36: &[f32], bsic: u8) -> Option<(u8, u32)> {
    debug_assert_eq!(soft36.len(), 36);
    let (u, bec) = GSM_RATE2.decode(&SoftVec::from_vals(soft36), 18);

    // Tail bits must be zero.
    if u.peek_field(14, 4) != 0 {
        return None;
    }
    // The parity word is sent inverted and XOR'd with the BSIC.
    let sent_parity = (!u.peek_field(8, 6)) & 0x3f;
    let check_parity = BlockParity::RACH.parity(u.segment(0, 8));
    let encoded_bsic = (sent_parity ^ check_parity) & 0x3f;
    if encoded_bsic != u64::from(bsic & 0x3f) {
        return None;
    }
    let mut d = BitVec::from_bits(u.segment(0, 8));
    d.lsb8_msb();
    Some((d.peek_field(0, 8) as u8, bec))
}

/// Encode an RA byte into 36 channel bits; the inverse of
/// [`decode_access_burst`], used by tests and the loopback harness.
pub fn encode_access_burst(ra: u8, bsic: u8) -> BitVec {
    let mut d = BitVec::zeroed(8);
    d.fill_field(0, u64::from(ra), 8);
    d.lsb8_msb();
    let parity = BlockParity::RACH.parity(d.as_slice());
    let mut u = BitVec::zeroed(18);
    u.copy_from(0, d.as_slice());
    u.fill_field(8, (!(parity ^ u64::from(bsic & 0x3f))) & 0x3f, 6);
    u.fill_field(14, 0, 4);
    GSM_RATE2.encode(&u)
}

/// A detected channel request, handed to the access-grant responder.
#[derive(Debug, Clone)]
pub struct ChannelRequest {
    pub ra: u8,
    pub when: GsmTime,
    pub rssi: f32,
    pub timing_error: f32,
    pub tn: u32,
}

/// Consumer of good RACH bursts (the access-grant responder in L3).
pub trait AccessGrantResponder: Send + Sync {
    fn channel_request(&self, req: ChannelRequest);
}

/// The RACH decoder; fed straight from the radio demux.
pub struct RachDecoder {
    pub core: DecoderCore,
    responder: Arc<dyn AccessGrantResponder>,
}

impl RachDecoder {
    pub fn new(
        shared: Arc<L1FecShared>,
        tn: u32,
        mapping: Arc<TdmaMapping>,
        responder: Arc<dyn AccessGrantResponder>,
    ) -> Arc<Self> {
        let core = DecoderCore::new(shared, 0, tn, mapping);
        core.dec_start();
        Arc::new(RachDecoder { core, responder })
    }
}

impl BurstSink for RachDecoder {
    fn write_low_side_rx(&self, burst: &RxBurst) {
        let bsic = self.core.shared.ctx.bsic();
        match decode_access_burst(burst.access_segment(), bsic) {
            Some((ra, bec)) => {
                self.core.count_good_frame(1);
                self.core.count_ber(bec, 36);
                log::info!(
                    "[{}] received RA={} at {} RSSI={} timingError={}",
                    self.core.label,
                    ra,
                    burst.time(),
                    burst.rssi(),
                    burst.timing_error()
                );
                self.responder.channel_request(ChannelRequest {
                    ra,
                    when: burst.time(),
                    rssi: burst.rssi(),
                    timing_error: burst.timing_error(),
                    tn: self.core.tn,
                });
            }
            None => self.core.count_bad_frame(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_burst_roundtrip() {
        for ra in [0u8, 1, 0x55, 0xaa, 0xff] {
            let c = encode_access_burst(ra, 0x2a);
            let soft: Vec<f32> = c.as_slice().iter().map(|&b| f32::from(b)).collect();
            let (got, bec) = decode_access_burst(&soft, 0x2a).expect("clean burst must decode");
            assert_eq!(got, ra);
            assert_eq!(bec, 0);
        }
    }

    #[test]
    fn test_wrong_bsic_rejected() {
        let c = encode_access_burst(0x17, 0x2a);
        let soft: Vec<f32> = c.as_slice().iter().map(|&b| f32::from(b)).collect();
        assert!(decode_access_burst(&soft, 0x2b).is_none());
    }

    #[test]
    fn test_false_alarm_rate() {
        // 10000 random soft vectors with BSIC=7: expect on the order of
        // ten false detections (1/1024 each), well under twenty.
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        let mut hits = 0;
        for _ in 0..10_000 {
            let soft: Vec<f32> = (0..36).map(|_| rng.f32()).collect();
            if decode_access_burst(&soft, 7).is_some() {
                hits += 1;
            }
        }
        assert!(hits < 20, "false-alarm count {hits} out of bounds");
    }
}
