// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Generator-only downlink channels: FCCH, SCH, BCCH and the CBCH.
//!
//! These have no decoder half. FCCH and SCH synthesize their bursts from
//! the TDMA clock; BCCH replays the system-information frames; CBCH is an
//! SDCCH-format channel whose blocks must align to (FN/51)%8 == 0.

use super::xcch::XcchEncoder;
use super::{EncoderCore, L1FecShared};
use crate::gsm::bits::BitVec;
use crate::gsm::burst::TxBurst;
use crate::gsm::l2::L2Frame;
use crate::gsm::parity::BlockParity;
use crate::gsm::radio::RadioSink;
use crate::gsm::tables::sch_training;
use crate::gsm::tdma::TdmaMapping;
use crate::gsm::time::GsmTime;
use crate::gsm::viterbi::GSM_RATE2;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;

/// A generator encoder's service pass; the spawned loop just repeats it.
pub trait Generator: Send + Sync + 'static {
    fn core(&self) -> &EncoderCore;
    fn service_pass(&self);
}

/// Spawn the service thread for a generator channel.
pub fn spawn_generator<G: Generator>(gen: Arc<G>) {
    let label = gen.core().label.clone();
    std::thread::Builder::new()
        .name(format!("gen-{label}"))
        .spawn(move || {
            while !gen.core().shared.ctx.shutting_down() {
                gen.service_pass();
            }
        })
        .expect("spawning generator thread");
}

/// The frequency-correction channel: five all-zero bursts (a pure sine
/// over GMSK) at the mapped positions, then sleep a second.
pub struct FcchEncoder {
    pub core: EncoderCore,
}

impl FcchEncoder {
    pub fn new(
        shared: Arc<L1FecShared>,
        radio: Arc<dyn RadioSink>,
        tn: u32,
        mapping: Arc<TdmaMapping>,
    ) -> Arc<Self> {
        let core = EncoderCore::new(shared, radio, 0, tn, mapping);
        core.enc_start();
        Arc::new(FcchEncoder { core })
    }
}

impl Generator for FcchEncoder {
    fn core(&self) -> &EncoderCore {
        &self.core
    }

    fn service_pass(&self) {
        let prev = {
            let mut st = self.core.state.lock();
            self.core.resync(&mut st, false);
            st.prev_write_time
        };
        self.core.wait_to_send(&prev);
        let burst_bits = BitVec::zeroed(148);
        for _ in 0..5 {
            let mut st = self.core.state.lock();
            let burst = TxBurst::from_bits(burst_bits.clone(), st.next_write_time);
            self.core.radio.write_high_side_tx(&burst, "FCCH");
            self.core.roll_forward(&mut st);
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// The synchronization channel (GSM 05.03 4.7, 05.02 5.2.5): BSIC and the
/// reduced TDMA time, 10-bit parity, rate-1/2 coded into the two 39-bit
/// halves around the extended training sequence.
pub struct SchEncoder {
    pub core: EncoderCore,
    buf: Mutex<TxBurst>,
}

impl SchEncoder {
    pub fn new(
        shared: Arc<L1FecShared>,
        radio: Arc<dyn RadioSink>,
        tn: u32,
        mapping: Arc<TdmaMapping>,
    ) -> Arc<Self> {
        let core = EncoderCore::new(shared, radio, 0, tn, mapping);
        core.enc_start();
        let mut burst = TxBurst::new(GsmTime::new(0, tn));
        burst.bits_mut().copy_from(42, sch_training().as_slice());
        Arc::new(SchEncoder {
            core,
            buf: Mutex::new(burst),
        })
    }

    /// Build the 25-bit SCH payload for frame `t` (GSM 04.08 9.1.30).
    fn sch_data(&self, t: &GsmTime) -> BitVec {
        let mut d = BitVec::zeroed(25);
        let mut wp = 0;
        for (val, len) in [
            (u64::from(self.core.shared.ctx.bsic()), 6usize),
            (u64::from(t.t1()), 11),
            (u64::from(t.t2()), 5),
            (u64::from(t.t3p()), 3),
        ] {
            d.fill_field(wp, val, len);
            wp += len;
        }
        d.lsb8_msb();
        d
    }
}

impl Generator for SchEncoder {
    fn core(&self) -> &EncoderCore {
        &self.core
    }

    fn service_pass(&self) {
        let (prev, next) = {
            let mut st = self.core.state.lock();
            self.core.resync(&mut st, false);
            (st.prev_write_time, st.next_write_time)
        };
        self.core.wait_to_send(&prev);

        let d = self.sch_data(&next);
        let mut u = BitVec::zeroed(39);
        u.copy_from(0, d.as_slice());
        let p = BlockParity::SCH.parity(d.as_slice());
        u.fill_field(25, !p & 0x3ff, 10);
        u.fill_field(35, 0, 4);
        let e = GSM_RATE2.encode(&u);
        debug_assert_eq!(e.len(), 78);

        let mut burst = self.buf.lock();
        burst.set_time(next);
        burst.bits_mut().copy_from(3, e.segment(0, 39));
        burst.bits_mut().copy_from(106, e.segment(39, 39));
        self.core.radio.write_high_side_tx(&burst, "SCH");
        let mut st = self.core.state.lock();
        self.core.roll_forward(&mut st);
    }
}

/// The system-information frames broadcast on the BCCH. L3 rebuilds these
/// when the beacon configuration changes.
pub struct SiFrames {
    pub si1: L2Frame,
    pub si2: L2Frame,
    pub si3: L2Frame,
    pub si4: L2Frame,
    /// Present only with GPRS enabled; broadcast in the TC=4 slot.
    pub si13: Option<L2Frame>,
}

/// BCCH: an XCCH encoder replaying SI frames by TC position
/// (GSM 05.02 6.3.1.3).
pub struct BcchEncoder {
    pub inner: Arc<XcchEncoder>,
    si: Arc<RwLock<SiFrames>>,
}

impl BcchEncoder {
    pub fn new(inner: Arc<XcchEncoder>, si: Arc<RwLock<SiFrames>>) -> Arc<Self> {
        inner.core.enc_start();
        Arc::new(BcchEncoder { inner, si })
    }
}

impl Generator for BcchEncoder {
    fn core(&self) -> &EncoderCore {
        &self.inner.core
    }

    fn service_pass(&self) {
        let tc = {
            let mut st = self.inner.core.state.lock();
            self.inner.core.resync(&mut st, false);
            st.next_write_time.tc()
        };
        let si = self.si.read();
        let frame = match tc {
            0 => si.si1.clone(),
            1 | 5 => si.si2.clone(),
            3 | 7 => si.si4.clone(),
            4 => si.si13.clone().unwrap_or_else(|| si.si3.clone()),
            _ => si.si3.clone(),
        };
        drop(si);
        // The XCCH path blocks on the burst clock, pacing this loop.
        self.inner.send_frame(&frame, None);
    }
}

/// CBCH: SDCCH encoding with the block start pinned to (FN/51)%8 == 0.
/// The first frame of each SMSCB block carries sequence number zero.
pub struct CbchEncoder {
    pub inner: Arc<XcchEncoder>,
}

impl CbchEncoder {
    pub fn new(inner: Arc<XcchEncoder>) -> Arc<Self> {
        Arc::new(CbchEncoder { inner })
    }

    pub fn write_high_side(&self, frame: &L2Frame) {
        if frame.bits().peek_field(4, 4) == 0 {
            let mut st = self.inner.core.state.lock();
            let first = self.inner.core.mapping.frame_mapping(0);
            st.next_write_time.roll_forward(first, 51 * 8);
        }
        self.inner.send_frame(frame, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::gsm::radio::NullRadio;
    use crate::gsm::tdma::sch_mapping;

    #[test]
    fn test_sch_payload_fields() {
        let ctx = test_context();
        let shared = L1FecShared::new(ctx, None);
        let enc = SchEncoder::new(
            shared,
            Arc::new(NullRadio),
            0,
            Arc::new(sch_mapping()),
        );
        // Frame 21 of superframe 5: t3 = 21 -> t3p = 2.
        let t = GsmTime::new(5 * 26 * 51 + 21, 0);
        let mut d = enc.sch_data(&t);
        // Undo the radio bit order and check the packed fields.
        d.lsb8_msb();
        assert_eq!(d.peek_field(0, 6), u64::from(enc.core.shared.ctx.bsic()));
        assert_eq!(d.peek_field(6, 11), 5);
        assert_eq!(d.peek_field(17, 5), u64::from(t.t2()));
        assert_eq!(d.peek_field(22, 3), 2);
    }
}
