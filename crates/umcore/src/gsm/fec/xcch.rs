// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The XCCH control-channel coder (GSM 05.03 4.1): SDCCH, SACCH, FACCH
//! and the broadcast channels all carry 184-bit frames through this path.
//!
//! Encode: d -> Fire parity -> rate-1/2 convolution -> 4x114 interleave ->
//! four normal bursts with both stealing bits set. Decode runs it
//! backwards, with erasure marking for missing bursts and the
//! ENCRYPT_MAYBE save/restore dance for ciphering phase-in.

use super::{DecoderCore, EncoderCore, L1FecShared};
use crate::gsm::bits::{BitVec, SoftVec};
use crate::gsm::burst::{RxBurst, TxBurst};
use crate::gsm::cipher::{cipher_count, decrypt_soft, EncryptionState};
use crate::gsm::l2::{L2Frame, L2_FRAME_BITS};
use crate::gsm::parity::BlockParity;
use crate::gsm::radio::{BurstSink, RadioSink};
use crate::gsm::sacch::MsPhysReport;
use crate::gsm::tables::training_sequence;
use crate::gsm::tdma::TdmaMapping;
use crate::gsm::time::GsmTime;
use crate::gsm::viterbi::GSM_RATE2;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;

/// Fill the parity and tail region of a 228-bit `u` whose `d` part is
/// ready, then convolutionally encode to 456 bits.
pub(crate) fn fec_encode_41(u: &mut BitVec) -> BitVec {
    debug_assert_eq!(u.len(), 228);
    let p = BlockParity::FIRE.parity(u.segment(0, 184));
    // The Fire parity is transmitted inverted (GSM 05.03 4.1.2).
    u.fill_field(184, !p & ((1 << 40) - 1), 40);
    u.fill_field(224, 0, 4);
    GSM_RATE2.encode(u)
}

/// The block-diagonal interleaver of GSM 05.03 4.1.4.
pub(crate) fn interleave_41(c: &BitVec, i: &mut [BitVec; 4]) {
    for k in 0..456 {
        let b = k % 4;
        let j = 2 * ((49 * k) % 57) + ((k % 8) / 4);
        i[b].set_bit(j, c.bit(k));
    }
}

/// Deinterleave `i` into a 456-bit soft block, resetting each consumed
/// position to an erasure so a later deinterleave after a missing burst
/// sees maximum uncertainty there.
pub(crate) fn deinterleave_41(i: &mut [SoftVec; 4]) -> SoftVec {
    let mut c = SoftVec::erased(456);
    for k in 0..456 {
        let b = k % 4;
        let j = 2 * ((49 * k) % 57) + ((k % 8) / 4);
        c.set(k, i[b].val(j));
        i[b].set(j, 0.5);
    }
    c
}

/// Decode a 456-bit soft block back to `u` and check the Fire syndrome.
/// Returns `(u, bit_error_count, parity_ok)`.
pub(crate) fn fec_decode_41(c: &SoftVec) -> (BitVec, u32, bool) {
    let (mut u, bec) = GSM_RATE2.decode(c, 228);
    // Undo the parity inversion before the syndrome check.
    let p = u.peek_field(184, 40);
    u.fill_field(184, !p & ((1 << 40) - 1), 40);
    let ok = BlockParity::FIRE.syndrome(u.segment(0, 224)) == 0;
    // Restore the on-air parity bits.
    u.fill_field(184, p, 40);
    (u, bec, ok)
}

struct EncBuffers {
    u: BitVec,
    i: [BitVec; 4],
    burst: TxBurst,
}

/// Encoder for the XCCH format. SACCH reuses it with a 16-bit physical
/// header in front of the L2 payload.
pub struct XcchEncoder {
    pub core: EncoderCore,
    header_offset: usize,
    buf: Mutex<EncBuffers>,
}

impl XcchEncoder {
    pub fn new(
        shared: Arc<L1FecShared>,
        radio: Arc<dyn RadioSink>,
        cn: u32,
        tn: u32,
        mapping: Arc<TdmaMapping>,
        header_offset: usize,
    ) -> Arc<Self> {
        let core = EncoderCore::new(shared, radio, cn, tn, mapping);
        let mut burst = TxBurst::new(GsmTime::new(0, tn));
        burst.set_training(&training_sequence(core.tsc));
        Arc::new(XcchEncoder {
            core,
            header_offset,
            buf: Mutex::new(EncBuffers {
                u: BitVec::zeroed(228),
                i: std::array::from_fn(|_| BitVec::zeroed(114)),
                burst,
            }),
        })
    }

    /// L2 entry point: encode and transmit one frame. Blocks briefly on
    /// the burst clock.
    pub fn write_high_side(&self, frame: &L2Frame) {
        if !self.core.enc_active() {
            log::info!("[{}] sending on non-active channel", self.core.label);
        }
        {
            let mut st = self.core.state.lock();
            self.core.resync(&mut st, false);
        }
        self.send_frame(frame, None);
    }

    /// Encode `frame` (optionally behind a SACCH physical header) into
    /// four bursts and ship them.
    pub(crate) fn send_frame(&self, frame: &L2Frame, phys_header: Option<(u64, u64)>) {
        log::debug!("[{}] sending {:?}", self.core.label, frame);
        if let Some(tap) = self.core.shared.gsmtap.as_ref() {
            if self.core.shared.ctx.config.hot().gsmtap_enabled {
                let st = self.core.state.lock();
                tap.write(
                    self.core.radio.arfcn(),
                    self.core.tn,
                    st.next_write_time.fnum(),
                    self.core.mapping.type_and_offset(),
                    self.core.mapping.repeat_length() > 51,
                    false,
                    &frame.bits().pack(),
                );
            }
        }

        let mut buf = self.buf.lock();
        // Copy the L2 frame into u and undo GSM's LSB-first octet order
        // over the d region (GSM 05.03 4.1.1).
        buf.u.fill(0);
        if let Some((power, ta)) = phys_header {
            buf.u.fill_field(0, power, 8);
            buf.u.fill_field(8, ta, 8);
        }
        let take = (184 - self.header_offset).min(L2_FRAME_BITS);
        let off = self.header_offset;
        buf.u.copy_from(off, &frame.bits().as_slice()[..take]);
        let mut d = BitVec::from_bits(buf.u.segment(0, 184));
        d.lsb8_msb();
        buf.u.copy_from(0, d.as_slice());

        let c = fec_encode_41(&mut buf.u);
        let mut planes: [BitVec; 4] = std::array::from_fn(|_| BitVec::zeroed(114));
        interleave_41(&c, &mut planes);
        buf.i = planes;
        self.transmit(&mut buf);
    }

    /// Ship the four interleaved planes, applying ciphering and the BER
    /// test hook per burst (GSM 05.03 4.1.5, 05.02 5.2.3).
    fn transmit(&self, buf: &mut EncBuffers) {
        let prev = self.core.state.lock().prev_write_time;
        self.core.wait_to_send(&prev);

        let hot = self.core.shared.ctx.config.hot();
        let mut rng = rand::rng();
        for b in 0..4 {
            let (next, crypto_on, alg, kc) = {
                let st = self.core.state.lock();
                let c = self.core.shared.crypto.lock();
                (
                    st.next_write_time,
                    c.downlink == EncryptionState::Yes,
                    c.algorithm,
                    c.kc,
                )
            };
            buf.burst.set_time(next);
            let mut e = buf.i[b].clone();
            if crypto_on {
                let ks = self
                    .core
                    .shared
                    .keystream
                    .keystream(alg, &kc, cipher_count(next.fnum()));
                for j in 0..114 {
                    e.set_bit(j, e.bit(j) ^ ks.downlink_bit(j));
                }
            }
            if hot.cch_ber > 0.0 {
                for j in 0..114 {
                    if rng.random::<f64>() < hot.cch_ber {
                        e.set_bit(j, e.bit(j) ^ 1);
                    }
                }
            }
            buf.burst.set_data(&e.as_slice()[0..57], &e.as_slice()[57..114]);
            // Stealing bits for a control channel (CS-1), GSM 05.03 4.2.5.
            buf.burst.set_hl(true);
            buf.burst.set_hu(true);
            self.core.radio.write_high_side_tx(&buf.burst, "xcch");
            let mut st = self.core.state.lock();
            self.core.roll_forward(&mut st);
        }
    }
}

struct DecBuffers {
    i: [SoftVec; 4],
    saved: [SoftVec; 4],
    fns: [u32; 4],
    read_time: GsmTime,
}

/// Decoder for the XCCH format. With `phys` attached it is a SACCH
/// decoder: every burst updates the physical measurement report and good
/// frames carry the power/TA physical header.
pub struct XcchDecoder {
    pub core: DecoderCore,
    header_offset: usize,
    pub phys: Option<Mutex<MsPhysReport>>,
    buf: Mutex<DecBuffers>,
}

impl XcchDecoder {
    pub fn new(
        shared: Arc<L1FecShared>,
        cn: u32,
        tn: u32,
        mapping: Arc<TdmaMapping>,
        header_offset: usize,
        phys: Option<MsPhysReport>,
    ) -> Arc<Self> {
        Arc::new(XcchDecoder {
            core: DecoderCore::new(shared, cn, tn, mapping),
            header_offset,
            phys: phys.map(Mutex::new),
            buf: Mutex::new(DecBuffers {
                i: std::array::from_fn(|_| SoftVec::erased(114)),
                saved: std::array::from_fn(|_| SoftVec::erased(114)),
                fns: [0; 4],
                read_time: GsmTime::default(),
            }),
        })
    }

    fn decrypt(&self, buf: &mut DecBuffers) {
        let c = self.core.shared.crypto.lock();
        for b in 0..4 {
            let ks = self
                .core
                .shared
                .keystream
                .keystream(c.algorithm, &c.kc, cipher_count(buf.fns[b]));
            decrypt_soft(&ks, &mut buf.i[b], 0);
        }
    }

    fn save_mi(buf: &mut DecBuffers) {
        for b in 0..4 {
            buf.saved[b] = buf.i[b].clone();
        }
    }

    fn restore_mi(buf: &mut DecBuffers) {
        for b in 0..4 {
            buf.i[b] = buf.saved[b].clone();
        }
    }

    /// Attempt a decode of the assembled block; honors the simulated-FER
    /// test knob.
    fn decode(&self, buf: &mut DecBuffers) -> Option<(BitVec, u32)> {
        let c = deinterleave_41(&mut buf.i);
        let (u, bec, ok) = fec_decode_41(&c);
        let hot = self.core.shared.ctx.config.hot();
        if hot.simulated_fer_uplink > 0
            && rand::rng().random_range(0..100) < hot.simulated_fer_uplink
        {
            log::info!(
                "[{}] simulating dropped uplink frame at {}",
                self.core.label,
                buf.read_time
            );
            return None;
        }
        if ok {
            Some((u, bec))
        } else {
            None
        }
    }

    fn handle_good_frame(&self, u: &BitVec, read_time: GsmTime) {
        let mut d = BitVec::from_bits(u.segment(0, 184));
        d.lsb8_msb();
        if let Some(phys) = self.phys.as_ref() {
            // SACCH physical header, GSM 04.04 6.1: MS power and timing
            // advance actuals. Read in host bit order, matching the
            // encoder writing it before the radio bit reversal.
            let mut p = phys.lock();
            p.record_actuals(
                d.peek_field(3, 5) as u8,
                d.peek_field(9, 7) as u8,
                self.core.shared.ctx.band,
            );
        }

        let hot = self.core.shared.ctx.config.hot();
        if hot.uplink_fuzzing_rate > 0
            && rand::rng().random_range(0..100) < hot.uplink_fuzzing_rate
        {
            let i = rand::rng().random_range(0..d.len());
            d.set_bit(i, d.bit(i) ^ 1);
            log::info!("[{}] fuzzing input frame, flipped bit {}", self.core.label, i);
        }
        if let Some(tap) = self.core.shared.gsmtap.as_ref() {
            if hot.gsmtap_enabled {
                tap.write(
                    self.core.cn,
                    self.core.tn,
                    read_time.fnum(),
                    self.core.mapping.type_and_offset(),
                    self.core.mapping.repeat_length() > 51,
                    true,
                    &d.pack(),
                );
            }
        }
        let l2 = BitVec::from_bits(d.segment(self.header_offset, 184 - self.header_offset));
        self.core.deliver_up(L2Frame::new(&l2));
    }

}

impl BurstSink for XcchDecoder {
    fn write_low_side_rx(&self, burst: &RxBurst) {
        if !self.core.dec_active() {
            log::debug!("[{}] not active, ignoring input", self.core.label);
            return;
        }
        if super::try_handover_access(&self.core, burst) {
            return;
        }
        self.core.count_snr(burst.snr());
        if let Some(phys) = self.phys.as_ref() {
            phys.lock()
                .process_burst(burst, &self.core.shared.ctx);
        }

        let Some(pos) = self.core.mapping.reverse_mapping(burst.time().fnum()) else {
            log::error!("[{}] demux misrouted burst {:?}", self.core.label, burst);
            return;
        };
        let b = pos % 4;
        let mut buf = self.buf.lock();
        buf.fns[b] = burst.time().fnum();
        buf.i[b].copy_from(0, burst.data1());
        buf.i[b].copy_from(57, burst.data2());
        if b == 0 {
            buf.read_time = burst.time();
        }
        if b != 3 {
            return;
        }

        let uplink_crypto = self.core.shared.crypto.lock().uplink;
        if uplink_crypto == EncryptionState::Maybe {
            Self::save_mi(&mut buf);
        }
        if uplink_crypto == EncryptionState::Yes {
            self.decrypt(&mut buf);
        }
        let read_time = buf.read_time;
        match self.decode(&mut buf) {
            Some((u, bec)) => {
                drop(buf);
                self.core.count_good_frame(1);
                self.core.count_ber(bec, 456);
                self.handle_good_frame(&u, read_time);
            }
            None if uplink_crypto == EncryptionState::Maybe => {
                // The first encrypted frame fails plain decode; try again
                // with the keystream applied and latch on success.
                log::debug!("[{}] retrying decode with decryption", self.core.label);
                Self::restore_mi(&mut buf);
                self.decrypt(&mut buf);
                match self.decode(&mut buf) {
                    Some((u, bec)) => {
                        drop(buf);
                        log::debug!("[{}] decrypt success on 2nd try", self.core.label);
                        self.core.shared.latch_encrypted();
                        self.core.count_good_frame(1);
                        self.core.count_ber(bec, 456);
                        self.handle_good_frame(&u, read_time);
                    }
                    None => {
                        drop(buf);
                        self.bad_frame();
                    }
                }
            }
            None => {
                drop(buf);
                self.bad_frame();
            }
        }
    }
}

impl XcchDecoder {
    fn bad_frame(&self) {
        if let Some(phys) = self.phys.as_ref() {
            let bump = self
                .core
                .shared
                .ctx
                .config
                .get_float("Control.SACCHTimeout.BumpDown");
            phys.lock().rssi_bump_down(bump as f32);
        }
        self.core.count_bad_frame(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gsm::bits::SoftVec;

    fn random_frame(seed: u64) -> BitVec {
        let mut rng = fastrand::Rng::with_seed(seed);
        BitVec::from_bits(&(0..184).map(|_| rng.u8(0..2)).collect::<Vec<_>>())
    }

    #[test]
    fn test_fec41_roundtrip() {
        for seed in 0..5 {
            let d = random_frame(seed);
            let mut u = BitVec::zeroed(228);
            u.copy_from(0, d.as_slice());
            let c = fec_encode_41(&mut u);
            let soft = SoftVec::from_bits(c.as_slice());
            let (u2, bec, ok) = fec_decode_41(&soft);
            assert!(ok, "parity failed on clean block");
            assert_eq!(bec, 0);
            assert_eq!(u2.segment(0, 184), d.as_slice());
        }
    }

    #[test]
    fn test_interleaver_is_bijective() {
        // pi(k) = (k%4, 2((49k)%57) + (k%8)/4) must hit every (B, j) once.
        let mut seen = [[false; 114]; 4];
        for k in 0..456usize {
            let b = k % 4;
            let j = 2 * ((49 * k) % 57) + ((k % 8) / 4);
            assert!(!seen[b][j], "collision at k={k}");
            seen[b][j] = true;
        }
        assert!(seen.iter().flatten().all(|&s| s));
    }

    #[test]
    fn test_deinterleave_marks_erasures() {
        let d = random_frame(3);
        let mut u = BitVec::zeroed(228);
        u.copy_from(0, d.as_slice());
        let c = fec_encode_41(&mut u);
        let mut planes: [SoftVec; 4] = std::array::from_fn(|_| SoftVec::erased(114));
        let mut hard: [BitVec; 4] = std::array::from_fn(|_| BitVec::zeroed(114));
        interleave_41(&c, &mut hard);
        for b in 0..4 {
            planes[b] = SoftVec::from_bits(hard[b].as_slice());
        }
        let _ = deinterleave_41(&mut planes);
        // After consumption every plane position is an erasure again.
        for plane in &planes {
            assert!(plane.as_slice().iter().all(|&v| (v - 0.5).abs() < 1e-6));
        }
    }

    #[test]
    fn test_missing_burst_still_decodes() {
        // Drop one of the four bursts entirely; the rate-1/2 code usually
        // recovers a quarter-erased block on clean input.
        let d = random_frame(9);
        let mut u = BitVec::zeroed(228);
        u.copy_from(0, d.as_slice());
        let c = fec_encode_41(&mut u);
        let mut planes: [SoftVec; 4] = std::array::from_fn(|_| SoftVec::erased(114));
        for k in 0..456usize {
            let b = k % 4;
            let j = 2 * ((49 * k) % 57) + ((k % 8) / 4);
            if b != 2 {
                planes[b].set(j, f32::from(c.bit(k)));
            }
        }
        let soft = deinterleave_41(&mut planes);
        let (u2, _bec, ok) = fec_decode_41(&soft);
        assert!(ok, "erasure decode failed");
        assert_eq!(u2.segment(0, 184), d.as_slice());
    }
}
