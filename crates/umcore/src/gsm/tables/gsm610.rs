// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! GSM 06.10 full-rate speech frame layout and the subjective-importance
//! bit ordering used by the channel coder (GSM 05.03 table 2).
//!
//! Frame layout (GSM 06.10 1.7): 36 header bits — eight log-area-ratio
//! coefficients of 6,6,5,5,4,4,3,3 bits — then four 56-bit sub-frames of
//! LTP lag (7), LTP gain (2), RPE grid position (2), block amplitude Xmax
//! (6) and thirteen 3-bit RPE pulses. 260 bits total.

use crate::gsm::bits::BitVec;

/// Decoded payload size of a full-rate speech frame.
pub const FR_FRAME_BITS: usize = 260;

const HEADER_BITS: usize = 36;
const SUBFRAME_BITS: usize = 56;

/// (start, length) of the eight LAR coefficients within the frame.
const LAR_POSITIONS: [(usize, usize); 8] = [
    (0, 6),
    (6, 6),
    (12, 5),
    (17, 5),
    (22, 4),
    (26, 4),
    (30, 3),
    (33, 3),
];

/// The d-to-payload permutation: bit k of the coder's importance-ordered
/// `d` vector lives at payload position `order[k]`.
///
/// Built by scanning the frame parameters bit-plane by bit-plane from the
/// most significant downward, so the coder's class-1 region holds the
/// perceptually dominant bits of every parameter.
pub fn fr_bit_order() -> Vec<usize> {
    // Parameter list in frame order: (start, len).
    let mut params: Vec<(usize, usize)> = LAR_POSITIONS.to_vec();
    for f in 0..4 {
        let base = HEADER_BITS + f * SUBFRAME_BITS;
        params.push((base, 7)); // LTP lag
        params.push((base + 7, 2)); // LTP gain
        params.push((base + 9, 2)); // RPE grid
        params.push((base + 11, 6)); // Xmax
        for p in 0..13 {
            params.push((base + 17 + 3 * p, 3)); // RPE pulses
        }
    }
    let mut order = Vec::with_capacity(FR_FRAME_BITS);
    for level in (0..7).rev() {
        for &(start, len) in &params {
            if len > level {
                order.push(start + (len - 1 - level));
            }
        }
    }
    debug_assert_eq!(order.len(), FR_FRAME_BITS);
    order
}

/// Accessor view over a 260-bit full-rate speech frame.
pub struct FrFrame<'a> {
    pub bits: &'a mut BitVec,
}

impl<'a> FrFrame<'a> {
    pub fn new(bits: &'a mut BitVec) -> Self {
        debug_assert_eq!(bits.len(), FR_FRAME_BITS);
        FrFrame { bits }
    }

    pub fn set_lar(&mut self, n: usize, value: u64) {
        let (start, len) = LAR_POSITIONS[n - 1];
        self.bits.fill_field(start, value, len);
    }

    pub fn set_ltp_lag(&mut self, sub: usize, value: u64) {
        self.bits
            .fill_field(HEADER_BITS + SUBFRAME_BITS * sub, value, 7);
    }

    pub fn set_ltp_gain(&mut self, sub: usize, value: u64) {
        self.bits
            .fill_field(HEADER_BITS + SUBFRAME_BITS * sub + 7, value, 2);
    }

    pub fn set_rpe_grid(&mut self, sub: usize, value: u64) {
        self.bits
            .fill_field(HEADER_BITS + SUBFRAME_BITS * sub + 9, value, 2);
    }

    pub fn block_amplitude(&self, sub: usize) -> i64 {
        self.bits
            .peek_field(HEADER_BITS + SUBFRAME_BITS * sub + 11, 6) as i64
    }

    pub fn set_block_amplitude(&mut self, sub: usize, value: u64) {
        self.bits
            .fill_field(HEADER_BITS + SUBFRAME_BITS * sub + 11, value, 6);
    }

    pub fn set_rpe_pulse(&mut self, sub: usize, pulse: usize, value: u64) {
        debug_assert!((1..=13).contains(&pulse));
        self.bits.fill_field(
            HEADER_BITS + SUBFRAME_BITS * sub + 17 + 3 * (pulse - 1),
            value,
            3,
        );
    }
}

/// Overwrite `frame` with the canonical comfort silence frame of
/// GSM 06.11 section 6, table 1.
pub fn write_silence_frame(frame: &mut BitVec) {
    let mut sf = FrFrame::new(frame);
    sf.set_lar(1, 42);
    sf.set_lar(2, 39);
    sf.set_lar(3, 21);
    sf.set_lar(4, 10);
    sf.set_lar(5, 9);
    sf.set_lar(6, 4);
    sf.set_lar(7, 3);
    sf.set_lar(8, 2);
    const PULSES: [u64; 13] = [3, 4, 3, 4, 4, 3, 3, 3, 4, 4, 4, 3, 3];
    for f in 0..4 {
        sf.set_ltp_gain(f, 0);
        sf.set_ltp_lag(f, 40);
        sf.set_rpe_grid(f, 1);
        sf.set_block_amplitude(f, 0);
        for (p, &v) in PULSES.iter().enumerate() {
            sf.set_rpe_pulse(f, p + 1, v);
        }
    }
}

/// SID (silence descriptor) detection per GSM 06.12 5.2: a SID frame has
/// zeros in a fixed subset of the RPE pulse bits.
///
/// Detection is currently not consulted by the bad-frame path; DTX is not
/// advertised on the beacon.
pub fn is_sid_frame(frame: &BitVec) -> bool {
    // Two of the three bits of each RPE pulse are considered in the first
    // three sub-frames; in the fourth, bit one only for the first four
    // pulses.
    for f in 0..4 {
        let base = HEADER_BITS + SUBFRAME_BITS * f + 17;
        for p in 0..13 {
            let full = f < 3 || p < 4;
            if frame.bit(base + 3 * p) != 0 {
                return false;
            }
            if full && frame.bit(base + 3 * p + 1) != 0 {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_order_is_permutation() {
        let order = fr_bit_order();
        assert_eq!(order.len(), FR_FRAME_BITS);
        let mut seen = vec![false; FR_FRAME_BITS];
        for &p in &order {
            assert!(p < FR_FRAME_BITS);
            assert!(!seen[p], "position {p} repeated");
            seen[p] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_silence_frame_is_sid_shaped() {
        let mut frame = BitVec::zeroed(FR_FRAME_BITS);
        write_silence_frame(&mut frame);
        let f = FrFrame::new(&mut frame);
        assert_eq!(f.block_amplitude(0), 0);
        assert_eq!(f.block_amplitude(3), 0);
    }

    #[test]
    fn test_sid_detection() {
        let frame = BitVec::zeroed(FR_FRAME_BITS);
        assert!(is_sid_frame(&frame));
        let mut noisy = BitVec::zeroed(FR_FRAME_BITS);
        noisy.set_bit(HEADER_BITS + 17, 1);
        assert!(!is_sid_frame(&noisy));
    }
}
