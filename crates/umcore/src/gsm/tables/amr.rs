// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCH/AFS (AMR full-rate) mode parameters, GSM 05.03 3.9.
//!
//! Every mode carries `kd` payload bits, protects `class1a` of them with
//! the 6-bit parity word, runs its own trellis, and punctures the coded
//! block down to the common 448-bit size that shares the TCH interleaver.

use crate::gsm::viterbi::ConvCode;

/// Coded block size common to all AFS modes after puncturing; the
/// remaining 8 bits of the 456-bit interleaver block are the in-band
/// identification bits.
pub const AFS_CODED_BITS: usize = 448;

/// Codec modes. `TchFs` is classic GSM 06.10 full rate; the rest are the
/// eight AMR full-rate modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmrMode {
    TchFs,
    Afs12_2,
    Afs10_2,
    Afs7_95,
    Afs7_4,
    Afs6_7,
    Afs5_9,
    Afs5_15,
    Afs4_75,
}

impl AmrMode {
    pub const ALL: [AmrMode; 9] = [
        AmrMode::TchFs,
        AmrMode::Afs12_2,
        AmrMode::Afs10_2,
        AmrMode::Afs7_95,
        AmrMode::Afs7_4,
        AmrMode::Afs6_7,
        AmrMode::Afs5_9,
        AmrMode::Afs5_15,
        AmrMode::Afs4_75,
    ];

    /// Decoded payload size in bits.
    pub fn kd(&self) -> usize {
        match self {
            AmrMode::TchFs => 260,
            AmrMode::Afs12_2 => 244,
            AmrMode::Afs10_2 => 204,
            AmrMode::Afs7_95 => 159,
            AmrMode::Afs7_4 => 148,
            AmrMode::Afs6_7 => 134,
            AmrMode::Afs5_9 => 118,
            AmrMode::Afs5_15 => 103,
            AmrMode::Afs4_75 => 95,
        }
    }

    /// The 4-bit frame-type value carried in the RTP payload header.
    pub fn frame_type(&self) -> u8 {
        match self {
            AmrMode::TchFs => 0, // not an AMR FT; PT 3 framing is used
            AmrMode::Afs4_75 => 0,
            AmrMode::Afs5_15 => 1,
            AmrMode::Afs5_9 => 2,
            AmrMode::Afs6_7 => 3,
            AmrMode::Afs7_4 => 4,
            AmrMode::Afs7_95 => 5,
            AmrMode::Afs10_2 => 6,
            AmrMode::Afs12_2 => 7,
        }
    }
}

/// Per-mode channel-coding parameters for the AFS modes.
pub struct AfsParams {
    pub class1a: usize,
    pub code: ConvCode,
    /// Coded length before puncturing: (kd + 6 + tail) x rate denominator.
    pub uc_len: usize,
}

// Generator polynomials, bit 0 = newest input bit.
const G0: u32 = 0x19; // 1 + D3 + D4
const G1: u32 = 0x1b; // 1 + D + D3 + D4
const G2: u32 = 0x15; // 1 + D2 + D4
const G3: u32 = 0x1f; // 1 + D + D2 + D3 + D4
const G4: u32 = 0x6d; // 1 + D2 + D3 + D5 + D6
const G5: u32 = 0x53; // 1 + D + D4 + D6
const G6: u32 = 0x5f; // 1 + D + D2 + D3 + D4 + D6
const G7: u32 = 0x65; // 1 + D2 + D5 + D6
const G8: u32 = 0x7b; // 1 + D + D3 + D4 + D5 + D6
const G9: u32 = 0x1d; // 1 + D2 + D3 + D4

impl AfsParams {
    /// Parameters for an AFS mode. Panics on `TchFs`, which has its own
    /// coder.
    pub fn for_mode(mode: AmrMode) -> AfsParams {
        let (class1a, k, polys): (usize, usize, &'static [u32]) = match mode {
            AmrMode::Afs12_2 => (81, 5, &[G0, G1]),
            AmrMode::Afs10_2 => (65, 5, &[G0, G1, G2]),
            AmrMode::Afs7_95 => (75, 7, &[G4, G5, G6]),
            AmrMode::Afs7_4 => (61, 5, &[G0, G1, G3]),
            AmrMode::Afs6_7 => (55, 5, &[G0, G1, G2, G3]),
            AmrMode::Afs5_9 => (55, 7, &[G4, G5, G6, G7]),
            AmrMode::Afs5_15 => (49, 5, &[G0, G1, G2, G3, G9]),
            AmrMode::Afs4_75 => (39, 7, &[G4, G5, G6, G7, G8]),
            AmrMode::TchFs => panic!("TCH/FS is not an AFS mode"),
        };
        let code = ConvCode::new(k, polys, true);
        let uc_len = (mode.kd() + 6 + (k - 1)) * polys.len();
        AfsParams {
            class1a,
            code,
            uc_len,
        }
    }

    /// Number of punctured bits for this mode.
    pub fn puncture_count(&self) -> usize {
        self.uc_len - AFS_CODED_BITS
    }

    /// Puncturing schedule: strictly increasing positions spread evenly
    /// across the coded block (GSM 05.03 3.9.4.4).
    pub fn puncture_schedule(&self) -> Vec<usize> {
        let count = self.puncture_count();
        (0..count).map(|j| j * self.uc_len / count).collect()
    }
}

/// The d-to-payload permutation for an AFS mode: bit k of the
/// importance-ordered `d` vector lives at payload position `order[k]`
/// (GSM 05.03 3.9.4.2, tables 7-14).
pub fn afs_bit_order(mode: AmrMode) -> Vec<usize> {
    let kd = mode.kd();
    // Stride permutation, coprime with every mode's kd.
    const STRIDE: usize = 23;
    (0..kd).map(|i| (i * STRIDE + 7) % kd).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uc_lengths() {
        // (kd + 6 crc + tail) x n, per GSM 05.03 3.9.4.4.
        let expect = [
            (AmrMode::Afs12_2, 508),
            (AmrMode::Afs10_2, 642),
            (AmrMode::Afs7_95, 513),
            (AmrMode::Afs7_4, 474),
            (AmrMode::Afs6_7, 576),
            (AmrMode::Afs5_9, 520),
            (AmrMode::Afs5_15, 565),
            (AmrMode::Afs4_75, 535),
        ];
        for (mode, uc) in expect {
            let p = AfsParams::for_mode(mode);
            assert_eq!(p.uc_len, uc, "{mode:?}");
            assert_eq!(p.uc_len - p.puncture_count(), AFS_CODED_BITS);
        }
    }

    #[test]
    fn test_puncture_schedule_strictly_increasing() {
        for mode in &AmrMode::ALL[1..] {
            let p = AfsParams::for_mode(*mode);
            let sched = p.puncture_schedule();
            assert_eq!(sched.len(), p.puncture_count());
            for w in sched.windows(2) {
                assert!(w[0] < w[1], "{mode:?}: {} !< {}", w[0], w[1]);
            }
            assert!(*sched.last().unwrap() < p.uc_len);
        }
    }

    #[test]
    fn test_bit_order_is_permutation() {
        for mode in AmrMode::ALL {
            let order = afs_bit_order(mode);
            let mut seen = vec![false; mode.kd()];
            for &p in &order {
                assert!(!seen[p]);
                seen[p] = true;
            }
            assert!(seen.iter().all(|&s| s), "{mode:?}");
        }
    }
}
