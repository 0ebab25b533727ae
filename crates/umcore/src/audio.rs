// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Audio frames in RTP payload format.
//!
//! The vocoder side of the TCH and the RTP session exchange
//! [`AudioFrame`]s: the codec payload already wrapped in its RTP payload
//! header. GSM full rate uses the static payload type 3 framing — a 4-bit
//! signature 0xD plus 260 bits, 33 bytes. AMR uses the octet-misaligned
//! bandwidth-efficient framing — 4-bit CMR, then a single table-of-
//! contents entry F(0)/FT/Q(1), then the mode's payload bits.

use crate::gsm::bits::BitVec;
use crate::gsm::tables::amr::AmrMode;

/// GSM full-rate RTP frame signature nibble.
const FR_MAGIC: u64 = 0xd;

/// One 20 ms audio frame as carried in an RTP packet body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioFrame {
    bits: BitVec,
}

impl AudioFrame {
    /// Wrap a decoded 260-bit GSM FR frame.
    pub fn from_fr_payload(payload: &BitVec) -> Self {
        debug_assert_eq!(payload.len(), 260);
        let mut bits = BitVec::zeroed(264);
        bits.fill_field(0, FR_MAGIC, 4);
        bits.copy_from(4, payload.as_slice());
        AudioFrame { bits }
    }

    /// Wrap a decoded AMR frame for `mode`; Q marks the frame good.
    pub fn from_amr_payload(mode: AmrMode, payload: &BitVec, good: bool) -> Self {
        debug_assert_eq!(payload.len(), mode.kd());
        let mut bits = BitVec::zeroed(10 + payload.len());
        bits.fill_field(0, u64::from(mode.frame_type()), 4); // CMR: request same mode
        bits.fill_field(4, 0, 1); // F: last entry
        bits.fill_field(5, u64::from(mode.frame_type()), 4); // FT
        bits.fill_field(9, u64::from(good), 1); // Q
        bits.copy_from(10, payload.as_slice());
        AudioFrame { bits }
    }

    /// Wrap a payload for whichever mode is active.
    pub fn from_payload(mode: AmrMode, payload: &BitVec) -> Self {
        match mode {
            AmrMode::TchFs => AudioFrame::from_fr_payload(payload),
            _ => AudioFrame::from_amr_payload(mode, payload, true),
        }
    }

    /// Rebuild from RTP packet bytes.
    pub fn from_bytes(bytes: &[u8], mode: AmrMode) -> Option<Self> {
        let want = Self::frame_bits(mode);
        if bytes.len() * 8 < want {
            return None;
        }
        Some(AudioFrame {
            bits: BitVec::unpack(bytes, want),
        })
    }

    fn frame_bits(mode: AmrMode) -> usize {
        match mode {
            AmrMode::TchFs => 264,
            m => 10 + m.kd(),
        }
    }

    /// Extract the codec payload for `mode`. None when the header does not
    /// match the expected framing.
    pub fn payload(&self, mode: AmrMode) -> Option<BitVec> {
        match mode {
            AmrMode::TchFs => {
                if self.bits.len() != 264 || self.bits.peek_field(0, 4) != FR_MAGIC {
                    return None;
                }
                Some(BitVec::from_bits(self.bits.segment(4, 260)))
            }
            m => {
                if self.bits.len() != 10 + m.kd() {
                    return None;
                }
                if self.bits.peek_field(5, 4) != u64::from(m.frame_type()) {
                    return None;
                }
                Some(BitVec::from_bits(self.bits.segment(10, m.kd())))
            }
        }
    }

    /// Packed wire bytes (zero-padded to the octet boundary).
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.pack()
    }

    pub fn size_bytes(&self) -> usize {
        self.bits.len().div_ceil(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fr_frame_is_33_bytes() {
        let payload = BitVec::zeroed(260);
        let f = AudioFrame::from_fr_payload(&payload);
        assert_eq!(f.size_bytes(), 33);
        assert_eq!(f.to_bytes()[0] >> 4, 0xd);
    }

    #[test]
    fn test_payload_roundtrip_all_modes() {
        for mode in AmrMode::ALL {
            let mut payload = BitVec::zeroed(mode.kd());
            for i in (0..payload.len()).step_by(3) {
                payload.set_bit(i, 1);
            }
            let f = AudioFrame::from_payload(mode, &payload);
            let back = f.payload(mode).expect("header should match");
            assert_eq!(back, payload, "{mode:?}");
            let wire = f.to_bytes();
            let f2 = AudioFrame::from_bytes(&wire, mode).unwrap();
            assert_eq!(f2.payload(mode).unwrap(), payload);
        }
    }

    #[test]
    fn test_wrong_mode_rejected() {
        let payload = BitVec::zeroed(AmrMode::Afs12_2.kd());
        let f = AudioFrame::from_amr_payload(AmrMode::Afs12_2, &payload, true);
        assert!(f.payload(AmrMode::Afs4_75).is_none());
    }
}
