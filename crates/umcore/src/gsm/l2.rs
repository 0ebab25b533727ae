// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! L2 (LAPDm) frames as seen by layer 1, GSM 04.06.
//!
//! Layer 1 does not run the LAPDm state machines — it carries 23-byte
//! frames up and down with a primitive attached, and peeks at the header
//! fields the SAP multiplexer routes on.

use super::bits::BitVec;
use rand::Rng;
use std::fmt;

/// Interlayer primitives (GSM 04.04 4, 04.06 4, 04.07 10). The full
/// req/conf/ind/ack handshake is not needed in a tightly integrated stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    /// Plain data at the L1<->L2 interface.
    L2Data,
    /// SABM established by the handset; sent up from LAPDm.
    L3EstablishIndication,
    /// Normal release indication flowing up.
    L3ReleaseIndication,
    /// Loss-of-contact indication from LAPDm.
    MdlErrorIndication,
    /// Release request flowing down.
    L3ReleaseRequest,
    /// Immediate channel teardown flowing down.
    L3HardReleaseRequest,
    /// Datagram-mode data.
    L3UnitData,
    /// First good burst detected on a newly opened channel.
    PhConnect,
    /// Inbound handover access burst detected by L1.
    HandoverAccess,
}

/// Service access point identifiers defined on the Um interface.
/// SAPI 0 carries call control and RR, SAPI 3 carries SMS.
pub const SAPI0: u8 = 0;
pub const SAPI3: u8 = 3;

/// LAPDm control-field formats (GSM 04.06 3.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFormat {
    I,
    S,
    U,
}

/// LAPDm frame types (GSM 04.06 3.8.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Ui,
    Sabm,
    Ua,
    Dm,
    Disc,
    Rr,
    Rnr,
    Rej,
    I,
    Bogus,
}

/// The LAPDm idle-fill octet pattern (GSM 04.06 2.2).
const FILL_PATTERN: [u8; 8] = [0, 0, 1, 0, 1, 0, 1, 1];

/// A 23-byte L2 frame plus its primitive. Bit order is MSB-first per
/// octet; [`BitVec::lsb8_msb`] happens at the radio edge.
#[derive(Clone)]
pub struct L2Frame {
    bits: BitVec,
    primitive: Primitive,
}

pub const L2_FRAME_BITS: usize = 23 * 8;

impl L2Frame {
    /// A data frame holding `payload` followed by idle fill.
    pub fn new(payload: &BitVec) -> Self {
        let mut f = L2Frame::empty(Primitive::L2Data);
        debug_assert!(payload.len() <= L2_FRAME_BITS);
        f.bits.copy_from(0, payload.as_slice());
        f
    }

    /// A bare primitive with idle fill (carries no payload).
    pub fn empty(primitive: Primitive) -> Self {
        let mut bits = BitVec::zeroed(L2_FRAME_BITS);
        for i in 0..L2_FRAME_BITS {
            bits.set_bit(i, FILL_PATTERN[i % 8]);
        }
        L2Frame { bits, primitive }
    }

    pub fn primitive(&self) -> Primitive {
        self.primitive
    }

    pub fn set_primitive(&mut self, p: Primitive) {
        self.primitive = p;
    }

    pub fn bits(&self) -> &BitVec {
        &self.bits
    }

    pub fn bits_mut(&mut self) -> &mut BitVec {
        &mut self.bits
    }

    /// SAPI from the address octet, GSM 04.06 3.2 (MSB-first packing).
    pub fn sapi(&self) -> u8 {
        self.bits.peek_field(3, 3) as u8
    }

    /// Link protocol discriminator, GSM 04.06 3.2.
    pub fn lpd(&self) -> u8 {
        self.bits.peek_field(1, 2) as u8
    }

    /// LAPDm control format from the second octet (GSM 04.06 table 3).
    pub fn control_format(&self) -> ControlFormat {
        if self.bits.bit(8 + 7) == 0 {
            ControlFormat::I
        } else if self.bits.bit(8 + 6) == 0 {
            ControlFormat::S
        } else {
            ControlFormat::U
        }
    }

    /// U-frame command type (GSM 04.06 table 4).
    pub fn u_frame_type(&self) -> FrameType {
        let upper = self.bits.peek_field(8, 3);
        let lower = self.bits.peek_field(8 + 4, 2);
        match (upper << 2) | lower {
            0x07 => FrameType::Sabm,
            0x03 => FrameType::Dm,
            0x00 => FrameType::Ui,
            0x08 => FrameType::Disc,
            0x0c => FrameType::Ua,
            _ => FrameType::Bogus,
        }
    }

    /// S-frame command type (GSM 04.06 table 4).
    pub fn s_frame_type(&self) -> FrameType {
        match self.bits.peek_field(8 + 4, 2) {
            0 => FrameType::Rr,
            1 => FrameType::Rnr,
            2 => FrameType::Rej,
            _ => FrameType::Bogus,
        }
    }

    /// Randomize the fill octets after `start_bit`, for filler scrambling.
    pub fn randomize_filler(&mut self, start_bit: usize) {
        let mut rng = rand::rng();
        for i in start_bit..L2_FRAME_BITS {
            self.bits.set_bit(i, u8::from(rng.random::<bool>()));
        }
    }
}

impl fmt::Debug for L2Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "L2Frame prim={:?} SAPI={} data={:?}",
            self.primitive,
            self.sapi(),
            self.bits
        )
    }
}

/// The LAPDm idle frame as sent by the network (GSM 04.06 5.4.2.3):
/// address 3, control 3, length 1.
pub fn l2_idle_frame(scramble_filler: bool) -> L2Frame {
    let mut f = L2Frame::empty(Primitive::L2Data);
    f.bits_mut().fill_field(0, 3, 8);
    f.bits_mut().fill_field(8, 3, 8);
    f.bits_mut().fill_field(16, 1, 8);
    if scramble_filler {
        f.randomize_filler(8 * 4);
    }
    f
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_fill_pattern() {
        let f = L2Frame::empty(Primitive::L2Data);
        assert_eq!(f.bits().peek_field(0, 8), 0x2b);
        assert_eq!(f.bits().peek_field(8 * 22, 8), 0x2b);
    }

    #[test]
    fn test_idle_frame_header() {
        let f = l2_idle_frame(false);
        assert_eq!(f.bits().peek_field(0, 8), 3);
        assert_eq!(f.bits().peek_field(8, 8), 3);
        assert_eq!(f.bits().peek_field(16, 8), 1);
        // Address octet 0b00000011: SAPI bits 3..6 are zero.
        assert_eq!(f.sapi(), 0);
        // Control 0b00000011 is a U format.
        assert_eq!(f.control_format(), ControlFormat::U);
    }

    #[test]
    fn test_sapi_field() {
        let mut payload = BitVec::zeroed(8);
        // C/R=0, LPD=0, SAPI=3, EA bits per 04.06 3.2 MSB-first layout.
        payload.fill_field(3, 3, 3);
        let f = L2Frame::new(&payload);
        assert_eq!(f.sapi(), 3);
    }
}
