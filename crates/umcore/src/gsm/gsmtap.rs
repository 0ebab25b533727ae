// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! GSMTAP debug tap: mirrors L2 frames to a UDP socket in the standard
//! 16-byte GSMTAP v2 framing, for wireshark-style inspection. Strictly a
//! debugging aid; enabled by `Control.GSMTAP.GSM`.

use super::TypeAndOffset;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};

const GSMTAP_VERSION: u8 = 2;
/// Header length in 32-bit words.
const GSMTAP_HDR_WORDS: u8 = 4;
/// Radio link type: Um interface.
const GSMTAP_TYPE_UM: u8 = 1;
/// Set in the ARFCN field of uplink frames.
const ARFCN_F_UPLINK: u16 = 0x4000;

const CHANNEL_BCCH: u8 = 1;
const CHANNEL_SDCCH4: u8 = 7;
const CHANNEL_SDCCH8: u8 = 8;
const CHANNEL_TCH_F: u8 = 9;
/// OR'd in for the associated control channel.
const CHANNEL_ACCH: u8 = 0x80;

fn channel_code(t: TypeAndOffset, sacch: bool) -> (u8, u8) {
    let (base, sub) = match t {
        TypeAndOffset::TdmaMisc => (CHANNEL_BCCH, 0),
        TypeAndOffset::TchF0 => (CHANNEL_TCH_F, 0),
        TypeAndOffset::Sdcch4(n) => (CHANNEL_SDCCH4, n),
        TypeAndOffset::Sdcch8(n) | TypeAndOffset::Sacch8(n) => (CHANNEL_SDCCH8, n),
        TypeAndOffset::Sacch4(n) => (CHANNEL_SDCCH4, n),
        TypeAndOffset::SacchTchF => (CHANNEL_TCH_F, 0),
        TypeAndOffset::Cbch => (CHANNEL_SDCCH4, 2),
    };
    let acch = sacch || matches!(t, TypeAndOffset::Sacch4(_) | TypeAndOffset::Sacch8(_));
    (if acch { base | CHANNEL_ACCH } else { base }, sub)
}

/// A connected GSMTAP UDP emitter.
pub struct GsmtapSink {
    socket: UdpSocket,
}

impl GsmtapSink {
    /// Connect to `target` (normally port 4729). The socket is
    /// fire-and-forget; send errors are logged and swallowed.
    pub fn new(target: SocketAddr) -> std::io::Result<Self> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.bind(&SocketAddr::from(([0, 0, 0, 0], 0)).into())?;
        let socket: UdpSocket = sock.into();
        socket.connect(target)?;
        Ok(GsmtapSink { socket })
    }

    /// Mirror one L2 frame.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        arfcn: u32,
        tn: u32,
        fnum: u32,
        type_and_offset: TypeAndOffset,
        is_sacch: bool,
        uplink: bool,
        payload: &[u8],
    ) {
        let mut pkt = Vec::with_capacity(16 + payload.len());
        pkt.push(GSMTAP_VERSION);
        pkt.push(GSMTAP_HDR_WORDS);
        pkt.push(GSMTAP_TYPE_UM);
        pkt.push(tn as u8);
        let mut arfcn16 = (arfcn & 0x3fff) as u16;
        if uplink {
            arfcn16 |= ARFCN_F_UPLINK;
        }
        pkt.extend_from_slice(&arfcn16.to_be_bytes());
        pkt.push(0); // signal dBm
        pkt.push(0); // SNR dB
        pkt.extend_from_slice(&fnum.to_be_bytes());
        let (chan, sub_slot) = channel_code(type_and_offset, is_sacch);
        pkt.push(chan);
        pkt.push(0); // antenna
        pkt.push(sub_slot);
        pkt.push(0); // reserved
        pkt.extend_from_slice(payload);
        if let Err(err) = self.socket.send(&pkt) {
            log::debug!("[Gsmtap] send failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let recv = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sink = GsmtapSink::new(recv.local_addr().unwrap()).unwrap();
        sink.write(
            42,
            3,
            0x00123456,
            TypeAndOffset::Sdcch8(5),
            false,
            true,
            &[0xab; 23],
        );
        let mut buf = [0u8; 64];
        recv.set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let n = recv.recv(&mut buf).unwrap();
        assert_eq!(n, 16 + 23);
        assert_eq!(buf[0], 2);
        assert_eq!(buf[1], 4);
        assert_eq!(buf[2], 1);
        assert_eq!(buf[3], 3);
        let arfcn = u16::from_be_bytes([buf[4], buf[5]]);
        assert_eq!(arfcn & 0x3fff, 42);
        assert_ne!(arfcn & 0x4000, 0, "uplink flag missing");
        assert_eq!(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]), 0x00123456);
        assert_eq!(buf[12], 8); // SDCCH/8
        assert_eq!(buf[14], 5); // sub-slot
    }
}
