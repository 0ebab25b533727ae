// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-dialog RTP sessions (RFC3550) with RFC2833 telephone events.
//!
//! 20 ms frames, timestamp unit 1/8000 s, 160 units per frame. The
//! receive side is wall-clock driven rather than timestamp driven: the
//! transmitter (a handset) goes silent during FACCH theft and in-call
//! SMS, and a timestamp-driven jitter buffer never recovers from those
//! discontinuities.

use super::sdp::Codec;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

/// Timestamp units per 20 ms frame at 8 kHz.
const TS_PER_FRAME: u32 = 160;

/// Normalized-timestamp distance treated as a stream discontinuity.
const TS_JUMP_LIMIT: u32 = 5000 * TS_PER_FRAME;

/// Cap the DTMF event duration: 8 s minus slack for the three end
/// packets. (8 * 50 * 160) - (5 * 160).
const DTMF_MAX_DURATION: u32 = 63_200;

/// Hard cap on buffered receive packets.
const MAX_RX_PACKETS: usize = 100;

/// Map a DTMF key to its RFC4733 event code.
fn dtmf_event_code(key: char) -> Option<u8> {
    match key {
        '0'..='9' => Some(key as u8 - b'0'),
        '*' => Some(10),
        '#' => Some(11),
        'A' | 'a' => Some(12),
        'B' | 'b' => Some(13),
        'C' | 'c' => Some(14),
        'D' | 'd' => Some(15),
        '!' => Some(16), // hook flash
        _ => None,
    }
}

struct DtmfState {
    key: char,
    start_ts: u32,
    duration: u32,
    /// 0 = running; 1..=3 counts the end packets.
    ending: u8,
}

/// One bidirectional RTP session, bound to the local media port and
/// connected to the peer from the SDP exchange.
pub struct RtpSession {
    socket: UdpSocket,
    peer: SocketAddr,
    codec: Codec,
    dtmf_pt: Option<u8>,
    ssrc: u32,
    seq: u16,
    tx_time: u32,
    marker_next: bool,
    dtmf: Option<DtmfState>,

    rx_base_ts: Option<u32>,
    rx_time: u32,
    rx_real_time: Option<Instant>,
    /// Received payloads keyed by normalized timestamp.
    rx_queue: BTreeMap<u32, Vec<u8>>,
    /// Prebuffer depth in packets before delivery starts (the fixed
    /// jitter buffer); zero disables buffering.
    prebuffer: usize,
    prebuffering: bool,
}

impl RtpSession {
    /// Bind `local_port` and aim at `peer`. `speech_buffer_ms` follows the
    /// GSM.SpeechBuffer convention: 0 = no jitter buffer, 1 = adaptive
    /// (treated as one frame), otherwise a fixed depth in milliseconds.
    pub fn new(
        local_port: u16,
        peer: SocketAddr,
        codec: Codec,
        dtmf_pt: Option<u8>,
        speech_buffer_ms: u32,
    ) -> io::Result<RtpSession> {
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_reuse_address(true)?;
        sock.set_nonblocking(true)?;
        sock.bind(&SocketAddr::from(([0, 0, 0, 0], local_port)).into())?;
        let socket: UdpSocket = sock.into();
        let mut rng = rand::rng();
        let prebuffer = match speech_buffer_ms {
            0 => 0,
            1 => 1,
            ms => ((ms / 20) as usize).min(MAX_RX_PACKETS / 2),
        };
        log::debug!("[Rtp] session local={local_port} peer={peer} codec={codec} prebuffer={prebuffer}");
        Ok(RtpSession {
            socket,
            peer,
            codec,
            dtmf_pt,
            ssrc: rng.random(),
            seq: rng.random(),
            tx_time: 0,
            marker_next: true,
            dtmf: None,
            rx_base_ts: None,
            rx_time: 0,
            rx_real_time: None,
            rx_queue: BTreeMap::new(),
            prebuffer,
            prebuffering: prebuffer > 0,
        })
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    fn send_packet(&mut self, pt: u8, marker: bool, ts: u32, payload: &[u8]) {
        let mut pkt = Vec::with_capacity(12 + payload.len());
        pkt.push(0x80); // V=2, no padding/extension/CSRC
        pkt.push(pt | if marker { 0x80 } else { 0 });
        pkt.extend_from_slice(&self.seq.to_be_bytes());
        pkt.extend_from_slice(&ts.to_be_bytes());
        pkt.extend_from_slice(&self.ssrc.to_be_bytes());
        pkt.extend_from_slice(payload);
        self.seq = self.seq.wrapping_add(1);
        if let Err(err) = self.socket.send_to(&pkt, self.peer) {
            if err.kind() != io::ErrorKind::WouldBlock {
                log::debug!("[Rtp] send failed: {err}");
            }
        }
    }

    /// Send one 20 ms audio frame. `num_flushed` is how many queued
    /// frames the caller dropped for latency control; the timestamp
    /// advances over them so the peer's clock stays aligned.
    pub fn tx_frame(&mut self, payload: &[u8], num_flushed: u32) {
        self.tx_time = self.tx_time.wrapping_add((num_flushed + 1) * TS_PER_FRAME);
        let ts = self.tx_time;
        let marker = std::mem::take(&mut self.marker_next);
        self.send_packet(self.codec.payload_type(), marker, ts, payload);
        if self.dtmf.is_some() {
            if !self.tx_dtmf() {
                log::warn!("[Rtp] RFC2833 send failed mid-event");
                self.dtmf = None;
            }
        }
    }

    /// Begin an RFC2833 event for `key`. Returns false for keys with no
    /// event code or when events are not negotiated.
    pub fn start_dtmf(&mut self, key: char) -> bool {
        if self.dtmf_pt.is_none() {
            log::warn!("[Rtp] DTMF start with no telephone-event payload type");
            return false;
        }
        if dtmf_event_code(key).is_none() {
            log::warn!("[Rtp] invalid DTMF key {key:?}");
            return false;
        }
        // Starting a new key mid-event is allowed; the old one just ends.
        self.dtmf = Some(DtmfState {
            key,
            start_ts: self.tx_time,
            duration: 0,
            ending: 0,
        });
        self.tx_dtmf()
    }

    /// End the running event; three end packets follow on the frame clock.
    pub fn stop_dtmf(&mut self) {
        match self.dtmf.as_mut() {
            Some(d) => {
                d.ending = 1;
                if !self.tx_dtmf() {
                    self.dtmf = None;
                }
            }
            None => log::warn!("[Rtp] stop DTMF with no event running"),
        }
    }

    /// Emit one RFC2833 packet for the current event state.
    fn tx_dtmf(&mut self) -> bool {
        let Some(pt) = self.dtmf_pt else { return false };
        let Some(d) = self.dtmf.as_mut() else {
            return false;
        };
        if d.ending == 0 && d.duration >= DTMF_MAX_DURATION {
            d.ending = 1;
        }
        let code = dtmf_event_code(d.key).unwrap_or(0);
        let end = d.ending > 0;
        // Volume 10: the spec tells receivers to ignore very quiet tones.
        let payload = [
            code,
            (u8::from(end) << 7) | 10,
            (d.duration >> 8) as u8,
            (d.duration & 0xff) as u8,
        ];
        let start = d.duration == 0;
        let ts = d.start_ts;
        d.duration += TS_PER_FRAME;
        let done = if end {
            d.ending += 1;
            d.ending > 3
        } else {
            false
        };
        self.send_packet(pt, start, ts, &payload);
        if done {
            self.dtmf = None;
        }
        true
    }

    /// Drain the socket into the receive queue.
    fn poll_receive(&mut self) {
        let mut buf = [0u8; 512];
        loop {
            let n = match self.socket.recv_from(&mut buf) {
                Ok((n, _)) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::debug!("[Rtp] recv failed: {err}");
                    break;
                }
            };
            if n < 12 || buf[0] >> 6 != 2 {
                continue;
            }
            let pt = buf[1] & 0x7f;
            if Some(pt) == self.dtmf_pt {
                continue; // inbound telephone events are not forwarded
            }
            if pt != self.codec.payload_type() {
                continue;
            }
            let ts = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
            let base = *self.rx_base_ts.get_or_insert(ts);
            let norm = ts.wrapping_sub(base);
            // A jump is measured against where the receive clock sits,
            // not against the session start.
            let drift = (i64::from(norm) - i64::from(self.rx_time)).unsigned_abs();
            if drift > u64::from(TS_JUMP_LIMIT) {
                log::debug!("[Rtp] timestamp jump, resync at ts={ts}");
                self.rx_queue.clear();
                self.rx_base_ts = Some(ts);
                self.rx_time = 0;
                self.rx_real_time = None;
                self.rx_queue.insert(0, buf[12..n].to_vec());
                continue;
            }
            if self.rx_queue.len() >= MAX_RX_PACKETS {
                self.rx_queue.pop_first();
            }
            self.rx_queue.insert(norm, buf[12..n].to_vec());
        }
    }

    /// Pull one received frame, paced by the wall clock; None when no
    /// frame is due yet. Never blocks.
    pub fn rx_frame(&mut self) -> Option<Vec<u8>> {
        self.poll_receive();
        if self.prebuffering {
            if self.rx_queue.len() < self.prebuffer {
                return None;
            }
            self.prebuffering = false;
        }
        let now = Instant::now();
        match self.rx_real_time {
            None => {
                // First pass: latch the epoch and deliver at time zero.
                self.rx_real_time = Some(now);
            }
            Some(epoch) => {
                let delay_frames = (now - epoch).as_millis() as u64 / 20;
                let proposed = (delay_frames as u32).wrapping_mul(TS_PER_FRAME);
                if proposed <= self.rx_time {
                    return None; // insufficient wall time has passed
                }
                self.rx_time = self.rx_time.wrapping_add(TS_PER_FRAME);
            }
        }
        // Take the oldest frame that is due. During a discontinuity this
        // yields None for each missing slot and picks up cleanly after.
        let due = self.rx_time;
        let (&ts, _) = self.rx_queue.iter().next()?;
        if ts > due {
            return None;
        }
        self.rx_queue.remove(&ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn pair() -> (RtpSession, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_nonblocking(true).unwrap();
        let peer_addr: SocketAddr = peer.local_addr().unwrap();
        let s = RtpSession::new(0, peer_addr, Codec::GsmFr, Some(101), 0).unwrap();
        (s, peer)
    }

    fn recv_all(peer: &UdpSocket) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 512];
        while let Ok((n, _)) = peer.recv_from(&mut buf) {
            out.push(buf[..n].to_vec());
        }
        out
    }

    #[test]
    fn test_tx_timestamp_advance() {
        let (mut s, peer) = pair();
        let frame = [0u8; 33];
        s.tx_frame(&frame, 0);
        s.tx_frame(&frame, 2); // two flushed frames skipped
        std::thread::sleep(std::time::Duration::from_millis(20));
        let pkts = recv_all(&peer);
        assert_eq!(pkts.len(), 2);
        let ts0 = u32::from_be_bytes([pkts[0][4], pkts[0][5], pkts[0][6], pkts[0][7]]);
        let ts1 = u32::from_be_bytes([pkts[1][4], pkts[1][5], pkts[1][6], pkts[1][7]]);
        assert_eq!(ts0 % 160, 0);
        assert_eq!(ts1.wrapping_sub(ts0), 3 * 160);
        // Payload type 3, marker on the first packet only.
        assert_eq!(pkts[0][1] & 0x7f, 3);
        assert_ne!(pkts[0][1] & 0x80, 0);
        assert_eq!(pkts[1][1] & 0x80, 0);
    }

    #[test]
    fn test_dtmf_event_packets() {
        let (mut s, peer) = pair();
        assert!(s.start_dtmf('5'));
        s.tx_frame(&[0u8; 33], 0);
        s.stop_dtmf();
        // Drive the end packets out on the frame clock.
        s.tx_frame(&[0u8; 33], 0);
        s.tx_frame(&[0u8; 33], 0);
        std::thread::sleep(std::time::Duration::from_millis(20));
        let pkts = recv_all(&peer);
        let events: Vec<&Vec<u8>> = pkts.iter().filter(|p| p[1] & 0x7f == 101).collect();
        assert!(events.len() >= 3, "expected start + end packets, got {}", events.len());
        // Event code 5, and end bit set on the trailing packets.
        assert_eq!(events[0][12], 5);
        assert_ne!(events.last().unwrap()[13] & 0x80, 0);
        // All event packets share the start timestamp.
        let ts: Vec<u32> = events
            .iter()
            .map(|p| u32::from_be_bytes([p[4], p[5], p[6], p[7]]))
            .collect();
        assert!(ts.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_rx_wall_clock_pacing() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut s = RtpSession::new(0, peer.local_addr().unwrap(), Codec::GsmFr, None, 0).unwrap();
        let me: SocketAddr = format!("127.0.0.1:{}", s.local_port()).parse().unwrap();

        // Hand-build three frames 160 apart.
        for i in 0..3u32 {
            let mut pkt = vec![0x80, 3, 0, i as u8];
            pkt.extend_from_slice(&(1000 + i * 160).to_be_bytes());
            pkt.extend_from_slice(&0x1234_5678u32.to_be_bytes());
            pkt.extend_from_slice(&[0xd0; 33]);
            peer.send_to(&pkt, me).unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(30));
        // First call delivers the base frame.
        assert!(s.rx_frame().is_some());
        // Immediately after, the wall clock has not advanced a frame.
        assert!(s.rx_frame().is_none());
        std::thread::sleep(std::time::Duration::from_millis(25));
        assert!(s.rx_frame().is_some());
        let t = s.rx_time;
        std::thread::sleep(std::time::Duration::from_millis(25));
        let _ = s.rx_frame();
        assert!(s.rx_time >= t, "rx time must never decrease");
    }
}
