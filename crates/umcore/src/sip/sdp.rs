// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SDP offer/answer bodies (RFC4566 inside SIP).
//!
//! Only the audio m-line matters here: the offer carries the local codec
//! set, the answer returns exactly one codec, and the handover REFER body
//! carries the remote RTP port with a fresh version id.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Audio codecs this BTS can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// GSM 06.10 full rate, static payload type 3.
    GsmFr,
    /// AMR narrowband, dynamic payload type.
    Amr,
}

impl Codec {
    pub fn payload_type(&self) -> u8 {
        match self {
            Codec::GsmFr => 3,
            Codec::Amr => 96,
        }
    }

    pub fn rtpmap(&self) -> &'static str {
        match self {
            Codec::GsmFr => "GSM/8000",
            Codec::Amr => "AMR/8000",
        }
    }

    pub fn from_payload_type(pt: u8) -> Option<Codec> {
        match pt {
            3 => Some(Codec::GsmFr),
            96 => Some(Codec::Amr),
            _ => None,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rtpmap())
    }
}

/// An ordered set of offered codecs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodecSet {
    pub codecs: Vec<Codec>,
}

impl CodecSet {
    pub fn gsm_only() -> CodecSet {
        CodecSet {
            codecs: vec![Codec::GsmFr],
        }
    }

    pub fn preferred(&self) -> Option<Codec> {
        self.codecs.first().copied()
    }
}

/// The fields of an SDP body this stack reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpInfo {
    pub rtp_port: u16,
    pub username: String,
    pub host: String,
    pub session_id: String,
    pub version_id: String,
    /// Payload types from the m-line; an offer lists several, an answer
    /// exactly one.
    pub payload_types: Vec<u8>,
    /// The a= lines, preserved.
    pub attrs: Vec<String>,
}

impl SdpInfo {
    /// Parse the lines we care about; anything unknown is skipped.
    pub fn parse(body: &str) -> SdpInfo {
        let mut info = SdpInfo::default();
        for line in body.lines() {
            let line = line.trim_end_matches('\r');
            let Some((kind, value)) = line.split_once('=') else {
                continue;
            };
            match kind {
                "o" => {
                    // o=<user> <sessionId> <versionId> IN IP4 <host>
                    let f: Vec<&str> = value.split_whitespace().collect();
                    if f.len() >= 6 {
                        info.username = f[0].to_string();
                        info.session_id = f[1].to_string();
                        info.version_id = f[2].to_string();
                        if info.host.is_empty() {
                            info.host = f[5].to_string();
                        }
                    }
                }
                "c" => {
                    // c=IN IP4 <host>
                    if let Some(host) = value.split_whitespace().nth(2) {
                        info.host = host.to_string();
                    }
                }
                "m" => {
                    // m=audio <port> RTP/AVP <pt...>
                    let f: Vec<&str> = value.split_whitespace().collect();
                    if f.len() >= 3 && f[0] == "audio" {
                        info.rtp_port = f[1].parse().unwrap_or(0);
                        info.payload_types = f[3..].iter().filter_map(|p| p.parse().ok()).collect();
                    }
                }
                "a" => info.attrs.push(value.to_string()),
                _ => {}
            }
        }
        info
    }

    /// Serialize back to an SDP body.
    pub fn value(&self) -> String {
        let mut s = String::new();
        s.push_str("v=0\r\n");
        s.push_str(&format!(
            "o={} {} {} IN IP4 {}\r\n",
            self.username, self.session_id, self.version_id, self.host
        ));
        s.push_str("s=Talk Time\r\n");
        s.push_str("t=0 0\r\n");
        let pts: Vec<String> = self.payload_types.iter().map(u8::to_string).collect();
        s.push_str(&format!(
            "m=audio {} RTP/AVP {}\r\n",
            self.rtp_port,
            pts.join(" ")
        ));
        s.push_str(&format!("c=IN IP4 {}\r\n", self.host));
        for a in &self.attrs {
            s.push_str(&format!("a={a}\r\n"));
        }
        s
    }

    /// The single answered codec, when this is an answer.
    pub fn answered_codec(&self) -> Option<Codec> {
        self.payload_types.first().and_then(|&pt| Codec::from_payload_type(pt))
    }
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Build an SDP offer advertising `codecs` on `host:port`.
pub fn make_offer(username: &str, host: &str, rtp_port: u16, codecs: &CodecSet) -> String {
    let now = unix_time().to_string();
    let info = SdpInfo {
        rtp_port,
        username: username.to_string(),
        host: host.to_string(),
        session_id: now.clone(),
        version_id: now,
        payload_types: codecs.codecs.iter().map(Codec::payload_type).collect(),
        attrs: codecs
            .codecs
            .iter()
            .map(|c| format!("rtpmap:{} {}", c.payload_type(), c.rtpmap()))
            .collect(),
    };
    info.value()
}

/// Build the answer to `offer`, accepting exactly `codec` on our port.
pub fn make_answer(offer: &SdpInfo, username: &str, host: &str, rtp_port: u16, codec: Codec) -> String {
    let info = SdpInfo {
        rtp_port,
        username: username.to_string(),
        host: host.to_string(),
        session_id: if offer.session_id.is_empty() {
            unix_time().to_string()
        } else {
            offer.session_id.clone()
        },
        version_id: offer.version_id.clone(),
        payload_types: vec![codec.payload_type()],
        attrs: vec![format!("rtpmap:{} {}", codec.payload_type(), codec.rtpmap())],
    };
    info.value()
}

/// The SDP carried in a handover REFER: the remote RTP port so the target
/// BTS learns it, with the version id bumped to the current Unix time.
pub fn make_refer_sdp(username: &str, host: &str, remote_rtp_port: u16, codec: Codec) -> String {
    let info = SdpInfo {
        rtp_port: remote_rtp_port,
        username: username.to_string(),
        host: host.to_string(),
        session_id: unix_time().to_string(),
        version_id: unix_time().to_string(),
        payload_types: vec![codec.payload_type()],
        attrs: vec![format!("rtpmap:{} {}", codec.payload_type(), codec.rtpmap())],
    };
    info.value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_parse_roundtrip() {
        let offer = make_offer(
            "IMSI001010000000001",
            "10.0.0.5",
            16484,
            &CodecSet {
                codecs: vec![Codec::GsmFr, Codec::Amr],
            },
        );
        let info = SdpInfo::parse(&offer);
        assert_eq!(info.rtp_port, 16484);
        assert_eq!(info.host, "10.0.0.5");
        assert_eq!(info.payload_types, vec![3, 96]);
        let again = SdpInfo::parse(&info.value());
        assert_eq!(info, again);
    }

    #[test]
    fn test_answer_returns_one_codec() {
        let offer = SdpInfo::parse(&make_offer("a", "1.2.3.4", 20000, &CodecSet::gsm_only()));
        let answer = make_answer(&offer, "b", "5.6.7.8", 16500, Codec::GsmFr);
        let info = SdpInfo::parse(&answer);
        assert_eq!(info.payload_types.len(), 1);
        assert_eq!(info.answered_codec(), Some(Codec::GsmFr));
        assert_eq!(info.rtp_port, 16500);
        assert_eq!(info.version_id, offer.version_id);
    }

    #[test]
    fn test_parse_foreign_sdp() {
        let body = "v=0\r\no=root 1564 1564 IN IP4 192.168.1.10\r\ns=session\r\n\
c=IN IP4 192.168.1.10\r\nt=0 0\r\nm=audio 20000 RTP/AVP 3 101\r\n\
a=rtpmap:3 GSM/8000\r\na=rtpmap:101 telephone-event/8000\r\n";
        let info = SdpInfo::parse(body);
        assert_eq!(info.rtp_port, 20000);
        assert_eq!(info.host, "192.168.1.10");
        assert_eq!(info.payload_types, vec![3, 101]);
        assert_eq!(info.attrs.len(), 2);
    }
}
