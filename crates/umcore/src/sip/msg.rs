// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The SIP message model and generator.
//!
//! One struct covers requests and responses; `code == 0` means request.
//! Recognized headers are first-class fields, everything else rides in
//! `extra_headers` and is regenerated verbatim for passthrough.

use super::parse::{SipParam, SipPreposition, SipVia};
use std::fmt;

/// Boundary used when composing multipart bodies.
pub const MULTIPART_BOUNDARY: &str = "zzyzx";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SipMessage {
    /// Request method; empty on responses.
    pub method: String,
    pub req_uri: String,
    /// Status code; 0 on requests.
    pub code: u32,
    /// Reason phrase from the status line (not the Reason header).
    pub reason: String,

    pub to: SipPreposition,
    pub from: SipPreposition,
    pub vias: Vec<SipVia>,
    pub call_id: String,
    pub cseq_num: u32,
    pub cseq_method: String,
    pub contact: Option<String>,
    pub routes: Vec<String>,
    pub record_routes: Vec<String>,
    pub max_forwards: Option<String>,
    pub content_type: Option<String>,
    pub authorization: Option<String>,
    pub www_authenticate: Option<String>,
    pub authentication_info: Option<String>,
    /// The "Reason:" header.
    pub reason_header: Option<String>,
    pub expires: Option<u32>,
    /// Unrecognized headers, preserved in order.
    pub extra_headers: Vec<SipParam>,
    pub body: String,
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        self.code == 0
    }

    pub fn is_invite(&self) -> bool {
        self.is_request() && self.method == "INVITE"
    }

    pub fn is_ack(&self) -> bool {
        self.is_request() && self.method == "ACK"
    }

    pub fn is_cancel(&self) -> bool {
        self.is_request() && self.method == "CANCEL"
    }

    pub fn is_bye(&self) -> bool {
        self.is_request() && self.method == "BYE"
    }

    pub fn is_message(&self) -> bool {
        self.is_request() && self.method == "MESSAGE"
    }

    /// Has anything been filled in yet? Call-ID goes in first, always.
    pub fn is_empty(&self) -> bool {
        self.call_id.is_empty() && self.method.is_empty() && self.code == 0
    }

    pub fn code_class(&self) -> u32 {
        (self.code / 100) * 100
    }

    /// The peer's dialog tag: From on requests, To on responses.
    pub fn remote_tag(&self) -> &str {
        if self.is_request() {
            &self.from.tag
        } else {
            &self.to.tag
        }
    }

    /// Our dialog tag as the peer sees it.
    pub fn local_tag(&self) -> &str {
        if self.is_request() {
            &self.to.tag
        } else {
            &self.from.tag
        }
    }

    pub fn top_via(&self) -> Option<&SipVia> {
        self.vias.first()
    }

    /// The branch of the top via, the per-hop transaction id.
    pub fn branch(&self) -> &str {
        self.vias.first().map_or("", |v| v.branch.as_str())
    }

    /// Push a new top via.
    pub fn add_via(&mut self, via: SipVia) {
        self.vias.insert(0, via);
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.extra_headers.push(SipParam {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    /// Attach a body, or fold an additional part into a multipart body.
    pub fn add_body(&mut self, content_type: &str, body: &str) {
        match (&self.content_type, self.body.is_empty()) {
            (None, _) | (_, true) => {
                self.content_type = Some(content_type.to_string());
                self.body = body.to_string();
            }
            (Some(existing), false) => {
                let existing = existing.clone();
                let first = std::mem::take(&mut self.body);
                let sep = format!("--{MULTIPART_BOUNDARY}");
                self.body = format!(
                    "{sep}\r\nContent-Type: {existing}\r\n\r\n{first}\r\n{sep}\r\nContent-Type: {content_type}\r\n\r\n{body}\r\n{sep}--\r\n"
                );
                self.content_type =
                    Some(format!("multipart/mixed;boundary={MULTIPART_BOUNDARY}"));
            }
        }
    }

    pub fn decrement_max_forwards(&mut self) -> bool {
        let n: i64 = self
            .max_forwards
            .as_deref()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(70);
        if n <= 0 {
            return false;
        }
        self.max_forwards = Some((n - 1).to_string());
        true
    }

    /// Serialize to the wire form.
    pub fn generate(&self, user_agent: &str) -> String {
        let mut s = String::with_capacity(512);
        if self.is_request() {
            s.push_str(&format!("{} {} SIP/2.0\r\n", self.method, self.req_uri));
        } else {
            s.push_str(&format!("SIP/2.0 {} {}\r\n", self.code, self.reason));
        }
        for via in &self.vias {
            s.push_str(&format!("Via: {}\r\n", via.raw));
        }
        s.push_str(&format!("From: {}\r\n", self.from.value()));
        s.push_str(&format!("To: {}\r\n", self.to.value()));
        s.push_str(&format!("Call-ID: {}\r\n", self.call_id));
        s.push_str(&format!("CSeq: {} {}\r\n", self.cseq_num, self.cseq_method));
        for r in &self.routes {
            s.push_str(&format!("Route: {r}\r\n"));
        }
        for r in &self.record_routes {
            s.push_str(&format!("Record-Route: {r}\r\n"));
        }
        if let Some(c) = &self.contact {
            s.push_str(&format!("Contact: {c}\r\n"));
        }
        if let Some(mf) = &self.max_forwards {
            s.push_str(&format!("Max-Forwards: {mf}\r\n"));
        }
        if let Some(a) = &self.authorization {
            s.push_str(&format!("Authorization: {a}\r\n"));
        }
        if let Some(a) = &self.www_authenticate {
            s.push_str(&format!("WWW-Authenticate: {a}\r\n"));
        }
        if let Some(a) = &self.authentication_info {
            s.push_str(&format!("Authentication-Info: {a}\r\n"));
        }
        if let Some(r) = &self.reason_header {
            s.push_str(&format!("Reason: {r}\r\n"));
        }
        if let Some(e) = self.expires {
            s.push_str(&format!("Expires: {e}\r\n"));
        }
        for h in &self.extra_headers {
            s.push_str(&format!("{}: {}\r\n", h.name, h.value));
        }
        if !user_agent.is_empty() {
            s.push_str(&format!("User-Agent: {user_agent}\r\n"));
        }
        if let Some(ct) = &self.content_type {
            s.push_str(&format!("Content-Type: {ct}\r\n"));
        }
        s.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        s.push_str(&self.body);
        s
    }

    /// First line, for logs.
    pub fn first_line(&self) -> String {
        if self.is_request() {
            format!("{} {}", self.method, self.req_uri)
        } else {
            format!("{} {}", self.code, self.reason)
        }
    }

    // ===== Derived message constructors =====

    /// A response to `request`. `local` supplies the To header (with our
    /// tag) when we are the dialog's server side.
    pub fn reply(request: &SipMessage, code: u32, reason: &str, local: Option<&SipPreposition>) -> SipMessage {
        SipMessage {
            code,
            reason: reason.to_string(),
            vias: request.vias.clone(),
            from: request.from.clone(),
            to: local.cloned().unwrap_or_else(|| request.to.clone()),
            call_id: request.call_id.clone(),
            cseq_num: request.cseq_num,
            cseq_method: request.cseq_method.clone(),
            record_routes: request.record_routes.clone(),
            ..SipMessage::default()
        }
    }

    /// An ACK or CANCEL derived from the original INVITE: same top via
    /// (same branch), Call-ID, From, Request-URI and CSeq number
    /// (RFC3261 17.1.1.3, 9.1).
    pub fn ack_or_cancel(method: &str, invite: &SipMessage) -> SipMessage {
        SipMessage {
            method: method.to_string(),
            req_uri: invite.req_uri.clone(),
            vias: invite.top_via().cloned().into_iter().collect(),
            from: invite.from.clone(),
            to: invite.to.clone(),
            call_id: invite.call_id.clone(),
            cseq_num: invite.cseq_num,
            cseq_method: method.to_string(),
            max_forwards: Some("70".to_string()),
            ..SipMessage::default()
        }
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.first_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::parse::{parse_message, parse_multipart, SipUri};

    fn sample_request() -> SipMessage {
        let mut m = SipMessage {
            method: "INVITE".into(),
            req_uri: "sip:411@127.0.0.1:5060".into(),
            from: SipPreposition::new("", SipUri::make("IMSI001010000000001", "10.0.0.5", 5062), "OBTSaaaaaaaaaaaaaaaa"),
            to: SipPreposition::new("", SipUri::make("411", "127.0.0.1", 5060), ""),
            call_id: "abc123".into(),
            cseq_num: 1,
            cseq_method: "INVITE".into(),
            max_forwards: Some("70".into()),
            ..SipMessage::default()
        };
        m.add_via(SipVia::make("UDP", "10.0.0.5:5062", "z9hG4bKOBTSbbbbbbbbbbbbbbbb"));
        m.add_body("application/sdp", "v=0");
        m
    }

    #[test]
    fn test_generate_parse_roundtrip() {
        let m = sample_request();
        let wire = m.generate("umcore test");
        let parsed = parse_message(wire.as_bytes()).unwrap();
        assert_eq!(parsed.method, "INVITE");
        assert_eq!(parsed.call_id, m.call_id);
        assert_eq!(parsed.cseq_num, 1);
        assert_eq!(parsed.from.tag, m.from.tag);
        assert_eq!(parsed.branch(), "z9hG4bKOBTSbbbbbbbbbbbbbbbb");
        assert_eq!(parsed.body, "v=0");
        // Second roundtrip preserves everything recognized (the first
        // pass folded User-Agent into the passthrough headers).
        let wire2 = parsed.generate("");
        let parsed2 = parse_message(wire2.as_bytes()).unwrap();
        assert_eq!(parsed, parsed2);
    }

    #[test]
    fn test_reply_copies_transaction_ids() {
        let req = sample_request();
        let mut local = req.to.clone();
        local.set_tag("OBTScccccccccccccccc");
        let rsp = SipMessage::reply(&req, 180, "Ringing", Some(&local));
        assert_eq!(rsp.code, 180);
        assert_eq!(rsp.call_id, req.call_id);
        assert_eq!(rsp.cseq_num, req.cseq_num);
        assert_eq!(rsp.cseq_method, "INVITE");
        assert_eq!(rsp.branch(), req.branch());
        assert_eq!(rsp.to.tag, "OBTScccccccccccccccc");
        assert_eq!(rsp.from.tag, req.from.tag);
    }

    #[test]
    fn test_ack_shares_branch_and_cseq() {
        let invite = sample_request();
        let ack = SipMessage::ack_or_cancel("ACK", &invite);
        assert!(ack.is_ack());
        assert_eq!(ack.vias.len(), 1);
        assert_eq!(ack.branch(), invite.branch());
        assert_eq!(ack.cseq_num, invite.cseq_num);
        assert_eq!(ack.cseq_method, "ACK");
        assert_eq!(ack.req_uri, invite.req_uri);
    }

    #[test]
    fn test_multipart_composition() {
        let mut m = sample_request();
        m.add_body("text/plain", "hello");
        let ct = m.content_type.clone().unwrap();
        assert!(ct.starts_with("multipart/mixed"));
        let parts = parse_multipart(&ct, &m.body).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], ("application/sdp".into(), "v=0".into()));
        assert_eq!(parts[1], ("text/plain".into(), "hello".into()));
    }

    #[test]
    fn test_max_forwards_decrement() {
        let mut m = sample_request();
        assert!(m.decrement_max_forwards());
        assert_eq!(m.max_forwards.as_deref(), Some("69"));
        m.max_forwards = Some("0".into());
        assert!(!m.decrement_max_forwards());
    }
}
