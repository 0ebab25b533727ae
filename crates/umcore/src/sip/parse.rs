// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RFC3261 message parsing: URIs, To/From headers, Via lines, parameter
//! lists, and the datagram-to-[`SipMessage`] parser.
//!
//! Parse failures are values, not panics: a malformed datagram yields a
//! [`SipParseError`] and the interface drops it.

use super::msg::SipMessage;
use std::fmt;

/// Why a datagram failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipParseError {
    Empty,
    BadStartLine { line: String },
    BadHeader { line: String },
    BadCseq { value: String },
    NotUtf8,
}

impl fmt::Display for SipParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipParseError::Empty => f.write_str("empty message"),
            SipParseError::BadStartLine { line } => write!(f, "bad start line: {line:?}"),
            SipParseError::BadHeader { line } => write!(f, "bad header line: {line:?}"),
            SipParseError::BadCseq { value } => write!(f, "bad CSeq: {value:?}"),
            SipParseError::NotUtf8 => f.write_str("message is not text"),
        }
    }
}

impl std::error::Error for SipParseError {}

/// A name=value parameter (also used for unknown headers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipParam {
    pub name: String,
    pub value: String,
}

/// Split `;a=b;c=d` (leading separator optional) into parameters.
pub fn parse_params(s: &str) -> Vec<SipParam> {
    s.split(';')
        .filter(|p| !p.trim().is_empty())
        .map(|p| {
            let (name, value) = p.split_once('=').unwrap_or((p, ""));
            SipParam {
                name: name.trim().to_string(),
                value: value.trim().trim_matches('"').to_string(),
            }
        })
        .collect()
}

/// Find a parameter by case-insensitive name.
pub fn param_find<'a>(params: &'a [SipParam], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .map(|p| p.value.as_str())
}

/// The subset of a URI this stack uses: `sip:user@host:port;params`.
/// URI parameters and headers are preserved but not interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SipUri {
    raw: String,
}

impl SipUri {
    /// Take a URI, stripping one level of `<...>` wrapping.
    pub fn parse(s: &str) -> SipUri {
        let t = s.trim();
        let raw = if let Some(stripped) = t.strip_prefix('<') {
            stripped
                .rsplit_once('>')
                .map_or(stripped, |(inner, _)| inner)
                .to_string()
        } else {
            t.to_string()
        };
        SipUri { raw }
    }

    pub fn make(user: &str, host: &str, port: u16) -> SipUri {
        let raw = if port != 0 {
            format!("sip:{user}@{host}:{port}")
        } else {
            format!("sip:{user}@{host}")
        };
        SipUri { raw }
    }

    pub fn value(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    fn after_scheme(&self) -> &str {
        self.raw
            .strip_prefix("sip:")
            .or_else(|| self.raw.strip_prefix("sips:"))
            .unwrap_or(&self.raw)
    }

    /// The user part, without scheme, password, host or parameters.
    pub fn username(&self) -> &str {
        let body = self.after_scheme();
        let end = body
            .find(|c| c == ';' || c == '@' || c == ':')
            .unwrap_or(body.len());
        &body[..end]
    }

    /// `host:port` after the `@`, empty when there is no user part.
    pub fn host_and_port(&self) -> &str {
        let body = self.after_scheme();
        let addr_end = body.find(|c| c == ';' || c == '&').unwrap_or(body.len());
        let addr = &body[..addr_end];
        addr.split_once('@').map_or("", |(_, host)| host)
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A To: or From: header — display name, URI and the tag parameter that
/// identifies the dialog.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SipPreposition {
    pub display_name: String,
    pub uri: SipUri,
    pub tag: String,
}

impl SipPreposition {
    pub fn new(display_name: &str, uri: SipUri, tag: &str) -> SipPreposition {
        SipPreposition {
            display_name: display_name.to_string(),
            uri,
            tag: tag.to_string(),
        }
    }

    /// Parse a full header value: `"Name" <sip:user@host>;tag=...`.
    pub fn parse(s: &str) -> SipPreposition {
        let t = s.trim();
        let (before_params, params) = match t.find('<') {
            Some(lt) => {
                let gt = t[lt..].find('>').map_or(t.len(), |g| lt + g + 1);
                (t[..gt].to_string(), parse_params(t[gt..].trim_start_matches(';')))
            }
            None => match t.split_once(';') {
                Some((head, rest)) => (head.to_string(), parse_params(rest)),
                None => (t.to_string(), Vec::new()),
            },
        };
        let (display_name, uri_part) = match before_params.find('<') {
            Some(lt) => (
                before_params[..lt].trim().trim_matches('"').to_string(),
                before_params[lt..].to_string(),
            ),
            None => (String::new(), before_params),
        };
        SipPreposition {
            display_name,
            uri: SipUri::parse(&uri_part),
            tag: param_find(&params, "tag").unwrap_or("").to_string(),
        }
    }

    pub fn set_tag(&mut self, tag: &str) {
        self.tag = tag.to_string();
    }

    /// The serialized header value.
    pub fn value(&self) -> String {
        let mut s = String::new();
        if !self.display_name.is_empty() {
            s.push_str(&format!("\"{}\" ", self.display_name));
        }
        s.push_str(&format!("<{}>", self.uri.value()));
        if !self.tag.is_empty() {
            s.push_str(&format!(";tag={}", self.tag));
        }
        s
    }

    pub fn username(&self) -> &str {
        self.uri.username()
    }
}

/// One Via header: the full line preserved, branch and sent-by extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipVia {
    pub raw: String,
    pub sent_by: String,
    pub branch: String,
}

impl SipVia {
    pub fn parse(line: &str) -> SipVia {
        let t = line.trim();
        // "SIP/2.0/UDP host:port;branch=..."
        let transport_and_rest = t.splitn(3, '/').nth(2).unwrap_or("");
        let after_proto = transport_and_rest
            .split_once(' ')
            .map_or(transport_and_rest, |(_, rest)| rest);
        let (sent_by, params) = match after_proto.split_once(';') {
            Some((s, p)) => (s.trim().to_string(), parse_params(p)),
            None => (after_proto.trim().to_string(), Vec::new()),
        };
        SipVia {
            raw: t.to_string(),
            sent_by,
            branch: param_find(&params, "branch").unwrap_or("").to_string(),
        }
    }

    pub fn make(transport: &str, sent_by: &str, branch: &str) -> SipVia {
        SipVia {
            raw: format!("SIP/2.0/{transport} {sent_by};branch={branch}"),
            sent_by: sent_by.to_string(),
            branch: branch.to_string(),
        }
    }
}

/// Unfold header continuation lines (a line starting with SP/HT continues
/// the previous header).
fn unfold(headers: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in headers.split("\r\n").flat_map(|l| l.split('\n')) {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if (line.starts_with(' ') || line.starts_with('\t')) && !out.is_empty() {
            let last = out.last_mut().unwrap();
            last.push(' ');
            last.push_str(line.trim());
        } else {
            out.push(line.to_string());
        }
    }
    out
}

/// Expand the compact header forms we accept from noncompliant peers.
fn canonical_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    match lower.as_str() {
        "f" => "from".to_string(),
        "t" => "to".to_string(),
        "i" => "call-id".to_string(),
        "v" => "via".to_string(),
        "m" => "contact".to_string(),
        "c" => "content-type".to_string(),
        "l" => "content-length".to_string(),
        other => other.to_string(),
    }
}

/// Parse one UDP datagram into a [`SipMessage`].
pub fn parse_message(data: &[u8]) -> Result<SipMessage, SipParseError> {
    if data.is_empty() {
        return Err(SipParseError::Empty);
    }
    let text = std::str::from_utf8(data).map_err(|_| SipParseError::NotUtf8)?;

    let (head, body) = match text.find("\r\n\r\n") {
        Some(pos) => (&text[..pos], &text[pos + 4..]),
        None => match text.find("\n\n") {
            Some(pos) => (&text[..pos], &text[pos + 2..]),
            None => (text, ""),
        },
    };
    let mut lines = unfold(head).into_iter();
    let start = lines.next().ok_or(SipParseError::Empty)?;

    let mut msg = SipMessage::default();
    if let Some(rest) = start.strip_prefix("SIP/2.0 ") {
        // Status line.
        let mut parts = rest.splitn(2, ' ');
        let code = parts
            .next()
            .and_then(|c| c.trim().parse::<u32>().ok())
            .ok_or_else(|| SipParseError::BadStartLine {
                line: start.clone(),
            })?;
        if code == 0 {
            return Err(SipParseError::BadStartLine { line: start });
        }
        msg.code = code;
        msg.reason = parts.next().unwrap_or("").trim().to_string();
    } else {
        // Request line: METHOD URI SIP/2.0
        let mut parts = start.split_whitespace();
        let method = parts.next().unwrap_or("");
        let uri = parts.next().unwrap_or("");
        let version = parts.next().unwrap_or("");
        if method.is_empty()
            || uri.is_empty()
            || !method.bytes().all(|b| b.is_ascii_alphabetic())
            || !version.starts_with("SIP/")
        {
            return Err(SipParseError::BadStartLine { line: start });
        }
        msg.method = method.to_ascii_uppercase();
        msg.req_uri = uri.to_string();
    }

    let mut content_length: Option<usize> = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(SipParseError::BadHeader { line });
        };
        let value = value.trim();
        match canonical_name(name).as_str() {
            "to" => msg.to = SipPreposition::parse(value),
            "from" => msg.from = SipPreposition::parse(value),
            "call-id" => msg.call_id = value.to_string(),
            "via" => {
                // A Via header may itself be a comma list.
                for v in value.split(',') {
                    msg.vias.push(SipVia::parse(v));
                }
            }
            "cseq" => {
                let mut p = value.split_whitespace();
                let num = p.next().and_then(|n| n.parse::<u32>().ok());
                let method = p.next();
                match (num, method) {
                    (Some(n), Some(m)) => {
                        msg.cseq_num = n;
                        msg.cseq_method = m.to_ascii_uppercase();
                    }
                    _ => {
                        return Err(SipParseError::BadCseq {
                            value: value.to_string(),
                        })
                    }
                }
            }
            "contact" => msg.contact = Some(value.to_string()),
            "route" => msg.routes.push(value.to_string()),
            "record-route" => msg.record_routes.push(value.to_string()),
            "max-forwards" => msg.max_forwards = Some(value.to_string()),
            "content-type" => msg.content_type = Some(value.to_string()),
            "content-length" => content_length = value.parse().ok(),
            "authorization" => msg.authorization = Some(value.to_string()),
            "www-authenticate" => msg.www_authenticate = Some(value.to_string()),
            "authentication-info" => msg.authentication_info = Some(value.to_string()),
            "reason" => msg.reason_header = Some(value.to_string()),
            "expires" => msg.expires = value.parse().ok(),
            _ => msg.extra_headers.push(SipParam {
                name: name.trim().to_string(),
                value: value.to_string(),
            }),
        }
    }

    msg.body = match content_length {
        Some(len) if len <= body.len() => body[..len].to_string(),
        _ => body.to_string(),
    };
    Ok(msg)
}

/// Split a `multipart/mixed;boundary=...` body into its parts, each with
/// its own Content-Type.
pub fn parse_multipart(content_type: &str, body: &str) -> Option<Vec<(String, String)>> {
    let params = parse_params(content_type.split_once(';').map_or("", |(_, p)| p));
    let boundary = param_find(&params, "boundary")?;
    let sep = format!("--{boundary}");
    let mut parts = Vec::new();
    for chunk in body.split(&sep).skip(1) {
        let chunk = chunk.trim_start_matches(['\r', '\n']);
        if chunk.starts_with("--") || chunk.trim().is_empty() {
            continue;
        }
        let (head, payload) = match chunk.find("\r\n\r\n") {
            Some(pos) => (&chunk[..pos], &chunk[pos + 4..]),
            None => match chunk.find("\n\n") {
                Some(pos) => (&chunk[..pos], &chunk[pos + 2..]),
                None => ("", chunk),
            },
        };
        let ctype = unfold(head)
            .into_iter()
            .find_map(|l| {
                let (n, v) = l.split_once(':')?;
                canonical_name(n)
                    .eq("content-type")
                    .then(|| v.trim().to_string())
            })
            .unwrap_or_default();
        parts.push((ctype, payload.trim_end_matches(['\r', '\n']).to_string()));
    }
    Some(parts)
}

/// Parse the comma-separated name=value list of a Digest challenge or
/// authorization header (after the scheme word).
pub fn parse_authenticate(value: &str) -> Vec<SipParam> {
    let rest = value
        .trim()
        .strip_prefix("Digest")
        .or_else(|| value.trim().strip_prefix("digest"))
        .unwrap_or(value);
    rest.split(',')
        .filter_map(|kv| {
            let (n, v) = kv.split_once('=')?;
            Some(SipParam {
                name: n.trim().to_string(),
                value: v.trim().trim_matches('"').to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_parts() {
        let u = SipUri::parse("<sip:IMSI001010000000001@127.0.0.1:5060;user=phone>");
        assert_eq!(u.username(), "IMSI001010000000001");
        assert_eq!(u.host_and_port(), "127.0.0.1:5060");
        let bare = SipUri::parse("sip:411@10.0.0.1");
        assert_eq!(bare.username(), "411");
        assert_eq!(bare.host_and_port(), "10.0.0.1");
    }

    #[test]
    fn test_preposition_roundtrip() {
        let p = SipPreposition::parse("\"Alice\" <sip:alice@example.com>;tag=OBTSabcdabcdabcdabcd");
        assert_eq!(p.display_name, "Alice");
        assert_eq!(p.username(), "alice");
        assert_eq!(p.tag, "OBTSabcdabcdabcdabcd");
        let again = SipPreposition::parse(&p.value());
        assert_eq!(p, again);
    }

    #[test]
    fn test_via_extraction() {
        let v = SipVia::parse("SIP/2.0/UDP 10.0.0.5:5062;branch=z9hG4bKOBTSxyzxyzxyzxyzxyzx");
        assert_eq!(v.sent_by, "10.0.0.5:5062");
        assert_eq!(v.branch, "z9hG4bKOBTSxyzxyzxyzxyzxyzx");
    }

    #[test]
    fn test_parse_request() {
        let raw = b"INVITE sip:411@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.5:5062;branch=z9hG4bKOBTSaaaaaaaaaaaaaaaa\r\n\
From: <sip:IMSI001010000000001@10.0.0.5>;tag=OBTSbbbbbbbbbbbbbbbb\r\n\
To: <sip:411@127.0.0.1>\r\n\
Call-ID: call123@10.0.0.5\r\n\
CSeq: 1 INVITE\r\n\
Content-Type: application/sdp\r\n\
Content-Length: 3\r\n\
\r\nv=0\r\n";
        let m = parse_message(raw).unwrap();
        assert!(m.is_request());
        assert_eq!(m.method, "INVITE");
        assert_eq!(m.cseq_num, 1);
        assert_eq!(m.cseq_method, "INVITE");
        assert_eq!(m.call_id, "call123@10.0.0.5");
        assert_eq!(m.from.tag, "OBTSbbbbbbbbbbbbbbbb");
        assert!(m.to.tag.is_empty());
        assert_eq!(m.body, "v=0");
    }

    #[test]
    fn test_parse_response_with_folding() {
        let raw = b"SIP/2.0 180 Ringing\r\n\
Via: SIP/2.0/UDP 10.0.0.5:5062;\r\n branch=z9hG4bKOBTScccccccccccccccc\r\n\
From: <sip:a@b>;tag=x\r\nTo: <sip:c@d>;tag=y\r\n\
Call-ID: z\r\nCSeq: 2 INVITE\r\n\r\n";
        let m = parse_message(raw).unwrap();
        assert!(!m.is_request());
        assert_eq!(m.code, 180);
        assert_eq!(m.vias.len(), 1);
        assert_eq!(m.vias[0].branch, "z9hG4bKOBTScccccccccccccccc");
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(parse_message(b"").is_err());
        assert!(parse_message(b"\xff\xfe\x00garbage").is_err());
        assert!(parse_message(b"NOT A SIP LINE\r\n\r\n").is_err());
    }

    #[test]
    fn test_multipart_split() {
        let body = "--zzyzx\r\nContent-Type: application/sdp\r\n\r\nv=0\r\n\
--zzyzx\r\nContent-Type: text/plain\r\n\r\nhello\r\n--zzyzx--\r\n";
        let parts = parse_multipart("multipart/mixed;boundary=zzyzx", body).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0, "application/sdp");
        assert_eq!(parts[0].1, "v=0");
        assert_eq!(parts[1].1, "hello");
    }

    #[test]
    fn test_authenticate_params() {
        let p = parse_authenticate("Digest nonce=\"abc123\", realm=\"gsm\", algorithm=MD5");
        assert_eq!(param_find(&p, "nonce"), Some("abc123"));
        assert_eq!(param_find(&p, "realm"), Some("gsm"));
    }
}
