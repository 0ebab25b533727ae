// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tag/branch/Call-ID generation, peer address resolution, SIP timers.

use rand::Rng;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Fixed prefix on locally generated to/from tags.
const TAG_PREFIX: &str = "OBTS";
/// RFC3261 17.2.3 magic cookie plus our prefix.
const BRANCH_PREFIX: &str = "z9hG4bKOBTS";

fn random_letters(prefix: &str) -> String {
    let mut rng = rand::rng();
    let mut s = String::with_capacity(prefix.len() + 16);
    s.push_str(prefix);
    for _ in 0..16 {
        s.push((b'a' + rng.random_range(0..26u8)) as char);
    }
    s
}

/// A new local tag: `OBTS` + 16 lowercase letters.
pub fn make_tag() -> String {
    random_letters(TAG_PREFIX)
}

/// A new via branch, RFC3261-cookie compliant.
pub fn make_branch() -> String {
    random_letters(BRANCH_PREFIX)
}

/// Packs seconds and microseconds into one 32-bit uniquifier.
fn time_uniquifier() -> u32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    let sec = now.as_secs() as u32;
    let usec = now.subsec_micros();
    ((sec & 0xffff) << 16) | (usec / 16)
}

/// A globally unique Call-ID: prefix, hex time uniquifier, hex random.
pub fn globally_unique_id(prefix: &str) -> String {
    let r: u32 = rand::rng().random();
    format!("{}{:x}{:x}", prefix, time_uniquifier(), r)
}

/// A resolved peer address. Kept alongside the unresolved name so config
/// changes re-resolve cleanly.
#[derive(Debug, Clone)]
pub struct IpAddressSpec {
    pub name: String,
    pub addr: Option<SocketAddr>,
}

impl IpAddressSpec {
    /// Resolve `host:port`; `provenance` names the config option for the
    /// log message when resolution fails.
    pub fn resolve(name: &str, provenance: &str) -> IpAddressSpec {
        let addr = name.to_socket_addrs().ok().and_then(|mut a| a.next());
        if addr.is_none() {
            log::warn!("[Sip] cannot resolve peer {name} from {provenance}");
        }
        IpAddressSpec {
            name: name.to_string(),
            addr,
        }
    }

    /// All signaling runs over UDP.
    pub fn is_reliable_transport(&self) -> bool {
        false
    }

    pub fn transport_name(&self) -> &'static str {
        "UDP"
    }
}

/// A one-shot/retransmit timer in the RFC3261 style: arm with a limit,
/// poll `expired`, double the period on retransmission.
#[derive(Debug, Clone)]
pub struct SipTimer {
    deadline: Option<Instant>,
    period: Duration,
}

impl SipTimer {
    pub fn new() -> Self {
        SipTimer {
            deadline: None,
            period: Duration::ZERO,
        }
    }

    /// Arm (or re-arm) with the given period.
    pub fn set(&mut self, ms: u64) {
        self.period = Duration::from_millis(ms);
        self.deadline = Some(Instant::now() + self.period);
    }

    /// Arm only if not already running.
    pub fn set_once(&mut self, ms: u64) {
        if self.deadline.is_none() {
            self.set(ms);
        }
    }

    /// Double the period (capped) and re-arm; the retransmission backoff.
    pub fn set_double(&mut self, cap_ms: u64) {
        let next = (self.period.as_millis() as u64 * 2).min(cap_ms).max(1);
        self.set(next);
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    /// True while armed and past the deadline. Stays true until stopped
    /// or re-armed.
    pub fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

impl Default for SipTimer {
    fn default() -> Self {
        Self::new()
    }
}
