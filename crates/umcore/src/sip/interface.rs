// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The SIP wire interface: the UDP socket, the dialog map, inbound
//! routing, and the periodic timer service.
//!
//! Inbound dispatch probes the dialog map twice — (Call-ID, local tag),
//! then (Call-ID, "") for the ACK that may still lack our tag — and
//! treats an unmatched INVITE/MESSAGE as session origination. Anything
//! else unmatched gets a 404, or a 400 when the To user is malformed.

use super::dialog::{DialogAction, SipDialog};
use super::msg::SipMessage;
use super::parse::parse_message;
use super::transaction::{SipTransactionTu, TuKey};
use super::utils::IpAddressSpec;
use super::{DialogMessage, DialogSink, DialogType};
use crate::config::Config;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Owns the free RTP port pool. The core asks for a port at SDP time;
/// release happens when a dialog is purged.
pub trait RtpPortAllocator: Send + Sync {
    fn allocate(&self) -> u16;
    fn release(&self, port: u16);
}

/// Even ports from a fixed media range.
pub struct EvenPortPool {
    free: Mutex<Vec<u16>>,
}

impl EvenPortPool {
    pub fn new(base: u16, count: u16) -> EvenPortPool {
        EvenPortPool {
            free: Mutex::new((0..count).map(|i| base + 2 * i).rev().collect()),
        }
    }
}

impl RtpPortAllocator for EvenPortPool {
    fn allocate(&self) -> u16 {
        self.free.lock().pop().unwrap_or(0)
    }

    fn release(&self, port: u16) {
        self.free.lock().push(port);
    }
}

/// Process-wide SIP plumbing shared by dialogs and transactions: the
/// socket, addressing, the transaction-user map and the L3 event sink.
pub struct SipContext {
    pub config: Arc<Config>,
    pub local_ip: String,
    pub local_port: u16,
    pub user_agent: String,
    socket: UdpSocket,
    send_lock: Mutex<()>,
    sink: RwLock<Option<Arc<dyn DialogSink>>>,
    tus: DashMap<TuKey, Arc<SipTransactionTu>>,
    rtp_ports: Arc<dyn RtpPortAllocator>,
    dialog_counter: AtomicU64,
    stopping: AtomicBool,
}

impl SipContext {
    pub fn new(
        config: Arc<Config>,
        rtp_ports: Option<Arc<dyn RtpPortAllocator>>,
    ) -> std::io::Result<Arc<SipContext>> {
        let mut local_ip = config.get_str("SIP.Local.IP");
        if local_ip.is_empty() || local_ip == "auto" {
            local_ip = local_ip_address::local_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|_| "127.0.0.1".to_string());
        }
        let local_port = config.get_num("SIP.Local.Port").max(0) as u16;
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_reuse_address(true)?;
        sock.bind(&SocketAddr::from(([0, 0, 0, 0], local_port)).into())?;
        let socket: UdpSocket = sock.into();
        let local_port = socket.local_addr()?.port();
        log::info!("[Sip] interface on {local_ip}:{local_port}");
        Ok(Arc::new(SipContext {
            config,
            local_ip,
            local_port,
            user_agent: "umcore".to_string(),
            socket,
            send_lock: Mutex::new(()),
            sink: RwLock::new(None),
            tus: DashMap::new(),
            rtp_ports: rtp_ports.unwrap_or_else(|| Arc::new(EvenPortPool::new(16484, 50))),
            dialog_counter: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
        }))
    }

    pub fn local_ip_and_port(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }

    pub fn set_sink(&self, sink: Arc<dyn DialogSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Deliver a dialog event to L3.
    pub fn deliver(&self, msg: DialogMessage) {
        match self.sink.read().as_ref() {
            Some(s) => s.dialog_message(msg),
            None => log::debug!("[Sip] dropping dialog message with no sink: {msg:?}"),
        }
    }

    pub fn allocate_rtp_port(&self) -> u16 {
        self.rtp_ports.allocate()
    }

    pub fn release_rtp_port(&self, port: u16) {
        if port != 0 {
            self.rtp_ports.release(port);
        }
    }

    pub fn next_dialog_id(&self) -> u64 {
        self.dialog_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Serialize and send toward a resolved peer.
    pub fn send(&self, msg: &SipMessage, peer: &IpAddressSpec) {
        let Some(addr) = peer.addr else {
            log::warn!("[Sip] dropping {}: peer {} unresolved", msg.first_line(), peer.name);
            return;
        };
        self.send_to_addr(msg, addr);
    }

    pub fn send_to_addr(&self, msg: &SipMessage, addr: SocketAddr) {
        let hot = self.config.hot();
        if hot.simulated_packet_loss > 0
            && rand::rng().random_range(0..100) < hot.simulated_packet_loss
        {
            log::info!("[Sip] simulating lost packet {}", msg.first_line());
            return;
        }
        let wire = msg.generate(&self.user_agent);
        let _guard = self.send_lock.lock();
        log::debug!("[Sip] send to {addr}: {}", msg.first_line());
        if let Err(err) = self.socket.send_to(wire.as_bytes(), addr) {
            log::warn!("[Sip] send failed: {err}");
        }
    }

    pub fn register_tu(&self, tu: Arc<SipTransactionTu>) {
        self.tus.insert(tu.key(), tu);
    }

    pub fn find_tu(&self, key: &TuKey) -> Option<Arc<SipTransactionTu>> {
        self.tus.get(key).map(|e| e.value().clone())
    }

    fn service_tus(&self) {
        let keys: Vec<TuKey> = self.tus.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some(tu) = self.find_tu(&key) {
                if tu.periodic_service() {
                    self.tus.remove(&key);
                }
            }
        }
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    fn try_clone_socket(&self) -> std::io::Result<UdpSocket> {
        self.socket.try_clone()
    }
}

/// L3's hook for session origination: a new MT dialog was created from an
/// inbound INVITE or MESSAGE.
pub trait MtHandler: Send + Sync {
    fn new_mt_dialog(&self, dialog: Arc<SipDialog>, request: &SipMessage);
}

/// Release gate for dead dialogs: true once no L3 transaction still
/// references the id.
pub type ReleaseCheck = Arc<dyn Fn(u64) -> bool + Send + Sync>;

/// The dialog map and its service threads.
pub struct SipInterface {
    pub ctx: Arc<SipContext>,
    dialogs: DashMap<String, Arc<SipDialog>>,
    dead: Mutex<Vec<Arc<SipDialog>>>,
    mt_handler: RwLock<Option<Arc<dyn MtHandler>>>,
    release_check: RwLock<Option<ReleaseCheck>>,
}

fn map_key(call_id: &str, local_tag: &str) -> String {
    format!("{call_id};tag={local_tag}")
}

/// A To user must look like a subscriber id: IMSI digits, a TMSI handle,
/// or plain dialed digits.
fn valid_to_user(user: &str) -> bool {
    if let Some(digits) = user.strip_prefix("IMSI") {
        return digits.len() >= 14 && digits.bytes().all(|b| b.is_ascii_digit());
    }
    if let Some(hex) = user.strip_prefix("TMSI") {
        return !hex.is_empty() && hex.bytes().all(|b| b.is_ascii_hexdigit());
    }
    !user.is_empty() && user.bytes().all(|b| b.is_ascii_digit() || b == b'+' || b == b'*' || b == b'#')
}

impl SipInterface {
    pub fn new(ctx: Arc<SipContext>) -> Arc<SipInterface> {
        Arc::new(SipInterface {
            ctx,
            dialogs: DashMap::new(),
            dead: Mutex::new(Vec::new()),
            mt_handler: RwLock::new(None),
            release_check: RwLock::new(None),
        })
    }

    pub fn set_mt_handler(&self, h: Arc<dyn MtHandler>) {
        *self.mt_handler.write() = Some(h);
    }

    pub fn set_release_check(&self, c: ReleaseCheck) {
        *self.release_check.write() = Some(c);
    }

    /// Spawn the receive and timer threads.
    pub fn start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let sock = self
            .ctx
            .try_clone_socket()
            .expect("cloning the SIP socket");
        sock.set_read_timeout(Some(Duration::from_millis(250)))
            .expect("setting SIP read timeout");
        std::thread::Builder::new()
            .name("sip-rx".to_string())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                while !me.ctx.stopping() {
                    match sock.recv_from(&mut buf) {
                        Ok((n, from)) => me.on_datagram(&buf[..n], from),
                        Err(ref e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(err) => {
                            log::warn!("[Sip] receive failed: {err}");
                            std::thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
            })
            .expect("spawning sip-rx");

        let me = Arc::clone(self);
        std::thread::Builder::new()
            .name("sip-service".to_string())
            .spawn(move || {
                while !me.ctx.stopping() {
                    me.periodic_service();
                    std::thread::sleep(Duration::from_millis(100));
                }
            })
            .expect("spawning sip-service");
    }

    /// Register a freshly created dialog (outbound, or inbound handover).
    pub fn add_dialog(&self, dialog: &Arc<SipDialog>) {
        let key = map_key(&dialog.call_id(), &self.initial_tag(dialog));
        if let Some(previous) = self.dialogs.insert(key.clone(), dialog.clone()) {
            log::warn!("[Sip] dialog map collision on {key}");
            self.dead.lock().push(previous);
        }
    }

    fn initial_tag(&self, dialog: &Arc<SipDialog>) -> String {
        // Server dialogs stay keyed under the empty tag until the ACK.
        if dialog.dialog_type.is_server() {
            String::new()
        } else {
            dialog.local_tag()
        }
    }

    /// Rewrite a server dialog's key once the ACK confirmed our tag.
    pub fn add_local_tag(&self, dialog: &Arc<SipDialog>) {
        let call_id = dialog.call_id();
        let old = map_key(&call_id, "");
        let new = map_key(&call_id, &dialog.local_tag());
        if self.dialogs.remove(&old).is_some() || !self.dialogs.contains_key(&new) {
            self.dialogs.insert(new, dialog.clone());
        }
    }

    /// Pull a dialog out of the active map onto the dead list.
    pub fn remove_dialog(&self, dialog: &Arc<SipDialog>) {
        let call_id = dialog.call_id();
        for key in [
            map_key(&call_id, &dialog.local_tag()),
            map_key(&call_id, ""),
        ] {
            if let Some((_, d)) = self.dialogs.remove(&key) {
                self.dead.lock().push(d);
            }
        }
    }

    pub fn find_dialog(&self, call_id: &str, local_tag: &str) -> Option<Arc<SipDialog>> {
        self.dialogs
            .get(&map_key(call_id, local_tag))
            .map(|e| e.value().clone())
    }

    pub fn dialog_count(&self) -> usize {
        self.dialogs.len()
    }

    /// Find the dialog a message belongs to: (Call-ID, local tag) first,
    /// then the empty-tag probe for the server-side ACK.
    fn find_dialog_by_msg(&self, msg: &SipMessage) -> Option<Arc<SipDialog>> {
        let local_tag = msg.local_tag().to_string();
        if let Some(d) = self.find_dialog(&msg.call_id, &local_tag) {
            return Some(d);
        }
        if msg.is_ack() || !local_tag.is_empty() {
            return self.find_dialog(&msg.call_id, "");
        }
        None
    }

    /// One inbound datagram.
    pub fn on_datagram(&self, data: &[u8], from: SocketAddr) {
        let msg = match parse_message(data) {
            Ok(m) => m,
            Err(err) => {
                log::info!("[Sip] dropping unparseable datagram from {from}: {err}");
                return;
            }
        };
        log::debug!("[Sip] recv from {from}: {}", msg.first_line());

        // Replies match client transactions first.
        if !msg.is_request() {
            let key = (
                msg.call_id.clone(),
                msg.cseq_method.clone(),
                msg.cseq_num,
            );
            if let Some(tu) = self.ctx.find_tu(&key) {
                tu.on_response(&msg);
                return;
            }
        }

        if let Some(dialog) = self.find_dialog_by_msg(&msg) {
            if dialog.handle_msg(&msg) == DialogAction::RegisterLocalTag {
                self.add_local_tag(&dialog);
            }
            return;
        }

        if !msg.is_request() {
            log::info!("[Sip] dropping unmatched response {}", msg.first_line());
            return;
        }
        if msg.is_ack() {
            return; // an ACK for something long gone
        }
        if msg.is_invite() || msg.is_message() {
            let to_user = msg.to.username().to_string();
            if !valid_to_user(&to_user) {
                log::info!("[Sip] 400 for malformed To user {to_user:?}");
                let reply = SipMessage::reply(&msg, 400, "Bad Request", None);
                self.ctx.send_to_addr(&reply, from);
                return;
            }
            let dtype = if msg.is_invite() {
                DialogType::Mtc
            } else {
                DialogType::MtSms
            };
            let dialog = SipDialog::new_mt(self.ctx.clone(), dtype, &msg);
            // Replies and in-dialog requests go back to where the
            // request came from.
            dialog.inner.lock().vars.proxy = IpAddressSpec {
                name: from.to_string(),
                addr: Some(from),
            };
            self.dialogs
                .insert(map_key(&msg.call_id, ""), dialog.clone());
            match self.mt_handler.read().as_ref() {
                Some(h) => h.new_mt_dialog(dialog, &msg),
                None => {
                    log::warn!("[Sip] inbound {} with no MT handler", msg.first_line());
                    dialog.mtc_early_error(super::TermCause::Congestion);
                }
            }
            return;
        }
        log::info!("[Sip] 404 for unmatched {}", msg.first_line());
        let reply = SipMessage::reply(&msg, 404, "Not Found", None);
        self.ctx.send_to_addr(&reply, from);
    }

    /// Timer pass over every dialog and transaction, then the dead-list
    /// purge.
    pub fn periodic_service(&self) {
        // Iterate a snapshot; dialog locks are never taken while holding
        // the map's shards.
        let snapshot: Vec<Arc<SipDialog>> =
            self.dialogs.iter().map(|e| e.value().clone()).collect();
        for dialog in snapshot {
            if dialog.periodic_service() {
                self.remove_dialog(&dialog);
            } else if dialog.is_stuck() {
                log::warn!(
                    "[Sip] dialog {} stuck in {}, forcing termination",
                    dialog.dialog_id,
                    dialog.sip_state()
                );
                self.remove_dialog(&dialog);
            }
        }
        self.ctx.service_tus();
        self.purge_dead();
    }

    fn purge_dead(&self) {
        let check = self.release_check.read().clone();
        let mut dead = self.dead.lock();
        dead.retain(|d| {
            let released = check
                .as_ref()
                .map_or(true, |c| c(d.tran_id.load(Ordering::SeqCst)));
            if released {
                self.ctx.release_rtp_port(d.rtp_port());
            }
            !released
        });
    }
}

#[cfg(test)]
pub(crate) fn test_sip_context() -> Arc<SipContext> {
    let cfg = Arc::new(Config::new());
    cfg.set("SIP.Local.Port", "0"); // ephemeral for tests
    SipContext::new(cfg, None).expect("test SIP context")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::DialogState;
    use parking_lot::Mutex as PMutex;

    struct Collect(PMutex<Vec<DialogMessage>>);

    impl DialogSink for Collect {
        fn dialog_message(&self, msg: DialogMessage) {
            self.0.lock().push(msg);
        }
    }

    #[test]
    fn test_valid_to_users() {
        assert!(valid_to_user("IMSI001010000000001"));
        assert!(valid_to_user("TMSI4f3a2b1c"));
        assert!(valid_to_user("411"));
        assert!(valid_to_user("+15551234567"));
        assert!(!valid_to_user(""));
        assert!(!valid_to_user("IMSIabc"));
        assert!(!valid_to_user("bob"));
    }

    #[test]
    fn test_unmatched_invite_creates_mt_dialog() {
        let ctx = test_sip_context();
        let iface = SipInterface::new(ctx.clone());
        let raw = b"INVITE sip:IMSI001010000000001@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5099;branch=z9hG4bKOBTSdddddddddddddddd\r\n\
From: <sip:2600@127.0.0.1>;tag=peer1\r\nTo: <sip:IMSI001010000000001@127.0.0.1>\r\n\
Call-ID: mtcall1\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n";
        iface.on_datagram(raw, "127.0.0.1:5099".parse().unwrap());
        let dlg = iface.find_dialog("mtcall1", "").expect("MT dialog created");
        assert_eq!(dlg.dialog_type, DialogType::Mtc);
        assert_eq!(dlg.remote_tag(), "peer1");
        assert!(!dlg.local_tag().is_empty());
    }

    struct AnswerImmediately;

    impl MtHandler for AnswerImmediately {
        fn new_mt_dialog(&self, dialog: Arc<SipDialog>, _request: &SipMessage) {
            dialog.mtc_send_trying();
            dialog.mtc_send_ringing();
        }
    }

    #[test]
    fn test_tag_rekey_on_ack() {
        let ctx = test_sip_context();
        let iface = SipInterface::new(ctx.clone());
        let sink = Arc::new(Collect(PMutex::new(Vec::new())));
        ctx.set_sink(sink.clone());
        iface.set_mt_handler(Arc::new(AnswerImmediately));

        let invite = b"INVITE sip:IMSI001010000000001@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5099;branch=z9hG4bKOBTSeeeeeeeeeeeeeeee\r\n\
From: <sip:2600@127.0.0.1>;tag=peer2\r\nTo: <sip:IMSI001010000000001@127.0.0.1>\r\n\
Call-ID: mtcall2\r\nCSeq: 1 INVITE\r\nContent-Type: application/sdp\r\nContent-Length: 0\r\n\r\n";
        let from = "127.0.0.1:5099".parse().unwrap();
        iface.on_datagram(invite, from);
        let dlg = iface.find_dialog("mtcall2", "").unwrap();
        let tag = dlg.local_tag();

        let ack = format!(
            "ACK sip:IMSI001010000000001@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5099;branch=z9hG4bKOBTSffffffffffffffff\r\n\
From: <sip:2600@127.0.0.1>;tag=peer2\r\nTo: <sip:IMSI001010000000001@127.0.0.1>;tag={tag}\r\n\
Call-ID: mtcall2\r\nCSeq: 1 ACK\r\nContent-Length: 0\r\n\r\n"
        );
        iface.on_datagram(ack.as_bytes(), from);
        assert!(iface.find_dialog("mtcall2", &tag).is_some());
        assert!(iface.find_dialog("mtcall2", "").is_none());
        let states: Vec<DialogState> = sink.0.lock().iter().map(|m| m.state).collect();
        assert!(states.contains(&DialogState::Active));
    }

    #[test]
    fn test_unmatched_request_gets_404() {
        let ctx = test_sip_context();
        let iface = SipInterface::new(ctx.clone());
        let recv = UdpSocket::bind("127.0.0.1:0").unwrap();
        recv.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let from = recv.local_addr().unwrap();
        let bye = b"BYE sip:whatever@127.0.0.1 SIP/2.0\r\n\
Via: SIP/2.0/UDP 127.0.0.1:5099;branch=z9hG4bKOBTS0000000000000000\r\n\
From: <sip:2600@127.0.0.1>;tag=x\r\nTo: <sip:411@127.0.0.1>;tag=y\r\n\
Call-ID: nosuchcall\r\nCSeq: 2 BYE\r\nContent-Length: 0\r\n\r\n";
        iface.on_datagram(bye, from);
        let mut buf = [0u8; 1024];
        let (n, _) = recv.recv_from(&mut buf).unwrap();
        let reply = parse_message(&buf[..n]).unwrap();
        assert_eq!(reply.code, 404);
        assert_eq!(reply.call_id, "nosuchcall");
    }

    #[test]
    fn test_parse_fuzz_never_panics() {
        let ctx = test_sip_context();
        let iface = SipInterface::new(ctx);
        let mut rng = fastrand::Rng::with_seed(0xf22d);
        let from = "127.0.0.1:9".parse().unwrap();
        for _ in 0..1000 {
            let len = rng.usize(0..600);
            let data: Vec<u8> = (0..len).map(|_| rng.u8(..)).collect();
            iface.on_datagram(&data, from);
        }
    }
}
