// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SIP dialogs and the INVITE transaction layers (RFC3261 12, 17).
//!
//! One [`SipDialog`] per call, SMS, USSD or registration exchange. The
//! MO (client) and MT (server) INVITE transaction machines live here,
//! folded into the dialog the way the message routing actually flows;
//! the non-INVITE client transactions (BYE/CANCEL/INFO/REGISTER) are the
//! transaction-user objects in [`super::transaction`].

use super::interface::SipContext;
use super::msg::SipMessage;
use super::parse::{SipPreposition, SipUri, SipVia};
use super::rtp::RtpSession;
use super::sdp::{self, Codec, CodecSet, SdpInfo};
use super::utils::{globally_unique_id, make_branch, make_tag, IpAddressSpec, SipTimer};
use super::{DialogContent, DialogMessage, DialogState, DialogType, SipState, TermCause};
use crate::audio::AudioFrame;
use crate::config::{SIP_T1_MS, SIP_T2_MS, SIP_T4_MS, SIP_TIMER_D_MS};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum interval between resends of the same response to duplicate
/// inbound requests.
const DUPLICATE_THROTTLE: Duration = Duration::from_millis(100);

/// What the interface must do after routing a message to a dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogAction {
    None,
    /// The ACK arrived; rekey the dialog map under (Call-ID, local tag).
    RegisterLocalTag,
}

/// RFC3261 dialog identification state plus our transport addressing.
#[derive(Debug, Clone)]
pub struct DialogStateVars {
    /// Used in From of requests we originate; its tag is the local tag.
    pub local: SipPreposition,
    /// Used in To of requests; its tag, once set, never changes.
    pub remote: SipPreposition,
    pub call_id: String,
    pub proxy: IpAddressSpec,
    /// CSeq of the last request we originated in this dialog.
    pub local_cseq: u32,
    pub route_set: Vec<String>,
}

impl DialogStateVars {
    pub fn next_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }
}

pub(crate) struct DialogInner {
    pub vars: DialogStateVars,
    pub sip_state: SipState,
    state_age: Instant,
    prev_pushed: DialogState,
    /// The INVITE or MESSAGE that created this dialog (ours or theirs).
    pub invite: Option<SipMessage>,
    pub invite_branch: String,
    /// MO: last response received (2xx kept for duplicate detection).
    /// MT: last response sent (resent on duplicates and timer G).
    pub last_response: Option<SipMessage>,
    last_resend_at: Option<Instant>,
    pub received_180: bool,

    // Client-side timers (RFC3261 17.1).
    timer_ae: SipTimer,
    timer_bf: SipTimer,
    timer_k: SipTimer,
    timer_d: SipTimer,
    // Server-side timers (RFC3261 17.2).
    timer_g: SipTimer,
    timer_h: SipTimer,
    timer_j: SipTimer,

    pub sdp_offer: Option<SdpInfo>,
    pub sdp_answer: Option<SdpInfo>,
    rtp: Option<RtpSession>,
    pub rtp_port: u16,
    pub codec: Codec,
}

/// One SIP dialog (or the registration pseudo-dialog).
pub struct SipDialog {
    pub dialog_type: DialogType,
    pub dialog_id: u64,
    /// The owning L3 transaction; dialog events carry it upward.
    pub tran_id: AtomicU64,
    pub(crate) ctx: Arc<SipContext>,
    pub(crate) inner: Mutex<DialogInner>,
}

impl SipDialog {
    fn new(ctx: Arc<SipContext>, dialog_type: DialogType, vars: DialogStateVars) -> Arc<SipDialog> {
        Arc::new(SipDialog {
            dialog_type,
            dialog_id: ctx.next_dialog_id(),
            tran_id: AtomicU64::new(0),
            ctx,
            inner: Mutex::new(DialogInner {
                vars,
                sip_state: SipState::Null,
                state_age: Instant::now(),
                prev_pushed: DialogState::Undefined,
                invite: None,
                invite_branch: String::new(),
                last_response: None,
                last_resend_at: None,
                received_180: false,
                timer_ae: SipTimer::new(),
                timer_bf: SipTimer::new(),
                timer_k: SipTimer::new(),
                timer_d: SipTimer::new(),
                timer_g: SipTimer::new(),
                timer_h: SipTimer::new(),
                timer_j: SipTimer::new(),
                sdp_offer: None,
                sdp_answer: None,
                rtp: None,
                rtp_port: 0,
                codec: Codec::GsmFr,
            }),
        })
    }

    /// An outbound (mobile-originated) dialog: call, SMS or USSD.
    pub fn new_mo(
        ctx: Arc<SipContext>,
        dialog_type: DialogType,
        tran_id: u64,
        local_user: &str,
        called: &str,
    ) -> Arc<SipDialog> {
        let proxy_key = match dialog_type {
            DialogType::MoSms => "SIP.Proxy.SMS",
            DialogType::MoUssd => "SIP.Proxy.USSD",
            _ => "SIP.Proxy.Speech",
        };
        let proxy_name = ctx.config.get_str(proxy_key);
        let proxy = IpAddressSpec::resolve(&proxy_name, proxy_key);
        let local_uri = SipUri::make(local_user, &ctx.local_ip_and_port(), 0);
        let remote_uri = SipUri::make(called, &proxy.name, 0);
        let vars = DialogStateVars {
            local: SipPreposition::new("", local_uri, &make_tag()),
            remote: SipPreposition::new("", remote_uri, ""),
            call_id: globally_unique_id(""),
            proxy,
            local_cseq: 0,
            route_set: Vec::new(),
        };
        let dlg = SipDialog::new(ctx, dialog_type, vars);
        dlg.tran_id.store(tran_id, Ordering::SeqCst);
        dlg
    }

    /// An inbound (mobile-terminated) dialog created from the initial
    /// INVITE or MESSAGE. The local tag is minted now for responses; the
    /// dialog-map key keeps the empty tag until the ACK.
    pub fn new_mt(ctx: Arc<SipContext>, dialog_type: DialogType, request: &SipMessage) -> Arc<SipDialog> {
        let peer = request
            .top_via()
            .map(|v| v.sent_by.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| ctx.config.get_str("SIP.Proxy.Speech"));
        let mut local = request.to.clone();
        local.set_tag(&make_tag());
        let vars = DialogStateVars {
            local,
            remote: request.from.clone(),
            call_id: request.call_id.clone(),
            proxy: IpAddressSpec::resolve(&peer, "top via"),
            local_cseq: 0,
            route_set: request.record_routes.clone(),
        };
        let dlg = SipDialog::new(ctx, dialog_type, vars);
        {
            let mut inner = dlg.inner.lock();
            inner.invite = Some(request.clone());
            inner.invite_branch = request.branch().to_string();
            if let Some(body) = request.content_type.as_deref() {
                if body.starts_with("application/sdp") {
                    inner.sdp_offer = Some(SdpInfo::parse(&request.body));
                }
            }
        }
        dlg
    }

    /// The registration pseudo-dialog: no dialog state proper, but the
    /// transport and retransmission machinery of one.
    pub fn new_register(ctx: Arc<SipContext>) -> Arc<SipDialog> {
        let proxy_name = ctx.config.get_str("SIP.Proxy.Registration");
        let proxy = IpAddressSpec::resolve(&proxy_name, "SIP.Proxy.Registration");
        let local = SipPreposition::new("", SipUri::make("registration", &ctx.local_ip_and_port(), 0), "");
        let vars = DialogStateVars {
            local: local.clone(),
            remote: local,
            call_id: globally_unique_id("reg"),
            proxy,
            local_cseq: 0,
            route_set: Vec::new(),
        };
        SipDialog::new(ctx, DialogType::Register, vars)
    }

    // ===== Accessors =====

    pub fn call_id(&self) -> String {
        self.inner.lock().vars.call_id.clone()
    }

    pub fn local_tag(&self) -> String {
        self.inner.lock().vars.local.tag.clone()
    }

    pub fn remote_tag(&self) -> String {
        self.inner.lock().vars.remote.tag.clone()
    }

    pub fn sip_state(&self) -> SipState {
        self.inner.lock().sip_state
    }

    pub fn rtp_port(&self) -> u16 {
        self.inner.lock().rtp_port
    }

    pub fn codec(&self) -> Codec {
        self.inner.lock().codec
    }

    pub fn is_active(&self) -> bool {
        self.sip_state() == SipState::Active
    }

    pub fn sip_is_finished(&self) -> bool {
        self.sip_state().is_finished()
    }

    /// The saved initial INVITE, for duplicate identification.
    pub fn same_invite(&self, msg: &SipMessage) -> bool {
        let inner = self.inner.lock();
        inner.invite.as_ref().is_some_and(|inv| {
            inv.call_id == msg.call_id && inv.cseq_num == msg.cseq_num && inv.branch() == msg.branch()
        })
    }

    /// A dialog stuck outside Active/Register for too long is eligible
    /// for forced termination.
    pub fn is_stuck(&self) -> bool {
        let inner = self.inner.lock();
        if matches!(self.dialog_type, DialogType::Register | DialogType::Unregister) {
            return false;
        }
        let age = inner.state_age.elapsed();
        match inner.sip_state {
            SipState::Active => false,
            SipState::Fail
            | SipState::Proceeding
            | SipState::Canceled
            | SipState::Cleared => age > Duration::from_secs(30),
            _ => age > Duration::from_secs(180),
        }
    }

    // ===== State publication =====

    fn push_state_locked(
        &self,
        inner: &mut DialogInner,
        new_state: SipState,
        code: u32,
        content: DialogContent,
    ) -> Option<DialogMessage> {
        inner.sip_state = new_state;
        inner.state_age = Instant::now();
        let coarse = DialogState::from_sip_state(new_state);
        // Forward-only progress; Proceeding and Ringing may repeat.
        if coarse < inner.prev_pushed {
            return None;
        }
        if coarse == inner.prev_pushed
            && !matches!(coarse, DialogState::Proceeding | DialogState::Ringing)
        {
            return None;
        }
        inner.prev_pushed = coarse;
        Some(DialogMessage {
            tran_id: self.tran_id.load(Ordering::SeqCst),
            state: coarse,
            sip_code: code,
            content,
        })
    }

    pub(crate) fn push_state(&self, new_state: SipState, code: u32, content: DialogContent) {
        let dmsg = {
            let mut inner = self.inner.lock();
            self.push_state_locked(&mut inner, new_state, code, content)
        };
        if let Some(dmsg) = dmsg {
            self.ctx.deliver(dmsg);
        }
    }

    /// Deliver an event that is not a state change (DTMF results, USSD).
    pub(crate) fn push_event(&self, state: DialogState, code: u32, content: DialogContent) {
        self.ctx.deliver(DialogMessage {
            tran_id: self.tran_id.load(Ordering::SeqCst),
            state,
            sip_code: code,
            content,
        });
    }

    pub(crate) fn sip_write(&self, msg: &SipMessage) {
        let peer = self.inner.lock().vars.proxy.clone();
        self.ctx.send(msg, &peer);
    }

    // ===== Request construction =====

    /// A standard initial request from the dialog state.
    fn make_initial_request(&self, inner: &mut DialogInner, method: &str) -> SipMessage {
        let branch = make_branch();
        let cseq = inner.vars.next_cseq();
        let mut msg = SipMessage {
            method: method.to_string(),
            req_uri: format!("sip:{}@{}", inner.vars.remote.username(), inner.vars.proxy.name),
            from: inner.vars.local.clone(),
            to: inner.vars.remote.clone(),
            call_id: inner.vars.call_id.clone(),
            cseq_num: cseq,
            cseq_method: method.to_string(),
            max_forwards: Some("70".to_string()),
            contact: Some(format!("<sip:{}@{}>", inner.vars.local.username(), self.ctx.local_ip_and_port())),
            ..SipMessage::default()
        };
        msg.add_via(SipVia::make("UDP", &self.ctx.local_ip_and_port(), &branch));
        inner.invite_branch = branch;
        msg
    }

    /// A request within the established dialog (BYE, INFO, re-INVITE).
    pub(crate) fn make_in_dialog_request(&self, method: &str, branch: Option<String>) -> SipMessage {
        let mut inner = self.inner.lock();
        let branch = branch.unwrap_or_else(make_branch);
        let cseq = inner.vars.next_cseq();
        let mut msg = SipMessage {
            method: method.to_string(),
            req_uri: format!("sip:{}@{}", inner.vars.remote.username(), inner.vars.proxy.name),
            from: inner.vars.local.clone(),
            to: inner.vars.remote.clone(),
            call_id: inner.vars.call_id.clone(),
            cseq_num: cseq,
            cseq_method: method.to_string(),
            max_forwards: Some("70".to_string()),
            routes: inner.vars.route_set.clone(),
            ..SipMessage::default()
        };
        msg.add_via(SipVia::make("UDP", &self.ctx.local_ip_and_port(), &branch));
        msg
    }

    // ===== MO (client) side =====

    /// Send the INVITE that opens an MO call.
    pub fn moc_send_invite(&self, codecs: &CodecSet) {
        let invite = {
            let mut inner = self.inner.lock();
            inner.rtp_port = self.ctx.allocate_rtp_port();
            inner.codec = codecs.preferred().unwrap_or(Codec::GsmFr);
            let username = inner.vars.local.username().to_string();
            let offer = sdp::make_offer(&username, &self.ctx.local_ip, inner.rtp_port, codecs);
            inner.sdp_offer = Some(SdpInfo::parse(&offer));
            let mut invite = self.make_initial_request(&mut inner, "INVITE");
            invite.add_body("application/sdp", &offer);
            inner.invite = Some(invite.clone());
            inner.timer_ae.set(2 * SIP_T1_MS);
            inner.timer_bf.set_once(64 * SIP_T1_MS);
            invite
        };
        self.sip_write(&invite);
        self.push_state(SipState::Starting, 0, DialogContent::None);
    }

    /// Send the INVITE that opens an MO USSD session.
    pub fn mo_ussd_send_invite(&self, ussd: &str) {
        let invite = {
            let mut inner = self.inner.lock();
            let mut invite = self.make_initial_request(&mut inner, "INVITE");
            invite.add_body("application/vnd.3gpp.ussd", ussd);
            inner.invite = Some(invite.clone());
            inner.timer_ae.set(2 * SIP_T1_MS);
            inner.timer_bf.set_once(64 * SIP_T1_MS);
            invite
        };
        self.sip_write(&invite);
        self.push_state(SipState::Starting, 0, DialogContent::None);
    }

    /// Re-originate a call arriving by inter-BTS handover: the INVITE
    /// carries the SDP learned from the REFER, and the dialog sits in
    /// the handover state until the access burst lands.
    pub fn send_invite_handover(&self, sdp_body: &str) {
        let invite = {
            let mut inner = self.inner.lock();
            inner.sdp_offer = Some(SdpInfo::parse(sdp_body));
            inner.rtp_port = self.ctx.allocate_rtp_port();
            let mut invite = self.make_initial_request(&mut inner, "INVITE");
            invite.add_body("application/sdp", sdp_body);
            inner.invite = Some(invite.clone());
            inner.timer_ae.set(2 * SIP_T1_MS);
            inner.timer_bf.set_once(64 * SIP_T1_MS);
            invite
        };
        self.sip_write(&invite);
        self.push_state(SipState::HandoverInbound, 0, DialogContent::None);
    }

    /// The REFER that hands this call to `target_bts`. Its body carries
    /// the remote RTP endpoint (so the target BTS learns it) under a
    /// version id bumped to the current time.
    pub fn handover_refer_message(&self, target_bts: &str) -> SipMessage {
        let (remote_sdp, codec, username) = {
            let inner = self.inner.lock();
            let remote = if self.dialog_type.is_server() {
                inner.sdp_offer.clone()
            } else {
                inner.sdp_answer.clone()
            };
            (
                remote.unwrap_or_default(),
                inner.codec,
                inner.vars.local.username().to_string(),
            )
        };
        let mut msg = self.make_in_dialog_request("REFER", None);
        msg.add_header("Refer-To", &format!("<sip:{target_bts}>"));
        msg.add_header("Referred-By", &format!("<sip:{}@{}>", username, self.ctx.local_ip_and_port()));
        msg.add_body(
            "application/sdp",
            &sdp::make_refer_sdp(&username, &remote_sdp.host, remote_sdp.rtp_port, codec),
        );
        msg
    }

    /// Submit an MO SMS as a MESSAGE.
    pub fn mo_sms_send_message(&self, body: &str, content_type: &str) {
        let msg = {
            let mut inner = self.inner.lock();
            let mut msg = self.make_initial_request(&mut inner, "MESSAGE");
            msg.add_body(content_type, body);
            inner.invite = Some(msg.clone());
            inner.timer_ae.set(2 * SIP_T1_MS);
            inner.timer_bf.set_once(64 * SIP_T1_MS);
            msg
        };
        self.sip_write(&msg);
        self.push_state(SipState::MoSmsSubmit, 0, DialogContent::None);
    }

    /// The UAC-core ACK for a 2xx: Call-ID, From, Request-URI and top via
    /// of the INVITE, To carrying the 2xx's tag (RFC3261 13.1, 17.1.1.3).
    pub fn moc_send_ack(&self) {
        let ack = {
            let inner = self.inner.lock();
            let Some(invite) = inner.invite.as_ref() else {
                return;
            };
            let mut ack = SipMessage::ack_or_cancel("ACK", invite);
            ack.to = inner.vars.remote.clone();
            ack
        };
        self.sip_write(&ack);
    }

    /// The transaction-layer ACK for a non-2xx final response: same as the
    /// UAC ACK but To is copied from the response itself.
    fn tl_send_ack(&self, response: &SipMessage) {
        let ack = {
            let inner = self.inner.lock();
            let Some(invite) = inner.invite.as_ref() else {
                return;
            };
            let mut ack = SipMessage::ack_or_cancel("ACK", invite);
            ack.to = response.to.clone();
            ack
        };
        self.sip_write(&ack);
    }

    /// Route an inbound message on an MO dialog.
    fn mo_write_high_side(&self, msg: &SipMessage) {
        if msg.is_request() {
            if msg.is_cancel() {
                self.inner.lock().timer_bf.stop();
                self.mt_cancel(msg);
            } else if msg.is_bye() {
                // A BYE before the dialog is established rates a 405, but
                // quietly terminating is kinder to broken peers.
                self.mt_bye(msg);
            } else {
                log::warn!("[Dialog {}] ignoring {}", self.dialog_id, msg.first_line());
                let oops = SipMessage::reply(msg, 405, "Method Not Allowed", None);
                self.sip_write(&oops);
            }
            return;
        }
        // A response: latch the remote tag on first sight, then run the
        // client transaction machine.
        let is_invite_dialog = {
            let mut inner = self.inner.lock();
            if inner.vars.remote.tag.is_empty() && !msg.to.tag.is_empty() {
                inner.vars.remote.set_tag(&msg.to.tag);
            }
            inner.last_response = Some(msg.clone());
            inner
                .invite
                .as_ref()
                .is_some_and(|inv| inv.method == "INVITE")
        };
        if is_invite_dialog {
            {
                let mut inner = self.inner.lock();
                inner.timer_ae.stop();
                inner.timer_bf.stop();
            }
            self.handle_invite_response(msg);
        } else {
            self.handle_message_response(msg);
        }
    }

    fn handle_invite_response(&self, msg: &SipMessage) {
        let code = msg.code;
        match code {
            1..=199 => {
                if code == 180 {
                    self.inner.lock().received_180 = true;
                    self.push_state(SipState::Ringing, code, DialogContent::None);
                } else {
                    self.push_state(SipState::Proceeding, code, DialogContent::None);
                }
                // Still waiting for a final answer.
                self.inner.lock().timer_bf.set_once(64 * SIP_T1_MS);
            }
            200..=299 => {
                let already_active = {
                    let mut inner = self.inner.lock();
                    let dup = inner.sip_state == SipState::Active;
                    if !dup {
                        if msg
                            .content_type
                            .as_deref()
                            .is_some_and(|t| t.starts_with("application/sdp"))
                        {
                            inner.sdp_answer = Some(SdpInfo::parse(&msg.body));
                        }
                        self.init_rtp_locked(&mut inner, false);
                    }
                    dup
                };
                self.moc_send_ack();
                if !already_active {
                    if self.dialog_type == DialogType::MoUssd {
                        // The USSD answer rides in the 2xx body.
                        self.push_event(
                            DialogState::Active,
                            code,
                            DialogContent::Ussd(msg.body.clone()),
                        );
                    }
                    self.push_state(SipState::Active, code, DialogContent::None);
                }
            }
            486 | 600 | 603 => {
                self.tl_send_ack(msg);
                self.inner.lock().timer_d.set_once(SIP_TIMER_D_MS);
                self.push_state(SipState::MocBusy, code, DialogContent::None);
            }
            _ => {
                self.tl_send_ack(msg);
                self.inner.lock().timer_d.set_once(SIP_TIMER_D_MS);
                self.push_state(SipState::Fail, code, DialogContent::None);
            }
        }
    }

    /// Responses to a MESSAGE: 1xx ignored, 2xx cleared, else failed
    /// (RFC3261 17.1.2 collapsed, per the non-INVITE client machine).
    fn handle_message_response(&self, msg: &SipMessage) {
        let code = msg.code;
        {
            let mut inner = self.inner.lock();
            inner.timer_ae.stop();
            inner.timer_bf.stop();
            if code < 200 {
                return;
            }
            inner.timer_k.set_once(SIP_T4_MS);
        }
        if msg.code_class() == 200 {
            self.push_state(SipState::Cleared, code, DialogContent::None);
        } else {
            self.push_state(SipState::Fail, code, DialogContent::None);
        }
    }

    // ===== MT (server) side =====

    fn mt_write_low_side(&self, response: &SipMessage) {
        self.inner.lock().last_response = Some(response.clone());
        self.sip_write(response);
    }

    pub fn mtc_send_trying(&self) {
        let reply = {
            let inner = self.inner.lock();
            let Some(invite) = inner.invite.as_ref() else {
                drop(inner);
                self.push_state(SipState::Fail, 0, DialogContent::None);
                return;
            };
            SipMessage::reply(invite, 100, "Trying", Some(&inner.vars.local))
        };
        self.mt_write_low_side(&reply);
        self.push_state(SipState::Proceeding, 100, DialogContent::None);
    }

    pub fn mtc_send_ringing(&self) {
        if self.sip_state() == SipState::Fail {
            return;
        }
        let reply = {
            let inner = self.inner.lock();
            let Some(invite) = inner.invite.as_ref() else {
                return;
            };
            SipMessage::reply(invite, 180, "Ringing", Some(&inner.vars.local))
        };
        self.mt_write_low_side(&reply);
        self.push_state(SipState::Proceeding, 180, DialogContent::None);
    }

    /// Answer the call: allocate the RTP port, build the SDP answer, send
    /// 200 OK and arm timers G and H for the ACK wait.
    pub fn mtc_send_ok(&self, codec: Codec) {
        let reply = {
            let mut inner = self.inner.lock();
            let Some(invite) = inner.invite.as_ref().cloned() else {
                return;
            };
            inner.rtp_port = self.ctx.allocate_rtp_port();
            inner.codec = codec;
            let offer = inner.sdp_offer.clone().unwrap_or_default();
            let username = inner.vars.local.username().to_string();
            let answer = sdp::make_answer(&offer, &username, &self.ctx.local_ip, inner.rtp_port, codec);
            inner.sdp_answer = Some(SdpInfo::parse(&answer));
            // The peer's media endpoint comes from the offer.
            self.init_rtp_locked(&mut inner, true);
            let mut reply = SipMessage::reply(&invite, 200, "OK", Some(&inner.vars.local));
            reply.add_body("application/sdp", &answer);
            reply.contact = Some(format!(
                "<sip:{}@{}>",
                inner.vars.local.username(),
                self.ctx.local_ip_and_port()
            ));
            inner.timer_g.set(SIP_T1_MS);
            inner.timer_h.set_once(64 * SIP_T1_MS);
            reply
        };
        self.mt_write_low_side(&reply);
        self.push_state(SipState::Connecting, 200, DialogContent::None);
    }

    /// Reply to an MT MESSAGE (SMS delivery result).
    pub fn mt_sms_reply(&self, code: u32, reason: &str) {
        let reply = {
            let inner = self.inner.lock();
            let Some(request) = inner.invite.as_ref() else {
                log::info!("[Dialog {}] clearing locally-generated transaction", self.dialog_id);
                return;
            };
            SipMessage::reply(request, code, reason, Some(&inner.vars.local))
        };
        self.mt_write_low_side(&reply);
        self.push_state(
            if code == 200 { SipState::Cleared } else { SipState::Fail },
            code,
            DialogContent::None,
        );
    }

    /// Terminate an unanswered MT INVITE with a 3xx-6xx response.
    pub fn mtc_early_error(&self, cause: TermCause) {
        let (mut code, mut reason) = cause.sip_code_and_reason();
        if code == 0 {
            code = 480;
            reason = "Temporarily Unavailable";
        }
        let reply = {
            let mut inner = self.inner.lock();
            let Some(invite) = inner.invite.as_ref() else {
                return;
            };
            let mut reply = SipMessage::reply(invite, code, reason, Some(&inner.vars.local));
            reply.reason_header = Some(cause.reason_header());
            inner.timer_g.set(SIP_T1_MS);
            inner.timer_h.set_once(64 * SIP_T1_MS);
            reply
        };
        self.mt_write_low_side(&reply);
        self.push_state(SipState::ModError, code, DialogContent::None);
    }

    /// Inbound CANCEL: 487 on the INVITE transaction, 200 to the CANCEL.
    fn mt_cancel(&self, cancel: &SipMessage) {
        let (invite_487, cancel_ok) = {
            let mut inner = self.inner.lock();
            let invite_487 = inner
                .invite
                .as_ref()
                .map(|inv| SipMessage::reply(inv, 487, "Request Terminated", Some(&inner.vars.local)));
            let ok = SipMessage::reply(cancel, 200, "OK", Some(&inner.vars.local));
            inner.timer_j.set_once(64 * SIP_T1_MS);
            (invite_487, ok)
        };
        if let Some(r) = invite_487 {
            self.mt_write_low_side(&r);
        }
        self.sip_write(&cancel_ok);
        self.push_state(SipState::MtdCanceling, 487, DialogContent::None);
    }

    /// Inbound BYE: 200 OK and clear down.
    fn mt_bye(&self, bye: &SipMessage) {
        let reply = {
            let mut inner = self.inner.lock();
            inner.timer_j.set_once(64 * SIP_T1_MS);
            SipMessage::reply(bye, 200, "OK", Some(&inner.vars.local))
        };
        self.sip_write(&reply);
        self.push_state(SipState::MtdClearing, 200, DialogContent::None);
    }

    /// Inbound traffic on an MT dialog: duplicate INVITEs, the ACK, and
    /// in-dialog requests.
    fn mt_write_high_side(&self, msg: &SipMessage) -> DialogAction {
        if !msg.is_request() {
            log::warn!("[Dialog {}] ignoring response {}", self.dialog_id, msg.first_line());
            return DialogAction::None;
        }
        if msg.is_invite() || msg.is_message() {
            // A retransmit: resend whatever we answered last, throttled.
            let resend = {
                let mut inner = self.inner.lock();
                let due = inner
                    .last_resend_at
                    .map_or(true, |at| at.elapsed() >= DUPLICATE_THROTTLE);
                if due {
                    inner.last_resend_at = Some(Instant::now());
                    inner.last_response.clone()
                } else {
                    None
                }
            };
            match resend {
                Some(r) => self.sip_write(&r),
                None if self.inner.lock().last_response.is_none() => self.mtc_send_trying(),
                None => {}
            }
            DialogAction::None
        } else if msg.is_ack() {
            let state = self.sip_state();
            if matches!(state, SipState::Null | SipState::Proceeding | SipState::Connecting) {
                {
                    let mut inner = self.inner.lock();
                    inner.timer_g.stop();
                    inner.timer_h.stop();
                }
                self.push_state(SipState::Active, 0, DialogContent::None);
                DialogAction::RegisterLocalTag
            } else {
                // Failed or canceled; soak up the ACK.
                let mut inner = self.inner.lock();
                inner.timer_g.stop();
                inner.timer_h.stop();
                DialogAction::None
            }
        } else if msg.is_cancel() {
            self.mt_cancel(msg);
            DialogAction::None
        } else if msg.is_bye() {
            self.mt_bye(msg);
            DialogAction::None
        } else {
            log::warn!("[Dialog {}] ignoring {}", self.dialog_id, msg.first_line());
            let oops = SipMessage::reply(msg, 405, "Method Not Allowed", None);
            self.sip_write(&oops);
            DialogAction::None
        }
    }

    /// Route one inbound message to the correct transaction machine.
    pub fn handle_msg(&self, msg: &SipMessage) -> DialogAction {
        match self.dialog_type {
            DialogType::Mtc | DialogType::MtSms => self.mt_write_high_side(msg),
            DialogType::Moc | DialogType::MoSms | DialogType::MoUssd => {
                self.mo_write_high_side(msg);
                DialogAction::None
            }
            _ => {
                log::warn!(
                    "[Dialog {}] unroutable message {} for type {:?}",
                    self.dialog_id,
                    msg.first_line(),
                    self.dialog_type
                );
                DialogAction::None
            }
        }
    }

    // ===== Cancellation =====

    /// Idempotent dialog teardown from L3. Active dialogs get a BYE,
    /// early MO dialogs a CANCEL, early MT dialogs an error response.
    /// `HandoverOutbound` terminates silently: the call now belongs to
    /// another node.
    pub fn dialog_cancel(self: &Arc<Self>, cause: TermCause) {
        if self.sip_is_finished() {
            return;
        }
        if cause == TermCause::HandoverOutbound {
            let mut inner = self.inner.lock();
            inner.sip_state = SipState::Cleared;
            inner.state_age = Instant::now();
            return;
        }
        let state = self.sip_state();
        if state == SipState::Active {
            super::transaction::send_bye(self, cause);
            self.push_state(SipState::ModClearing, 0, DialogContent::None);
        } else if self.dialog_type.is_server() {
            self.mtc_early_error(cause);
        } else {
            super::transaction::send_cancel(self, cause);
            self.push_state(SipState::ModCanceling, 0, DialogContent::None);
        }
    }

    /// Send a DTMF key as both an RFC2833 event and a SIP INFO.
    pub fn send_key(self: &Arc<Self>, key: char, rfc2833: bool) {
        if !self.is_active() {
            return;
        }
        if rfc2833 {
            let mut inner = self.inner.lock();
            if let Some(rtp) = inner.rtp.as_mut() {
                rtp.start_dtmf(key);
            }
        } else {
            super::transaction::send_info_dtmf(self, key);
        }
    }

    pub fn stop_key(&self) {
        let mut inner = self.inner.lock();
        if let Some(rtp) = inner.rtp.as_mut() {
            rtp.stop_dtmf();
        }
    }

    // ===== RTP =====

    /// Open the RTP session once the SDP exchange pins both ends.
    /// MT uses the offer's endpoint, MO the answer's.
    fn init_rtp_locked(&self, inner: &mut DialogInner, use_offer: bool) {
        let remote = if use_offer {
            inner.sdp_offer.clone()
        } else {
            inner.sdp_answer.clone()
        };
        let Some(remote) = remote else {
            log::warn!("[Dialog {}] no SDP to open RTP from", self.dialog_id);
            return;
        };
        if inner.rtp_port == 0 {
            inner.rtp_port = self.ctx.allocate_rtp_port();
        }
        let peer = format!("{}:{}", remote.host, remote.rtp_port);
        let Ok(peer_addr) = peer.parse() else {
            log::warn!("[Dialog {}] unparseable RTP peer {peer}", self.dialog_id);
            return;
        };
        let dtmf_pt = self
            .ctx
            .config
            .get_bool("SIP.DTMF.RFC2833")
            .then(|| self.ctx.config.get_num("SIP.DTMF.RFC2833.PayloadType") as u8);
        let buffer = self.ctx.config.get_num("GSM.SpeechBuffer").max(0) as u32;
        match RtpSession::new(inner.rtp_port, peer_addr, inner.codec, dtmf_pt, buffer) {
            Ok(session) => inner.rtp = Some(session),
            Err(err) => log::warn!("[Dialog {}] RTP bind failed: {err}", self.dialog_id),
        }
    }

    /// Downlink-bound audio from the radio side.
    pub fn tx_audio(&self, frame: &AudioFrame, num_flushed: u32) {
        if !self.is_active() {
            return;
        }
        let hot = self.ctx.config.hot();
        if hot.simulated_packet_loss > 0
            && rand::Rng::random_range(&mut rand::rng(), 0..100) < hot.simulated_packet_loss
        {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(rtp) = inner.rtp.as_mut() {
            rtp.tx_frame(&frame.to_bytes(), num_flushed);
        }
    }

    /// Uplink-bound audio toward the radio side; never blocks.
    pub fn rx_audio(&self) -> Option<AudioFrame> {
        if !self.is_active() {
            return None;
        }
        let mut inner = self.inner.lock();
        let codec = inner.codec;
        let bytes = inner.rtp.as_mut()?.rx_frame()?;
        let mode = match codec {
            Codec::GsmFr => crate::gsm::tables::amr::AmrMode::TchFs,
            Codec::Amr => crate::gsm::tables::amr::AmrMode::Afs12_2,
        };
        AudioFrame::from_bytes(&bytes, mode)
    }

    // ===== Timer service =====

    /// Drive the retransmission and teardown timers. Returns true when
    /// the dialog should move to the dead list.
    pub fn periodic_service(&self) -> bool {
        let mut to_send: Option<SipMessage> = None;
        let mut fail = false;
        let mut remove = false;
        {
            let mut inner = self.inner.lock();
            let state = inner.sip_state;

            // Client half.
            if inner.timer_ae.expired() {
                if matches!(
                    state,
                    SipState::Starting | SipState::HandoverInbound | SipState::MoSmsSubmit
                ) {
                    to_send = inner.invite.clone();
                    inner.timer_ae.set_double(SIP_T2_MS);
                } else {
                    inner.timer_ae.stop();
                }
            } else if inner.timer_bf.expired() || inner.timer_d.expired() {
                inner.timer_ae.stop();
                inner.timer_bf.stop();
                inner.timer_k.stop();
                inner.timer_d.stop();
                fail = true;
                remove = true;
            } else if inner.timer_k.expired() {
                inner.timer_k.stop();
                remove = true;
            }

            // Server half.
            if inner.timer_g.expired() {
                if matches!(state, SipState::Connecting | SipState::ModError) {
                    to_send = inner.last_response.clone();
                    inner.timer_g.set_double(SIP_T2_MS);
                } else {
                    inner.timer_g.stop();
                }
            } else if inner.timer_h.expired() || inner.timer_j.expired() {
                inner.timer_g.stop();
                inner.timer_h.stop();
                inner.timer_j.stop();
                if state == SipState::Connecting {
                    // No ACK ever came.
                    fail = true;
                }
                remove = true;
            }

            if !remove && state.is_finished() {
                // Wait out any kill timers still soaking up resends.
                let soaking = inner.timer_bf.is_active()
                    || inner.timer_d.is_active()
                    || inner.timer_k.is_active()
                    || inner.timer_h.is_active()
                    || inner.timer_j.is_active();
                remove = !soaking;
            }
        }
        if let Some(msg) = to_send {
            self.sip_write(&msg);
        }
        if fail {
            self.push_state(SipState::Fail, 408, DialogContent::None);
        }
        remove
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::interface::test_sip_context;

    fn mo_dialog() -> Arc<SipDialog> {
        let ctx = test_sip_context();
        SipDialog::new_mo(ctx, DialogType::Moc, 7, "IMSI001010000000001", "411")
    }

    #[test]
    fn test_mo_dialog_identity() {
        let dlg = mo_dialog();
        assert!(!dlg.call_id().is_empty());
        assert!(dlg.local_tag().starts_with("OBTS"));
        assert!(dlg.remote_tag().is_empty());
        assert_eq!(dlg.sip_state(), SipState::Null);
    }

    #[test]
    fn test_cseq_monotonic() {
        let dlg = mo_dialog();
        let a = dlg.make_in_dialog_request("INFO", None);
        let b = dlg.make_in_dialog_request("INFO", None);
        assert!(b.cseq_num > a.cseq_num);
    }

    #[test]
    fn test_remote_tag_set_once() {
        let dlg = mo_dialog();
        dlg.moc_send_invite(&CodecSet::gsm_only());
        let mut rsp = SipMessage {
            code: 180,
            reason: "Ringing".into(),
            call_id: dlg.call_id(),
            cseq_num: 1,
            cseq_method: "INVITE".into(),
            ..SipMessage::default()
        };
        rsp.to.set_tag("remote-tag-1");
        dlg.handle_msg(&rsp);
        assert_eq!(dlg.remote_tag(), "remote-tag-1");
        // A later (misbehaving) response cannot change it.
        rsp.to.set_tag("remote-tag-2");
        rsp.code = 200;
        dlg.handle_msg(&rsp);
        assert_eq!(dlg.remote_tag(), "remote-tag-1");
    }

    #[test]
    fn test_forward_only_state_publication() {
        let dlg = mo_dialog();
        dlg.push_state(SipState::Active, 200, DialogContent::None);
        // A later Proceeding must be suppressed (backward).
        let suppressed = {
            let mut inner = dlg.inner.lock();
            dlg.push_state_locked(&mut inner, SipState::Proceeding, 100, DialogContent::None)
        };
        assert!(suppressed.is_none());
        // Ringing repeats are allowed before Active.
        let dlg2 = mo_dialog();
        dlg2.push_state(SipState::Ringing, 180, DialogContent::None);
        let again = {
            let mut inner = dlg2.inner.lock();
            dlg2.push_state_locked(&mut inner, SipState::Ringing, 180, DialogContent::None)
        };
        assert!(again.is_some());
    }

    #[test]
    fn test_stuck_detection() {
        let dlg = mo_dialog();
        assert!(!dlg.is_stuck());
        {
            let mut inner = dlg.inner.lock();
            inner.sip_state = SipState::Proceeding;
            inner.state_age = Instant::now() - Duration::from_secs(31);
        }
        assert!(dlg.is_stuck());
        {
            let mut inner = dlg.inner.lock();
            inner.sip_state = SipState::Active;
        }
        assert!(!dlg.is_stuck());
    }
}
