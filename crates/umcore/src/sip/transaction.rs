// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Non-INVITE client transactions (RFC3261 17.1.2): the in-dialog BYE,
//! CANCEL and INFO transaction users, and the REGISTER client that runs
//! on the registration pseudo-dialog with RFC2617 digest authentication.
//!
//! Replies match transactions by (Call-ID, CSeq method, CSeq number).
//! The via branch is parsed and carried but deliberately not used for
//! matching: common peers emit noncompliant branches.

use super::dialog::SipDialog;
use super::interface::SipContext;
use super::msg::SipMessage;
use super::parse::{param_find, parse_authenticate, SipPreposition, SipUri, SipVia};
use super::utils::{make_branch, make_tag, IpAddressSpec, SipTimer};
use super::{DialogContent, DialogState, SipState};
use crate::config::{SIP_T1_MS, SIP_T2_MS, SIP_T4_MS};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::sync::Arc;

/// Transaction matching key: (Call-ID, CSeq method, CSeq number).
pub type TuKey = (String, String, u32);

/// What kind of client transaction this is; decides how the final
/// response lands on the dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuKind {
    Bye,
    Cancel,
    InfoDtmf,
    Register { unregister: bool },
}

struct TuInner {
    request: SipMessage,
    peer: IpAddressSpec,
    timer_e: SipTimer,
    timer_f: SipTimer,
    timer_k: SipTimer,
    completed: bool,
}

/// A client (outbound) non-INVITE transaction.
pub struct SipTransactionTu {
    pub kind: TuKind,
    ctx: Arc<SipContext>,
    /// The owning dialog; None for REGISTER exchanges.
    dialog: Option<Arc<SipDialog>>,
    tran_id: u64,
    inner: Mutex<TuInner>,
}

impl SipTransactionTu {
    fn new(
        ctx: Arc<SipContext>,
        kind: TuKind,
        dialog: Option<Arc<SipDialog>>,
        tran_id: u64,
        request: SipMessage,
        peer: IpAddressSpec,
    ) -> Arc<SipTransactionTu> {
        Arc::new(SipTransactionTu {
            kind,
            ctx,
            dialog,
            tran_id,
            inner: Mutex::new(TuInner {
                request,
                peer,
                timer_e: SipTimer::new(),
                timer_f: SipTimer::new(),
                timer_k: SipTimer::new(),
                completed: false,
            }),
        })
    }

    pub fn key(&self) -> TuKey {
        let inner = self.inner.lock();
        (
            inner.request.call_id.clone(),
            inner.request.cseq_method.clone(),
            inner.request.cseq_num,
        )
    }

    /// Register with the context and fire the request with timers E/F.
    fn start(self: &Arc<Self>) {
        self.ctx.register_tu(self.clone());
        let (msg, peer) = {
            let mut inner = self.inner.lock();
            inner.timer_e.set(SIP_T1_MS);
            inner.timer_f.set_once(64 * SIP_T1_MS);
            (inner.request.clone(), inner.peer.clone())
        };
        self.ctx.send(&msg, &peer);
    }

    /// An inbound response matched to this transaction.
    pub fn on_response(&self, msg: &SipMessage) {
        if msg.code < 200 {
            // Provisional: back the retransmit rate off to T2.
            self.inner.lock().timer_e.set(SIP_T2_MS);
            return;
        }
        {
            let mut inner = self.inner.lock();
            if inner.completed {
                return; // response retransmission
            }
            inner.completed = true;
            inner.timer_e.stop();
            inner.timer_f.stop();
            inner.timer_k.set(SIP_T4_MS);
        }
        let ok = msg.code_class() == 200;
        match self.kind {
            TuKind::Bye => {
                if let Some(d) = self.dialog.as_ref() {
                    d.push_state(
                        if ok { SipState::Cleared } else { SipState::Fail },
                        msg.code,
                        DialogContent::None,
                    );
                }
            }
            TuKind::Cancel => {
                if let Some(d) = self.dialog.as_ref() {
                    d.push_state(
                        if ok { SipState::Canceled } else { SipState::Fail },
                        msg.code,
                        DialogContent::None,
                    );
                }
            }
            TuKind::InfoDtmf => {
                if let Some(d) = self.dialog.as_ref() {
                    d.push_event(DialogState::Dtmf, msg.code, DialogContent::None);
                }
            }
            TuKind::Register { .. } => self.register_response(msg),
        }
    }

    fn register_response(&self, msg: &SipMessage) {
        match msg.code_class() {
            200 => {
                // A fresh Kc may ride in on the OK.
                let kc = msg
                    .extra_headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("P-GSM-Kc"))
                    .map(|h| h.value.clone())
                    .or_else(|| {
                        let info = msg.authentication_info.as_deref()?;
                        let params = parse_authenticate(info);
                        param_find(&params, "cnonce").map(str::to_string)
                    });
                let content = match kc {
                    Some(kc) => DialogContent::Auth { kc },
                    None => DialogContent::None,
                };
                self.ctx.deliver(super::DialogMessage {
                    tran_id: self.tran_id,
                    state: DialogState::Active,
                    sip_code: msg.code,
                    content,
                });
            }
            _ if msg.code == 401 => {
                let rand = msg
                    .www_authenticate
                    .as_deref()
                    .map(parse_authenticate)
                    .and_then(|p| param_find(&p, "nonce").map(str::to_string))
                    .unwrap_or_default();
                self.ctx.deliver(super::DialogMessage {
                    tran_id: self.tran_id,
                    state: DialogState::Fail,
                    sip_code: 401,
                    content: DialogContent::Challenge {
                        rand,
                        reject_cause: register_reject_cause(401),
                    },
                });
            }
            _ => {
                self.ctx.deliver(super::DialogMessage {
                    tran_id: self.tran_id,
                    state: DialogState::Fail,
                    sip_code: msg.code,
                    content: DialogContent::Challenge {
                        rand: String::new(),
                        reject_cause: register_reject_cause(msg.code),
                    },
                });
            }
        }
    }

    /// Timer pass; true when the transaction can be dropped.
    pub fn periodic_service(&self) -> bool {
        let mut resend: Option<(SipMessage, IpAddressSpec)> = None;
        let mut timed_out = false;
        let mut remove = false;
        {
            let mut inner = self.inner.lock();
            if inner.timer_e.expired() && !inner.completed {
                resend = Some((inner.request.clone(), inner.peer.clone()));
                inner.timer_e.set_double(SIP_T2_MS);
            } else if inner.timer_f.expired() && !inner.completed {
                inner.timer_e.stop();
                inner.timer_f.stop();
                inner.completed = true;
                timed_out = true;
                remove = true;
            } else if inner.timer_k.expired() {
                remove = true;
            }
        }
        if let Some((msg, peer)) = resend {
            self.ctx.send(&msg, &peer);
        }
        if timed_out {
            match self.kind {
                TuKind::Register { .. } => self.ctx.deliver(super::DialogMessage {
                    tran_id: self.tran_id,
                    state: DialogState::Fail,
                    sip_code: 408,
                    content: DialogContent::None,
                }),
                _ => {
                    if let Some(d) = self.dialog.as_ref() {
                        d.push_state(SipState::Fail, 408, DialogContent::None);
                    }
                }
            }
        }
        remove
    }
}

/// Map a REGISTER failure onto a GSM 04.08 reject cause.
fn register_reject_cause(code: u32) -> u32 {
    match code {
        401 => 0,  // challenge, not a rejection
        404 => 2,  // IMSI unknown in HLR
        403 => 3,  // illegal MS
        _ => 17,   // network failure
    }
}

// ===== RFC2617 digest =====

fn md5_hex(input: &str) -> String {
    let mut h = Md5::new();
    h.update(input.as_bytes());
    let out = h.finalize();
    out.iter().map(|b| format!("{b:02x}")).collect()
}

/// The digest response: MD5(HA1:nonce:HA2) with HA1 = MD5(user:realm:pw)
/// and HA2 = MD5(method:uri).
pub fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

// ===== Transaction-user entry points =====

/// Send a BYE on an active dialog; the Reason header carries the Q.850
/// cause.
pub fn send_bye(dialog: &Arc<SipDialog>, cause: super::TermCause) {
    let mut request = dialog.make_in_dialog_request("BYE", None);
    request.reason_header = Some(cause.reason_header());
    let peer = dialog.inner.lock().vars.proxy.clone();
    let tu = SipTransactionTu::new(
        dialog.ctx.clone(),
        TuKind::Bye,
        Some(dialog.clone()),
        dialog.tran_id.load(std::sync::atomic::Ordering::SeqCst),
        request,
        peer,
    );
    tu.start();
}

/// Cancel a pending MO INVITE. The CANCEL reuses the INVITE's branch and
/// CSeq number (RFC3261 9.1).
pub fn send_cancel(dialog: &Arc<SipDialog>, cause: super::TermCause) {
    let (request, peer) = {
        let inner = dialog.inner.lock();
        let Some(invite) = inner.invite.as_ref() else {
            log::warn!("[Dialog {}] CANCEL with no INVITE", dialog.dialog_id);
            return;
        };
        let mut request = SipMessage::ack_or_cancel("CANCEL", invite);
        request.reason_header = Some(cause.reason_header());
        (request, inner.vars.proxy.clone())
    };
    let tu = SipTransactionTu::new(
        dialog.ctx.clone(),
        TuKind::Cancel,
        Some(dialog.clone()),
        dialog.tran_id.load(std::sync::atomic::Ordering::SeqCst),
        request,
        peer,
    );
    tu.start();
}

/// Carry a DTMF key as a SIP INFO with the dtmf-relay body.
pub fn send_info_dtmf(dialog: &Arc<SipDialog>, key: char) {
    let mut request = dialog.make_in_dialog_request("INFO", None);
    request.add_body(
        "application/dtmf-relay",
        &format!("Signal={key}\r\nDuration=200\r\n"),
    );
    let peer = dialog.inner.lock().vars.proxy.clone();
    let tu = SipTransactionTu::new(
        dialog.ctx.clone(),
        TuKind::InfoDtmf,
        Some(dialog.clone()),
        dialog.tran_id.load(std::sync::atomic::Ordering::SeqCst),
        request,
        peer,
    );
    tu.start();
}

/// Build and send a REGISTER (or unregister) on the registration
/// pseudo-dialog. `challenge` is the (nonce, SRES) pair from a prior 401.
pub fn send_register(
    register_dialog: &Arc<SipDialog>,
    tran_id: u64,
    imsi: &str,
    challenge: Option<(&str, &str)>,
    unregister: bool,
) {
    let ctx = register_dialog.ctx.clone();
    let realm = ctx.config.get_str("SIP.Realm");
    let expires = if unregister {
        0
    } else {
        60 * ctx.config.get_num("SIP.RegistrationPeriod").max(0) as u32
    };
    let (request, peer) = {
        let mut inner = register_dialog.inner.lock();
        let proxy = inner.vars.proxy.clone();
        let req_uri = format!("sip:{}", proxy.name);
        let username = format!("IMSI{imsi}");
        let my_uri = if realm.is_empty() {
            SipUri::make(&username, &proxy.name, 0)
        } else {
            SipUri::make(&username, &realm, 0)
        };
        let cseq = inner.vars.next_cseq();
        let mut msg = SipMessage {
            method: "REGISTER".to_string(),
            req_uri: req_uri.clone(),
            to: SipPreposition::new("", my_uri.clone(), ""),
            from: SipPreposition::new("", my_uri, &make_tag()),
            call_id: inner.vars.call_id.clone(),
            cseq_num: cseq,
            cseq_method: "REGISTER".to_string(),
            max_forwards: Some("70".to_string()),
            contact: Some(format!(
                "<sip:{}@{}>;expires={}",
                username,
                ctx.local_ip_and_port(),
                expires
            )),
            expires: Some(expires),
            ..SipMessage::default()
        };
        msg.add_via(SipVia::make("UDP", &ctx.local_ip_and_port(), &make_branch()));
        if let Some((nonce, sres)) = challenge {
            if !sres.is_empty() {
                if realm.is_empty() {
                    // The plain sipauthserve form: unhashed SRES.
                    msg.authorization = Some(format!(
                        "Digest nonce=\"{nonce}\", uri=\"{imsi}\", response=\"{sres}\""
                    ));
                } else {
                    let auth_uri = format!("sip:{realm}");
                    let response =
                        digest_response(&username, &realm, sres, "REGISTER", &auth_uri, nonce);
                    msg.authorization = Some(format!(
                        "Digest realm=\"{realm}\", username=\"{username}\", nonce=\"{nonce}\", uri=\"{auth_uri}\", response=\"{response}\", algorithm=MD5, qop=\"auth\""
                    ));
                }
            }
        }
        (msg, proxy)
    };
    let tu = SipTransactionTu::new(
        ctx,
        TuKind::Register { unregister },
        None,
        tran_id,
        request,
        peer,
    );
    tu.start();
}
