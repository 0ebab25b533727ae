// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SIP signaling and RTP media.
//!
//! Every call, SMS, registration and USSD session is a [`dialog::SipDialog`].
//! The [`interface::SipInterface`] owns the UDP socket and the dialog map,
//! routes inbound messages, and drives the RFC3261 retransmission timers
//! from its periodic service thread. Dialog state changes surface to L3 as
//! [`DialogMessage`]s through a registered callback.

pub mod dialog;
pub mod interface;
pub mod msg;
pub mod parse;
pub mod rtp;
pub mod sdp;
pub mod transaction;
pub mod utils;

use std::fmt;

/// Fine-grained dialog state, tracking the RFC3261 transaction machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipState {
    Null,
    Timeout,
    /// MOC/MOSMS/inbound handover sent the INVITE.
    Starting,
    /// MOC received Trying/Queued; MTC sent Trying.
    Proceeding,
    /// MOC received Ringing.
    Ringing,
    /// MOC received Busy.
    MocBusy,
    /// MTC sent OK, waiting for ACK.
    Connecting,
    /// MOC received OK / MTC got the ACK.
    Active,
    /// We sent BYE.
    ModClearing,
    /// We sent CANCEL.
    ModCanceling,
    /// We sent an error response.
    ModError,
    /// Peer sent BYE.
    MtdClearing,
    /// Peer sent CANCEL.
    MtdCanceling,
    /// CANCEL exchange finished.
    Canceled,
    /// BYE exchange finished, or an SMS completed.
    Cleared,
    /// Unrecoverable response or timeout.
    Fail,
    /// MESSAGE submitted.
    MoSmsSubmit,
    HandoverInbound,
    HandoverOutbound,
}

impl SipState {
    /// True once the call has finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            SipState::Cleared
                | SipState::ModClearing
                | SipState::MtdClearing
                | SipState::Canceled
                | SipState::ModCanceling
                | SipState::MtdCanceling
                | SipState::Fail
                | SipState::ModError
                | SipState::Timeout
        )
    }
}

impl fmt::Display for SipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The coarse dialog state published to L3. Only forward transitions are
/// signaled, except that Proceeding and Ringing may repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DialogState {
    Undefined,
    Started,
    Proceeding,
    Ringing,
    Active,
    Bye,
    Fail,
    /// Not a state per se: an in-dialog DTMF result event.
    Dtmf,
}

impl DialogState {
    /// Collapse the fine state.
    pub fn from_sip_state(s: SipState) -> DialogState {
        match s {
            SipState::Null | SipState::HandoverOutbound => DialogState::Undefined,
            SipState::Starting | SipState::MoSmsSubmit | SipState::HandoverInbound => {
                DialogState::Started
            }
            SipState::Proceeding | SipState::Connecting => DialogState::Proceeding,
            SipState::Ringing => DialogState::Ringing,
            SipState::Active => DialogState::Active,
            SipState::ModClearing
            | SipState::ModCanceling
            | SipState::MtdClearing
            | SipState::MtdCanceling
            | SipState::Canceled
            | SipState::Cleared => DialogState::Bye,
            SipState::MocBusy | SipState::Fail | SipState::ModError | SipState::Timeout => {
                DialogState::Fail
            }
        }
    }
}

/// Dialog kinds. Registration is a pseudo-dialog reusing the transport
/// and retransmission machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogType {
    Undefined,
    Register,
    Unregister,
    Moc,
    Mtc,
    MoSms,
    MtSms,
    MoUssd,
}

impl DialogType {
    /// True when the peer initiated the dialog.
    pub fn is_server(&self) -> bool {
        matches!(self, DialogType::Mtc | DialogType::MtSms)
    }
}

/// Extra payload on a dialog event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogContent {
    None,
    /// USSD string from the remote side.
    Ussd(String),
    /// A 401 challenge: the RAND nonce and the GSM reject cause mapping.
    Challenge { rand: String, reject_cause: u32 },
    /// Fresh Kc delivered with a 200 OK to REGISTER.
    Auth { kc: String },
}

/// One dialog event delivered to the L3 transaction table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogMessage {
    pub tran_id: u64,
    pub state: DialogState,
    pub sip_code: u32,
    pub content: DialogContent,
}

/// L3's receive hook for dialog events.
pub trait DialogSink: Send + Sync {
    fn dialog_message(&self, msg: DialogMessage);
}

/// Why L3 wants a dialog terminated; maps to the SIP code sent on early
/// MT termination and to the Reason header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermCause {
    NormalRelease,
    Busy,
    NoAnswer,
    NoUserResponding,
    Congestion,
    OperatorIntervention,
    /// Ownership transferred to another node; terminate with no SIP
    /// emission at all.
    HandoverOutbound,
}

impl TermCause {
    /// The SIP status for an early MT error response (300-699).
    pub fn sip_code_and_reason(&self) -> (u32, &'static str) {
        match self {
            TermCause::NormalRelease => (480, "Temporarily Unavailable"),
            TermCause::Busy => (486, "Busy Here"),
            TermCause::NoAnswer => (480, "No Answer"),
            TermCause::NoUserResponding => (480, "No User Responding"),
            TermCause::Congestion => (503, "Service Unavailable"),
            TermCause::OperatorIntervention => (487, "Request Terminated"),
            TermCause::HandoverOutbound => (0, ""),
        }
    }

    /// The Q.850 cause carried in the Reason header.
    pub fn q850_cause(&self) -> u32 {
        match self {
            TermCause::NormalRelease => 16,
            TermCause::Busy => 17,
            TermCause::NoAnswer => 19,
            TermCause::NoUserResponding => 18,
            TermCause::Congestion => 42,
            TermCause::OperatorIntervention => 31,
            TermCause::HandoverOutbound => 0,
        }
    }

    pub fn reason_header(&self) -> String {
        format!("Q.850; cause={}", self.q850_cause())
    }
}

/// Map a final SIP response code back onto a GSM L3 cause value
/// (GSM 04.08 10.5.4.11) for the control layer.
pub fn sip_code_to_l3_cause(code: u32) -> u32 {
    match code {
        404 | 604 => 1,  // unassigned number
        486 | 600 => 17, // user busy
        480 | 408 => 18, // no user responding
        487 => 16,       // normal clearing
        503 => 42,       // switching equipment congestion
        603 => 21,       // call rejected
        _ => 41,         // temporary failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finished_states() {
        assert!(SipState::Cleared.is_finished());
        assert!(SipState::Fail.is_finished());
        assert!(!SipState::Active.is_finished());
        assert!(!SipState::Starting.is_finished());
    }

    #[test]
    fn test_coarse_mapping_is_monotone_for_call_setup() {
        let seq = [
            SipState::Starting,
            SipState::Proceeding,
            SipState::Ringing,
            SipState::Active,
        ];
        let coarse: Vec<_> = seq.iter().map(|&s| DialogState::from_sip_state(s)).collect();
        let mut sorted = coarse.clone();
        sorted.sort();
        assert_eq!(coarse, sorted);
    }

    #[test]
    fn test_term_cause_codes() {
        assert_eq!(TermCause::Busy.sip_code_and_reason().0, 486);
        assert_eq!(TermCause::Busy.q850_cause(), 17);
        assert_eq!(sip_code_to_l3_cause(486), 17);
        assert_eq!(sip_code_to_l3_cause(487), 16);
    }
}
