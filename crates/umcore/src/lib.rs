// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! umcore — GSM base-station core: Um-interface layer 1 and SIP/RTP signaling.
//!
//! Two coupled subsystems:
//!
//! - [`gsm`]: the layer-1 FEC engine. Channel coders per 3GPP TS 05.03
//!   (XCCH, RACH, SCH, TCH/FR, AMR), the eight-burst diagonal TCH/FACCH
//!   interleaver, per-channel burst scheduling against the 4.615 ms TDMA
//!   clock, A5 ciphering synchronization, the SACCH power/timing closed
//!   loop, and the SAP multiplexer toward LAPDm.
//!
//! - [`sip`]: the signaling and media side. An RFC3261 message codec,
//!   per-dialog state machines with the INVITE / non-INVITE client and
//!   server transaction layers, a REGISTER pseudo-dialog with RFC2617
//!   digest authentication, SDP offer/answer, and an RTP session per
//!   dialog with RFC2833 DTMF.
//!
//! Everything is wired through explicit contexts ([`context::BtsContext`],
//! [`context::SipContext`]) — there are no globals. The radio front-end and
//! the L3 state machines sit outside this crate and attach through the
//! traits in [`gsm::radio`] and the callbacks in [`sip::interface`].

pub mod audio;
pub mod config;
pub mod context;
pub mod gsm;
pub mod sip;

pub use config::Config;
pub use context::BtsContext;
