// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel assembly: one [`L1Fec`] per logical channel, owning its
//! encoder and decoder halves and wiring them to the radio, the demux and
//! the SAP multiplexer.

use super::generators::{
    spawn_generator, BcchEncoder, CbchEncoder, FcchEncoder, SchEncoder, SiFrames,
};
use super::rach::{AccessGrantResponder, RachDecoder};
use super::tch::{TchFacchDecoder, TchFacchEncoder};
use super::xcch::{XcchDecoder, XcchEncoder};
use super::{DecoderStats, L1FecShared, L2Sink, XcchDecoderHandle};
use crate::audio::AudioFrame;
use crate::context::BtsContext;
use crate::gsm::gsmtap::GsmtapSink;
use crate::gsm::l2::L2Frame;
use crate::gsm::radio::{RadioSink, RxDemux};
use crate::gsm::sacch::{MsPhysReport, SacchEncoder};
use crate::gsm::tables::amr::AmrMode;
use crate::gsm::tdma;
use parking_lot::RwLock;
use std::sync::Arc;

/// SACCH physical header length in bits.
const SACCH_HEADER_BITS: usize = 16;

pub enum ChannelEncoder {
    Xcch(Arc<XcchEncoder>),
    Sacch(Arc<SacchEncoder>),
    Tch(Arc<TchFacchEncoder>),
    Fcch(Arc<FcchEncoder>),
    Sch(Arc<SchEncoder>),
    Bcch(Arc<BcchEncoder>),
    Cbch(Arc<CbchEncoder>),
}

pub enum ChannelDecoder {
    Xcch(Arc<XcchDecoder>),
    Tch(Arc<TchFacchDecoder>),
    Rach(Arc<RachDecoder>),
}

/// One logical channel's L1: encoder + decoder, immutable after creation.
pub struct L1Fec {
    pub shared: Arc<L1FecShared>,
    pub encoder: Option<ChannelEncoder>,
    pub decoder: Option<ChannelDecoder>,
}

impl L1Fec {
    /// A dedicated SDCCH/8 subchannel.
    pub fn new_sdcch(
        ctx: Arc<BtsContext>,
        radio: Arc<dyn RadioSink>,
        demux: &RxDemux,
        gsmtap: Option<Arc<GsmtapSink>>,
        cn: u32,
        tn: u32,
        sub: u8,
    ) -> L1Fec {
        let shared = L1FecShared::new(ctx, gsmtap);
        let enc = XcchEncoder::new(
            shared.clone(),
            radio,
            cn,
            tn,
            Arc::new(tdma::sdcch8_mapping(sub, true)),
            0,
        );
        let dec_mapping = Arc::new(tdma::sdcch8_mapping(sub, false));
        let dec = XcchDecoder::new(shared.clone(), cn, tn, dec_mapping.clone(), 0, None);
        demux.install(tn, dec_mapping, dec.clone());
        L1Fec {
            shared,
            encoder: Some(ChannelEncoder::Xcch(enc)),
            decoder: Some(ChannelDecoder::Xcch(dec)),
        }
    }

    /// The SACCH paired with an SDCCH/8 subchannel.
    pub fn new_sacch_sdcch8(
        ctx: Arc<BtsContext>,
        radio: Arc<dyn RadioSink>,
        demux: &RxDemux,
        gsmtap: Option<Arc<GsmtapSink>>,
        cn: u32,
        tn: u32,
        sub: u8,
    ) -> L1Fec {
        let phys = MsPhysReport::new(&ctx);
        let shared = L1FecShared::new(ctx, gsmtap);
        let dec_mapping = Arc::new(tdma::sacch8_mapping(sub, false));
        let dec = XcchDecoder::new(
            shared.clone(),
            cn,
            tn,
            dec_mapping.clone(),
            SACCH_HEADER_BITS,
            Some(phys),
        );
        demux.install(tn, dec_mapping, dec.clone());
        let inner = XcchEncoder::new(
            shared.clone(),
            radio,
            cn,
            tn,
            Arc::new(tdma::sacch8_mapping(sub, true)),
            SACCH_HEADER_BITS,
        );
        let enc = SacchEncoder::new(inner, XcchDecoderHandle(dec.clone()));
        L1Fec {
            shared,
            encoder: Some(ChannelEncoder::Sacch(enc)),
            decoder: Some(ChannelDecoder::Xcch(dec)),
        }
    }

    /// The SACCH paired with a TCH/F.
    pub fn new_sacch_tchf(
        ctx: Arc<BtsContext>,
        radio: Arc<dyn RadioSink>,
        demux: &RxDemux,
        gsmtap: Option<Arc<GsmtapSink>>,
        cn: u32,
        tn: u32,
    ) -> L1Fec {
        let phys = MsPhysReport::new(&ctx);
        let shared = L1FecShared::new(ctx, gsmtap);
        let mapping = Arc::new(tdma::sacch_tf_mapping(tn));
        let dec = XcchDecoder::new(
            shared.clone(),
            cn,
            tn,
            mapping.clone(),
            SACCH_HEADER_BITS,
            Some(phys),
        );
        demux.install(tn, mapping.clone(), dec.clone());
        let inner = XcchEncoder::new(shared.clone(), radio, cn, tn, mapping, SACCH_HEADER_BITS);
        let enc = SacchEncoder::new(inner, XcchDecoderHandle(dec.clone()));
        L1Fec {
            shared,
            encoder: Some(ChannelEncoder::Sacch(enc)),
            decoder: Some(ChannelDecoder::Xcch(dec)),
        }
    }

    /// A full-rate traffic channel with its FACCH.
    pub fn new_tchf(
        ctx: Arc<BtsContext>,
        radio: Arc<dyn RadioSink>,
        demux: &RxDemux,
        gsmtap: Option<Arc<GsmtapSink>>,
        cn: u32,
        tn: u32,
    ) -> L1Fec {
        let shared = L1FecShared::new(ctx, gsmtap);
        let mapping = Arc::new(tdma::tchf_mapping());
        let enc = TchFacchEncoder::new(shared.clone(), radio, cn, tn, mapping.clone());
        let dec = TchFacchDecoder::new(shared.clone(), cn, tn, mapping.clone());
        enc.set_sibling(dec.clone());
        demux.install(tn, mapping, dec.clone());
        L1Fec {
            shared,
            encoder: Some(ChannelEncoder::Tch(enc)),
            decoder: Some(ChannelDecoder::Tch(dec)),
        }
    }

    /// A CCCH (AGCH/PCH) block carrier: XCCH format, fed by the paging
    /// and access-grant queues in L3.
    pub fn new_ccch(
        ctx: Arc<BtsContext>,
        radio: Arc<dyn RadioSink>,
        gsmtap: Option<Arc<GsmtapSink>>,
        tn: u32,
    ) -> L1Fec {
        let shared = L1FecShared::new(ctx, gsmtap);
        let enc = XcchEncoder::new(
            shared.clone(),
            radio,
            0,
            tn,
            Arc::new(tdma::ccch_mapping()),
            0,
        );
        enc.core.enc_start();
        L1Fec {
            shared,
            encoder: Some(ChannelEncoder::Xcch(enc)),
            decoder: None,
        }
    }

    /// The beacon FCCH; starts transmitting immediately.
    pub fn new_fcch(
        ctx: Arc<BtsContext>,
        radio: Arc<dyn RadioSink>,
        gsmtap: Option<Arc<GsmtapSink>>,
        tn: u32,
    ) -> L1Fec {
        let shared = L1FecShared::new(ctx, gsmtap);
        let enc = FcchEncoder::new(shared.clone(), radio, tn, Arc::new(tdma::fcch_mapping()));
        spawn_generator(enc.clone());
        L1Fec {
            shared,
            encoder: Some(ChannelEncoder::Fcch(enc)),
            decoder: None,
        }
    }

    /// The beacon SCH; starts transmitting immediately.
    pub fn new_sch(
        ctx: Arc<BtsContext>,
        radio: Arc<dyn RadioSink>,
        gsmtap: Option<Arc<GsmtapSink>>,
        tn: u32,
    ) -> L1Fec {
        let shared = L1FecShared::new(ctx, gsmtap);
        let enc = SchEncoder::new(shared.clone(), radio, tn, Arc::new(tdma::sch_mapping()));
        spawn_generator(enc.clone());
        L1Fec {
            shared,
            encoder: Some(ChannelEncoder::Sch(enc)),
            decoder: None,
        }
    }

    /// The beacon BCCH, replaying the given SI frames.
    pub fn new_bcch(
        ctx: Arc<BtsContext>,
        radio: Arc<dyn RadioSink>,
        gsmtap: Option<Arc<GsmtapSink>>,
        tn: u32,
        si: Arc<RwLock<SiFrames>>,
    ) -> L1Fec {
        let shared = L1FecShared::new(ctx, gsmtap);
        let inner = XcchEncoder::new(
            shared.clone(),
            radio,
            0,
            tn,
            Arc::new(tdma::bcch_mapping()),
            0,
        );
        let enc = BcchEncoder::new(inner, si);
        spawn_generator(enc.clone());
        L1Fec {
            shared,
            encoder: Some(ChannelEncoder::Bcch(enc)),
            decoder: None,
        }
    }

    /// The RACH, feeding the access-grant responder.
    pub fn new_rach(
        ctx: Arc<BtsContext>,
        demux: &RxDemux,
        tn: u32,
        responder: Arc<dyn AccessGrantResponder>,
    ) -> L1Fec {
        let shared = L1FecShared::new(ctx, None);
        let mapping = Arc::new(tdma::rach_mapping());
        let dec = RachDecoder::new(shared.clone(), tn, mapping.clone(), responder);
        demux.install(tn, mapping, dec.clone());
        L1Fec {
            shared,
            encoder: None,
            decoder: Some(ChannelDecoder::Rach(dec)),
        }
    }

    /// The cell-broadcast channel.
    pub fn new_cbch(
        ctx: Arc<BtsContext>,
        radio: Arc<dyn RadioSink>,
        gsmtap: Option<Arc<GsmtapSink>>,
        cn: u32,
        tn: u32,
    ) -> L1Fec {
        let shared = L1FecShared::new(ctx, gsmtap);
        let inner = XcchEncoder::new(
            shared.clone(),
            radio,
            cn,
            tn,
            Arc::new(tdma::cbch_mapping()),
            0,
        );
        let enc = CbchEncoder::new(inner);
        enc.inner.core.enc_start();
        L1Fec {
            shared,
            encoder: Some(ChannelEncoder::Cbch(enc)),
            decoder: None,
        }
    }

    fn enc_core(&self) -> Option<&super::EncoderCore> {
        match self.encoder.as_ref()? {
            ChannelEncoder::Xcch(e) => Some(&e.core),
            ChannelEncoder::Sacch(e) => Some(&e.inner.core),
            ChannelEncoder::Tch(e) => Some(&e.core),
            ChannelEncoder::Fcch(e) => Some(&e.core),
            ChannelEncoder::Sch(e) => Some(&e.core),
            ChannelEncoder::Bcch(e) => Some(&e.inner.core),
            ChannelEncoder::Cbch(e) => Some(&e.inner.core),
        }
    }

    fn dec_core(&self) -> Option<&super::DecoderCore> {
        match self.decoder.as_ref()? {
            ChannelDecoder::Xcch(d) => Some(&d.core),
            ChannelDecoder::Tch(d) => Some(&d.core),
            ChannelDecoder::Rach(d) => Some(&d.core),
        }
    }

    /// Clear both halves for a new transaction.
    pub fn l1_init(&self) {
        if let Some(dec) = self.dec_core() {
            dec.dec_init();
        }
        match self.encoder.as_ref() {
            Some(ChannelEncoder::Sacch(e)) => e.enc_init(),
            Some(ChannelEncoder::Tch(e)) => e.enc_init(),
            _ => {
                if let Some(core) = self.enc_core() {
                    core.enc_init();
                }
            }
        }
        self.shared.reset_crypto();
    }

    /// Activate; spawns the TCH dispatch thread on first start.
    pub fn l1_start(&self) {
        if let Some(dec) = self.dec_core() {
            dec.dec_start();
        }
        match self.encoder.as_ref() {
            Some(ChannelEncoder::Tch(e)) => {
                if e.core.enc_start() {
                    e.service_start();
                }
            }
            _ => {
                if let Some(core) = self.enc_core() {
                    core.enc_start();
                }
            }
        }
    }

    /// Deactivate, flushing the dummy fill.
    pub fn l1_close(&self) {
        if let Some(core) = self.enc_core() {
            core.close();
        }
        if let Some(dec) = self.dec_core() {
            dec.close();
        }
    }

    /// Active means currently sending and receiving; send-only channels
    /// are always active.
    pub fn l1_active(&self) -> bool {
        match self.dec_core() {
            Some(dec) => dec.dec_active(),
            None => self.encoder.is_some(),
        }
    }

    pub fn l1_is_idle(&self) -> bool {
        self.enc_core().map_or(true, super::EncoderCore::l1_is_idle)
    }

    /// Downlink entry for message channels.
    pub fn write_high_side(&self, frame: &L2Frame) {
        match self.encoder.as_ref() {
            Some(ChannelEncoder::Xcch(e)) => e.write_high_side(frame),
            Some(ChannelEncoder::Sacch(e)) => e.write_high_side(frame),
            Some(ChannelEncoder::Tch(e)) => e.write_high_side(frame),
            Some(ChannelEncoder::Cbch(e)) => e.write_high_side(frame),
            _ => log::error!("[L1Fec] write_high_side on a generator channel"),
        }
    }

    /// Downlink audio (traffic channels only).
    pub fn send_tch(&self, frame: AudioFrame) {
        match self.encoder.as_ref() {
            Some(ChannelEncoder::Tch(e)) => e.send_tch(frame),
            _ => log::error!("[L1Fec] send_tch on a non-traffic channel"),
        }
    }

    /// Non-blocking uplink audio (traffic channels only).
    pub fn recv_tch(&self) -> Option<AudioFrame> {
        match self.decoder.as_ref() {
            Some(ChannelDecoder::Tch(d)) => d.recv_tch(),
            _ => None,
        }
    }

    /// Switch vocoder mode on both halves.
    pub fn set_amr_mode(&self, mode: AmrMode) {
        if let Some(ChannelEncoder::Tch(e)) = self.encoder.as_ref() {
            e.set_amr_mode(mode);
        }
        if let Some(ChannelDecoder::Tch(d)) = self.decoder.as_ref() {
            d.set_amr_mode(mode);
        }
    }

    /// Connect the uplink to a SAP multiplexer or test sink.
    pub fn set_upstream(&self, sink: Arc<dyn L2Sink>) {
        if let Some(dec) = self.dec_core() {
            dec.set_upstream(sink);
        }
    }

    /// Arm or clear inbound-handover access detection on both the radio
    /// correlator and the decoder.
    pub fn handover_pending(&self, flag: bool, reference: u8) {
        if let Some(core) = self.enc_core() {
            let ok = if flag {
                core.radio.set_handover(self.tn().unwrap_or(0))
            } else {
                core.radio.clear_handover(self.tn().unwrap_or(0))
            };
            if !ok {
                log::error!("[L1Fec] handover correlator setup failed");
            }
        }
        if let Some(dec) = self.dec_core() {
            dec.set_handover(flag, reference);
        }
    }

    /// Seed the SACCH loop from access-burst measurements at channel
    /// open.
    pub fn l1_init_phy(&self, rssi: f32, timing_error: f32) {
        if let Some(ChannelEncoder::Sacch(e)) = self.encoder.as_ref() {
            e.init_phy(rssi, timing_error);
        }
        if let Some(ChannelDecoder::Xcch(d)) = self.decoder.as_ref() {
            if let Some(phys) = d.phys.as_ref() {
                phys.lock().init_phy(rssi, timing_error);
            }
        }
    }

    /// Carry the SACCH loop state over from an established channel on
    /// reassignment or intra-BTS handover.
    pub fn set_phy(&self, other: &L1Fec) {
        if let (Some(ChannelEncoder::Sacch(e)), Some(ChannelEncoder::Sacch(o))) =
            (self.encoder.as_ref(), other.encoder.as_ref())
        {
            e.set_phy(o);
        }
        if let (Some(ChannelDecoder::Xcch(d)), Some(ChannelDecoder::Xcch(od))) =
            (self.decoder.as_ref(), other.decoder.as_ref())
        {
            if let (Some(phys), Some(other_phys)) = (d.phys.as_ref(), od.phys.as_ref()) {
                let snapshot = other_phys.lock().clone();
                phys.lock().set_phy(&snapshot);
            }
        }
    }

    /// Measurements of the detected handover access burst, if any.
    pub fn handover_record(&self) -> Option<super::HandoverRecord> {
        self.dec_core().and_then(super::DecoderCore::handover_record)
    }

    /// Arm ciphering phase-in with the subscriber's Kc.
    pub fn decrypt_maybe(&self, kc: &[u8; 8], algorithm: i32) -> bool {
        self.shared.decrypt_maybe(kc, algorithm)
    }

    pub fn decoder_stats(&self) -> Option<DecoderStats> {
        self.dec_core().map(super::DecoderCore::stats)
    }

    pub fn tn(&self) -> Option<u32> {
        self.enc_core()
            .map(|c| c.tn)
            .or_else(|| self.dec_core().map(|c| c.tn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::gsm::radio::NullRadio;

    #[test]
    fn test_sdcch_lifecycle() {
        let ctx = test_context();
        let demux = RxDemux::new();
        let chan = L1Fec::new_sdcch(ctx, Arc::new(NullRadio), &demux, None, 0, 1, 2);
        assert!(!chan.l1_active());
        chan.l1_init();
        chan.l1_start();
        assert!(chan.l1_active());
        chan.l1_close();
        assert!(!chan.l1_active());
    }

    #[test]
    fn test_rach_is_decoder_only() {
        struct NoOp;
        impl AccessGrantResponder for NoOp {
            fn channel_request(&self, _req: super::super::rach::ChannelRequest) {}
        }
        let ctx = test_context();
        let demux = RxDemux::new();
        let chan = L1Fec::new_rach(ctx, &demux, 0, Arc::new(NoOp));
        assert!(chan.encoder.is_none());
        assert!(chan.l1_active());
        assert!(chan.l1_is_idle());
    }
}
