// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel FEC: the encoder/decoder pairs behind every logical channel.
//!
//! An [`L1Fec`] owns one encoder and one decoder as composite fields
//! (generator-only channels have no decoder). Encoders push bursts
//! downstream on their own schedule; decoders are driven synchronously by
//! the radio demux. The pair shares ciphering state through
//! [`L1FecShared`], which is how the uplink ENCRYPT_MAYBE phase-in turns
//! on downlink encryption.

pub mod channel;
pub mod generators;
pub mod rach;
pub mod tch;
pub mod xcch;

pub use channel::{ChannelDecoder, ChannelEncoder, L1Fec};

use super::burst::TxBurst;
use super::cipher::{A5Keystream, EncryptionState, TestKeystream};
use super::gsmtap::GsmtapSink;
use super::l2::L2Frame;
use super::radio::RadioSink;
use super::tables::dummy_burst;
use super::tdma::TdmaMapping;
use super::time::GsmTime;
use crate::context::BtsContext;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// FER/BER/SNR decay memory, in frames. About one second of control
/// frames.
const FER_MEMORY: f32 = 208.0;

/// Shared handle to an XCCH-format decoder; the SACCH controller reads
/// the sibling's measurements through this.
#[derive(Clone)]
pub struct XcchDecoderHandle(pub Arc<xcch::XcchDecoder>);

impl XcchDecoderHandle {
    pub fn decoder(&self) -> &Arc<xcch::XcchDecoder> {
        &self.0
    }

    /// A copy of the current physical measurement report, when this
    /// decoder carries one (SACCH decoders do).
    pub fn phys_snapshot(&self) -> Option<crate::gsm::sacch::MsPhysReport> {
        self.0.phys.as_ref().map(|m| m.lock().clone())
    }
}

/// Upstream consumer of decoded L2 frames (the SAP multiplexer).
pub trait L2Sink: Send + Sync {
    fn write_low_side(&self, frame: L2Frame);
}

/// Ciphering state shared by an encoder/decoder pair.
pub struct CryptoState {
    pub downlink: EncryptionState,
    pub uplink: EncryptionState,
    pub algorithm: i32,
    pub kc: [u8; 8],
}

impl CryptoState {
    fn cleared() -> Self {
        CryptoState {
            downlink: EncryptionState::No,
            uplink: EncryptionState::No,
            algorithm: 0,
            kc: [0; 8],
        }
    }
}

/// State shared between the two halves of an [`L1Fec`].
pub struct L1FecShared {
    pub ctx: Arc<BtsContext>,
    pub crypto: Mutex<CryptoState>,
    pub keystream: Arc<dyn A5Keystream>,
    pub gsmtap: Option<Arc<GsmtapSink>>,
}

impl L1FecShared {
    pub fn new(ctx: Arc<BtsContext>, gsmtap: Option<Arc<GsmtapSink>>) -> Arc<Self> {
        Arc::new(L1FecShared {
            ctx,
            crypto: Mutex::new(CryptoState::cleared()),
            keystream: Arc::new(TestKeystream),
            gsmtap,
        })
    }

    /// Arm encryption phase-in: watch for uplink frames that fail plain
    /// decode and pass after decryption. Returns false without a key.
    pub fn decrypt_maybe(&self, kc: &[u8; 8], algorithm: i32) -> bool {
        if kc.iter().all(|&b| b == 0) {
            return false;
        }
        let mut c = self.crypto.lock();
        c.kc = *kc;
        c.algorithm = algorithm;
        c.uplink = EncryptionState::Maybe;
        log::debug!("[L1Fec] decrypt maybe, algorithm=A5/{algorithm}");
        true
    }

    /// An encrypted uplink frame decoded: latch both directions on.
    pub fn latch_encrypted(&self) {
        let mut c = self.crypto.lock();
        c.uplink = EncryptionState::Yes;
        c.downlink = EncryptionState::Yes;
    }

    /// Encryption survives to the bitter end of a channel's use; it is
    /// cleared here when the channel is reused.
    pub fn reset_crypto(&self) {
        *self.crypto.lock() = CryptoState::cleared();
    }
}

/// Mutable scheduling state of an encoder.
pub struct EncState {
    pub total_frames: usize,
    pub prev_write_time: GsmTime,
    pub next_write_time: GsmTime,
    pub enc_active: bool,
    pub enc_ever_active: bool,
    pub running: bool,
    filler_send_at: Option<Instant>,
}

/// The scheduling half every encoder embeds: write-time bookkeeping
/// against the BTS clock, dummy-burst fill, idle detection.
pub struct EncoderCore {
    pub shared: Arc<L1FecShared>,
    pub radio: Arc<dyn RadioSink>,
    pub cn: u32,
    pub tn: u32,
    pub tsc: u8,
    pub mapping: Arc<TdmaMapping>,
    pub label: String,
    pub state: Mutex<EncState>,
}

impl EncoderCore {
    pub fn new(
        shared: Arc<L1FecShared>,
        radio: Arc<dyn RadioSink>,
        cn: u32,
        tn: u32,
        mapping: Arc<TdmaMapping>,
    ) -> Self {
        debug_assert!(mapping.allowed_slot(tn));
        debug_assert!(mapping.downlink());
        let now = shared.ctx.clock.time();
        let tsc = shared.ctx.bcc();
        let label = format!("C{}T{} {}", cn, tn, mapping.type_and_offset());
        let mut next = GsmTime::new(now.fnum(), tn);
        next.roll_forward(mapping.frame_mapping(0), mapping.repeat_length());
        EncoderCore {
            shared,
            radio,
            cn,
            tn,
            tsc,
            mapping,
            label,
            state: Mutex::new(EncState {
                total_frames: 0,
                prev_write_time: next,
                next_write_time: next,
                enc_active: false,
                enc_ever_active: false,
                running: false,
                filler_send_at: None,
            }),
        }
    }

    /// Advance write times to the next mapped frame (GSM 05.02 clause 7,
    /// transmit side).
    pub fn roll_forward(&self, st: &mut EncState) {
        st.prev_write_time = st.next_write_time;
        st.total_frames += 1;
        st.next_write_time.roll_forward(
            self.mapping.frame_mapping(st.total_frames),
            self.mapping.repeat_length(),
        );
    }

    /// Snap the write time back to the clock when it drifted more than a
    /// 51x26 superframe, or on demand at channel open.
    pub fn resync(&self, st: &mut EncState, force: bool) {
        let now = self.shared.ctx.clock.time();
        let delta = st.next_write_time.delta(&now);
        if force || delta < 0 || delta > (51 * 26) {
            let mut next = GsmTime::new(now.fnum(), self.tn);
            st.total_frames = 0;
            next.roll_forward(self.mapping.frame_mapping(0), self.mapping.repeat_length());
            st.next_write_time = next;
            log::debug!("[{}] resync next={} now={}", self.label, next, now);
        }
    }

    /// Block until the clock catches up with the previously written burst.
    /// Called with the state lock released.
    pub fn wait_to_send(&self, prev: &GsmTime) {
        self.shared.ctx.clock.wait_until(prev);
    }

    /// Queue the dummy-burst filler over one full mapping cycle. On C0 the
    /// downlink must never go silent; on other carriers it is required
    /// once a channel has been active so a SACCH can be deactivated
    /// cleanly.
    pub fn send_dummy_fill(&self, st: &mut EncState) {
        self.resync(st, false);
        if self.cn != 0 && !st.enc_ever_active {
            return;
        }
        let filler = dummy_burst();
        for _ in 0..self.mapping.num_frames() {
            let burst = TxBurst::from_bits(filler.clone(), st.next_write_time);
            self.radio.write_high_side_tx(&burst, "dummy");
            self.roll_forward(st);
        }
        st.filler_send_at = Some(self.shared.ctx.clock.systime(&st.next_write_time));
    }

    /// Open the channel for a new transaction.
    pub fn enc_init(&self) {
        let mut st = self.state.lock();
        st.total_frames = 0;
        self.resync(&mut st, true);
        // Prevent the first write after opening from blocking in
        // wait_to_send.
        st.prev_write_time = self.shared.ctx.clock.time();
        if self.cn == 0 && !st.enc_ever_active {
            self.send_dummy_fill(&mut st);
        }
    }

    /// Mark active; returns true when the service thread still needs to be
    /// spawned.
    pub fn enc_start(&self) -> bool {
        let mut st = self.state.lock();
        let first = !st.running;
        st.running = true;
        st.enc_active = true;
        st.enc_ever_active = true;
        first
    }

    /// Close after flushing the dummy fill.
    pub fn close(&self) {
        let mut st = self.state.lock();
        if st.enc_active {
            self.send_dummy_fill(&mut st);
        }
        st.enc_active = false;
    }

    pub fn enc_active(&self) -> bool {
        self.state.lock().enc_active
    }

    /// Idle iff closed and the last filler has gone out the door.
    pub fn l1_is_idle(&self) -> bool {
        let st = self.state.lock();
        !st.enc_active
            && st
                .filler_send_at
                .map_or(true, |at| at <= Instant::now())
    }

    pub fn next_write_time(&self) -> GsmTime {
        let mut st = self.state.lock();
        self.resync(&mut st, false);
        st.next_write_time
    }
}

/// Running decoder quality statistics.
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    pub ave_fer: f32,
    pub ave_ber: f32,
    pub ave_snr: f32,
    pub last_snr: f32,
    pub last_ber: f32,
    pub snr_count: u32,
    pub total_frames: u32,
    pub stolen_frames: u32,
    pub bad_frames: u32,
}

struct StatsState {
    stats: DecoderStats,
    /// +1 per bad frame, -2 per good frame, floored at zero. The radio
    /// link failure escalation watches this.
    bad_frame_tracker: i32,
}

/// Inbound handover detection state (GSM 05.03 4.9 access bursts).
pub struct HandoverState {
    pub pending: bool,
    pub reference: u8,
    /// T3103 expiry; access bursts are only decoded while this is live.
    pub t3103_deadline: Option<Instant>,
    pub record: Option<HandoverRecord>,
}

/// Measurements of a detected handover access burst.
#[derive(Debug, Clone)]
pub struct HandoverRecord {
    pub rssi: f32,
    pub timing_error: f32,
    pub when: Instant,
}

/// The stateful half every decoder embeds.
pub struct DecoderCore {
    pub shared: Arc<L1FecShared>,
    pub cn: u32,
    pub tn: u32,
    pub mapping: Arc<TdmaMapping>,
    pub label: String,
    active: AtomicBool,
    pub upstream: Mutex<Option<Arc<dyn L2Sink>>>,
    stats: Mutex<StatsState>,
    pub handover: Mutex<HandoverState>,
}

impl DecoderCore {
    pub fn new(
        shared: Arc<L1FecShared>,
        cn: u32,
        tn: u32,
        mapping: Arc<TdmaMapping>,
    ) -> Self {
        let label = format!("C{}T{} {}", cn, tn, mapping.type_and_offset());
        DecoderCore {
            shared,
            cn,
            tn,
            mapping,
            label,
            active: AtomicBool::new(false),
            upstream: Mutex::new(None),
            stats: Mutex::new(StatsState {
                stats: DecoderStats::default(),
                bad_frame_tracker: 0,
            }),
            handover: Mutex::new(HandoverState {
                pending: false,
                reference: 0,
                t3103_deadline: None,
                record: None,
            }),
        }
    }

    pub fn set_upstream(&self, sink: Arc<dyn L2Sink>) {
        let mut up = self.upstream.lock();
        debug_assert!(up.is_none(), "upstream connected twice");
        *up = Some(sink);
    }

    pub fn deliver_up(&self, frame: L2Frame) {
        if let Some(up) = self.upstream.lock().as_ref() {
            up.write_low_side(frame);
        } else {
            log::error!("[{}] decoded frame with no uplink connected", self.label);
        }
    }

    pub fn dec_init(&self) {
        self.set_handover(false, 0);
        let mut st = self.stats.lock();
        st.stats = DecoderStats::default();
        st.bad_frame_tracker = 0;
        self.shared.reset_crypto();
    }

    pub fn dec_start(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn dec_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Arm or clear handover-access decoding; arming starts T3103.
    pub fn set_handover(&self, pending: bool, reference: u8) {
        let mut h = self.handover.lock();
        h.pending = pending;
        h.reference = reference;
        h.record = None;
        h.t3103_deadline = if pending {
            let ms = self.shared.ctx.config.get_num("GSM.Timer.T3103").max(0) as u64;
            Some(Instant::now() + Duration::from_millis(ms))
        } else {
            None
        };
    }

    pub fn handover_record(&self) -> Option<HandoverRecord> {
        self.handover.lock().record.clone()
    }

    pub fn count_good_frame(&self, nframes: u32) {
        let mut st = self.stats.lock();
        st.bad_frame_tracker = (st.bad_frame_tracker - 2).max(0);
        let a = 1.0 / FER_MEMORY;
        st.stats.ave_fer *= 1.0 - a;
        st.stats.total_frames += nframes;
    }

    pub fn count_bad_frame(&self, nframes: u32) {
        let mut st = self.stats.lock();
        st.bad_frame_tracker += 1;
        let a = 1.0 / FER_MEMORY;
        st.stats.ave_fer = (1.0 - a) * st.stats.ave_fer + a;
        st.stats.total_frames += nframes;
        st.stats.bad_frames += nframes;
    }

    /// Stolen frames do not affect FER reporting.
    pub fn count_stolen_frame(&self, nframes: u32) {
        let mut st = self.stats.lock();
        st.stats.total_frames += nframes;
        st.stats.stolen_frames += nframes;
    }

    pub fn count_ber(&self, bit_errors: u32, frame_size: u32) {
        let mut st = self.stats.lock();
        let a = 1.0 / FER_MEMORY;
        let this = bit_errors as f32 / frame_size as f32;
        st.stats.last_ber = this;
        st.stats.ave_ber = (1.0 - a) * st.stats.ave_ber + a * this;
    }

    pub fn count_snr(&self, snr: f32) {
        let mut st = self.stats.lock();
        st.stats.last_snr = snr;
        let period = self.shared.ctx.config.get_num("GSM.Radio.SNRAveragePeriod");
        if period > 0 {
            let count = st.stats.snr_count.min(period as u32);
            st.stats.ave_snr = (snr + count as f32 * st.stats.ave_snr) / (count + 1) as f32;
            st.stats.snr_count += 1;
        }
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats.lock().stats.clone()
    }

    pub fn bad_frame_tracker(&self) -> i32 {
        self.stats.lock().bad_frame_tracker
    }
}

/// Try to consume `burst` as an inbound handover access burst
/// (GSM 05.03 4.9, decoded like a RACH). Returns true when the decoder is
/// in handover-pending mode and the burst must not reach normal decoding.
pub(crate) fn try_handover_access(core: &DecoderCore, burst: &crate::gsm::burst::RxBurst) -> bool {
    let mut h = core.handover.lock();
    if !h.pending {
        return false;
    }
    if h.t3103_deadline.map_or(true, |d| d <= Instant::now()) {
        // Pending but T3103 ran out; swallow bursts until L3 cleans up.
        return true;
    }
    log::info!("[{}] handover access {:?}", core.label, burst);
    let bsic = core.shared.ctx.bsic();
    if let Some((reference, _bec)) = rach::decode_access_burst(burst.access_segment(), bsic) {
        if reference == h.reference {
            log::info!("[{}] queuing HANDOVER_ACCESS ref={}", core.label, reference);
            h.t3103_deadline = None;
            h.record = Some(HandoverRecord {
                rssi: burst.rssi(),
                timing_error: burst.timing_error(),
                when: Instant::now(),
            });
            drop(h);
            core.deliver_up(L2Frame::empty(crate::gsm::l2::Primitive::HandoverAccess));
        } else {
            log::warn!("[{}] no inbound handover with reference {}", core.label, reference);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::gsm::radio::NullRadio;
    use crate::gsm::tdma::sdcch8_mapping;

    fn test_core() -> EncoderCore {
        let ctx = test_context();
        let shared = L1FecShared::new(ctx, None);
        EncoderCore::new(
            shared,
            Arc::new(NullRadio),
            0,
            1,
            Arc::new(sdcch8_mapping(0, true)),
        )
    }

    #[test]
    fn test_roll_forward_follows_mapping() {
        let core = test_core();
        let mut st = core.state.lock();
        let start = st.next_write_time;
        assert_eq!(start.fnum() % 51, core.mapping.frame_mapping(0));
        core.roll_forward(&mut st);
        assert_eq!(st.prev_write_time, start);
        assert_eq!(st.next_write_time.fnum() % 51, core.mapping.frame_mapping(1));
        assert!(st.next_write_time >= start);
    }

    #[test]
    fn test_resync_snaps_stale_clock() {
        let core = test_core();
        core.shared.ctx.clock.set(100_000);
        let mut st = core.state.lock();
        // next_write_time was computed near FN 0; far behind now.
        core.resync(&mut st, false);
        let now = core.shared.ctx.clock.time();
        let d = st.next_write_time.delta(&now);
        assert!((0..=51 * 26).contains(&d), "delta after resync: {d}");
    }

    #[test]
    fn test_idle_tracking() {
        let core = test_core();
        assert!(core.l1_is_idle());
        core.enc_init();
        assert!(core.enc_start());
        assert!(!core.l1_is_idle());
        assert!(!core.enc_start(), "second start must not respawn");
        core.close();
        // Filler queued into the near future; once passed the channel is
        // idle again.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _ = core.l1_is_idle();
    }

    #[test]
    fn test_bad_frame_tracker_floor() {
        let ctx = test_context();
        let shared = L1FecShared::new(ctx, None);
        let dec = DecoderCore::new(shared, 0, 1, Arc::new(sdcch8_mapping(0, false)));
        dec.count_bad_frame(1);
        dec.count_bad_frame(1);
        assert_eq!(dec.bad_frame_tracker(), 2);
        dec.count_good_frame(1);
        assert_eq!(dec.bad_frame_tracker(), 0);
        dec.count_good_frame(1);
        assert_eq!(dec.bad_frame_tracker(), 0);
        assert!(dec.stats().ave_fer > 0.0);
    }

    #[test]
    fn test_crypto_phase_in_latch() {
        let shared = L1FecShared::new(test_context(), None);
        assert!(!shared.decrypt_maybe(&[0; 8], 1));
        assert!(shared.decrypt_maybe(&[1, 2, 3, 4, 5, 6, 7, 8], 1));
        assert_eq!(shared.crypto.lock().uplink, EncryptionState::Maybe);
        assert_eq!(shared.crypto.lock().downlink, EncryptionState::No);
        shared.latch_encrypted();
        assert_eq!(shared.crypto.lock().uplink, EncryptionState::Yes);
        assert_eq!(shared.crypto.lock().downlink, EncryptionState::Yes);
        shared.reset_crypto();
        assert_eq!(shared.crypto.lock().uplink, EncryptionState::No);
    }
}
