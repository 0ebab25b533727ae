// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCH/F and its fast associated control channel (GSM 05.03 3.1, 3.9).
//!
//! Traffic and FACCH share an eight-burst diagonal interleaver: each
//! burst carries halves of two overlapping coded blocks, and every four
//! bursts a complete 456-bit block is ready. The stealing bits across
//! those eight bursts arbitrate FACCH against speech on the uplink; on
//! the downlink the dispatch thread chooses FACCH over speech over filler
//! each block, marking the stealing flags accordingly.

use super::xcch::{fec_decode_41, fec_encode_41};
use super::{DecoderCore, EncoderCore, L1FecShared};
use crate::audio::AudioFrame;
use crate::gsm::bits::{BitVec, SoftVec};
use crate::gsm::burst::{RxBurst, TxBurst};
use crate::gsm::cipher::{cipher_count, decrypt_soft, EncryptionState};
use crate::gsm::l2::{l2_idle_frame, L2Frame, L2_FRAME_BITS};
use crate::gsm::parity::BlockParity;
use crate::gsm::radio::{BurstSink, RadioSink};
use crate::gsm::tables::amr::{afs_bit_order, AfsParams, AmrMode};
use crate::gsm::tables::gsm610::{fr_bit_order, write_silence_frame, FrFrame, FR_FRAME_BITS};
use crate::gsm::tables::{tch_filler_c, training_sequence};
use crate::gsm::tdma::TdmaMapping;
use crate::gsm::time::GsmTime;
use crate::gsm::viterbi::{puncture, unpuncture, GSM_RATE2};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;

/// Per-mode vocoder channel-coding transforms, shared by the encoder and
/// decoder sides.
pub struct TchCodec {
    mode: AmrMode,
    bit_order: Vec<usize>,
    afs: Option<AfsCfg>,
}

struct AfsCfg {
    params: AfsParams,
    punct: Vec<usize>,
}

impl TchCodec {
    pub fn new(mode: AmrMode) -> Self {
        let bit_order = match mode {
            AmrMode::TchFs => fr_bit_order(),
            m => afs_bit_order(m),
        };
        let afs = (mode != AmrMode::TchFs).then(|| {
            let params = AfsParams::for_mode(mode);
            let punct = params.puncture_schedule();
            AfsCfg { params, punct }
        });
        TchCodec {
            mode,
            bit_order,
            afs,
        }
    }

    pub fn mode(&self) -> AmrMode {
        self.mode
    }

    /// Encode a raw vocoder payload into the 456-bit coded block.
    pub fn encode(&self, payload: &BitVec) -> BitVec {
        debug_assert_eq!(payload.len(), self.mode.kd());
        // Reorder bits by importance while copying into d.
        let mut d = BitVec::zeroed(self.mode.kd());
        payload.unmap(&self.bit_order, &mut d);
        match self.afs.as_ref() {
            None => encode_fr(&d),
            Some(cfg) => encode_afs(&d, cfg),
        }
    }

    /// Decode a 456-bit soft block. On good parity returns the raw
    /// payload and the corrected-bit count.
    pub fn decode(&self, c: &SoftVec) -> Option<(BitVec, u32)> {
        let (d, bec) = match self.afs.as_ref() {
            None => decode_fr(c)?,
            Some(cfg) => decode_afs(c, cfg)?,
        };
        let mut payload = BitVec::zeroed(self.mode.kd());
        d.map(&self.bit_order, &mut payload);
        Some((payload, bec))
    }
}

/// GSM 05.03 3.1.2: TCH/FS encode, d -> c.
fn encode_fr(d: &BitVec) -> BitVec {
    debug_assert_eq!(d.len(), FR_FRAME_BITS);
    let mut u = BitVec::zeroed(189);
    // 3.1.2.1 -- class 1 reordering d -> u.
    for k in 0..=90 {
        u.set_bit(k, d.bit(2 * k));
        u.set_bit(184 - k, d.bit(2 * k + 1));
    }
    // 3.1.2.1 -- 3-bit parity over class 1A, transmitted inverted.
    let p = BlockParity::TCH_FR.parity(d.segment(0, 50));
    u.fill_field(91, !p & 0x7, 3);
    // 3.1.2.1 -- tail bits.
    u.fill_field(185, 0, 4);
    // 3.1.2.2 -- class 1 coded, class 2 plain.
    let class1_c = GSM_RATE2.encode(&u);
    let mut c = BitVec::zeroed(456);
    c.copy_from(0, class1_c.as_slice());
    c.copy_from(378, d.segment(182, 78));
    c
}

/// GSM 05.03 3.1.2 backwards.
fn decode_fr(c: &SoftVec) -> Option<(BitVec, u32)> {
    let (u, bec) = GSM_RATE2.decode(&SoftVec::from_vals(c.segment(0, 378)), 189);
    let mut d = BitVec::zeroed(FR_FRAME_BITS);
    for k in 0..=90 {
        d.set_bit(2 * k, u.bit(k));
        d.set_bit(2 * k + 1, u.bit(184 - k));
    }
    let class2 = SoftVec::from_vals(c.segment(378, 78)).sliced();
    d.copy_from(182, class2.as_slice());
    let sent = (!u.peek_field(91, 3)) & 0x7;
    let calc = BlockParity::TCH_FR.parity(d.segment(0, 50)) & 0x7;
    (sent == calc).then_some((d, bec))
}

/// GSM 05.03 3.9.4: TCH/AFS encode, d -> c.
fn encode_afs(d: &BitVec, cfg: &AfsCfg) -> BitVec {
    let class1a = cfg.params.class1a;
    let kd = d.len();
    let mut u = BitVec::zeroed(kd + 6);
    // 3.9.4.3 -- class 1a, parity, class 1b.
    for k in 0..class1a {
        u.set_bit(k, d.bit(k));
    }
    let p = BlockParity::RACH.parity(d.segment(0, class1a));
    u.fill_field(class1a, !p & 0x3f, 6);
    for k in 0..kd - class1a {
        u.set_bit(k + class1a + 6, d.bit(k + class1a));
    }
    // 3.9.4.4 -- encode and puncture down to 448 bits; the last 8 bits of
    // the interleaver block are the in-band id bits.
    let uc = cfg.params.code.encode(&u);
    debug_assert_eq!(uc.len(), cfg.params.uc_len);
    let punctured = puncture(&uc, &cfg.punct);
    let mut c = BitVec::zeroed(456);
    c.copy_from(0, punctured.as_slice());
    c
}

/// GSM 05.03 3.9.4 backwards.
fn decode_afs(c: &SoftVec, cfg: &AfsCfg) -> Option<(BitVec, u32)> {
    let class1a = cfg.params.class1a;
    let uc = unpuncture(c.segment(0, 448), &cfg.punct, cfg.params.uc_len);
    let kd = cfg.params.uc_len / cfg.params.code.rate_denominator()
        - (cfg.params.code.coded_len(0) / cfg.params.code.rate_denominator())
        - 6;
    let (u, bec) = cfg.params.code.decode(&uc, kd + 6);
    let mut d = BitVec::zeroed(kd);
    for k in 0..class1a {
        d.set_bit(k, u.bit(k));
    }
    for k in 0..kd - class1a {
        d.set_bit(k + class1a, u.bit(k + class1a + 6));
    }
    let sent = (!u.peek_field(class1a, 6)) & 0x3f;
    let calc = BlockParity::RACH.parity(u.segment(0, class1a)) & 0x3f;
    (sent == calc).then_some((d, bec))
}

/// Bad-frame substitution state (GSM 06.11).
pub struct BadFrameState {
    prev_good: BitVec,
    num_bad: u32,
}

impl BadFrameState {
    pub fn new(mode: AmrMode) -> Self {
        BadFrameState {
            prev_good: BitVec::zeroed(mode.kd()),
            num_bad: 0,
        }
    }

    fn record_good(&mut self, payload: &BitVec) {
        self.prev_good = payload.clone();
        self.num_bad = 0;
    }

    /// Age the previous good FR frame: attenuate the block amplitude 4 dB
    /// per successive bad frame, randomize the RPE grid, and mute to the
    /// canonical silence frame after 32 bad frames.
    fn age_fr(&mut self) {
        self.num_bad += 1;
        if self.num_bad >= 32 {
            write_silence_frame(&mut self.prev_good);
            return;
        }
        let mut rng = rand::rng();
        let mut sf = FrFrame::new(&mut self.prev_good);
        let mut xmax = sf.block_amplitude(3);
        for f in 0..4 {
            // The first bad frame extrapolates the last good one;
            // subsequent ones are muted.
            if self.num_bad > 1 {
                xmax -= 4;
            }
            xmax = xmax.max(0);
            sf.set_block_amplitude(f, xmax as u64);
            sf.set_rpe_grid(f, u64::from(rng.random::<u8>() & 0x3));
            if xmax == 0 {
                write_silence_frame(&mut self.prev_good);
                self.num_bad = 32;
                return;
            }
        }
    }
}

/// Decode one traffic block into an audio frame, running the bad-frame
/// machinery when parity fails or the block was stolen. Always produces a
/// frame; the bool says whether it was a genuine good decode.
fn decode_tch_block(
    codec: &TchCodec,
    bad: &mut BadFrameState,
    c: &SoftVec,
    stolen: bool,
) -> (AudioFrame, bool, u32) {
    let mut bec = 0;
    let good = if stolen {
        false
    } else {
        match codec.decode(c) {
            Some((payload, b)) => {
                bec = b;
                bad.record_good(&payload);
                true
            }
            None => false,
        }
    };
    if !good {
        // AFS bad frames just replay the previous good payload; the FR
        // path runs the GSM 06.11 aging.
        if codec.mode() == AmrMode::TchFs {
            bad.age_fr();
        } else {
            bad.num_bad += 1;
        }
    }
    (
        AudioFrame::from_payload(codec.mode(), &bad.prev_good),
        good,
        bec,
    )
}

/// The GSM 05.03 3.1.3 diagonal interleaver.
fn interleave_31(c: &BitVec, i: &mut [BitVec; 8], block_offset: usize) {
    for k in 0..456 {
        let b = (k + block_offset) % 8;
        let j = 2 * ((49 * k) % 57) + ((k % 8) / 4);
        i[b].set_bit(j, c.bit(k));
    }
}

/// Deinterleave with erasure marking, diagonal phase `block_offset`.
fn deinterleave_31(i: &mut [SoftVec; 8], block_offset: usize) -> SoftVec {
    let mut c = SoftVec::erased(456);
    for k in 0..456 {
        let b = (k + block_offset) % 8;
        let j = 2 * ((49 * k) % 57) + ((k % 8) / 4);
        c.set(k, i[b].val(j));
        i[b].set(j, 0.5);
    }
    c
}

struct TchEncState {
    u: BitVec,
    i: [BitVec; 8],
    burst: TxBurst,
    offset: usize,
    previous_facch: bool,
    codec: TchCodec,
}

/// Downlink TCH/FACCH: queues from L2 and the RTP side, drained by a
/// dedicated dispatch thread that must feed the interleaver on time.
pub struct TchFacchEncoder {
    pub core: EncoderCore,
    l2_tx: Sender<L2Frame>,
    l2_rx: Receiver<L2Frame>,
    speech_tx: Sender<AudioFrame>,
    speech_rx: Receiver<AudioFrame>,
    enc: Mutex<TchEncState>,
    sibling_active: Mutex<Option<Arc<TchFacchDecoder>>>,
}

impl TchFacchEncoder {
    pub fn new(
        shared: Arc<L1FecShared>,
        radio: Arc<dyn RadioSink>,
        cn: u32,
        tn: u32,
        mapping: Arc<TdmaMapping>,
    ) -> Arc<Self> {
        let core = EncoderCore::new(shared, radio, cn, tn, mapping);
        let mut burst = TxBurst::new(GsmTime::new(0, tn));
        burst.set_training(&training_sequence(core.tsc));
        let (l2_tx, l2_rx) = unbounded();
        let (speech_tx, speech_rx) = unbounded();
        Arc::new(TchFacchEncoder {
            core,
            l2_tx,
            l2_rx,
            speech_tx,
            speech_rx,
            enc: Mutex::new(TchEncState {
                u: BitVec::zeroed(228),
                i: std::array::from_fn(|_| BitVec::zeroed(114)),
                burst,
                offset: 0,
                previous_facch: true,
                codec: TchCodec::new(AmrMode::TchFs),
            }),
            sibling_active: Mutex::new(None),
        })
    }

    pub fn set_sibling(&self, dec: Arc<TchFacchDecoder>) {
        *self.sibling_active.lock() = Some(dec);
    }

    pub fn set_amr_mode(&self, mode: AmrMode) {
        let mut enc = self.enc.lock();
        enc.codec = TchCodec::new(mode);
    }

    pub fn enc_init(&self) {
        self.core.enc_init();
        self.enc.lock().previous_facch = true;
    }

    /// Queue a FACCH frame; honors the simulated downlink FER test knob.
    pub fn write_high_side(&self, frame: &L2Frame) {
        let hot = self.core.shared.ctx.config.hot();
        if hot.simulated_fer_downlink > 0
            && rand::rng().random_range(0..100) < hot.simulated_fer_downlink
        {
            log::info!("[{}] simulating dropped downlink frame", self.core.label);
            return;
        }
        let _ = self.l2_tx.send(frame.clone());
    }

    /// Queue a speech frame from the RTP side.
    pub fn send_tch(&self, frame: AudioFrame) {
        let _ = self.speech_tx.send(frame);
    }

    /// Spawn the dispatch thread. Call once, from `enc_start`.
    pub fn service_start(self: &Arc<Self>) {
        let me = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("tch-{}", self.core.label))
            .spawn(move || {
                while !me.core.shared.ctx.shutting_down() {
                    me.dispatch();
                }
            })
            .expect("spawning TCH dispatch thread");
    }

    fn pair_active(&self) -> bool {
        let dec_ok = self
            .sibling_active
            .lock()
            .as_ref()
            .map_or(true, |d| d.core.dec_active());
        self.core.enc_active() && dec_ok
    }

    /// One pass of the downlink service loop: pick FACCH > speech >
    /// filler, encode, interleave, ship four bursts.
    pub fn dispatch(&self) {
        {
            let mut st = self.core.state.lock();
            self.core.resync(&mut st, false);
        }
        // An inactive channel still advances its clock, one multiframe at
        // a time, so it wakes promptly on activation.
        if !self.pair_active() {
            let target = {
                let mut st = self.core.state.lock();
                st.next_write_time.advance(26);
                st.next_write_time
            };
            self.core.shared.ctx.clock.wait_until(&target);
            return;
        }
        let prev = {
            let mut st = self.core.state.lock();
            self.core.resync(&mut st, false);
            st.prev_write_time
        };
        self.core.wait_to_send(&prev);

        let cfg = &self.core.shared.ctx.config;
        let hot = cfg.hot();
        let mut current_facch = false;

        // Speech latency control: the SIP side is close, keep the queue
        // short.
        let max_q = cfg.get_num("GSM.MaxSpeechLatency").max(0) as usize;
        while self.speech_rx.len() > max_q {
            let _ = self.speech_rx.try_recv();
        }

        let mut enc = self.enc.lock();
        let c: BitVec;
        if let Ok(frame) = self.l2_rx.try_recv() {
            // FACCH steals this block.
            current_facch = true;
            log::debug!("[{}] FACCH {:?}", self.core.label, frame);
            if let Some(tap) = self.core.shared.gsmtap.as_ref() {
                if hot.gsmtap_enabled {
                    let st = self.core.state.lock();
                    tap.write(
                        self.core.radio.arfcn(),
                        self.core.tn,
                        st.next_write_time.fnum(),
                        self.core.mapping.type_and_offset(),
                        false,
                        false,
                        &frame.bits().pack(),
                    );
                }
            }
            let mut d = BitVec::from_bits(&frame.bits().as_slice()[..L2_FRAME_BITS]);
            d.lsb8_msb();
            enc.u.fill(0);
            enc.u.copy_from(0, d.as_slice());
            c = fec_encode_41(&mut enc.u);
            // Flush the vocoder queue to limit latency after the theft.
            while self.speech_rx.try_recv().is_ok() {}
        } else if let Ok(audio) = self.speech_rx.try_recv() {
            match audio.payload(enc.codec.mode()) {
                Some(payload) => {
                    c = enc.codec.encode(&payload);
                }
                None => {
                    log::warn!("[{}] audio frame framing mismatch", self.core.label);
                    c = tch_filler_c();
                }
            }
        } else if !enc.previous_facch {
            c = tch_filler_c();
        } else {
            current_facch = true;
            let mut idle = l2_idle_frame(hot.scramble_filler);
            idle.bits_mut().lsb8_msb();
            enc.u.fill(0);
            enc.u.copy_from(0, idle.bits().as_slice());
            c = fec_encode_41(&mut enc.u);
        }

        let offset = enc.offset;
        interleave_31(&c, &mut enc.i, offset);

        // Noise injection applies to stolen (control) blocks only.
        let p_noise = if current_facch { hot.cch_ber } else { 0.0 };
        let prev_facch = enc.previous_facch;
        let mut rng = rand::rng();
        for b in 0..4 {
            let (next, crypto_on, alg, kc) = {
                let st = self.core.state.lock();
                let cr = self.core.shared.crypto.lock();
                (
                    st.next_write_time,
                    cr.downlink == EncryptionState::Yes,
                    cr.algorithm,
                    cr.kc,
                )
            };
            enc.burst.set_time(next);
            let mut e = enc.i[(b + offset) % 8].clone();
            if crypto_on {
                let ks = self
                    .core
                    .shared
                    .keystream
                    .keystream(alg, &kc, cipher_count(next.fnum()));
                for j in 0..114 {
                    e.set_bit(j, e.bit(j) ^ ks.downlink_bit(j));
                }
            }
            if p_noise > 0.0 {
                for j in 0..114 {
                    if rng.random::<f64>() < p_noise {
                        e.set_bit(j, e.bit(j) ^ 1);
                    }
                }
            }
            enc.burst.set_data(&e.as_slice()[0..57], &e.as_slice()[57..114]);
            // A stolen block is flagged across all eight bursts it spans.
            enc.burst.set_hu(current_facch);
            enc.burst.set_hl(prev_facch);
            self.core.radio.write_high_side_tx(&enc.burst, "tch");
            let mut st = self.core.state.lock();
            self.core.roll_forward(&mut st);
        }

        enc.offset = if offset == 0 { 4 } else { 0 };
        enc.previous_facch = current_facch;
    }
}

struct TchDecState {
    i: [SoftVec; 8],
    saved: [SoftVec; 8],
    fns: [u32; 8],
    steal_l: [u32; 8],
    steal_u: [u32; 8],
    read_time: GsmTime,
    codec: TchCodec,
    bad: BadFrameState,
}

/// Uplink TCH/FACCH decoder.
pub struct TchFacchDecoder {
    pub core: DecoderCore,
    state: Mutex<TchDecState>,
    speech_tx: Sender<AudioFrame>,
    speech_rx: Receiver<AudioFrame>,
}

impl TchFacchDecoder {
    pub fn new(
        shared: Arc<L1FecShared>,
        cn: u32,
        tn: u32,
        mapping: Arc<TdmaMapping>,
    ) -> Arc<Self> {
        let (speech_tx, speech_rx) = unbounded();
        Arc::new(TchFacchDecoder {
            core: DecoderCore::new(shared, cn, tn, mapping),
            state: Mutex::new(TchDecState {
                i: std::array::from_fn(|_| SoftVec::erased(114)),
                saved: std::array::from_fn(|_| SoftVec::erased(114)),
                fns: [0; 8],
                steal_l: [0; 8],
                steal_u: [0; 8],
                read_time: GsmTime::default(),
                codec: TchCodec::new(AmrMode::TchFs),
                bad: BadFrameState::new(AmrMode::TchFs),
            }),
            speech_tx,
            speech_rx,
        })
    }

    pub fn set_amr_mode(&self, mode: AmrMode) {
        let mut st = self.state.lock();
        st.codec = TchCodec::new(mode);
        st.bad = BadFrameState::new(mode);
    }

    /// Non-blocking uplink audio: one decoded frame per good (or
    /// substituted) traffic block.
    pub fn recv_tch(&self) -> Option<AudioFrame> {
        self.speech_rx.try_recv().ok()
    }

    fn decrypt_range(&self, st: &mut TchDecState, from: usize, to: usize) {
        let cr = self.core.shared.crypto.lock();
        for b in from..to {
            let ks = self
                .core
                .shared
                .keystream
                .keystream(cr.algorithm, &cr.kc, cipher_count(st.fns[b]));
            decrypt_soft(&ks, &mut st.i[b], 0);
        }
    }

    fn handle_facch_frame(&self, u: &BitVec, read_time: GsmTime) {
        let mut d = BitVec::from_bits(u.segment(0, 184));
        d.lsb8_msb();
        if let Some(tap) = self.core.shared.gsmtap.as_ref() {
            if self.core.shared.ctx.config.hot().gsmtap_enabled {
                tap.write(
                    self.core.cn,
                    self.core.tn,
                    read_time.fnum(),
                    self.core.mapping.type_and_offset(),
                    false,
                    true,
                    &d.pack(),
                );
            }
        }
        self.core.deliver_up(L2Frame::new(&d));
    }
}

impl BurstSink for TchFacchDecoder {
    fn write_low_side_rx(&self, burst: &RxBurst) {
        if !self.core.dec_active() {
            log::debug!("[{}] not active, ignoring input", self.core.label);
            return;
        }
        if super::try_handover_access(&self.core, burst) {
            return;
        }
        self.core.count_snr(burst.snr());

        let Some(pos) = self.core.mapping.reverse_mapping(burst.time().fnum()) else {
            log::error!("[{}] demux misrouted burst {:?}", self.core.label, burst);
            return;
        };
        let b = pos % 8;
        let mut st = self.state.lock();
        st.i[b].copy_from(0, burst.data1());
        st.i[b].copy_from(57, burst.data2());
        st.fns[b] = burst.time().fnum();
        st.steal_l[b] = u32::from(burst.hl());
        st.steal_u[b] = u32::from(burst.hu());
        if b % 4 != 3 {
            return;
        }
        st.read_time = burst.time();

        let uplink_crypto = self.core.shared.crypto.lock().uplink;
        if uplink_crypto == EncryptionState::Maybe {
            for k in 0..8 {
                st.saved[k] = st.i[k].clone();
            }
        }
        if uplink_crypto == EncryptionState::Yes {
            let (from, to) = if b == 7 { (4, 8) } else { (0, 4) };
            self.decrypt_range(&mut st, from, to);
        }

        // Deinterleave according to the diagonal phase of B.
        let phase = if b == 3 { 4 } else { 0 };
        let mut c = deinterleave_31(&mut st.i, phase);

        // Stealing-bit census over the eight bursts covering this block.
        let stolen_bits: u32 = if b == 3 {
            st.steal_u[4..8].iter().sum::<u32>() + st.steal_l[0..4].iter().sum::<u32>()
        } else {
            st.steal_u[0..4].iter().sum::<u32>() + st.steal_l[4..8].iter().sum::<u32>()
        };

        let mut ok_facch = false;
        let mut facch_bec = 0;
        if stolen_bits > 0 {
            // Any stealing flag: try FACCH first; its 40-bit parity is a
            // much stronger signal than the flags themselves.
            let (u, bec, ok) = fec_decode_41(&c);
            if ok {
                ok_facch = true;
                facch_bec = bec;
                self.handle_facch_frame(&u, st.read_time);
            } else if uplink_crypto == EncryptionState::Maybe {
                log::debug!("[{}] retrying FACCH decode with decryption", self.core.label);
                for k in 0..8 {
                    st.i[k] = st.saved[k].clone();
                }
                self.decrypt_range(&mut st, 0, 8);
                c = deinterleave_31(&mut st.i, phase);
                let (u2, bec2, ok2) = fec_decode_41(&c);
                if ok2 {
                    log::debug!("[{}] decrypt success on 2nd try", self.core.label);
                    self.core.shared.latch_encrypted();
                    ok_facch = true;
                    facch_bec = bec2;
                    self.handle_facch_frame(&u2, st.read_time);
                }
            }
        }

        // Always feed the traffic channel; the bad-frame machinery covers
        // stolen blocks. A block with many stealing flags but failed
        // FACCH parity is probably a corrupt (or still-encrypted) FACCH,
        // and the speech frame's 3 parity bits are too weak to trust it.
        let hot = self.core.shared.ctx.config.hot();
        let mut treat_stolen = ok_facch || stolen_bits > hot.steal_threshold;
        if hot.simulated_fer_uplink > 0
            && rand::rng().random_range(0..100) < hot.simulated_fer_uplink
        {
            log::debug!("[{}] simulating dropped uplink vocoder frame", self.core.label);
            treat_stolen = true;
        }
        let inner = &mut *st;
        let (frame, traffic_good, tch_bec) =
            decode_tch_block(&inner.codec, &mut inner.bad, &c, treat_stolen);
        drop(st);
        // A confirmed-stolen block was a FACCH, not speech: the L2 frame
        // went upstream and no audio frame is emitted for it.
        if !ok_facch {
            let _ = self.speech_tx.send(frame);
        }

        if ok_facch {
            self.core.count_stolen_frame(1);
            self.core.count_ber(facch_bec, 456);
        } else if traffic_good {
            self.core.count_good_frame(1);
            self.core.count_ber(tch_bec, 378);
        } else {
            self.core.count_bad_frame(4);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_payload(n: usize, seed: u64) -> BitVec {
        let mut rng = fastrand::Rng::with_seed(seed);
        BitVec::from_bits(&(0..n).map(|_| rng.u8(0..2)).collect::<Vec<_>>())
    }

    #[test]
    fn test_codec_roundtrip_every_mode() {
        for mode in AmrMode::ALL {
            let codec = TchCodec::new(mode);
            for trial in 0..3u64 {
                let payload = if trial == 0 {
                    BitVec::zeroed(mode.kd())
                } else {
                    random_payload(mode.kd(), trial * 31 + mode.kd() as u64)
                };
                let c = codec.encode(&payload);
                assert_eq!(c.len(), 456);
                let soft = SoftVec::from_bits(c.as_slice());
                let (got, bec) = codec
                    .decode(&soft)
                    .unwrap_or_else(|| panic!("{mode:?} trial {trial}: parity failed"));
                assert_eq!(got, payload, "{mode:?} trial {trial}");
                assert_eq!(bec, 0);
            }
        }
    }

    #[test]
    fn test_tch_interleaver_roundtrip() {
        let c = random_payload(456, 99);
        // Two consecutive blocks with alternating offsets fill all eight
        // planes; decoding the first block back out needs both halves.
        let mut planes: [BitVec; 8] = std::array::from_fn(|_| BitVec::zeroed(114));
        interleave_31(&c, &mut planes, 0);
        let mut soft: [SoftVec; 8] = std::array::from_fn(|_| SoftVec::erased(114));
        for k in 0..8 {
            soft[k] = SoftVec::from_bits(planes[k].as_slice());
        }
        let got = deinterleave_31(&mut soft, 0);
        for k in 0..456 {
            assert_eq!(u8::from(got.val(k) > 0.5), c.bit(k));
        }
    }

    #[test]
    fn test_bad_frame_aging_reaches_silence() {
        let mut bad = BadFrameState::new(AmrMode::TchFs);
        let mut payload = BitVec::zeroed(260);
        // A loud frame: max block amplitude everywhere.
        {
            let mut sf = FrFrame::new(&mut payload);
            for f in 0..4 {
                sf.set_block_amplitude(f, 63);
            }
        }
        bad.record_good(&payload);
        for _ in 0..40 {
            bad.age_fr();
        }
        let mut aged = bad.prev_good.clone();
        let sf = FrFrame::new(&mut aged);
        assert_eq!(sf.block_amplitude(0), 0);
        assert_eq!(bad.num_bad, 32);
    }

    use crate::context::test_context;
    use crate::gsm::burst::RxBurst;
    use crate::gsm::tdma::tchf_mapping;
    use parking_lot::Mutex as PMutex;

    struct CaptureRadio(PMutex<Vec<TxBurst>>);

    impl RadioSink for CaptureRadio {
        fn write_high_side_tx(&self, burst: &TxBurst, _reason: &str) {
            self.0.lock().push(burst.clone());
        }
    }

    struct CaptureL2(PMutex<Vec<L2Frame>>);

    impl super::super::L2Sink for CaptureL2 {
        fn write_low_side(&self, frame: L2Frame) {
            self.0.lock().push(frame);
        }
    }

    /// Speech through the live encoder dispatch loop, across the
    /// eight-burst diagonal, back out of the live decoder.
    #[test]
    fn test_speech_burst_loopback() {
        let ctx = test_context();
        let shared = L1FecShared::new(ctx, None);
        let radio = Arc::new(CaptureRadio(PMutex::new(Vec::new())));
        let mapping = Arc::new(tchf_mapping());
        let enc = TchFacchEncoder::new(shared.clone(), radio.clone(), 1, 2, mapping.clone());
        let dec = TchFacchDecoder::new(shared, 1, 2, mapping);
        dec.core
            .set_upstream(Arc::new(CaptureL2(PMutex::new(Vec::new()))));
        dec.core.dec_init();
        dec.core.dec_start();
        enc.enc_init();
        enc.core.enc_start();

        let payload = random_payload(260, 77);
        enc.send_tch(AudioFrame::from_fr_payload(&payload));
        // Two dispatch passes fill all eight bursts of the first block's
        // diagonal (the second carries the idle filler).
        enc.dispatch();
        enc.dispatch();
        let bursts = radio.0.lock().clone();
        assert_eq!(bursts.len(), 8);

        for b in &bursts {
            dec.write_low_side_rx(&RxBurst::from_tx(b, -40.0, 0.0));
        }
        // The half-filled block at B=3 substitutes; the full block at B=7
        // decodes our payload.
        let frames: Vec<AudioFrame> = std::iter::from_fn(|| dec.recv_tch()).collect();
        assert!(!frames.is_empty());
        let got = frames
            .last()
            .unwrap()
            .payload(AmrMode::TchFs)
            .expect("FR framing");
        assert_eq!(got, payload, "decoded speech differs");
    }

    /// A FACCH frame steals the block: it must come out as an L2 frame,
    /// with no speech frame emitted for that block.
    #[test]
    fn test_facch_theft_loopback() {
        let ctx = test_context();
        let shared = L1FecShared::new(ctx, None);
        let radio = Arc::new(CaptureRadio(PMutex::new(Vec::new())));
        let mapping = Arc::new(tchf_mapping());
        let enc = TchFacchEncoder::new(shared.clone(), radio.clone(), 1, 2, mapping.clone());
        let dec = TchFacchDecoder::new(shared, 1, 2, mapping);
        let up = Arc::new(CaptureL2(PMutex::new(Vec::new())));
        dec.core.set_upstream(up.clone());
        dec.core.dec_init();
        dec.core.dec_start();
        enc.enc_init();
        enc.core.enc_start();

        let l2 = random_payload(184, 13);
        enc.write_high_side(&L2Frame::new(&l2));
        enc.dispatch(); // FACCH block, Hu set on bursts 0..3
        enc.dispatch(); // idle FACCH (previous was FACCH), Hl set
        let bursts = radio.0.lock().clone();
        assert_eq!(bursts.len(), 8);
        // The stolen block is flagged on both halves of its diagonal.
        assert_eq!(bursts[0].bits().bit(87), 1, "Hu missing on first half");
        assert_eq!(bursts[4].bits().bit(60), 1, "Hl missing on second half");

        for b in &bursts {
            dec.write_low_side_rx(&RxBurst::from_tx(b, -40.0, 0.0));
        }
        let frames = up.0.lock();
        assert!(
            frames
                .iter()
                .any(|f| f.bits().segment(0, 184) == l2.as_slice()),
            "stolen FACCH frame not delivered upstream"
        );
        drop(frames);
        // No speech frame for the stolen block itself.
        let mut speech = 0;
        while dec.recv_tch().is_some() {
            speech += 1;
        }
        assert!(speech <= 1, "speech emitted for stolen blocks: {speech}");
    }

    #[test]
    fn test_stolen_block_substitutes_audio() {
        let codec = TchCodec::new(AmrMode::TchFs);
        let mut bad = BadFrameState::new(AmrMode::TchFs);
        let payload = random_payload(260, 5);
        let c = SoftVec::from_bits(codec.encode(&payload).as_slice());
        let (_, good, _) = decode_tch_block(&codec, &mut bad, &c, false);
        assert!(good);
        // Stolen: audio still produced, flagged not-good.
        let (frame, good, _) = decode_tch_block(&codec, &mut bad, &c, true);
        assert!(!good);
        assert!(frame.payload(AmrMode::TchFs).is_some());
    }
}
