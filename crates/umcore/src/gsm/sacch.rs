// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The SACCH physical-layer closed loop (GSM 05.08 4, 05.10 5-6).
//!
//! Every SACCH frame carries a 16-bit physical header: the ordered MS
//! power and timing advance. The uplink side averages the measured RSSI
//! and timing error of each good burst; the downlink side runs a damped
//! controller that steers the MS toward the configured RSSI target
//! without dropping marginal calls.

use super::burst::RxBurst;
use super::fec::xcch::XcchEncoder;
use super::fec::XcchDecoderHandle;
use super::l2::L2Frame;
use crate::context::{Band, BtsContext};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Initial downlink-ordered MS power, dBm. 2 W in the low band; the
/// closed loop turns it down quickly once the SACCH is up.
pub const INITIAL_MS_POWER: f32 = 33.0;

/// Measurement reports over which timing error is averaged, minus one.
/// The phone's actual setting changes every 4 bursts, so average over at
/// least that.
const AVERAGE_PERIOD_TIMING: u32 = 8;

/// Power control codes for GSM400/GSM850/EGSM900, GSM 05.05 4.1.1.
const POWER_LOW_BAND: [i32; 32] = [
    39, 39, 39, 37, 35, 33, 31, 29, 27, 25, 23, 21, 19, 17, 15, 13, 11, 9, 7, 5, 5, 5, 5, 5, 5, 5,
    5, 5, 5, 5, 5, 5,
];

/// Power control codes for DCS1800.
const POWER_1800: [i32; 32] = [
    30, 28, 26, 24, 22, 20, 18, 16, 14, 12, 10, 8, 6, 4, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 36, 24, 23,
];

/// Power control codes for PCS1900.
const POWER_1900: [i32; 32] = [
    30, 28, 26, 24, 22, 20, 18, 16, 14, 12, 10, 8, 6, 4, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    0, 0, 0, 0,
];

fn power_table(band: Band) -> &'static [i32; 32] {
    match band {
        Band::Gsm850 | Band::Egsm900 => &POWER_LOW_BAND,
        Band::Dcs1800 => &POWER_1800,
        Band::Pcs1900 => &POWER_1900,
    }
}

/// dBm value ordered by control code `code`.
pub fn decode_power(band: Band, code: u8) -> i32 {
    power_table(band)[usize::from(code & 0x1f)]
}

/// Closest control code for a dBm power level.
pub fn encode_power(band: Band, power_dbm: f32) -> u8 {
    let table = power_table(band);
    let mut best = 0usize;
    let mut best_err = (power_dbm - table[0] as f32).abs();
    for (i, &v) in table.iter().enumerate().skip(1) {
        let err = (power_dbm - v as f32).abs();
        if err == 0.0 {
            return i as u8;
        }
        if err < best_err {
            best_err = err;
            best = i;
        }
    }
    best as u8
}

/// Uplink physical measurements of one MS, kept by the SACCH decoder.
#[derive(Debug, Clone)]
pub struct MsPhysReport {
    rssi: f32,
    timing_error: f32,
    timestamp: Option<Instant>,
    report_count: u32,
    actual_ms_power: f32,
    actual_ms_timing: f32,
}

impl MsPhysReport {
    /// Fresh state at channel open: RSSI starts at the target (not zero),
    /// the RACH came in at full power, timing unknown.
    pub fn new(ctx: &BtsContext) -> Self {
        MsPhysReport {
            rssi: ctx.config.get_num("GSM.Radio.RSSITarget") as f32,
            timing_error: 0.0,
            timestamp: None,
            report_count: 0,
            actual_ms_power: INITIAL_MS_POWER,
            actual_ms_timing: 0.0,
        }
    }

    /// Fold one burst's measurements into the running averages.
    pub fn process_burst(&mut self, burst: &RxBurst, ctx: &BtsContext) {
        let rssi_period = ctx.config.get_num("GSM.Radio.RSSIAveragePeriod").max(0) as u32;
        let n = self.report_count.min(rssi_period);
        self.rssi = (burst.rssi() + n as f32 * self.rssi) / (n + 1) as f32;

        let n = self.report_count.min(AVERAGE_PERIOD_TIMING);
        self.timing_error = (burst.timing_error() + n as f32 * self.timing_error) / (n + 1) as f32;

        self.timestamp = Some(Instant::now());
        self.report_count += 1;
    }

    /// Record the actuals from a good frame's physical header.
    pub fn record_actuals(&mut self, power_code: u8, ta_field: u8, band: Band) {
        self.actual_ms_power = decode_power(band, power_code) as f32;
        if ta_field < 64 {
            self.actual_ms_timing = f32::from(ta_field);
        }
    }

    /// Push measured RSSI down so the controller orders more power; used
    /// when SACCH frames go missing.
    pub fn rssi_bump_down(&mut self, db: f32) {
        self.rssi -= db;
    }

    /// Seed measurements at channel open (from the RACH or a handover
    /// access burst).
    pub fn init_phy(&mut self, rssi: f32, timing_error: f32) {
        self.rssi = rssi;
        self.timing_error = timing_error;
    }

    /// Carry measurements over from an established channel on reassignment.
    pub fn set_phy(&mut self, other: &MsPhysReport) {
        *self = other.clone();
    }

    pub fn is_valid(&self) -> bool {
        self.report_count > 0
    }

    pub fn rssi(&self) -> f32 {
        self.rssi
    }

    pub fn timing_error(&self) -> f32 {
        self.timing_error
    }

    pub fn actual_ms_power(&self) -> f32 {
        self.actual_ms_power
    }

    pub fn actual_ms_timing(&self) -> f32 {
        self.actual_ms_timing
    }

    pub fn report_count(&self) -> u32 {
        self.report_count
    }
}

struct SacchOrders {
    power: f32,
    timing: f32,
}

/// The SACCH downlink: an XCCH encoder with the power/TA controller in
/// front of it.
pub struct SacchEncoder {
    pub inner: Arc<XcchEncoder>,
    sibling: XcchDecoderHandle,
    orders: Mutex<SacchOrders>,
}

impl SacchEncoder {
    pub fn new(inner: Arc<XcchEncoder>, sibling: XcchDecoderHandle) -> Arc<Self> {
        Arc::new(SacchEncoder {
            inner,
            sibling,
            orders: Mutex::new(SacchOrders {
                power: INITIAL_MS_POWER,
                timing: 0.0,
            }),
        })
    }

    fn ctx(&self) -> &BtsContext {
        &self.inner.core.shared.ctx
    }

    fn bound_power(&self, p: f32) -> f32 {
        let max = self.ctx().config.get_num("GSM.MS.Power.Max") as f32;
        let min = self.ctx().config.get_num("GSM.MS.Power.Min") as f32;
        p.clamp(min, max)
    }

    fn bound_timing(&self, t: f32) -> f32 {
        let max = self.ctx().config.get_num("GSM.MS.TA.Max") as f32;
        t.clamp(0.0, max)
    }

    pub fn enc_init(&self) {
        let mut o = self.orders.lock();
        o.power = self.bound_power(INITIAL_MS_POWER);
        o.timing = 0.0;
        drop(o);
        self.inner.core.enc_init();
    }

    /// Initialize orders from the access-burst measurements; like the
    /// closed loop but with no damping, and the target goosed up a little
    /// in case the RACH measurement was off.
    pub fn init_phy(&self, rssi: f32, timing_error: f32) {
        let target = self.ctx().config.get_num("GSM.Radio.RSSITarget") as f32 + 10.0;
        let delta_p = rssi - target;
        let mut o = self.orders.lock();
        o.power = self.bound_power(INITIAL_MS_POWER - delta_p);
        o.timing = self.bound_timing(timing_error);
        log::info!(
            "[{}] init phy rssi={} timingError={} orderPower={}",
            self.inner.core.label,
            rssi,
            timing_error,
            o.power
        );
    }

    /// Carry orders over from an established channel.
    pub fn set_phy(&self, other: &SacchEncoder) {
        let from = other.orders.lock();
        let mut o = self.orders.lock();
        o.power = from.power;
        o.timing = from.timing;
    }

    /// One pass of the damped control loop followed by frame transmission.
    pub fn write_high_side(&self, frame: &L2Frame) {
        let cfg = &self.ctx().config;
        let phys = self.sibling.phys_snapshot();
        let mut o = self.orders.lock();
        if let Some(phys) = phys.filter(MsPhysReport::is_valid) {
            // Power, GSM 05.08 4. RSSI and target are both negative dB:
            // deltaP positive means the handset is too loud.
            let rssi = phys.rssi();
            let target = cfg.get_num("GSM.Radio.RSSITarget") as f32;
            let mut delta_p = rssi - target;
            let snr_target = cfg.get_num("GSM.Radio.SNRTarget") as f32;
            if snr_target != 0.0 {
                let snr = self.sibling.decoder().core.stats().ave_snr;
                if delta_p > 0.0 && snr < snr_target {
                    // RSSI is fine but the channel is noisy; only ever
                    // push power up on SNR deficit.
                    delta_p = snr - snr_target;
                }
            }
            let damping_cfg = cfg.get_num("GSM.MS.Power.Damping");
            let mut damping = damping_cfg as f32 * 0.01;
            if damping_cfg < 90 && delta_p < 4.0 {
                // Track upward faster than downward when the signal is
                // near the edge.
                damping /= 2.0;
            }
            let target_power = phys.actual_ms_power() - delta_p;
            o.power = self.bound_power(damping * o.power + (1.0 - damping) * target_power);

            // Timing, GSM 05.10 5-6, symbol periods.
            let target_ta = phys.actual_ms_timing() + phys.timing_error();
            let ta_damping = cfg.get_num("GSM.MS.TA.Damping") as f32 * 0.01;
            o.timing = self.bound_timing(ta_damping * o.timing + (1.0 - ta_damping) * target_ta);
            log::debug!(
                "[{}] loop rssi={} deltaP={} orderPower={} orderTA={}",
                self.inner.core.label,
                rssi,
                delta_p,
                o.power,
                o.timing
            );
        }
        let power_code = encode_power(self.ctx().band, o.power);
        let ta = (o.timing + 0.5) as u64;
        drop(o);
        self.inner
            .send_frame(frame, Some((u64::from(power_code), ta)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    #[test]
    fn test_power_tables() {
        assert_eq!(decode_power(Band::Egsm900, 5), 33);
        assert_eq!(decode_power(Band::Dcs1800, 0), 30);
        // Encoding picks the nearest code.
        assert_eq!(decode_power(Band::Egsm900, encode_power(Band::Egsm900, 33.0)), 33);
        assert_eq!(decode_power(Band::Egsm900, encode_power(Band::Egsm900, 12.0)), 13);
    }

    #[test]
    fn test_phys_averages() {
        let ctx = test_context();
        let mut phys = MsPhysReport::new(&ctx);
        assert!(!phys.is_valid());
        assert_eq!(phys.rssi(), -50.0);
        let burst = crate::gsm::burst::RxBurst::new(
            crate::gsm::bits::SoftVec::erased(148),
            crate::gsm::time::GsmTime::new(0, 2),
            -60.0,
            1.0,
            9.0,
        );
        phys.process_burst(&burst, &ctx);
        assert!(phys.is_valid());
        // The first measurement replaces the seed outright.
        assert!((phys.rssi() - (-60.0)).abs() < 0.01);
        // A second burst at a different level averages in.
        let burst2 = crate::gsm::burst::RxBurst::new(
            crate::gsm::bits::SoftVec::erased(148),
            crate::gsm::time::GsmTime::new(4, 2),
            -50.0,
            1.0,
            9.0,
        );
        phys.process_burst(&burst2, &ctx);
        assert!((phys.rssi() - (-55.0)).abs() < 0.01);
        phys.rssi_bump_down(3.0);
        assert!((phys.rssi() - (-58.0)).abs() < 0.01);
    }

    #[test]
    fn test_actuals_guard_ta_range() {
        let ctx = test_context();
        let mut phys = MsPhysReport::new(&ctx);
        phys.record_actuals(5, 20, Band::Egsm900);
        assert_eq!(phys.actual_ms_power(), 33.0);
        assert_eq!(phys.actual_ms_timing(), 20.0);
        phys.record_actuals(5, 100, Band::Egsm900);
        // Out-of-range TA field is ignored.
        assert_eq!(phys.actual_ms_timing(), 20.0);
    }
}
