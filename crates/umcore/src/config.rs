// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global configuration — single source of truth.
//!
//! Two levels, the same split the rest of the tree relies on:
//!
//! - **Level 1 (static)**: compile-time protocol constants (TDMA geometry,
//!   burst layout, RFC3261 timer bases). **Never hardcode these elsewhere.**
//! - **Level 2 (dynamic)**: [`Config`], the runtime key/value table holding
//!   every `GSM.*` / `SIP.*` / `Control.*` / `Test.*` key, with typed
//!   getters and an [`ArcSwap`] snapshot of the values read on per-frame
//!   hot paths.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::Arc;

// =======================================================================
// TDMA geometry (GSM 05.02)
// =======================================================================

/// Frames per 51-multiframe times frames per 26-multiframe.
pub const FRAMES_PER_SUPERFRAME: u32 = 26 * 51;

/// TDMA hyperframe length in frames (26 x 51 x 2048, about 3.5 hours).
pub const HYPERFRAME: u32 = FRAMES_PER_SUPERFRAME * 2048;

/// One TDMA frame is exactly 120 ms / 26 = 4.615384... ms.
pub const FRAME_DURATION_US: u64 = 120_000 / 26;

/// Symbols per timeslot, not counting the guard period.
pub const SLOT_LEN: usize = 148;

/// Index of the lower stealing bit within a normal burst (GSM 05.03 3.1.4).
pub const HL_INDEX: usize = 60;

/// Index of the upper stealing bit within a normal burst (GSM 05.03 3.1.4).
pub const HU_INDEX: usize = 87;

/// Offset of the training sequence within a normal burst (GSM 05.02 5.2.3).
pub const TRAINING_OFFSET: usize = 61;

// =======================================================================
// RFC3261 timer bases (section 17.1.2.2)
// =======================================================================

/// RTT estimate T1, in milliseconds.
pub const SIP_T1_MS: u64 = 500;

/// Maximum retransmit interval T2 for non-INVITE requests and responses.
pub const SIP_T2_MS: u64 = 4000;

/// Maximum duration a message will remain in the network, T4.
pub const SIP_T4_MS: u64 = 5000;

/// Timer D for an INVITE client transaction on unreliable transport.
/// RFC3261 17.1.1.2 says 32 s instead of 64*T1.
pub const SIP_TIMER_D_MS: u64 = 32_000;

/// GSMTAP well-known UDP port.
pub const GSMTAP_PORT: u16 = 4729;

// =======================================================================
// Runtime configuration
// =======================================================================

/// Values read on per-frame hot paths, refreshed on every [`Config::set`].
///
/// Reading through the `ArcSwap` snapshot keeps the burst loops free of
/// string parsing and map lookups.
#[derive(Debug, Clone)]
pub struct HotValues {
    /// `GSM.Cipher.CCHBER`: control-channel bit error injection probability.
    pub cch_ber: f64,
    /// `GSM.Cipher.ScrambleFiller`: randomize LAPDm filler octets.
    pub scramble_filler: bool,
    /// `Test.GSM.SimulatedFER.Uplink`: percent of uplink frames dropped.
    pub simulated_fer_uplink: i64,
    /// `Test.GSM.SimulatedFER.Downlink`: percent of downlink frames dropped.
    pub simulated_fer_downlink: i64,
    /// `Test.GSM.UplinkFuzzingRate`: percent of good uplink frames fuzzed.
    pub uplink_fuzzing_rate: i64,
    /// `Test.SIP.SimulatedPacketLoss`: percent of outbound SIP/RTP drops.
    pub simulated_packet_loss: i64,
    /// `Control.GSMTAP.GSM`: mirror L2 frames to the GSMTAP socket.
    pub gsmtap_enabled: bool,
    /// `GSM.StealFrameThreshold`: stealing-bit count above which a block
    /// with failed FACCH parity is still withheld from the vocoder.
    pub steal_threshold: u32,
}

/// Built-in defaults. Every key named in the configuration surface exists
/// here so `get_*` never has to guess.
const DEFAULTS: &[(&str, &str)] = &[
    ("GSM.Radio.ARFCNs", "1"),
    ("GSM.Radio.Band", "900"),
    ("GSM.Radio.RSSITarget", "-50"),
    ("GSM.Radio.RSSIAveragePeriod", "4"),
    ("GSM.Radio.SNRTarget", "0"),
    ("GSM.Radio.SNRAveragePeriod", "4"),
    ("GSM.MS.Power.Min", "5"),
    ("GSM.MS.Power.Max", "33"),
    ("GSM.MS.Power.Damping", "75"),
    ("GSM.MS.TA.Max", "62"),
    ("GSM.MS.TA.Damping", "50"),
    ("GSM.MaxSpeechLatency", "2"),
    ("GSM.SpeechBuffer", "300"),
    ("GSM.Cipher.CCHBER", "0"),
    ("GSM.Cipher.ScrambleFiller", "0"),
    ("GSM.StealFrameThreshold", "5"),
    ("GSM.Timer.T3103", "5000"),
    ("GSM.Timer.T3109", "30000"),
    ("GSM.Timer.T3111", "2000"),
    ("Control.SACCHTimeout.BumpDown", "1"),
    ("Control.GSMTAP.GSM", "0"),
    ("Control.GSMTAP.TargetIP", "127.0.0.1"),
    ("SIP.Local.IP", "127.0.0.1"),
    ("SIP.Local.Port", "5062"),
    ("SIP.Proxy.Speech", "127.0.0.1:5060"),
    ("SIP.Proxy.SMS", "127.0.0.1:5063"),
    ("SIP.Proxy.Registration", "127.0.0.1:5064"),
    ("SIP.Proxy.USSD", ""),
    ("SIP.RegistrationPeriod", "90"),
    ("SIP.Timer.E", "500"),
    ("SIP.Timer.F", "32000"),
    ("SIP.DTMF.RFC2833", "1"),
    ("SIP.DTMF.RFC2833.PayloadType", "101"),
    ("SIP.Realm", ""),
    ("SIP.RFC3428.NoTrying", "0"),
    ("Test.GSM.SimulatedFER.Uplink", "0"),
    ("Test.GSM.SimulatedFER.Downlink", "0"),
    ("Test.GSM.UplinkFuzzingRate", "0"),
    ("Test.SIP.SimulatedPacketLoss", "0"),
];

/// Runtime configuration table.
///
/// Lock-free reads (`DashMap`), atomic hot-path snapshot (`ArcSwap`).
/// Unknown keys fall back to the built-in default, or to the type's zero
/// value for keys that have none.
pub struct Config {
    store: DashMap<Arc<str>, Arc<str>>,
    hot: ArcSwap<HotValues>,
}

impl Config {
    pub fn new() -> Self {
        let cfg = Config {
            store: DashMap::new(),
            hot: ArcSwap::from_pointee(HotValues {
                cch_ber: 0.0,
                scramble_filler: false,
                simulated_fer_uplink: 0,
                simulated_fer_downlink: 0,
                uplink_fuzzing_rate: 0,
                simulated_packet_loss: 0,
                gsmtap_enabled: false,
                steal_threshold: 5,
            }),
        };
        cfg.refresh_hot();
        cfg
    }

    /// Set a key and refresh the hot snapshot.
    pub fn set(&self, key: &str, value: &str) {
        self.store.insert(Arc::from(key), Arc::from(value));
        self.refresh_hot();
        log::debug!("[Config] set {}={}", key, value);
    }

    pub fn get_str(&self, key: &str) -> String {
        if let Some(v) = self.store.get(key) {
            return v.value().to_string();
        }
        DEFAULTS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| (*v).to_string())
            .unwrap_or_default()
    }

    pub fn get_num(&self, key: &str) -> i64 {
        self.get_str(key).trim().parse().unwrap_or(0)
    }

    pub fn get_float(&self, key: &str) -> f64 {
        self.get_str(key).trim().parse().unwrap_or(0.0)
    }

    /// "1", "true", "yes", "on" are true; everything else is false.
    pub fn get_bool(&self, key: &str) -> bool {
        matches!(
            self.get_str(key).trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    }

    /// Current hot-path snapshot.
    pub fn hot(&self) -> Arc<HotValues> {
        self.hot.load_full()
    }

    fn refresh_hot(&self) {
        self.hot.store(Arc::new(HotValues {
            cch_ber: self.get_float("GSM.Cipher.CCHBER"),
            scramble_filler: self.get_bool("GSM.Cipher.ScrambleFiller"),
            simulated_fer_uplink: self.get_num("Test.GSM.SimulatedFER.Uplink"),
            simulated_fer_downlink: self.get_num("Test.GSM.SimulatedFER.Downlink"),
            uplink_fuzzing_rate: self.get_num("Test.GSM.UplinkFuzzingRate"),
            simulated_packet_loss: self.get_num("Test.SIP.SimulatedPacketLoss"),
            gsmtap_enabled: self.get_bool("Control.GSMTAP.GSM"),
            steal_threshold: self.get_num("GSM.StealFrameThreshold").max(0) as u32,
        }));
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_present() {
        let cfg = Config::new();
        assert_eq!(cfg.get_num("GSM.Radio.ARFCNs"), 1);
        assert_eq!(cfg.get_num("GSM.Radio.RSSITarget"), -50);
        assert_eq!(cfg.get_str("SIP.Proxy.Speech"), "127.0.0.1:5060");
        assert!(!cfg.get_bool("Control.GSMTAP.GSM"));
    }

    #[test]
    fn test_set_refreshes_hot() {
        let cfg = Config::new();
        assert_eq!(cfg.hot().simulated_fer_uplink, 0);
        cfg.set("Test.GSM.SimulatedFER.Uplink", "25");
        assert_eq!(cfg.hot().simulated_fer_uplink, 25);
        cfg.set("GSM.StealFrameThreshold", "7");
        assert_eq!(cfg.hot().steal_threshold, 7);
    }

    #[test]
    fn test_unknown_key_is_zero() {
        let cfg = Config::new();
        assert_eq!(cfg.get_num("No.Such.Key"), 0);
        assert_eq!(cfg.get_str("No.Such.Key"), "");
    }
}
