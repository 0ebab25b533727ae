// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The seam to the radio front-end.
//!
//! Downlink: encoders hand finished bursts to a [`RadioSink`]. Uplink: the
//! radio thread pushes each received burst into the [`RxDemux`], which
//! routes it to every decoder whose TDMA mapping claims that (TN, FN).

use super::burst::{RxBurst, TxBurst};
use super::tdma::TdmaMapping;
use parking_lot::RwLock;
use std::sync::Arc;

/// Downlink burst consumer, implemented by the transceiver glue (or a
/// test harness).
pub trait RadioSink: Send + Sync {
    fn write_high_side_tx(&self, burst: &TxBurst, reason: &str);

    /// Enable the handover-access correlator on a timeslot.
    fn set_handover(&self, _tn: u32) -> bool {
        true
    }

    fn clear_handover(&self, _tn: u32) -> bool {
        true
    }

    fn arfcn(&self) -> u32 {
        0
    }
}

/// A sink that drops bursts; stands in when no radio is connected, which
/// is normal in the unit-test harness.
pub struct NullRadio;

impl RadioSink for NullRadio {
    fn write_high_side_tx(&self, burst: &TxBurst, reason: &str) {
        log::debug!("[NullRadio] dropping {reason} burst at {}", burst.time());
    }
}

/// Uplink burst consumer, implemented by every L1 decoder.
pub trait BurstSink: Send + Sync {
    fn write_low_side_rx(&self, burst: &RxBurst);
}

struct DemuxEntry {
    tn: u32,
    mapping: Arc<TdmaMapping>,
    sink: Arc<dyn BurstSink>,
}

/// Routes uplink bursts by (TN, FN mod mapping repeat).
#[derive(Default)]
pub struct RxDemux {
    entries: RwLock<Vec<DemuxEntry>>,
}

impl RxDemux {
    pub fn new() -> Self {
        RxDemux {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register a decoder. Called once per channel at configuration time.
    pub fn install(&self, tn: u32, mapping: Arc<TdmaMapping>, sink: Arc<dyn BurstSink>) {
        log::info!(
            "[RxDemux] installing decoder {} on TN{}",
            mapping.type_and_offset(),
            tn
        );
        self.entries.write().push(DemuxEntry { tn, mapping, sink });
    }

    /// Deliver one received burst to the owning decoder(s).
    pub fn receive(&self, burst: &RxBurst) {
        let tn = burst.time().tn();
        let fnum = burst.time().fnum();
        for e in self.entries.read().iter() {
            if e.tn == tn && e.mapping.reverse_mapping(fnum).is_some() {
                e.sink.write_low_side_rx(burst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gsm::bits::SoftVec;
    use crate::gsm::tdma::sdcch8_mapping;
    use crate::gsm::time::GsmTime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl BurstSink for Counter {
        fn write_low_side_rx(&self, _burst: &RxBurst) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_demux_routes_by_mapping() {
        let demux = RxDemux::new();
        let sink = Arc::new(Counter(AtomicUsize::new(0)));
        let mapping = Arc::new(sdcch8_mapping(0, false));
        demux.install(1, mapping.clone(), sink.clone());

        let burst_at = |fnum, tn| {
            RxBurst::new(
                SoftVec::erased(148),
                GsmTime::new(fnum, tn),
                -40.0,
                0.0,
                8.0,
            )
        };
        // Subchannel 0 uplink starts at frame 15.
        demux.receive(&burst_at(15, 1));
        demux.receive(&burst_at(16, 1));
        demux.receive(&burst_at(15, 2)); // wrong TN
        demux.receive(&burst_at(30, 1)); // frame not in mapping
        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
    }
}
