// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The SAP multiplexer between L1 and LAPDm (GSM 04.06).
//!
//! Downlink is transparent: one L2 frame goes to the single L1 below.
//! Uplink routes by primitive: data frames by their SAPI field, handover
//! access pinned to SAPI 0, establish/error indications broadcast to
//! every attached upper SAP.

use super::fec::L2Sink;
use super::l2::{L2Frame, Primitive};
use parking_lot::RwLock;
use std::sync::Arc;

/// Downlink entry point of the L1 below the mux.
pub trait L1FrameSink: Send + Sync {
    fn write_high_side(&self, frame: &L2Frame);
}

/// The multiplexer. Upper SAPs (LAPDm instances) register per SAPI; the
/// single lower L1 is attached once.
pub struct SapMux {
    upper: RwLock<[Option<Arc<dyn L2Sink>>; 4]>,
    lower: RwLock<Option<Arc<dyn L1FrameSink>>>,
    label: String,
}

impl SapMux {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(SapMux {
            upper: RwLock::new([None, None, None, None]),
            lower: RwLock::new(None),
            label: label.into(),
        })
    }

    pub fn attach_upper(&self, sapi: u8, sink: Arc<dyn L2Sink>) {
        debug_assert!(sapi < 4);
        self.upper.write()[usize::from(sapi)] = Some(sink);
    }

    pub fn attach_lower(&self, sink: Arc<dyn L1FrameSink>) {
        let mut lower = self.lower.write();
        debug_assert!(lower.is_none(), "lower L1 attached twice");
        *lower = Some(sink);
    }

    /// Downlink: transparent passthrough.
    pub fn write_high_side(&self, frame: &L2Frame) {
        match self.lower.read().as_ref() {
            Some(l1) => l1.write_high_side(frame),
            None => log::error!("[SapMux {}] downlink with no L1 attached", self.label),
        }
    }

    fn deliver(&self, sapi: u8, frame: L2Frame) {
        match self.upper.read()[usize::from(sapi & 3)].as_ref() {
            Some(up) => up.write_low_side(frame),
            None => log::debug!(
                "[SapMux {}] dropping uplink frame for unattached SAPI {}",
                self.label,
                sapi
            ),
        }
    }

    fn broadcast(&self, frame: &L2Frame) {
        for sap in self.upper.read().iter().flatten() {
            sap.write_low_side(frame.clone());
        }
    }
}

impl L2Sink for SapMux {
    /// Uplink routing.
    fn write_low_side(&self, frame: L2Frame) {
        match frame.primitive() {
            Primitive::L2Data => {
                let sapi = frame.sapi();
                if sapi != 0 && sapi != 3 {
                    log::warn!("[SapMux {}] uplink frame with SAPI {}", self.label, sapi);
                }
                self.deliver(sapi, frame);
            }
            // The thin RACH-style L2 of the handover burst has no
            // addressing; it belongs to the main signalling SAP.
            Primitive::HandoverAccess => self.deliver(0, frame),
            Primitive::L3EstablishIndication
            | Primitive::PhConnect
            | Primitive::MdlErrorIndication => self.broadcast(&frame),
            p => {
                // Release-family primitives flow downlink only.
                log::error!("[SapMux {}] unexpected uplink primitive {:?}", self.label, p);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gsm::bits::BitVec;
    use parking_lot::Mutex;

    struct Collect(Mutex<Vec<Primitive>>);

    impl L2Sink for Collect {
        fn write_low_side(&self, frame: L2Frame) {
            self.0.lock().push(frame.primitive());
        }
    }

    #[test]
    fn test_data_routes_by_sapi() {
        let mux = SapMux::new("test");
        let s0 = Arc::new(Collect(Mutex::new(Vec::new())));
        let s3 = Arc::new(Collect(Mutex::new(Vec::new())));
        mux.attach_upper(0, s0.clone());
        mux.attach_upper(3, s3.clone());

        let mut payload = BitVec::zeroed(8);
        payload.fill_field(3, 3, 3); // SAPI 3
        mux.write_low_side(L2Frame::new(&payload));
        mux.write_low_side(L2Frame::new(&BitVec::zeroed(8))); // SAPI 0
        assert_eq!(s0.0.lock().len(), 1);
        assert_eq!(s3.0.lock().len(), 1);
    }

    #[test]
    fn test_handover_access_forced_to_sap0() {
        let mux = SapMux::new("test");
        let s0 = Arc::new(Collect(Mutex::new(Vec::new())));
        let s3 = Arc::new(Collect(Mutex::new(Vec::new())));
        mux.attach_upper(0, s0.clone());
        mux.attach_upper(3, s3.clone());
        mux.write_low_side(L2Frame::empty(Primitive::HandoverAccess));
        assert_eq!(s0.0.lock().len(), 1);
        assert!(s3.0.lock().is_empty());
    }

    #[test]
    fn test_establish_broadcasts() {
        let mux = SapMux::new("test");
        let s0 = Arc::new(Collect(Mutex::new(Vec::new())));
        let s3 = Arc::new(Collect(Mutex::new(Vec::new())));
        mux.attach_upper(0, s0.clone());
        mux.attach_upper(3, s3.clone());
        mux.write_low_side(L2Frame::empty(Primitive::L3EstablishIndication));
        assert_eq!(s0.0.lock().len(), 1);
        assert_eq!(s3.0.lock().len(), 1);
    }
}
