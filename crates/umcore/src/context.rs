// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Injected context objects.
//!
//! The original globals of a BTS core (clock, band, BSIC, LAI, SIP
//! interface addresses) live in two explicit structs handed to each
//! subsystem at construction. Lifecycle: build the context, start the
//! subsystems, stop the subsystems, drop the context.

use crate::config::Config;
use crate::gsm::time::BtsClock;
use std::sync::Arc;

/// GSM frequency bands with distinct power-control tables (GSM 05.05 4.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Gsm850,
    Egsm900,
    Dcs1800,
    Pcs1900,
}

impl Band {
    pub fn from_config(cfg: &Config) -> Band {
        match cfg.get_num("GSM.Radio.Band") {
            850 => Band::Gsm850,
            1800 => Band::Dcs1800,
            1900 => Band::Pcs1900,
            _ => Band::Egsm900,
        }
    }
}

/// Location area identity broadcast by this cell.
#[derive(Debug, Clone)]
pub struct Lai {
    pub mcc: u16,
    pub mnc: u16,
    pub lac: u16,
    pub cell_id: u16,
}

/// Shared state of one BTS: the frame clock and the cell identity.
///
/// Cheap to clone behind an `Arc`; every L1 component holds one.
pub struct BtsContext {
    pub config: Arc<Config>,
    pub clock: BtsClock,
    pub band: Band,
    /// Base station identity code: NCC (3 bits) << 3 | BCC (3 bits).
    pub bsic: u8,
    pub lai: Lai,
    shutdown: std::sync::atomic::AtomicBool,
}

impl BtsContext {
    pub fn new(config: Arc<Config>, bsic: u8, lai: Lai) -> Arc<Self> {
        let band = Band::from_config(&config);
        Arc::new(BtsContext {
            config,
            clock: BtsClock::new(),
            band,
            bsic: bsic & 0x3f,
            lai,
            shutdown: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Base station color code, also used as the training sequence code.
    pub fn bcc(&self) -> u8 {
        self.bsic & 0x07
    }

    pub fn bsic(&self) -> u8 {
        self.bsic
    }

    /// True once `stop()` has been called; service loops poll this.
    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Ask every service thread to wind down.
    pub fn stop(&self) {
        self.shutdown
            .store(true, std::sync::atomic::Ordering::Relaxed);
        log::info!("[BtsContext] shutdown requested");
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> Arc<BtsContext> {
    BtsContext::new(
        Arc::new(Config::new()),
        0x3a,
        Lai {
            mcc: 1,
            mnc: 1,
            lac: 1000,
            cell_id: 10,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bsic_split() {
        let ctx = test_context();
        assert_eq!(ctx.bsic(), 0x3a);
        assert_eq!(ctx.bcc(), 0x02);
    }
}
