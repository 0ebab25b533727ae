// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TDMA time: frame-number arithmetic and the BTS clock.
//!
//! A [`GsmTime`] is a (frame number, timeslot) pair. All FN arithmetic is
//! modulo the hyperframe (GSM 05.02 4.3.3). The [`BtsClock`] maps frame
//! numbers onto wall-clock instants so encoder threads can pace themselves
//! against the 4.615 ms burst clock.

use crate::config::HYPERFRAME;
use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

/// Convert a frame count to elapsed microseconds (exactly 120 ms / 26 each).
fn frames_to_us(frames: u64) -> u64 {
    frames * 120_000 / 26
}

fn us_to_frames(us: u64) -> u64 {
    us * 26 / 120_000
}

/// A point in TDMA time: frame number within the hyperframe plus timeslot.
///
/// Ordering compares FN first, then TN, without modular wrapping; use
/// [`GsmTime::delta`] for wrap-aware distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct GsmTime {
    fnum: u32,
    tn: u32,
}

impl GsmTime {
    pub fn new(fnum: u32, tn: u32) -> Self {
        debug_assert!(tn < 8);
        GsmTime {
            fnum: fnum % HYPERFRAME,
            tn,
        }
    }

    pub fn fnum(&self) -> u32 {
        self.fnum
    }

    pub fn tn(&self) -> u32 {
        self.tn
    }

    pub fn set_tn(&mut self, tn: u32) {
        debug_assert!(tn < 8);
        self.tn = tn;
    }

    /// T1, the superframe counter, 11 bits (GSM 04.08 9.1.30).
    pub fn t1(&self) -> u32 {
        self.fnum / (26 * 51)
    }

    /// T2, the 26-multiframe index, 5 bits.
    pub fn t2(&self) -> u32 {
        self.fnum % 26
    }

    /// T3, the 51-multiframe index.
    pub fn t3(&self) -> u32 {
        self.fnum % 51
    }

    /// T3', the compressed T3 sent on the SCH, 3 bits.
    pub fn t3p(&self) -> u32 {
        (self.t3() - 1) / 10
    }

    /// TC, the BCCH block counter (GSM 05.02 6.3.1.3).
    pub fn tc(&self) -> u32 {
        (self.fnum / 51) % 8
    }

    /// Advance by a number of frames, modulo the hyperframe.
    pub fn advance(&mut self, frames: u32) {
        self.fnum = (self.fnum + frames) % HYPERFRAME;
    }

    /// Signed FN distance `self - other`, wrapped to the nearest half
    /// hyperframe.
    pub fn delta(&self, other: &GsmTime) -> i32 {
        let half = (HYPERFRAME / 2) as i64;
        let mut d = i64::from(self.fnum) - i64::from(other.fnum);
        if d >= half {
            d -= i64::from(HYPERFRAME);
        } else if d < -half {
            d += i64::from(HYPERFRAME);
        }
        d as i32
    }

    /// Move forward (never backward) to the next FN congruent to `offset`
    /// modulo `modulus`. This implements GSM 05.02 clause 7 scheduling.
    pub fn roll_forward(&mut self, offset: u32, modulus: u32) {
        let d = (offset + modulus - (self.fnum % modulus)) % modulus;
        self.fnum = (self.fnum + d) % HYPERFRAME;
    }
}

impl fmt::Display for GsmTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fnum, self.tn)
    }
}

/// The master frame clock.
///
/// Holds a (FN, Instant) anchor; the current FN is derived from elapsed
/// wall-clock time. `set()` re-anchors on a transceiver clock indication,
/// which may jump the clock in either direction.
pub struct BtsClock {
    anchor: Mutex<(u32, Instant)>,
}

impl BtsClock {
    pub fn new() -> Self {
        BtsClock {
            anchor: Mutex::new((0, Instant::now())),
        }
    }

    /// Re-anchor the clock at `fnum` as of now.
    pub fn set(&self, fnum: u32) {
        let mut a = self.anchor.lock();
        *a = (fnum % HYPERFRAME, Instant::now());
    }

    /// Current frame number.
    pub fn fnum(&self) -> u32 {
        let a = self.anchor.lock();
        let elapsed = us_to_frames(a.1.elapsed().as_micros() as u64);
        ((u64::from(a.0) + elapsed) % u64::from(HYPERFRAME)) as u32
    }

    /// Current time with TN 0.
    pub fn time(&self) -> GsmTime {
        GsmTime::new(self.fnum(), 0)
    }

    /// The wall-clock instant at which frame `t` occurs (next occurrence,
    /// within half a hyperframe either way).
    pub fn systime(&self, t: &GsmTime) -> Instant {
        let (afn, ainstant) = *self.anchor.lock();
        let anchor_time = GsmTime::new(afn, 0);
        // An Instant cannot represent times before the anchor on all
        // platforms; clamp past times to the anchor itself.
        let d = t.delta(&anchor_time).max(0);
        ainstant + Duration::from_micros(frames_to_us(d as u64))
    }

    /// Block until the clock reaches frame `t`. Returns immediately if `t`
    /// is in the past.
    pub fn wait_until(&self, t: &GsmTime) {
        loop {
            let now = self.time();
            let d = t.delta(&now);
            if d <= 0 {
                return;
            }
            std::thread::sleep(Duration::from_micros(frames_to_us(d as u64)));
        }
    }
}

impl Default for BtsClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_fields() {
        // FN = t1*(26*51) + offsets; pick one with known decomposition.
        let t = GsmTime::new(2 * 26 * 51 + 23, 0);
        assert_eq!(t.t1(), 2);
        assert_eq!(t.t2(), 23 % 26);
        assert_eq!(t.t3(), 23 % 51);
    }

    #[test]
    fn test_roll_forward() {
        let mut t = GsmTime::new(100, 3);
        t.roll_forward(2, 51);
        assert_eq!(t.fnum() % 51, 2);
        assert!(t.fnum() >= 100);
        // Already at the target position: no movement.
        let before = t.fnum();
        t.roll_forward(t.fnum() % 51, 51);
        assert_eq!(t.fnum(), before);
    }

    #[test]
    fn test_delta_wraps() {
        let a = GsmTime::new(5, 0);
        let b = GsmTime::new(HYPERFRAME - 5, 0);
        assert_eq!(a.delta(&b), 10);
        assert_eq!(b.delta(&a), -10);
    }

    #[test]
    fn test_clock_advances() {
        let clock = BtsClock::new();
        clock.set(1000);
        let t0 = clock.fnum();
        std::thread::sleep(Duration::from_millis(15));
        let t1 = clock.fnum();
        assert!(t1 > t0, "clock did not advance: {t0} -> {t1}");
    }

    #[test]
    fn test_wait_until_past_returns() {
        let clock = BtsClock::new();
        clock.set(1000);
        clock.wait_until(&GsmTime::new(10, 0)); // far in the past half
    }
}
