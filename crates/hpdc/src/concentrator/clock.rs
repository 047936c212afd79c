// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Real-time tracking without a trusted global clock.
//!
//! In measurement-tracking mode the most recent plausible measurement
//! timestamp IS real time: device clocks are GPS-disciplined and
//! typically better than the local host clock. The local clock serves
//! only as a sanity bound. In local-clock mode the host clock is
//! authoritative and incoming timestamps never move real time.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::core::time::{self, Ticks};

/// Tracks the concentrator's notion of "now".
#[derive(Debug)]
pub struct RealTimeClock {
    /// Host clock is authoritative; measurement timestamps are ignored.
    use_local_clock: bool,
    /// Plausibility bound, seconds. A candidate timestamp (or the
    /// current value, against the host clock) must sit within +/- this
    /// of the host clock.
    lead_time: f64,
    /// Latest accepted real time, ticks.
    real_time: AtomicI64,
}

impl RealTimeClock {
    pub fn new(use_local_clock: bool, lead_time: f64) -> Self {
        Self {
            use_local_clock,
            lead_time,
            real_time: AtomicI64::new(time::now_ticks()),
        }
    }

    /// Current real time in ticks.
    ///
    /// In tracking mode, a stored value that has drifted outside the
    /// lead tolerance of the host clock (host restart, time step, quiet
    /// inputs) is snapped back to the host clock first.
    pub fn real_time(&self) -> Ticks {
        let now = time::now_ticks();
        if self.use_local_clock {
            return now;
        }

        let current = self.real_time.load(Ordering::Acquire);
        let distance = time::to_seconds(now - current);
        if distance > self.lead_time || distance < -self.lead_time {
            // Single attempt: a lost race means another caller already
            // repaired the value.
            let _ = self.real_time.compare_exchange(
                current,
                now,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }

        self.real_time.load(Ordering::Acquire)
    }

    /// Seconds between real time and a timestamp (positive = past).
    #[inline]
    pub fn seconds_from_real_time(&self, timestamp: Ticks) -> f64 {
        time::to_seconds(self.real_time() - timestamp)
    }

    /// Offer a successfully sorted measurement timestamp as a real-time
    /// candidate.
    ///
    /// Only timestamps ahead of the current value are considered. A
    /// candidate within the lead tolerance of the host clock advances
    /// real time; otherwise, if the stored value itself has drifted out
    /// of tolerance, it is repaired from the host clock. No-op in
    /// local-clock mode.
    ///
    /// Returns `true` when the candidate itself became real time.
    pub fn update(&self, timestamp: Ticks) -> bool {
        if self.use_local_clock {
            return false;
        }

        let current = self.real_time.load(Ordering::Acquire);
        if timestamp <= current {
            return false;
        }

        let now = time::now_ticks();
        if time::time_is_valid(timestamp, now, self.lead_time, self.lead_time) {
            self.real_time
                .compare_exchange(current, timestamp, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        } else {
            // Candidate implausible; fall back to checking our own value
            // against the host clock.
            let distance = time::to_seconds(now - current);
            if distance > self.lead_time || distance < -self.lead_time {
                let _ = self.real_time.compare_exchange(
                    current,
                    now,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn set_raw(&self, ticks: Ticks) {
        self.real_time.store(ticks, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::TICKS_PER_SECOND;

    #[test]
    fn test_local_clock_mode_follows_host() {
        let clock = RealTimeClock::new(true, 1.0);
        let now = time::now_ticks();
        let rt = clock.real_time();
        assert!((rt - now).abs() < TICKS_PER_SECOND, "should track host clock");
    }

    #[test]
    fn test_local_clock_mode_ignores_updates() {
        let clock = RealTimeClock::new(true, 1.0);
        let future = time::now_ticks() + TICKS_PER_SECOND / 2;
        assert!(!clock.update(future));
    }

    #[test]
    fn test_plausible_timestamp_advances_real_time() {
        let clock = RealTimeClock::new(false, 1.0);
        let candidate = time::now_ticks() + TICKS_PER_SECOND / 2;

        assert!(clock.update(candidate));
        assert_eq!(clock.real_time(), candidate);
    }

    #[test]
    fn test_stale_timestamp_does_not_regress() {
        let clock = RealTimeClock::new(false, 1.0);
        let current = clock.real_time();
        assert!(!clock.update(current - TICKS_PER_SECOND));
        assert!(clock.real_time() >= current);
    }

    #[test]
    fn test_implausible_timestamp_rejected() {
        let clock = RealTimeClock::new(false, 1.0);
        let before = clock.real_time();
        let wild = time::now_ticks() + 10 * TICKS_PER_SECOND;

        assert!(!clock.update(wild));
        let after = clock.real_time();
        assert!(after < wild, "wild future timestamp must not become real time");
        assert!(after >= before);
    }

    #[test]
    fn test_drifted_value_snaps_to_host_clock() {
        let clock = RealTimeClock::new(false, 1.0);
        clock.set_raw(time::now_ticks() - 10 * TICKS_PER_SECOND);

        let rt = clock.real_time();
        let now = time::now_ticks();
        assert!(
            (now - rt).abs() < TICKS_PER_SECOND,
            "drifted value should snap back to the host clock"
        );
    }

    #[test]
    fn test_seconds_from_real_time_sign() {
        let clock = RealTimeClock::new(false, 1.0);
        let rt = clock.real_time();

        let past = clock.seconds_from_real_time(rt - TICKS_PER_SECOND);
        assert!(past > 0.9, "past timestamps yield positive distance");

        let future = clock.seconds_from_real_time(rt + TICKS_PER_SECOND);
        assert!(future < -0.9, "future timestamps yield negative distance");
    }
}
