// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Same-key collision handling within a destination frame.
//!
//! At low frame rates several measurements for one key can land in the
//! same frame. Each frame carries a [`Downsampler`] that decides, per
//! incoming measurement, whether it replaces the held one, is dropped,
//! or is buffered for a publish-time filter pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::DownsamplingMethod;
use crate::core::frame::Frame;
use crate::core::measurement::{Measurement, MeasurementKey};

/// Combines buffered same-key candidates into one published value.
pub type FilterFn = Arc<dyn Fn(&[Measurement]) -> f64 + Send + Sync>;

/// Cap on buffered candidates per key in filtered mode. Oldest entries
/// are dropped past this point.
const MAX_FILTER_CANDIDATES: usize = 256;

/// Average of the good-quality candidate values.
///
/// Falls back to averaging everything when no candidate has good value
/// quality, so a frame full of suspect data still publishes a number
/// instead of silently vanishing.
#[must_use]
pub fn average_filter(candidates: &[Measurement]) -> f64 {
    debug_assert!(!candidates.is_empty());

    let (sum, count) = candidates
        .iter()
        .filter(|m| m.value_quality_good)
        .fold((0.0, 0usize), |(sum, count), m| (sum + m.value, count + 1));

    if count > 0 {
        sum / count as f64
    } else {
        candidates.iter().map(|m| m.value).sum::<f64>() / candidates.len() as f64
    }
}

/// Per-frame downsampling state.
///
/// `derive` is called on the sorting path for every measurement headed
/// into the frame; `finalize` runs once on the publication path after
/// the frame is sealed.
pub(crate) struct Downsampler {
    method: DownsamplingMethod,
    /// Buffered candidates per key, filtered mode only.
    candidates: Mutex<HashMap<MeasurementKey, Vec<Measurement>>>,
    /// Collisions resolved so far (reported at publication).
    downsampled: AtomicU64,
}

impl Downsampler {
    pub(crate) fn new(method: DownsamplingMethod) -> Self {
        Self {
            method,
            candidates: Mutex::new(HashMap::new()),
            downsampled: AtomicU64::new(0),
        }
    }

    /// Decide what the frame should hold after this measurement.
    ///
    /// `Some(m)` means assign `m` (replacing any held value for the
    /// key); `None` means the measurement lost the collision and the
    /// caller discards it.
    pub(crate) fn derive(&self, frame: &Frame, measurement: Measurement) -> Option<Measurement> {
        match self.method {
            DownsamplingMethod::LastReceived => {
                if frame.get(&measurement.key).is_some() {
                    self.downsampled.fetch_add(1, Ordering::Relaxed);
                }
                Some(measurement)
            }
            DownsamplingMethod::Closest => match frame.get(&measurement.key) {
                None => Some(measurement),
                Some(held) => {
                    self.downsampled.fetch_add(1, Ordering::Relaxed);
                    let offset = |ts: i64| (ts - frame.timestamp()).abs();
                    if offset(measurement.timestamp) < offset(held.timestamp) {
                        Some(measurement)
                    } else {
                        None
                    }
                }
            },
            DownsamplingMethod::Filtered => {
                let mut candidates = self.candidates.lock();
                let entry = candidates.entry(measurement.key.clone()).or_default();
                if !entry.is_empty() {
                    self.downsampled.fetch_add(1, Ordering::Relaxed);
                }
                if entry.len() >= MAX_FILTER_CANDIDATES {
                    entry.remove(0);
                }
                entry.push(measurement.clone());
                // The latest candidate stands in until finalize installs
                // the filter output.
                Some(measurement)
            }
        }
    }

    /// Install filter outputs for every key that saw more than one
    /// candidate. Runs after the frame is sealed; no-op outside
    /// filtered mode.
    pub(crate) fn finalize(&self, frame: &Frame, filter: &FilterFn) {
        if self.method != DownsamplingMethod::Filtered {
            return;
        }

        let candidates = self.candidates.lock();
        for (key, entries) in candidates.iter() {
            if entries.len() > 1 {
                frame.replace_value(key, filter(entries));
            }
        }
    }

    /// Collisions resolved in this frame so far.
    pub(crate) fn downsampled_count(&self) -> u64 {
        self.downsampled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u32) -> MeasurementKey {
        MeasurementKey::new("TEST", id)
    }

    fn sort(frame: &Frame, downsampler: &Downsampler, m: Measurement) -> bool {
        match downsampler.derive(frame, m) {
            Some(derived) => frame.try_insert(derived),
            None => false,
        }
    }

    #[test]
    fn test_last_received_keeps_latest() {
        let frame = Frame::new(1_000_000);
        let ds = Downsampler::new(DownsamplingMethod::LastReceived);

        assert!(sort(&frame, &ds, Measurement::new(key(1), 999_000, 1.0)));
        assert!(sort(&frame, &ds, Measurement::new(key(1), 1_002_000, 2.0)));

        let held = frame.get(&key(1)).expect("measurement should be present");
        assert_eq!(held.value, 2.0);
        assert_eq!(ds.downsampled_count(), 1);
    }

    #[test]
    fn test_closest_rejects_farther() {
        let frame = Frame::new(1_000_000);
        let ds = Downsampler::new(DownsamplingMethod::Closest);

        assert!(sort(&frame, &ds, Measurement::new(key(1), 1_000_100, 1.0)));
        // 2_000 ticks off vs 100: loses.
        assert!(!sort(&frame, &ds, Measurement::new(key(1), 1_002_000, 2.0)));

        let held = frame.get(&key(1)).expect("measurement should be present");
        assert_eq!(held.value, 1.0);
        assert_eq!(ds.downsampled_count(), 1);
    }

    #[test]
    fn test_closest_replaces_with_nearer() {
        let frame = Frame::new(1_000_000);
        let ds = Downsampler::new(DownsamplingMethod::Closest);

        assert!(sort(&frame, &ds, Measurement::new(key(1), 1_005_000, 1.0)));
        assert!(sort(&frame, &ds, Measurement::new(key(1), 1_000_100, 2.0)));

        let held = frame.get(&key(1)).expect("measurement should be present");
        assert_eq!(held.value, 2.0);
        assert_eq!(ds.downsampled_count(), 1);
    }

    #[test]
    fn test_filtered_finalize_installs_average() {
        let frame = Frame::new(1_000_000);
        let ds = Downsampler::new(DownsamplingMethod::Filtered);
        let filter: FilterFn = Arc::new(average_filter);

        assert!(sort(&frame, &ds, Measurement::new(key(1), 999_000, 1.0)));
        assert!(sort(&frame, &ds, Measurement::new(key(1), 1_000_000, 2.0)));
        assert!(sort(&frame, &ds, Measurement::new(key(1), 1_001_000, 6.0)));
        assert_eq!(ds.downsampled_count(), 2);

        frame.mark_published();
        ds.finalize(&frame, &filter);

        let held = frame.get(&key(1)).expect("measurement should be present");
        assert!((held.value - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_filtered_single_candidate_untouched() {
        let frame = Frame::new(1_000_000);
        let ds = Downsampler::new(DownsamplingMethod::Filtered);
        let filter: FilterFn = Arc::new(|_| 99.0);

        assert!(sort(&frame, &ds, Measurement::new(key(1), 1_000_000, 5.0)));
        frame.mark_published();
        ds.finalize(&frame, &filter);

        let held = frame.get(&key(1)).expect("measurement should be present");
        assert_eq!(held.value, 5.0);
        assert_eq!(ds.downsampled_count(), 0);
    }

    #[test]
    fn test_average_filter_prefers_good_quality() {
        let good = Measurement::new(key(1), 0, 10.0);
        let mut bad = Measurement::new(key(1), 0, 1000.0);
        bad.value_quality_good = false;

        let avg = average_filter(&[good.clone(), bad.clone()]);
        assert!((avg - 10.0).abs() < 1e-9);

        // All-bad input still averages rather than producing nothing.
        let avg = average_filter(&[bad.clone(), bad.with_value(2000.0)]);
        assert!((avg - 1500.0).abs() < 1e-9);
    }
}
