// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frames: time-aligned collections of measurements.
//!
//! A frame holds every measurement sorted into one discrete output instant.
//! The publish flag and the measurement map live behind a single mutex, so a
//! producer inserting a measurement and the publication thread sealing the
//! frame can never interleave: once `published` flips, no insert succeeds and
//! the contents are fixed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::core::measurement::{Measurement, MeasurementKey};
use crate::core::time::Ticks;

/// One discrete instant of time-aligned measurements.
pub struct Frame {
    /// Frame timestamp in ticks (bucket-quantized).
    timestamp: Ticks,
    /// Measurement map and publish flag, guarded together.
    state: Mutex<FrameState>,
    /// Total successful assignments, including same-key replacements.
    ///
    /// Kept outside the mutex so the preemptive-publishing check can read it
    /// without contending with producers.
    sorted_count: AtomicUsize,
}

struct FrameState {
    measurements: HashMap<MeasurementKey, Measurement>,
    published: bool,
}

impl Frame {
    /// Create an empty frame for the given timestamp.
    pub fn new(timestamp: Ticks) -> Self {
        Self {
            timestamp,
            state: Mutex::new(FrameState {
                measurements: HashMap::new(),
                published: false,
            }),
            sorted_count: AtomicUsize::new(0),
        }
    }

    /// Frame timestamp in ticks.
    #[inline]
    pub fn timestamp(&self) -> Ticks {
        self.timestamp
    }

    /// Attempt to sort a measurement into this frame.
    ///
    /// Fails (returns `false`) iff the frame has already been published; the
    /// caller counts that as a missed sort. The last writer for a given key
    /// wins.
    pub fn try_insert(&self, measurement: Measurement) -> bool {
        let mut state = self.state.lock();
        if state.published {
            return false;
        }
        state.measurements.insert(measurement.key.clone(), measurement);
        self.sorted_count.fetch_add(1, Ordering::Release);
        true
    }

    /// Seal the frame for publication.
    ///
    /// Returns `false` if the frame was already published. After this returns
    /// `true`, every concurrent and subsequent `try_insert` fails.
    pub fn mark_published(&self) -> bool {
        let mut state = self.state.lock();
        if state.published {
            return false;
        }
        state.published = true;
        true
    }

    /// Whether the frame has been sealed for publication.
    pub fn is_published(&self) -> bool {
        self.state.lock().published
    }

    /// Total successful assignments, including same-key replacements.
    #[inline]
    pub fn sorted_count(&self) -> usize {
        self.sorted_count.load(Ordering::Acquire)
    }

    /// Number of distinct keys currently held.
    pub fn key_count(&self) -> usize {
        self.state.lock().measurements.len()
    }

    /// Copy of the measurement currently held for a key.
    pub fn get(&self, key: &MeasurementKey) -> Option<Measurement> {
        self.state.lock().measurements.get(key).cloned()
    }

    /// Snapshot of all held measurements (unordered).
    pub fn measurements(&self) -> Vec<Measurement> {
        self.state.lock().measurements.values().cloned().collect()
    }

    /// Replace the value held for a key with a derived one.
    ///
    /// Used by filtered downsampling to install the filter output while the
    /// frame is being published. Only the publication path calls this, after
    /// `mark_published`, so it deliberately ignores the publish fence.
    pub(crate) fn replace_value(&self, key: &MeasurementKey, value: f64) {
        let mut state = self.state.lock();
        if let Some(existing) = state.measurements.get(key) {
            let derived = existing.with_value(value);
            state.measurements.insert(key.clone(), derived);
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("timestamp", &self.timestamp)
            .field("sorted_count", &self.sorted_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u32) -> MeasurementKey {
        MeasurementKey::new("TEST", id)
    }

    #[test]
    fn test_insert_and_get() {
        let frame = Frame::new(1000);
        assert!(frame.try_insert(Measurement::new(key(1), 1000, 1.5)));

        let m = frame.get(&key(1)).expect("measurement should be present");
        assert_eq!(m.value, 1.5);
        assert_eq!(frame.key_count(), 1);
        assert_eq!(frame.sorted_count(), 1);
    }

    #[test]
    fn test_last_writer_wins_per_key() {
        let frame = Frame::new(1000);
        assert!(frame.try_insert(Measurement::new(key(1), 1000, 1.0)));
        assert!(frame.try_insert(Measurement::new(key(1), 1001, 2.0)));

        assert_eq!(frame.key_count(), 1);
        assert_eq!(frame.sorted_count(), 2);
        let m = frame.get(&key(1)).expect("measurement should be present");
        assert_eq!(m.value, 2.0);
    }

    #[test]
    fn test_published_frame_rejects_inserts() {
        let frame = Frame::new(1000);
        assert!(frame.try_insert(Measurement::new(key(1), 1000, 1.0)));

        assert!(frame.mark_published());
        assert!(frame.is_published());

        // Insert after publication fails and leaves the contents untouched.
        assert!(!frame.try_insert(Measurement::new(key(2), 1000, 9.9)));
        assert_eq!(frame.key_count(), 1);
        assert_eq!(frame.sorted_count(), 1);
    }

    #[test]
    fn test_mark_published_is_one_shot() {
        let frame = Frame::new(1000);
        assert!(frame.mark_published());
        assert!(!frame.mark_published());
    }

    #[test]
    fn test_concurrent_insert_vs_publish() {
        use std::sync::Arc;
        use std::thread;

        for _ in 0..50 {
            let frame = Arc::new(Frame::new(1000));
            let inserter = {
                let frame = Arc::clone(&frame);
                thread::spawn(move || {
                    let mut accepted = 0usize;
                    for id in 0..100 {
                        if frame.try_insert(Measurement::new(key(id), 1000, f64::from(id))) {
                            accepted += 1;
                        }
                    }
                    accepted
                })
            };
            let publisher = {
                let frame = Arc::clone(&frame);
                thread::spawn(move || frame.mark_published())
            };

            let accepted = inserter.join().expect("inserter thread");
            assert!(publisher.join().expect("publisher thread"));

            // Whatever was accepted before the seal is exactly what remains.
            assert_eq!(frame.key_count(), accepted);
        }
    }
}
