// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Latest-value tracking for absolute-latest reads.
//!
//! Consumers that only want "the current value of key X" should not pay
//! for frame alignment. The cache keeps the newest measurement per key;
//! reads are judged against real time, and a value older than the lag
//! window reads as NaN rather than silently serving stale data.

use dashmap::DashMap;

use crate::core::measurement::{Measurement, MeasurementKey};
use crate::core::time::{self, Ticks};

/// Newest measurement per key with staleness-aware reads.
pub struct LatestMeasurementCache {
    /// Read tolerance windows, seconds.
    lag_time: f64,
    lead_time: f64,
    values: DashMap<MeasurementKey, Measurement>,
}

impl LatestMeasurementCache {
    pub fn new(lag_time: f64, lead_time: f64) -> Self {
        Self {
            lag_time,
            lead_time,
            values: DashMap::new(),
        }
    }

    /// Record a measurement if it is at least as new as the held one.
    pub fn update(&self, measurement: &Measurement) {
        match self.values.entry(measurement.key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut held) => {
                if measurement.timestamp >= held.get().timestamp {
                    held.insert(measurement.clone());
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(measurement.clone());
            }
        }
    }

    /// Value for a key, judged against the given real time.
    ///
    /// `None` when the key has never been seen; NaN when the held value
    /// has aged out of the tolerance windows.
    pub fn value(&self, key: &MeasurementKey, real_time: Ticks) -> Option<f64> {
        self.values.get(key).map(|held| {
            if time::time_is_valid(held.timestamp, real_time, self.lag_time, self.lead_time) {
                held.value
            } else {
                f64::NAN
            }
        })
    }

    /// Raw held measurement for a key, regardless of age.
    pub fn measurement(&self, key: &MeasurementKey) -> Option<Measurement> {
        self.values.get(key).map(|held| held.clone())
    }

    /// Every held measurement still within the tolerance windows.
    pub fn fresh_measurements(&self, real_time: Ticks) -> Vec<Measurement> {
        self.values
            .iter()
            .filter(|held| {
                time::time_is_valid(held.timestamp, real_time, self.lag_time, self.lead_time)
            })
            .map(|held| held.clone())
            .collect()
    }

    /// Every held measurement, with stale values replaced by NaN.
    ///
    /// Used by flush-style publication where subscribers expect one
    /// entry per tracked key regardless of age.
    pub fn snapshot(&self, real_time: Ticks) -> Vec<Measurement> {
        self.values
            .iter()
            .map(|held| {
                if time::time_is_valid(held.timestamp, real_time, self.lag_time, self.lead_time) {
                    held.clone()
                } else {
                    held.with_value(f64::NAN)
                }
            })
            .collect()
    }

    /// Number of keys ever seen.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&self) {
        self.values.clear();
    }
}
