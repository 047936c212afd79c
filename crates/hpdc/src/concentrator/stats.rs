// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Concentration statistics with atomic counters.
//!
//! Counters use Relaxed ordering: they feed operator diagnostics, not
//! control flow, so cross-counter consistency is not required.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::core::time::{self, Ticks};

/// Shared counters updated by the sorting and publication paths.
#[derive(Debug, Default)]
pub struct ConcentrationStats {
    /// Measurements presented for sorting.
    received: AtomicU64,
    /// Measurements successfully assigned to a frame.
    processed: AtomicU64,
    /// Measurements dropped for any reason.
    discarded: AtomicU64,
    /// Bad-timestamp measurements re-stamped with arrival time.
    sorted_by_arrival: AtomicU64,
    /// Measurements that missed their frame because it had published.
    missed_by_timeout: AtomicU64,
    /// Same-key collisions resolved by the downsampling strategy.
    downsampled: AtomicU64,
    /// Frames handed to the sink.
    published_frames: AtomicU64,
    /// Sorted measurements carried by published frames.
    published_measurements: AtomicU64,
    /// Frames published early by the preemptive path.
    frames_ahead_of_schedule: AtomicU64,
    /// Cumulative time spent inside the frame sink, in ticks.
    total_publish_time: AtomicI64,
}

impl ConcentrationStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_received(&self, count: u64) {
        self.received.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_processed(&self, count: u64) {
        self.processed.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_discarded(&self, count: u64) {
        self.discarded.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_sorted_by_arrival(&self, count: u64) {
        self.sorted_by_arrival.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_missed_by_timeout(&self, count: u64) {
        self.missed_by_timeout.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_downsampled(&self, count: u64) {
        self.downsampled.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_published_frame(&self, measurement_count: u64) {
        self.published_frames.fetch_add(1, Ordering::Relaxed);
        self.published_measurements
            .fetch_add(measurement_count, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_frame_ahead_of_schedule(&self) {
        self.frames_ahead_of_schedule.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_publish_time(&self, ticks: Ticks) {
        self.total_publish_time.fetch_add(ticks, Ordering::Relaxed);
    }

    /// Zero every counter.
    pub fn reset(&self) {
        self.received.store(0, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
        self.discarded.store(0, Ordering::Relaxed);
        self.sorted_by_arrival.store(0, Ordering::Relaxed);
        self.missed_by_timeout.store(0, Ordering::Relaxed);
        self.downsampled.store(0, Ordering::Relaxed);
        self.published_frames.store(0, Ordering::Relaxed);
        self.published_measurements.store(0, Ordering::Relaxed);
        self.frames_ahead_of_schedule.store(0, Ordering::Relaxed);
        self.total_publish_time.store(0, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            sorted_by_arrival: self.sorted_by_arrival.load(Ordering::Relaxed),
            missed_by_timeout: self.missed_by_timeout.load(Ordering::Relaxed),
            downsampled: self.downsampled.load(Ordering::Relaxed),
            published_frames: self.published_frames.load(Ordering::Relaxed),
            published_measurements: self.published_measurements.load(Ordering::Relaxed),
            frames_ahead_of_schedule: self.frames_ahead_of_schedule.load(Ordering::Relaxed),
            total_publish_time: self.total_publish_time.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the concentration counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub discarded: u64,
    pub sorted_by_arrival: u64,
    pub missed_by_timeout: u64,
    pub downsampled: u64,
    pub published_frames: u64,
    pub published_measurements: u64,
    pub frames_ahead_of_schedule: u64,
    /// Cumulative sink time in ticks.
    pub total_publish_time: Ticks,
}

impl StatsSnapshot {
    /// Mean time spent publishing one frame, in seconds.
    #[must_use]
    pub fn average_publish_time(&self) -> f64 {
        if self.published_frames == 0 {
            return 0.0;
        }
        time::to_seconds(self.total_publish_time) / self.published_frames as f64
    }

    /// Fraction of received measurements that reached a frame.
    #[must_use]
    pub fn sorting_efficiency(&self) -> f64 {
        if self.received == 0 {
            return 0.0;
        }
        self.processed as f64 / self.received as f64
    }
}
