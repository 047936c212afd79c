// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame queue: the ordered working set of in-flight frames.
//!
//! Buckets are keyed by timestamp quantized to the configured time
//! resolution and kept sorted, so the head is always the oldest
//! unpublished instant. Producers look up or lazily create buckets;
//! the publication worker pops from the front. The table mutex guards
//! bucket operations only; per-measurement work happens under the
//! individual frame's own lock.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::DownsamplingMethod;
use crate::concentrator::downsample::{Downsampler, FilterFn};
use crate::concentrator::FrameFactory;
use crate::core::frame::Frame;
use crate::core::measurement::Measurement;
use crate::core::time::{self, Ticks};

// =======================================================================
// Tracking Frame
// =======================================================================

/// A frame plus the sorting bookkeeping that travels with it.
pub struct TrackingFrame {
    frame: Arc<Frame>,
    downsampler: Downsampler,
    /// Most recent measurement assigned to this frame.
    last_sorted: Mutex<Option<Measurement>>,
}

impl TrackingFrame {
    pub(crate) fn new(frame: Frame, method: DownsamplingMethod) -> Self {
        Self {
            frame: Arc::new(frame),
            downsampler: Downsampler::new(method),
            last_sorted: Mutex::new(None),
        }
    }

    /// The underlying frame.
    #[inline]
    pub fn frame(&self) -> &Arc<Frame> {
        &self.frame
    }

    /// Bucket timestamp in ticks.
    #[inline]
    pub fn timestamp(&self) -> Ticks {
        self.frame.timestamp()
    }

    /// Run the downsampling decision for an incoming measurement.
    pub(crate) fn derive(&self, measurement: Measurement) -> Option<Measurement> {
        self.downsampler.derive(&self.frame, measurement)
    }

    /// Apply the publish-time filter pass (filtered downsampling only).
    pub(crate) fn finalize(&self, filter: &FilterFn) {
        self.downsampler.finalize(&self.frame, filter);
    }

    pub(crate) fn set_last_sorted(&self, measurement: Measurement) {
        *self.last_sorted.lock() = Some(measurement);
    }

    /// Most recent measurement assigned to this frame, if any.
    pub fn last_sorted(&self) -> Option<Measurement> {
        self.last_sorted.lock().clone()
    }

    /// Same-key collisions resolved while sorting into this frame.
    pub fn downsampled_count(&self) -> u64 {
        self.downsampler.downsampled_count()
    }
}

impl std::fmt::Debug for TrackingFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingFrame")
            .field("timestamp", &self.timestamp())
            .field("downsampled", &self.downsampled_count())
            .finish()
    }
}

// =======================================================================
// Frame Queue
// =======================================================================

/// Ordered bucket table of in-flight frames.
pub struct FrameQueue {
    /// Bucket width in ticks; 0 or 1 means no quantization.
    time_resolution: i64,
    downsampling: DownsamplingMethod,
    factory: FrameFactory,
    /// Buckets sorted ascending by timestamp.
    frames: Mutex<VecDeque<Arc<TrackingFrame>>>,
}

impl FrameQueue {
    pub(crate) fn new(
        time_resolution: i64,
        downsampling: DownsamplingMethod,
        factory: FrameFactory,
    ) -> Self {
        Self {
            time_resolution,
            downsampling,
            factory,
            frames: Mutex::new(VecDeque::new()),
        }
    }

    /// Look up or create the bucket responsible for a timestamp.
    ///
    /// The timestamp is rounded to the nearest resolution multiple
    /// first, so jitter below half the resolution lands in one bucket.
    pub fn get_frame(&self, timestamp: Ticks) -> Arc<TrackingFrame> {
        let destination = time::quantize(timestamp, self.time_resolution);
        let mut frames = self.frames.lock();

        // Most traffic targets the newest bucket.
        if let Some(newest) = frames.back() {
            if newest.timestamp() == destination {
                return Arc::clone(newest);
            }
        }

        match frames.binary_search_by_key(&destination, |f| f.timestamp()) {
            Ok(index) => Arc::clone(&frames[index]),
            Err(index) => {
                let frame = Arc::new(TrackingFrame::new(
                    (self.factory)(destination),
                    self.downsampling,
                ));
                frames.insert(index, Arc::clone(&frame));
                frame
            }
        }
    }

    /// Oldest bucket, left in place.
    pub fn head(&self) -> Option<Arc<TrackingFrame>> {
        self.frames.lock().front().cloned()
    }

    /// Remove and return the oldest bucket.
    pub fn pop(&self) -> Option<Arc<TrackingFrame>> {
        self.frames.lock().pop_front()
    }

    /// Number of buckets currently buffered.
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Drop every buffered bucket.
    pub fn clear(&self) {
        self.frames.lock().clear();
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("len", &self.len())
            .field("time_resolution", &self.time_resolution)
            .field("downsampling", &self.downsampling)
            .finish()
    }
}
