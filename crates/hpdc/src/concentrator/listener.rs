// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Observer surface for concentration events.
//!
//! The concentrator reports progress, recoverable errors, discarded
//! measurement batches and queue backlog through this trait rather than
//! through return values: sorting and publication never fail outward,
//! they only notify.

use crate::core::measurement::Measurement;
use crate::error::Error;

/// Receives concentration lifecycle and diagnostic events.
///
/// Every method has a no-op default, so implementors subscribe only to
/// what they care about. Callbacks run on concentrator threads (sorting
/// producers, the publication worker, the backlog monitor) and must not
/// block.
pub trait ConcentratorListener: Send + Sync {
    /// Human-readable progress or state-change message.
    fn on_status_message(&self, _message: &str) {}

    /// Recoverable error, typically a failed frame publication.
    fn on_process_exception(&self, _error: &Error) {}

    /// Batch of measurements dropped during sorting, with the reason
    /// already counted in statistics.
    fn on_discarding_measurements(&self, _discarded: &[Measurement]) {}

    /// Whole seconds of data sitting unpublished in the queue, sampled
    /// once per second. Zero is normal; growth means the consumer or
    /// clock has a problem.
    fn on_unpublished_samples(&self, _seconds: usize) {}
}

/// Routes concentration events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogListener;

impl ConcentratorListener for LogListener {
    fn on_status_message(&self, message: &str) {
        log::info!("[Concentrator] {message}");
    }

    fn on_process_exception(&self, error: &Error) {
        log::error!("[Concentrator] {error}");
    }

    fn on_discarding_measurements(&self, discarded: &[Measurement]) {
        log::debug!("[Concentrator] Discarding {} measurements", discarded.len());
    }

    fn on_unpublished_samples(&self, seconds: usize) {
        if seconds > 0 {
            log::warn!("[Concentrator] {seconds}s of data awaiting publication");
        }
    }
}
