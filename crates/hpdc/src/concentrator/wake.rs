// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wake signalling for the publication worker.
//!
//! The worker sleeps between publication opportunities; the frame-rate
//! timer and the sorting path wake it. Signals coalesce: any number of
//! notifies before the worker wakes collapse into one pass over the
//! queue, which is correct because the worker always drains every
//! publishable frame per pass.
//!
//! Two-tier design: an atomic flag serves the common already-signalled
//! case without a lock; the condvar only engages when the worker is
//! actually asleep.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Coalescing wake signal for a single sleeping worker.
#[derive(Debug, Default)]
pub struct WakeSignal {
    /// Set by notify, consumed by wait.
    pending: AtomicBool,
    /// True while the worker is blocked on the condvar.
    sleeping: Mutex<bool>,
    condvar: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            sleeping: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Signal the worker that frames may be ready.
    ///
    /// Lock-free unless the worker is asleep. The sleeping check is
    /// racy; the worst case is one spurious condvar signal.
    #[inline]
    pub fn notify(&self) {
        self.pending.store(true, Ordering::Release);
        if *self.sleeping.lock() {
            self.condvar.notify_one();
        }
    }

    /// Block until notified or the timeout elapses.
    ///
    /// Returns immediately when a notify is already pending. The
    /// pending flag is consumed either way, so the caller must scan the
    /// queue after every return.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.pending.swap(false, Ordering::Acquire) {
            return true;
        }

        let mut sleeping = self.sleeping.lock();

        // A notify may have landed between the check above and taking
        // the lock.
        if self.pending.swap(false, Ordering::Acquire) {
            return true;
        }

        *sleeping = true;
        let result = self.condvar.wait_for(&mut sleeping, timeout);
        *sleeping = false;

        // A notify that lands as the timeout expires still counts.
        self.pending.swap(false, Ordering::Acquire) || !result.timed_out()
    }
}
