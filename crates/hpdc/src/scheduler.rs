// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame-rate scheduling: shared per-rate timers with an exact
//! millisecond schedule.
//!
//! Whole-millisecond periods rarely divide one second evenly, so each
//! frame rate gets a per-index period table that distributes the
//! remainder across the second. Every full cycle sums to exactly
//! 1000 ms, keeping frame boundaries locked to wall-clock second
//! boundaries over time.
//!
//! # Architecture
//!
//! ```text
//! TimerRegistry
//! +-- timers: Mutex<HashMap<u16 fps, TimerEntry>>
//!       +-- TimerEntry { timer: Arc<FrameRateTimer>, refs: usize }
//!
//! FrameRateTimer (one thread per active rate, "hpdc-timer-{fps}")
//! +-- period table from tick_periods()
//! +-- absolute deadlines (no drift accumulation)
//! +-- callbacks: Mutex<Vec<(id, Arc<dyn Fn()>)>>
//!
//! TimerHandle (returned by acquire)
//! +-- Drop -> unregister callback, decref, last one stops the thread
//! ```
//!
//! All consumers at the same rate share one timer thread, so their
//! publication cycles fire in phase with each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::MAX_FRAMES_PER_SECOND;
use crate::error::{Error, Result};

/// Shared tick callback invoked on the timer thread.
pub type TickCallback = Arc<dyn Fn() + Send + Sync>;

/// Resync threshold: a timer this far behind schedule restarts its
/// deadline base instead of firing a catch-up burst.
const RESYNC_THRESHOLD: Duration = Duration::from_secs(1);

// =======================================================================
// Period Table
// =======================================================================

/// Per-frame wait periods (milliseconds) for one full second at the
/// given rate.
///
/// The base period is `round(1000 / fps)`; the leftover milliseconds
/// (positive or negative) are spread across the cycle at evenly spaced
/// indices so no two adjusted frames are adjacent when avoidable. The
/// returned periods always sum to exactly 1000.
///
/// # Example
///
/// ```
/// use hpdc::scheduler::tick_periods;
///
/// // 30 fps: base 33 ms leaves 10 ms to distribute.
/// let periods = tick_periods(30);
/// assert_eq!(periods.iter().sum::<u64>(), 1000);
/// assert_eq!(periods.iter().filter(|&&p| p == 34).count(), 10);
/// ```
#[must_use]
pub fn tick_periods(frames_per_second: u16) -> Vec<u64> {
    let fps = i64::from(frames_per_second);
    let base = (1000.0 / fps as f64).round() as i64;
    let deficit = 1000 - base * fps;

    (0..fps)
        .map(|index| {
            let adjusted = if deficit == 0 || index == 0 {
                base
            } else if index == fps - 1 {
                base + deficit.signum()
            } else {
                // Spread the remaining corrections at interval-spaced
                // indices: adjust where this index is a local minimum of
                // the distance to the nearest interval boundary.
                let interval = fps as f64 / deficit.abs() as f64;
                let prev = interval_distance(index - 1, interval);
                let cur = interval_distance(index, interval);
                let next = interval_distance(index + 1, interval);
                if cur <= prev && cur < next {
                    base + deficit.signum()
                } else {
                    base
                }
            };
            adjusted as u64
        })
        .collect()
}

/// Distance from a frame index to the nearest interval boundary.
fn interval_distance(index: i64, interval: f64) -> f64 {
    let above = ((index + 1) as f64) % interval;
    let below = interval - above;
    below.min(above)
}

// =======================================================================
// Frame-Rate Timer
// =======================================================================

struct TimerShared {
    /// Cleared to stop the timer thread.
    running: AtomicBool,
    /// Guards the stop flag for the interruptible deadline wait.
    stopped: Mutex<bool>,
    condvar: Condvar,
    /// Registered tick callbacks, snapshot-cloned before each fire.
    callbacks: Mutex<Vec<(u64, TickCallback)>>,
}

/// Dedicated timer thread firing at one frame rate.
///
/// Ticks are scheduled against absolute deadlines so jitter in one
/// period never accumulates into the next. A timer that falls more
/// than [`RESYNC_THRESHOLD`] behind (system suspend, debugger pause)
/// rebases instead of replaying missed ticks.
pub struct FrameRateTimer {
    frames_per_second: u16,
    shared: Arc<TimerShared>,
    next_callback_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl FrameRateTimer {
    /// Spawn the timer thread for a frame rate.
    pub fn new(frames_per_second: u16) -> Result<Self> {
        if frames_per_second == 0 || frames_per_second > MAX_FRAMES_PER_SECOND {
            return Err(Error::InvalidFramesPerSecond(frames_per_second));
        }

        let shared = Arc::new(TimerShared {
            running: AtomicBool::new(true),
            stopped: Mutex::new(false),
            condvar: Condvar::new(),
            callbacks: Mutex::new(Vec::new()),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("hpdc-timer-{frames_per_second}"))
            .spawn(move || {
                timer_loop(&thread_shared, frames_per_second);
            })
            .map_err(|e| Error::SchedulerFailed(format!("failed to spawn timer thread: {e}")))?;

        log::debug!("[Scheduler] Started timer thread at {frames_per_second} fps");

        Ok(Self {
            frames_per_second,
            shared,
            next_callback_id: AtomicU64::new(1),
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Rate this timer fires at.
    #[inline]
    #[must_use]
    pub fn frames_per_second(&self) -> u16 {
        self.frames_per_second
    }

    /// Register a tick callback, returning its removal id.
    pub fn add_callback(&self, callback: TickCallback) -> u64 {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.shared.callbacks.lock().push((id, callback));
        id
    }

    /// Remove a previously registered callback.
    pub fn remove_callback(&self, id: u64) -> bool {
        let mut callbacks = self.shared.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id);
        callbacks.len() != before
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.shared.callbacks.lock().len()
    }

    /// Stop the timer thread and wait for it to exit.
    ///
    /// Safe to call more than once.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        {
            let mut stopped = self.shared.stopped.lock();
            *stopped = true;
            self.shared.condvar.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                log::error!(
                    "[Scheduler] Timer thread at {} fps panicked",
                    self.frames_per_second
                );
            }
        }
    }
}

impl Drop for FrameRateTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for FrameRateTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRateTimer")
            .field("frames_per_second", &self.frames_per_second)
            .field("callbacks", &self.callback_count())
            .finish()
    }
}

fn timer_loop(shared: &TimerShared, frames_per_second: u16) {
    let periods = tick_periods(frames_per_second);
    let mut frame_index = 0usize;
    let mut deadline = Instant::now() + Duration::from_millis(periods[frame_index]);

    while shared.running.load(Ordering::Acquire) {
        // Interruptible absolute-deadline wait.
        {
            let mut stopped = shared.stopped.lock();
            while !*stopped {
                if shared.condvar.wait_until(&mut stopped, deadline).timed_out() {
                    break;
                }
            }
            if *stopped {
                return;
            }
        }

        let now = Instant::now();
        if now.saturating_duration_since(deadline) > RESYNC_THRESHOLD {
            log::warn!(
                "[Scheduler] Timer at {frames_per_second} fps fell {:?} behind, resyncing",
                now - deadline
            );
            deadline = now;
        }

        let snapshot: Vec<TickCallback> = shared
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in snapshot {
            callback();
        }

        frame_index = (frame_index + 1) % periods.len();
        deadline += Duration::from_millis(periods[frame_index]);
    }
}

// =======================================================================
// Timer Registry
// =======================================================================

struct TimerEntry {
    timer: Arc<FrameRateTimer>,
    refs: usize,
}

/// Refcounted registry of shared frame-rate timers.
///
/// All consumers of one rate share a single timer thread. [`acquire`]
/// creates the thread on first use; dropping the last [`TimerHandle`]
/// for a rate stops and joins it.
///
/// [`acquire`]: Self::acquire
pub struct TimerRegistry {
    timers: Mutex<HashMap<u16, TimerEntry>>,
}

impl TimerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the shared timer for a frame rate and register a tick
    /// callback on it.
    ///
    /// The returned handle unregisters the callback and releases the
    /// timer reference when dropped.
    pub fn acquire(
        self: &Arc<Self>,
        frames_per_second: u16,
        callback: TickCallback,
    ) -> Result<TimerHandle> {
        let mut timers = self.timers.lock();

        if let Some(entry) = timers.get_mut(&frames_per_second) {
            entry.refs += 1;
            let callback_id = entry.timer.add_callback(callback);
            log::debug!(
                "[Scheduler] Acquired timer at {frames_per_second} fps (refs={})",
                entry.refs
            );
            return Ok(TimerHandle {
                registry: Arc::downgrade(self),
                frames_per_second,
                callback_id,
            });
        }

        let timer = Arc::new(FrameRateTimer::new(frames_per_second)?);
        let callback_id = timer.add_callback(callback);
        timers.insert(frames_per_second, TimerEntry { timer, refs: 1 });
        log::debug!("[Scheduler] Acquired timer at {frames_per_second} fps (refs=1)");

        Ok(TimerHandle {
            registry: Arc::downgrade(self),
            frames_per_second,
            callback_id,
        })
    }

    /// Release one reference on a rate's timer (called by handle drop).
    fn release(&self, frames_per_second: u16, callback_id: u64) {
        let timer_to_stop = {
            let mut timers = self.timers.lock();
            let Some(entry) = timers.get_mut(&frames_per_second) else {
                return;
            };

            entry.timer.remove_callback(callback_id);
            entry.refs -= 1;
            if entry.refs > 0 {
                log::debug!(
                    "[Scheduler] Released timer at {frames_per_second} fps (refs={})",
                    entry.refs
                );
                return;
            }

            // Last reference: take the timer out of the map, stop it
            // outside the lock (stop joins the thread).
            timers
                .remove(&frames_per_second)
                .map(|entry| entry.timer)
        };

        if let Some(timer) = timer_to_stop {
            log::debug!("[Scheduler] Stopping unused timer at {frames_per_second} fps");
            timer.stop();
        }
    }

    /// Number of rates with a live timer thread.
    #[must_use]
    pub fn active_timer_count(&self) -> usize {
        self.timers.lock().len()
    }
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("active_timers", &self.active_timer_count())
            .finish()
    }
}

/// Reference to a shared frame-rate timer.
///
/// Dropping the handle unregisters its callback; the last handle for a
/// rate stops the timer thread.
pub struct TimerHandle {
    registry: Weak<TimerRegistry>,
    frames_per_second: u16,
    callback_id: u64,
}

impl TimerHandle {
    /// Rate the underlying timer fires at.
    #[inline]
    #[must_use]
    pub fn frames_per_second(&self) -> u16 {
        self.frames_per_second
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.frames_per_second, self.callback_id);
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("frames_per_second", &self.frames_per_second)
            .finish()
    }
}

// =======================================================================
// Tests
// =======================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_periods_sum_to_one_second() {
        for fps in [1u16, 2, 3, 6, 7, 10, 12, 15, 20, 24, 30, 50, 60, 120, 240, 1000] {
            let periods = tick_periods(fps);
            assert_eq!(periods.len(), usize::from(fps));
            assert_eq!(
                periods.iter().sum::<u64>(),
                1000,
                "periods for {fps} fps must cover exactly one second"
            );
        }
    }

    #[test]
    fn test_even_rate_has_uniform_periods() {
        let periods = tick_periods(10);
        assert!(periods.iter().all(|&p| p == 100));

        let periods = tick_periods(20);
        assert!(periods.iter().all(|&p| p == 50));
    }

    #[test]
    fn test_positive_deficit_distribution() {
        // 30 fps: base 33 ms x 30 = 990 ms, so 10 frames get 34 ms.
        let periods = tick_periods(30);
        assert_eq!(periods.iter().filter(|&&p| p == 34).count(), 10);
        assert_eq!(periods.iter().filter(|&&p| p == 33).count(), 20);
        assert_eq!(periods[0], 33);
    }

    #[test]
    fn test_negative_deficit_distribution() {
        // 60 fps: base 17 ms x 60 = 1020 ms, so 20 frames drop to 16 ms.
        let periods = tick_periods(60);
        assert_eq!(periods.iter().filter(|&&p| p == 16).count(), 20);
        assert_eq!(periods.iter().filter(|&&p| p == 17).count(), 40);
        assert_eq!(periods[0], 17);
    }

    #[test]
    fn test_odd_rate_distribution() {
        // 7 fps: base 143 ms x 7 = 1001 ms, so exactly one frame drops to 142.
        let periods = tick_periods(7);
        assert_eq!(periods.iter().filter(|&&p| p == 142).count(), 1);
        assert_eq!(periods.iter().filter(|&&p| p == 143).count(), 6);
    }

    #[test]
    fn test_timer_rejects_invalid_rate() {
        assert!(matches!(
            FrameRateTimer::new(0),
            Err(Error::InvalidFramesPerSecond(0))
        ));
        assert!(matches!(
            FrameRateTimer::new(1001),
            Err(Error::InvalidFramesPerSecond(1001))
        ));
    }

    #[test]
    fn test_timer_fires_at_rate() {
        let timer = FrameRateTimer::new(50).expect("Failed to create timer");
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_cb = Arc::clone(&ticks);
        timer.add_callback(Arc::new(move || {
            ticks_cb.fetch_add(1, Ordering::Relaxed);
        }));

        thread::sleep(Duration::from_millis(500));
        timer.stop();

        // ~25 ticks expected at 50 fps over 500 ms; generous bounds for
        // loaded CI machines.
        let count = ticks.load(Ordering::Relaxed);
        assert!(count >= 10, "expected at least 10 ticks, got {count}");
        assert!(count <= 40, "expected at most 40 ticks, got {count}");
    }

    #[test]
    fn test_callback_add_remove() {
        let timer = FrameRateTimer::new(30).expect("Failed to create timer");
        let id1 = timer.add_callback(Arc::new(|| {}));
        let id2 = timer.add_callback(Arc::new(|| {}));
        assert_eq!(timer.callback_count(), 2);
        assert_ne!(id1, id2);

        assert!(timer.remove_callback(id1));
        assert_eq!(timer.callback_count(), 1);
        assert!(!timer.remove_callback(id1));
        assert!(timer.remove_callback(id2));
        assert_eq!(timer.callback_count(), 0);
    }

    #[test]
    fn test_timer_stop_is_idempotent() {
        let timer = FrameRateTimer::new(30).expect("Failed to create timer");
        timer.stop();
        timer.stop();
    }

    #[test]
    fn test_registry_shares_timer_per_rate() {
        let registry = Arc::new(TimerRegistry::new());

        let h1 = registry
            .acquire(30, Arc::new(|| {}))
            .expect("Failed to acquire timer");
        let h2 = registry
            .acquire(30, Arc::new(|| {}))
            .expect("Failed to acquire timer");
        assert_eq!(registry.active_timer_count(), 1);

        drop(h1);
        assert_eq!(registry.active_timer_count(), 1);

        drop(h2);
        assert_eq!(registry.active_timer_count(), 0);
    }

    #[test]
    fn test_registry_distinct_rates() {
        let registry = Arc::new(TimerRegistry::new());

        let h30 = registry
            .acquire(30, Arc::new(|| {}))
            .expect("Failed to acquire timer");
        let h60 = registry
            .acquire(60, Arc::new(|| {}))
            .expect("Failed to acquire timer");
        assert_eq!(registry.active_timer_count(), 2);
        assert_eq!(h30.frames_per_second(), 30);
        assert_eq!(h60.frames_per_second(), 60);

        drop(h30);
        drop(h60);
        assert_eq!(registry.active_timer_count(), 0);
    }

    #[test]
    fn test_registry_rejects_invalid_rate() {
        let registry = Arc::new(TimerRegistry::new());
        assert!(registry.acquire(0, Arc::new(|| {})).is_err());
        assert_eq!(registry.active_timer_count(), 0);
    }

    #[test]
    fn test_shared_timer_drives_all_callbacks() {
        let registry = Arc::new(TimerRegistry::new());
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        let a_cb = Arc::clone(&a);
        let _h1 = registry
            .acquire(100, Arc::new(move || {
                a_cb.fetch_add(1, Ordering::Relaxed);
            }))
            .expect("Failed to acquire timer");
        let b_cb = Arc::clone(&b);
        let _h2 = registry
            .acquire(100, Arc::new(move || {
                b_cb.fetch_add(1, Ordering::Relaxed);
            }))
            .expect("Failed to acquire timer");

        thread::sleep(Duration::from_millis(200));

        assert!(a.load(Ordering::Relaxed) > 0, "first callback should fire");
        assert!(b.load(Ordering::Relaxed) > 0, "second callback should fire");
    }
}
