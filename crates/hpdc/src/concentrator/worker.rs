// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Concentrator worker threads.
//!
//! The publication worker drains due frames to the sink; the monitor
//! thread samples queue backlog once per second. Both park on a
//! [`WakeSignal`](super::wake::WakeSignal) with a guard timeout, so a
//! lost wakeup costs at most one timeout period, never a stall.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::config::MONITOR_INTERVAL_MS;
use crate::core::time::{self, Ticks};

use super::SharedState;

/// Guard timeout for the publication wait. Ticks normally arrive far
/// more often than this; the timeout only covers a missed notify.
const PUBLICATION_WAIT_TIMEOUT: Duration = Duration::from_millis(100);

// =======================================================================
// Publication
// =======================================================================

/// Body of the "hpdc-publish" thread.
pub(crate) fn run_publication_loop(shared: &SharedState) {
    raise_thread_priority();
    log::debug!("[Concentrator] Publication thread running");

    while shared.enabled.load(Ordering::Acquire) {
        publish_due_frames(shared);
        shared.signal.wait_timeout(PUBLICATION_WAIT_TIMEOUT);
    }

    log::debug!("[Concentrator] Publication thread exiting");
}

/// Publish every frame at the head of the queue whose lag window has
/// expired, oldest first.
///
/// A sink error stops the drain for this pass; the failed frame is
/// still consumed (publication is at-most-once, never retried).
pub(crate) fn publish_due_frames(shared: &SharedState) {
    let preemptive = shared.config.preemptive_enabled();
    let expected = shared.config.expected_measurements;

    while shared.enabled.load(Ordering::Acquire) {
        let Some(tracking) = shared.queue.head() else {
            break;
        };
        let frame = tracking.frame();

        let due_in = shared.lag_ticks - (shared.clock.real_time() - frame.timestamp());
        if due_in > 0 {
            // Inside the lag window. Preemptive mode may still release
            // the frame once every expected measurement has arrived.
            if !(preemptive && frame.sorted_count() >= expected) {
                break;
            }
            shared.stats.add_frame_ahead_of_schedule();
        }

        // Seal first: sorts racing this point miss the frame rather
        // than landing in an already-delivered snapshot.
        frame.mark_published();
        tracking.finalize(&shared.filter);

        let index = frame_index(frame.timestamp(), shared.ticks_per_frame, shared.time_offset);
        let started = Instant::now();
        let result = shared.sink.publish(frame, index);
        let publish_ticks = (started.elapsed().as_nanos() / 100) as Ticks;

        // The frame is spent whether the sink liked it or not.
        shared.queue.pop();
        shared.stats.add_published_frame(frame.sorted_count() as u64);
        shared.stats.add_downsampled(tracking.downsampled_count());
        shared.stats.add_publish_time(publish_ticks);

        if let Err(e) = result {
            log::error!("[Concentrator] Frame publication failed: {e}");
            shared.notify_process_exception(&e);
            break;
        }
    }
}

/// Slot of `timestamp` within its second at the configured frame rate.
///
/// The offset recenters bucket timestamps that quantization pulled
/// slightly before their nominal frame instant.
pub(crate) fn frame_index(timestamp: Ticks, ticks_per_frame: f64, time_offset: f64) -> u16 {
    let subsecond = time::subsecond(timestamp) as f64;
    ((subsecond + time_offset) / ticks_per_frame) as u16
}

// =======================================================================
// Backlog Monitor
// =======================================================================

/// Body of the "hpdc-monitor" thread.
///
/// Reports whole seconds of unpublished data once per interval; zero
/// is reported too so listeners can clear a previous alarm.
pub(crate) fn run_monitor_loop(shared: &SharedState) {
    let interval = Duration::from_millis(MONITOR_INTERVAL_MS);
    let frames_per_second = usize::from(shared.config.frames_per_second);

    while shared.enabled.load(Ordering::Acquire) {
        if shared.monitor_signal.wait_timeout(interval) {
            // Woken explicitly, which only shutdown does.
            continue;
        }
        shared.notify_unpublished_samples(backlog_seconds(
            shared.queue.len(),
            frames_per_second,
        ));
    }
}

/// Whole seconds of queued data beyond the second currently filling.
pub(crate) fn backlog_seconds(queued_frames: usize, frames_per_second: usize) -> usize {
    (queued_frames / frames_per_second).saturating_sub(1)
}

// =======================================================================
// Thread Priority
// =======================================================================

/// Ask for real-time scheduling so publication cadence survives load.
///
/// Needs CAP_SYS_NICE (or root); refusal is normal on dev boxes and the
/// thread simply keeps the default policy.
#[cfg(target_os = "linux")]
fn raise_thread_priority() {
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = 10;
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc != 0 {
        log::debug!(
            "[Concentrator] Real-time scheduling unavailable (errno {rc}), keeping default priority"
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn raise_thread_priority() {}

// =======================================================================
// Tests
// =======================================================================
