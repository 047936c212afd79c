// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tick-based time arithmetic.
//!
//! All timestamps in the concentrator are expressed in ticks: 100-nanosecond
//! intervals since the Unix epoch. Ticks give sub-microsecond resolution in a
//! plain `i64`, cheap to compare and to store in atomics, which matters because
//! the real-time reference clock is updated with compare-and-swap from many
//! producer threads at once.

use std::time::{SystemTime, UNIX_EPOCH};

/// Timestamp or duration in 100-nanosecond intervals.
pub type Ticks = i64;

/// Ticks per second.
pub const TICKS_PER_SECOND: Ticks = 10_000_000;

/// Ticks per millisecond.
pub const TICKS_PER_MILLISECOND: Ticks = 10_000;

/// Current wall-clock time in ticks since the Unix epoch.
pub fn now_ticks() -> Ticks {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => {
            elapsed.as_secs() as i64 * TICKS_PER_SECOND + elapsed.subsec_nanos() as i64 / 100
        }
        // Clock before the epoch; treat as epoch rather than going negative.
        Err(_) => 0,
    }
}

/// Convert ticks to fractional seconds.
#[inline]
pub fn to_seconds(ticks: Ticks) -> f64 {
    ticks as f64 / TICKS_PER_SECOND as f64
}

/// Convert fractional seconds to ticks.
#[inline]
pub fn from_seconds(seconds: f64) -> Ticks {
    (seconds * TICKS_PER_SECOND as f64) as Ticks
}

/// Convert whole milliseconds to ticks.
#[inline]
pub fn from_millis(millis: i64) -> Ticks {
    millis * TICKS_PER_MILLISECOND
}

/// Quantize a timestamp to the nearest multiple of `resolution` ticks.
///
/// Adds half the resolution before truncating, so the result rounds to the
/// nearest bucket rather than always flooring. A resolution of zero or one
/// leaves the timestamp untouched.
#[inline]
pub fn quantize(timestamp: Ticks, resolution: Ticks) -> Ticks {
    if resolution <= 1 {
        return timestamp;
    }
    (timestamp + resolution / 2) / resolution * resolution
}

/// Ticks elapsed past the most recent whole second of `timestamp`.
#[inline]
pub fn subsecond(timestamp: Ticks) -> Ticks {
    timestamp.rem_euclid(TICKS_PER_SECOND)
}

/// Check that `timestamp` lies within `[reference - lag, reference + lead]`
/// seconds of a reference time.
#[inline]
pub fn time_is_valid(timestamp: Ticks, reference: Ticks, lag_time: f64, lead_time: f64) -> bool {
    let distance = to_seconds(reference - timestamp);
    distance <= lag_time && distance >= -lead_time
}
