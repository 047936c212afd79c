// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HPDC Global Configuration - Single Source of Truth
//!
//! This module centralizes concentration constants and runtime configuration.
//! **NEVER hardcode elsewhere!**
//!
//! Two levels:
//!
//! - **Level 1 (Static)**: Compile-time defaults and bounds (frame rates,
//!   tolerance windows, time resolution)
//! - **Level 2 (Dynamic)**: [`ConcentratorConfig`] / [`PublisherConfig`]
//!   validated at start-up, immutable afterwards

use crate::error::{Error, Result};

// =======================================================================
// Concentration Defaults
// =======================================================================

/// Default frame rate (frames per second)
///
/// 30 fps is the common reporting rate for 60 Hz power systems
/// (IEEE C37.118 supports 10/12/15/20/30/60 on 60 Hz systems).
pub const DEFAULT_FRAMES_PER_SECOND: u16 = 30;

/// Default lag time (seconds)
///
/// Past-tolerance window: how long a frame waits for slow measurements
/// before it must publish.
pub const DEFAULT_LAG_TIME: f64 = 3.0;

/// Default lead time (seconds)
///
/// Future-tolerance window: how far ahead of real time a measurement
/// timestamp (or a clock source) may be and still be believed.
pub const DEFAULT_LEAD_TIME: f64 = 1.0;

/// Default destination timestamp resolution (ticks)
///
/// 10,000 ticks = 1 ms. Source timestamps are rounded to this resolution
/// before bucket assignment, so sub-millisecond jitter between devices
/// lands in the same frame.
pub const DEFAULT_TIME_RESOLUTION: i64 = 10_000;

/// Maximum supported frame rate (frames per second)
///
/// Above 1000 fps the per-frame millisecond schedule degenerates
/// (sub-millisecond periods round to zero).
pub const MAX_FRAMES_PER_SECOND: u16 = 1000;

/// Backlog monitor period (milliseconds)
///
/// The queue backlog is sampled once per second and reported in whole
/// seconds of unpublished data.
pub const MONITOR_INTERVAL_MS: u64 = 1_000;

// =======================================================================
// Downsampling
// =======================================================================

/// Strategy applied when several measurements for one key land in the
/// same destination frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownsamplingMethod {
    /// Keep whichever measurement arrived last (cheapest, no comparison).
    #[default]
    LastReceived,
    /// Keep the measurement whose timestamp is closest to the frame
    /// timestamp.
    Closest,
    /// Collect candidates and combine them with a filter function at
    /// publication time.
    Filtered,
}

impl std::fmt::Display for DownsamplingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LastReceived => write!(f, "LastReceived"),
            Self::Closest => write!(f, "Closest"),
            Self::Filtered => write!(f, "Filtered"),
        }
    }
}

// =======================================================================
// Concentrator Configuration
// =======================================================================

/// Validated concentration parameters.
///
/// Built with struct-update syntax from [`ConcentratorConfig::default()`],
/// then checked once with [`validate`](Self::validate) when the
/// concentrator starts. Immutable while running: changing the frame rate
/// or tolerance windows requires a stop/start cycle.
///
/// # Example
///
/// ```
/// use hpdc::config::ConcentratorConfig;
///
/// let config = ConcentratorConfig {
///     frames_per_second: 60,
///     lag_time: 0.5,
///     lead_time: 0.5,
///     ..ConcentratorConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ConcentratorConfig {
    /// Frames published per second (1..=1000).
    pub frames_per_second: u16,
    /// Past-tolerance window in seconds (> 0). Sub-second values allowed.
    pub lag_time: f64,
    /// Future-tolerance window in seconds (> 0). Sub-second values allowed.
    pub lead_time: f64,
    /// Destination timestamp rounding, in ticks (>= 0). 0 or 1 disables
    /// rounding.
    pub time_resolution: i64,
    /// Same-key collision strategy within one frame.
    pub downsampling: DownsamplingMethod,
    /// Expected measurements per frame. 0 means unknown, which disables
    /// preemptive publishing.
    pub expected_measurements: usize,
    /// Publish a frame as soon as it holds `expected_measurements`
    /// sorted values instead of waiting out the lag window.
    pub allow_preemptive_publishing: bool,
    /// Use timestamps as-is even when flagged bad. Supersedes
    /// `allow_sorts_by_arrival`.
    pub ignore_bad_timestamps: bool,
    /// Re-stamp bad-timestamp measurements with real time and sort them
    /// by arrival. When false, bad timestamps are discarded.
    pub allow_sorts_by_arrival: bool,
    /// Trust the local system clock instead of tracking real time from
    /// incoming measurement timestamps.
    pub use_local_clock: bool,
    /// Maintain a latest-value table updated on every sort.
    pub track_latest_measurements: bool,
}

impl Default for ConcentratorConfig {
    fn default() -> Self {
        Self {
            frames_per_second: DEFAULT_FRAMES_PER_SECOND,
            lag_time: DEFAULT_LAG_TIME,
            lead_time: DEFAULT_LEAD_TIME,
            time_resolution: DEFAULT_TIME_RESOLUTION,
            downsampling: DownsamplingMethod::default(),
            expected_measurements: 0,
            allow_preemptive_publishing: true,
            ignore_bad_timestamps: false,
            allow_sorts_by_arrival: true,
            use_local_clock: false,
            track_latest_measurements: false,
        }
    }
}

impl ConcentratorConfig {
    /// Check every parameter against its legal range.
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.frames_per_second == 0 || self.frames_per_second > MAX_FRAMES_PER_SECOND {
            return Err(Error::InvalidFramesPerSecond(self.frames_per_second));
        }
        if self.lag_time.is_nan() || self.lag_time <= 0.0 {
            return Err(Error::InvalidLagTime(self.lag_time));
        }
        if self.lead_time.is_nan() || self.lead_time <= 0.0 {
            return Err(Error::InvalidLeadTime(self.lead_time));
        }
        if self.time_resolution < 0 {
            return Err(Error::InvalidTimeResolution(self.time_resolution));
        }
        Ok(())
    }

    /// Ticks spanned by one frame at the configured rate.
    #[inline]
    #[must_use]
    pub fn ticks_per_frame(&self) -> f64 {
        crate::core::time::TICKS_PER_SECOND as f64 / f64::from(self.frames_per_second)
    }

    /// Lag window in ticks.
    #[inline]
    #[must_use]
    pub fn lag_ticks(&self) -> i64 {
        crate::core::time::from_seconds(self.lag_time)
    }

    /// Whether preemptive publishing is effectively enabled.
    ///
    /// Requires both the flag and a known expected-measurement count.
    #[inline]
    #[must_use]
    pub fn preemptive_enabled(&self) -> bool {
        self.allow_preemptive_publishing && self.expected_measurements > 0
    }
}

// =======================================================================
// Publisher Configuration
// =======================================================================

/// Default TCP listen port for the data publisher.
///
/// Chosen from the IANA dynamic range; no registration exists for this
/// protocol.
pub const DEFAULT_PUBLISHER_PORT: u16 = 6165;

/// Cap on buffered latest-value measurements per throttled subscriber.
pub const DEFAULT_LATEST_FLUSH_LIMIT: usize = 1_000;

/// Data publisher parameters.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// TCP listen address, e.g. `"0.0.0.0:6165"`.
    pub listen_addr: String,
    /// Shared secret every subscriber must present (encrypted) at
    /// subscribe time.
    pub shared_secret: String,
    /// Cap on buffered measurements for latest-value subscribers.
    pub latest_flush_limit: usize,
    /// Base concentration settings for synchronized subscriptions;
    /// subscribers may override rate and tolerances per connection.
    pub concentration: ConcentratorConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{DEFAULT_PUBLISHER_PORT}"),
            shared_secret: String::new(),
            latest_flush_limit: DEFAULT_LATEST_FLUSH_LIMIT,
            concentration: ConcentratorConfig::default(),
        }
    }
}

// =======================================================================
// Tests
// =======================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ConcentratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames_per_second, 30);
        assert_eq!(config.downsampling, DownsamplingMethod::LastReceived);
        assert!(config.allow_sorts_by_arrival);
        assert!(!config.use_local_clock);
    }

    #[test]
    fn test_frame_rate_bounds() {
        let mut config = ConcentratorConfig::default();

        config.frames_per_second = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidFramesPerSecond(0))
        ));

        config.frames_per_second = 1001;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidFramesPerSecond(1001))
        ));

        config.frames_per_second = 1000;
        assert!(config.validate().is_ok());

        config.frames_per_second = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tolerance_windows_must_be_positive() {
        let mut config = ConcentratorConfig::default();

        config.lag_time = 0.0;
        assert!(matches!(config.validate(), Err(Error::InvalidLagTime(_))));

        config.lag_time = f64::NAN;
        assert!(matches!(config.validate(), Err(Error::InvalidLagTime(_))));

        config.lag_time = 0.001;
        config.lead_time = -1.0;
        assert!(matches!(config.validate(), Err(Error::InvalidLeadTime(_))));

        config.lead_time = 0.001;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_negative_time_resolution_rejected() {
        let config = ConcentratorConfig {
            time_resolution: -1,
            ..ConcentratorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidTimeResolution(-1))
        ));
    }

    #[test]
    fn test_ticks_per_frame() {
        let config = ConcentratorConfig {
            frames_per_second: 30,
            ..ConcentratorConfig::default()
        };
        let tpf = config.ticks_per_frame();
        assert!((tpf - 333_333.333).abs() < 1.0);
    }

    #[test]
    fn test_preemptive_requires_expected_count() {
        let mut config = ConcentratorConfig::default();
        assert!(config.allow_preemptive_publishing);
        assert!(!config.preemptive_enabled());

        config.expected_measurements = 10;
        assert!(config.preemptive_enabled());

        config.allow_preemptive_publishing = false;
        assert!(!config.preemptive_enabled());
    }

    #[test]
    fn test_downsampling_display() {
        assert_eq!(DownsamplingMethod::LastReceived.to_string(), "LastReceived");
        assert_eq!(DownsamplingMethod::Closest.to_string(), "Closest");
        assert_eq!(DownsamplingMethod::Filtered.to_string(), "Filtered");
    }
}
