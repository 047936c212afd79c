// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HPDC - High-Performance Phasor Data Concentrator
//!
//! A pure Rust measurement concentrator for synchrophasor and other
//! high-rate timestamped data: measurements arriving out of order from
//! many devices are sorted into fixed-rate frames, published exactly
//! once at a precise cadence, and streamed to TCP subscribers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hpdc::{
//!     Concentrator, ConcentratorConfig, Frame, FrameSink, Measurement, MeasurementKey,
//!     Result, TimerRegistry,
//! };
//!
//! struct Printer;
//!
//! impl FrameSink for Printer {
//!     fn publish(&self, frame: &Frame, frame_index: u16) -> Result<()> {
//!         println!(
//!             "frame {} @ {} ({} measurements)",
//!             frame_index,
//!             frame.timestamp(),
//!             frame.measurements().len()
//!         );
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let config = ConcentratorConfig {
//!         frames_per_second: 30,
//!         ..ConcentratorConfig::default()
//!     };
//!     let concentrator =
//!         Concentrator::new(config, Arc::new(TimerRegistry::new()), Arc::new(Printer))?;
//!     concentrator.start()?;
//!
//!     let key = MeasurementKey::new("SHELBY", 1);
//!     concentrator.sort_measurements(&[Measurement::new(key, hpdc::time::now_ticks(), 59.98)]);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                      Publication Layer                       |
//! |   DataPublisher -> ClientSubscription -> wire packets        |
//! +--------------------------------------------------------------+
//! |                     Concentration Layer                      |
//! |   sort_measurements | FrameQueue | publication worker        |
//! +--------------------------------------------------------------+
//! |                      Scheduling Layer                        |
//! |   TimerRegistry | shared FrameRateTimer per frame rate       |
//! +--------------------------------------------------------------+
//! |                      Transport Layer                         |
//! |   mio TCP server | length-prefixed packet framing            |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Concentrator`] | Sorts measurements into frames and publishes them on time |
//! | [`DataPublisher`] | TCP server distributing feeds to subscribers |
//! | [`Measurement`] | One timestamped value from one source signal |
//! | [`Frame`] | The set of measurements belonging to one publication instant |
//! | [`TimerRegistry`] | Shares one precise timer across same-rate concentrators |
//!
//! ## Modules Overview
//!
//! - [`concentrator`] - Sorting engine and frame publication (start here)
//! - [`publisher`] - Subscription management and the wire protocol
//! - [`scheduler`] - Precise frame-rate timers
//! - [`transport`] - Non-blocking TCP server and packet codec

/// Concentration engine: measurement sorting, frame queue, publication
/// and monitor workers, downsampling, latest-value tracking.
pub mod concentrator;
/// Configuration for concentration and publishing.
pub mod config;
/// Core data types: measurements, frames and tick arithmetic.
pub mod core;
/// Error type shared by every fallible operation in the crate.
pub mod error;
/// TCP publication: subscriptions, authentication, wire encoding.
pub mod publisher;
/// Shared frame-rate timers with sub-frame alignment.
pub mod scheduler;
/// Non-blocking TCP server and length-prefixed packet framing.
pub mod transport;

pub use concentrator::{
    Concentrator, ConcentratorListener, FrameSink, LatestMeasurementCache, LogListener,
    StatsSnapshot,
};
pub use config::{ConcentratorConfig, DownsamplingMethod, PublisherConfig};
pub use core::frame::Frame;
pub use core::measurement::{Measurement, MeasurementKey};
pub use core::time::{self, Ticks};
pub use error::{Error, Result};
pub use publisher::{DataPublisher, SubscribeRequest};
pub use scheduler::{FrameRateTimer, TimerHandle, TimerRegistry};
pub use transport::{ServerMetrics, ServerMetricsSnapshot};

/// HPDC version string.
pub const VERSION: &str = "0.3.2";
