// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Core data model: tick-based time, measurements and time-aligned frames.

pub mod frame;
pub mod measurement;
pub mod time;

pub use frame::Frame;
pub use measurement::{Measurement, MeasurementKey};
pub use time::Ticks;
