// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Measurement records and their keys.
//!
//! A measurement is the unit of data flowing through the concentrator: one
//! floating-point value for one signal at one instant. Measurements are
//! immutable after creation; downsampling derives replacement instances
//! instead of mutating existing ones.

use std::sync::Arc;

use crate::core::time::Ticks;

/// Identity of a measured signal: acquisition source plus a numeric id.
///
/// The source string is shared (`Arc<str>`) because one device typically
/// contributes many signals and every measurement carries its key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MeasurementKey {
    /// Acquisition source (device or historian name).
    pub source: Arc<str>,
    /// Signal id within the source.
    pub id: u32,
}

impl MeasurementKey {
    /// Create a new key.
    pub fn new(source: impl Into<Arc<str>>, id: u32) -> Self {
        Self {
            source: source.into(),
            id,
        }
    }

    /// Parse a `SOURCE:ID` string as used in subscription filters.
    ///
    /// Returns `None` for missing separators or non-numeric ids.
    pub fn parse(text: &str) -> Option<Self> {
        let (source, id) = text.rsplit_once(':')?;
        let source = source.trim();
        if source.is_empty() {
            return None;
        }
        let id = id.trim().parse().ok()?;
        Some(Self::new(source, id))
    }
}

impl std::fmt::Display for MeasurementKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source, self.id)
    }
}

impl std::fmt::Debug for MeasurementKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MeasurementKey({}:{})", self.source, self.id)
    }
}

/// One timestamped value for one signal.
#[derive(Debug, Clone)]
pub struct Measurement {
    /// Signal identity.
    pub key: MeasurementKey,
    /// Source timestamp in ticks.
    pub timestamp: Ticks,
    /// Measured value.
    pub value: f64,
    /// Whether the source timestamp is trusted.
    pub timestamp_quality_good: bool,
    /// Whether the value itself is trusted.
    pub value_quality_good: bool,
}

impl Measurement {
    /// Create a good-quality measurement.
    pub fn new(key: MeasurementKey, timestamp: Ticks, value: f64) -> Self {
        Self {
            key,
            timestamp,
            value,
            timestamp_quality_good: true,
            value_quality_good: true,
        }
    }

    /// Derive a copy carrying a different value, preserving identity and time.
    pub fn with_value(&self, value: f64) -> Self {
        Self {
            value,
            ..self.clone()
        }
    }

    /// Derive a copy carrying a different timestamp.
    pub fn with_timestamp(&self, timestamp: Ticks) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }
}
