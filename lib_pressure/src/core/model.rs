//! # Pressure Data Model
//!
//! The value types that flow through the delivery core: the enumerated set of
//! sources, the ordered severity states, the immutable `PressureRecord` handed
//! to consumers, and the `ObserveOptions` an observer registers with.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::PressureError;

/// # Pressure Source
///
/// The fixed, enumerated set of signals a pressure observer can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureSource {
    /// Aggregate CPU load of the machine.
    Cpu,
    /// Thermal headroom of the machine.
    Thermals,
}

impl PressureSource {
    /// Every source this build knows about, in a stable order.
    pub const ALL: [PressureSource; 2] = [PressureSource::Cpu, PressureSource::Thermals];

    /// The wire name of the source (e.g. `"cpu"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Thermals => "thermals",
        }
    }
}

impl fmt::Display for PressureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PressureSource {
    type Err = PressureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "thermals" => Ok(Self::Thermals),
            other => Err(PressureError::UnknownSource(other.to_string())),
        }
    }
}

/// # Pressure State
///
/// Ordered severity of a source. The derive order gives
/// `Nominal < Fair < Serious < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureState {
    /// The source is idle or lightly used.
    Nominal,
    /// Load is elevated but the system keeps up.
    Fair,
    /// Load is high enough to affect responsiveness.
    Serious,
    /// The system is at or beyond its limits.
    Critical,
}

impl PressureState {
    /// All states from least to most severe.
    pub const ALL: [PressureState; 4] = [
        PressureState::Nominal,
        PressureState::Fair,
        PressureState::Serious,
        PressureState::Critical,
    ];

    /// The wire name of the state (e.g. `"critical"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nominal => "nominal",
            Self::Fair => "fair",
            Self::Serious => "serious",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for PressureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PressureState {
    type Err = PressureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nominal" => Ok(Self::Nominal),
            "fair" => Ok(Self::Fair),
            "serious" => Ok(Self::Serious),
            "critical" => Ok(Self::Critical),
            other => Err(PressureError::UnknownState(other.to_string())),
        }
    }
}

/// # Pressure Record
///
/// A single delivered change. Records are created by the sampler and never
/// mutated afterwards; consumers only get read access.
///
/// `time` is a millisecond timestamp relative to the dispatcher's time origin.
/// For a given observer and source, delivered records carry strictly
/// increasing times.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureRecord {
    source: PressureSource,
    state: PressureState,
    time: f64,
}

impl PressureRecord {
    pub(crate) fn new(source: PressureSource, state: PressureState, time: f64) -> Self {
        Self { source, state, time }
    }

    /// The source this record was sampled from.
    pub fn source(&self) -> PressureSource {
        self.source
    }

    /// The severity state at sampling time.
    pub fn state(&self) -> PressureState {
        self.state
    }

    /// Milliseconds since the dispatcher's time origin.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Serializes the record as `{"source", "state", "time"}`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "source": self.source,
            "state": self.state,
            "time": self.time,
        })
    }
}

/// Exclusive upper bound of `sampleInterval` (the unsigned long range).
pub const SAMPLE_INTERVAL_LIMIT: i64 = 1 << 32;

/// # Observe Options
///
/// Options passed to `PressureObserver::observe`. The interval is kept as a
/// signed 64-bit value so that out-of-range input can be rejected instead of
/// being silently truncated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserveOptions {
    /// Minimum milliseconds between two records carrying the same state.
    /// `None` falls back to the dispatcher's configured default.
    pub sample_interval: Option<i64>,
}

impl ObserveOptions {
    /// Options with an explicit sample interval in milliseconds.
    pub fn with_sample_interval(sample_interval: i64) -> Self {
        Self {
            sample_interval: Some(sample_interval),
        }
    }

    /// Validates the interval and resolves it against `default_ms`.
    ///
    /// # Returns
    /// - `Ok(ms)` when the interval lies in `[0, 2^32)`.
    /// - `Err(PressureError::InvalidSampleInterval)` otherwise.
    pub fn resolve_interval(&self, default_ms: u32) -> Result<u32, PressureError> {
        match self.sample_interval {
            None => Ok(default_ms),
            Some(ms) => u32::try_from(ms).map_err(|_| PressureError::InvalidSampleInterval(ms)),
        }
    }
}
