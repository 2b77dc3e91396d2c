//! # Sampler / Debouncer
//!
//! Turns raw readings into delivered `PressureRecord`s for one observer. The
//! sampler owns the observer's `LastRecordMap`, the memory of the most recent
//! record delivered per source, and applies the "has change in data" test
//! against it:
//!
//! 1.  No previous record for the source: always accept.
//! 2.  The state differs from the previous record: always accept. The sample
//!     interval never gates a transition.
//! 3.  Same state: accept only when the interval is non-zero and at least that
//!     many milliseconds have passed since the previous record. With an
//!     interval of 0 repeated states are never re-delivered.
//!
//! Accepted candidates replace the map entry. Rejected candidates leave it
//! untouched.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::HashMap;

use crate::core::model::{PressureRecord, PressureSource, PressureState};

/// Smallest step used to keep per-source record times strictly increasing.
pub const MIN_TIME_STEP_MS: f64 = 0.001;

/// Source id → last delivered record, for a single observer.
pub type LastRecordMap = HashMap<PressureSource, PressureRecord>;

/// # Sampler
///
/// Per-observer debouncer. Not shared between observers.
#[derive(Debug, Default)]
pub struct Sampler {
    last_records: LastRecordMap,
}

impl Sampler {
    /// Creates a sampler with an empty `LastRecordMap`.
    pub fn new() -> Self {
        Self::default()
    }

    /// # Sample
    ///
    /// Runs the change test for a reading of `state` taken at `time_ms`.
    ///
    /// # Returns
    /// `Some(record)` when the reading should be delivered; the record is
    /// already stored as the last record for `source`. `None` when it was
    /// discarded.
    pub fn sample(
        &mut self,
        source: PressureSource,
        state: PressureState,
        time_ms: f64,
        sample_interval_ms: u32,
    ) -> Option<PressureRecord> {
        let last = self.last_records.get(&source);
        if !has_change_in_data(last, state, time_ms, sample_interval_ms) {
            log::trace!("Discarding '{}' reading for '{}': no change in data", state, source);
            return None;
        }

        let time_ms = match last {
            Some(prev) if time_ms <= prev.time() => prev.time() + MIN_TIME_STEP_MS,
            _ => time_ms,
        };
        let record = PressureRecord::new(source, state, time_ms);
        self.last_records.insert(source, record);
        Some(record)
    }

    /// The last delivered record for `source`, if any.
    pub fn last_record(&self, source: PressureSource) -> Option<&PressureRecord> {
        self.last_records.get(&source)
    }

    /// Drops the entry for `source`.
    pub fn forget(&mut self, source: PressureSource) {
        self.last_records.remove(&source);
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.last_records.clear();
    }

    /// Number of sources with a remembered record.
    pub fn len(&self) -> usize {
        self.last_records.len()
    }

    /// Whether no record is remembered.
    pub fn is_empty(&self) -> bool {
        self.last_records.is_empty()
    }
}

/// The "has change in data" test.
pub fn has_change_in_data(
    last: Option<&PressureRecord>,
    state: PressureState,
    time_ms: f64,
    sample_interval_ms: u32,
) -> bool {
    let Some(last) = last else {
        return true;
    };
    if last.state() != state {
        return true;
    }
    sample_interval_ms > 0 && time_ms - last.time() >= f64::from(sample_interval_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPU: PressureSource = PressureSource::Cpu;

    #[test]
    fn test_first_reading_is_always_delivered() {
        let mut sampler = Sampler::new();
        let record = sampler.sample(CPU, PressureState::Critical, 10.0, 1000).unwrap();
        assert_eq!(record.state(), PressureState::Critical);
        assert_eq!(sampler.last_record(CPU), Some(&record));
    }

    #[test]
    fn test_same_state_within_interval_is_discarded() {
        let mut sampler = Sampler::new();
        sampler.sample(CPU, PressureState::Fair, 0.0, 200).unwrap();
        assert!(sampler.sample(CPU, PressureState::Fair, 50.0, 200).is_none());
        assert!(sampler.sample(CPU, PressureState::Fair, 199.0, 200).is_none());
        // The discarded candidates did not move the reference point.
        assert_eq!(sampler.last_record(CPU).unwrap().time(), 0.0);
        assert!(sampler.sample(CPU, PressureState::Fair, 200.0, 200).is_some());
    }

    #[test]
    fn test_transition_ignores_interval() {
        let mut sampler = Sampler::new();
        sampler.sample(CPU, PressureState::Critical, 0.0, 10_000).unwrap();
        let record = sampler.sample(CPU, PressureState::Nominal, 1.0, 10_000).unwrap();
        assert_eq!(record.state(), PressureState::Nominal);
    }

    #[test]
    fn test_zero_interval_delivers_only_transitions() {
        let mut sampler = Sampler::new();
        sampler.sample(CPU, PressureState::Serious, 0.0, 0).unwrap();
        assert!(sampler.sample(CPU, PressureState::Serious, 5_000.0, 0).is_none());
        assert!(sampler.sample(CPU, PressureState::Critical, 5_001.0, 0).is_some());
    }

    #[test]
    fn test_times_stay_strictly_increasing() {
        let mut sampler = Sampler::new();
        let a = sampler.sample(CPU, PressureState::Nominal, 40.0, 0).unwrap();
        let b = sampler.sample(CPU, PressureState::Fair, 40.0, 0).unwrap();
        assert!(b.time() > a.time());
    }

    #[test]
    fn test_sources_are_tracked_independently() {
        let mut sampler = Sampler::new();
        sampler.sample(CPU, PressureState::Fair, 0.0, 0).unwrap();
        assert!(sampler
            .sample(PressureSource::Thermals, PressureState::Fair, 1.0, 0)
            .is_some());
        sampler.forget(CPU);
        assert_eq!(sampler.len(), 1);
        assert!(sampler.sample(CPU, PressureState::Fair, 2.0, 0).is_some());
        sampler.clear();
        assert!(sampler.is_empty());
    }
}
