//! # Rate Obfuscation Guard
//!
//! A per-observer accountant for delivered changes. Fast, precise sequences of
//! pressure changes can be abused as a timing side channel, so once an
//! observer has received a threshold of changes inside a counting window the
//! guard enforces a penalty: nothing is delivered until the penalty has
//! elapsed since the last delivered record.
//!
//! ## Core Functionality:
//!
//! - **Randomized Parameters**: The change threshold, the penalty duration and
//!   the counting window length are each drawn uniformly from a configured
//!   range, so an observer cannot learn the exact limits by probing. A fixed
//!   `seed` makes the draws reproducible.
//!
//! - **Counting Window**: Changes are counted from the first delivery of a
//!   window. If the window elapses before the threshold is reached, the count
//!   starts over. Triggering a penalty also starts over.
//!
//! - **Hold, Don't Drop**: While a penalty is active the guard holds the latest
//!   reading per source instead of discarding it. When the penalty expires the
//!   held readings are released through the sampler, stamped with the penalty
//!   deadline. The guard never alters a state; it only shifts delivery timing.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::core::model::{PressureSource, PressureState};

/// Normative lower bound of the change threshold.
pub const MIN_CHANGES_THRESHOLD: u32 = 50;
/// Normative upper bound of the change threshold.
pub const MAX_CHANGES_THRESHOLD: u32 = 100;
/// Normative lower bound of the penalty duration.
pub const MIN_PENALTY_TIME_MS: u64 = 5_000;
/// Normative upper bound of the penalty duration.
pub const MAX_PENALTY_TIME_MS: u64 = 10_000;
/// Lower bound of the counting window.
pub const MIN_OBSERVATION_WINDOW_MS: u64 = 300_000;
/// Upper bound of the counting window.
pub const MAX_OBSERVATION_WINDOW_MS: u64 = 600_000;

/// # Rate Obfuscation Config
///
/// Parameter ranges for the guard. Every field has a default, so a partial
/// JSON object is enough to override a single value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateObfuscationConfig {
    /// Turns the guard off entirely when `false`.
    pub enabled: bool,
    /// Lowest number of changes a window may allow before a penalty.
    pub min_changes_threshold: u32,
    /// Highest number of changes a window may allow before a penalty.
    pub max_changes_threshold: u32,
    /// Shortest penalty in milliseconds.
    pub min_penalty_time_ms: u64,
    /// Longest penalty in milliseconds.
    pub max_penalty_time_ms: u64,
    /// Shortest counting window in milliseconds.
    pub min_observation_window_ms: u64,
    /// Longest counting window in milliseconds.
    pub max_observation_window_ms: u64,
    /// Seed for reproducible draws; OS entropy when `None`.
    pub seed: Option<u64>,
}

impl Default for RateObfuscationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_changes_threshold: MIN_CHANGES_THRESHOLD,
            max_changes_threshold: MAX_CHANGES_THRESHOLD,
            min_penalty_time_ms: MIN_PENALTY_TIME_MS,
            max_penalty_time_ms: MAX_PENALTY_TIME_MS,
            min_observation_window_ms: MIN_OBSERVATION_WINDOW_MS,
            max_observation_window_ms: MAX_OBSERVATION_WINDOW_MS,
            seed: None,
        }
    }
}

/// Outcome of `RateObfuscationGuard::admit`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// No penalty is active; the reading goes to the sampler.
    Open,
    /// A penalty is active; the reading must be held.
    Hold,
    /// A penalty that ended at `deadline_ms` was just lifted. Held readings
    /// must be released at that time before the new reading is sampled.
    Released {
        /// The time the penalty ended.
        deadline_ms: f64,
    },
}

/// # Rate Obfuscation Guard
///
/// Owned by exactly one observer. All times are milliseconds on the
/// dispatcher's time line.
#[derive(Debug)]
pub struct RateObfuscationGuard {
    config: RateObfuscationConfig,
    rng: StdRng,
    change_count: u32,
    threshold: u32,
    window_start_ms: Option<f64>,
    window_len_ms: f64,
    penalty_until_ms: Option<f64>,
    held: BTreeMap<PressureSource, PressureState>,
    penalties: u64,
}

impl RateObfuscationGuard {
    /// Creates a guard with no window started yet.
    pub fn new(config: RateObfuscationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let threshold = config.min_changes_threshold.max(1);
        Self {
            config,
            rng,
            change_count: 0,
            threshold,
            window_start_ms: None,
            window_len_ms: 0.0,
            penalty_until_ms: None,
            held: BTreeMap::new(),
            penalties: 0,
        }
    }

    /// # Admit
    ///
    /// Decides what happens to a reading taken at `time_ms`. Lifts an expired
    /// penalty as a side effect.
    pub fn admit(&mut self, time_ms: f64) -> Admission {
        if !self.config.enabled {
            return Admission::Open;
        }
        match self.penalty_until_ms {
            Some(deadline) if time_ms < deadline => Admission::Hold,
            Some(deadline) => {
                self.penalty_until_ms = None;
                Admission::Released { deadline_ms: deadline }
            }
            None => Admission::Open,
        }
    }

    /// Lifts the penalty if it has expired by `now_ms`.
    ///
    /// # Returns
    /// The deadline of the lifted penalty, at which held readings are due.
    pub fn expire(&mut self, now_ms: f64) -> Option<f64> {
        match self.penalty_until_ms {
            Some(deadline) if deadline <= now_ms => {
                self.penalty_until_ms = None;
                Some(deadline)
            }
            _ => None,
        }
    }

    /// Holds `state` as the latest reading of `source`, replacing any earlier
    /// held reading of the same source.
    pub fn hold(&mut self, source: PressureSource, state: PressureState) {
        self.held.insert(source, state);
    }

    /// Drains held readings in source order.
    pub fn take_held(&mut self) -> Vec<(PressureSource, PressureState)> {
        std::mem::take(&mut self.held).into_iter().collect()
    }

    /// Drops the held reading of `source`.
    pub fn forget_held(&mut self, source: PressureSource) {
        self.held.remove(&source);
    }

    /// Drops every held reading. Counters and an active penalty are kept.
    pub fn clear_held(&mut self) {
        self.held.clear();
    }

    /// # Record Delivery
    ///
    /// Counts a record delivered at `time_ms`.
    ///
    /// ## Logic:
    /// 1.  Starts a new window (fresh threshold and length) if none is running
    ///     or the current one has elapsed.
    /// 2.  Increments the change count.
    /// 3.  When the count reaches the threshold, arms a penalty ending a random
    ///     duration after `time_ms` and resets the count.
    pub fn record_delivery(&mut self, time_ms: f64) {
        if !self.config.enabled {
            return;
        }

        let window_elapsed = match self.window_start_ms {
            None => true,
            Some(start) => time_ms - start >= self.window_len_ms,
        };
        if window_elapsed {
            self.start_window(time_ms);
        }

        self.change_count += 1;
        if self.change_count >= self.threshold {
            let penalty_ms = self.draw(self.config.min_penalty_time_ms, self.config.max_penalty_time_ms);
            let deadline = time_ms + penalty_ms as f64;
            log::debug!(
                "Rate obfuscation penalty armed after {} changes: holding deliveries for {} ms",
                self.change_count,
                penalty_ms
            );
            self.penalty_until_ms = Some(deadline);
            self.penalties += 1;
            self.change_count = 0;
            self.window_start_ms = None;
        }
    }

    /// The end of the active penalty, if any.
    pub fn penalty_deadline(&self) -> Option<f64> {
        self.penalty_until_ms
    }

    /// Whether a penalty is active.
    pub fn is_penalized(&self) -> bool {
        self.penalty_until_ms.is_some()
    }

    /// Changes counted in the current window.
    pub fn change_count(&self) -> u32 {
        self.change_count
    }

    /// The threshold of the current window.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Number of penalties triggered so far.
    pub fn penalties(&self) -> u64 {
        self.penalties
    }

    fn start_window(&mut self, time_ms: f64) {
        let (lo, hi) = (self.config.min_changes_threshold, self.config.max_changes_threshold);
        self.threshold = self.draw(u64::from(lo), u64::from(hi)).max(1) as u32;
        self.window_len_ms = self.draw(
            self.config.min_observation_window_ms,
            self.config.max_observation_window_ms,
        ) as f64;
        self.window_start_ms = Some(time_ms);
        self.change_count = 0;
    }

    // Tolerates inverted bounds by collapsing to the lower one.
    fn draw(&mut self, lo: u64, hi: u64) -> u64 {
        if hi <= lo {
            lo
        } else {
            self.rng.random_range(lo..=hi)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(threshold: u32, penalty_ms: u64) -> RateObfuscationConfig {
        RateObfuscationConfig {
            min_changes_threshold: threshold,
            max_changes_threshold: threshold,
            min_penalty_time_ms: penalty_ms,
            max_penalty_time_ms: penalty_ms,
            seed: Some(7),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_penalty_below_threshold() {
        let mut guard = RateObfuscationGuard::new(fixed(5, 1000));
        for i in 0..4 {
            assert_eq!(guard.admit(i as f64 * 10.0), Admission::Open);
            guard.record_delivery(i as f64 * 10.0);
        }
        assert!(!guard.is_penalized());
        assert_eq!(guard.change_count(), 4);
    }

    #[test]
    fn test_penalty_armed_at_threshold() {
        let mut guard = RateObfuscationGuard::new(fixed(3, 1000));
        for t in [0.0, 10.0, 20.0] {
            assert_eq!(guard.admit(t), Admission::Open);
            guard.record_delivery(t);
        }
        assert_eq!(guard.penalty_deadline(), Some(1020.0));
        assert_eq!(guard.change_count(), 0);
        assert_eq!(guard.penalties(), 1);

        assert_eq!(guard.admit(30.0), Admission::Hold);
        assert_eq!(guard.admit(1019.9), Admission::Hold);
        assert_eq!(guard.admit(1020.0), Admission::Released { deadline_ms: 1020.0 });
        assert_eq!(guard.admit(1021.0), Admission::Open);
    }

    #[test]
    fn test_expire_lifts_penalty_once() {
        let mut guard = RateObfuscationGuard::new(fixed(1, 500));
        guard.record_delivery(100.0);
        assert_eq!(guard.expire(599.0), None);
        assert_eq!(guard.expire(600.0), Some(600.0));
        assert_eq!(guard.expire(700.0), None);
    }

    #[test]
    fn test_hold_keeps_latest_per_source() {
        let mut guard = RateObfuscationGuard::new(fixed(1, 500));
        guard.hold(PressureSource::Cpu, PressureState::Fair);
        guard.hold(PressureSource::Cpu, PressureState::Critical);
        guard.hold(PressureSource::Thermals, PressureState::Nominal);
        assert_eq!(
            guard.take_held(),
            vec![
                (PressureSource::Cpu, PressureState::Critical),
                (PressureSource::Thermals, PressureState::Nominal)
            ]
        );
        assert!(guard.take_held().is_empty());
    }

    #[test]
    fn test_window_expiry_resets_count() {
        let config = RateObfuscationConfig {
            min_observation_window_ms: 1_000,
            max_observation_window_ms: 1_000,
            ..fixed(3, 5_000)
        };
        let mut guard = RateObfuscationGuard::new(config);
        guard.record_delivery(0.0);
        guard.record_delivery(500.0);
        // The window started at 0 is over; this change opens a new one.
        guard.record_delivery(1_000.0);
        assert_eq!(guard.change_count(), 1);
        assert!(!guard.is_penalized());
    }

    #[test]
    fn test_disabled_guard_never_holds() {
        let config = RateObfuscationConfig {
            enabled: false,
            ..fixed(1, 5_000)
        };
        let mut guard = RateObfuscationGuard::new(config);
        for i in 0..10 {
            guard.record_delivery(i as f64);
            assert_eq!(guard.admit(i as f64 + 0.5), Admission::Open);
        }
    }

    #[test]
    fn test_randomized_threshold_stays_in_range() {
        let config = RateObfuscationConfig {
            seed: Some(42),
            ..Default::default()
        };
        let mut guard = RateObfuscationGuard::new(config);
        guard.record_delivery(0.0);
        assert!((MIN_CHANGES_THRESHOLD..=MAX_CHANGES_THRESHOLD).contains(&guard.threshold()));
    }
}
