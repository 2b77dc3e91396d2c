//! # Linux CPU Probe
//!
//! A polling backend for the `cpu` source. Every poll period it reads the
//! aggregate `cpu` line of `/proc/stat`, computes utilisation since the
//! previous poll as `1 - Δidle / Δtotal` (iowait counts as idle), and maps it
//! onto a pressure state with `CpuThresholds`.
//!
//! One sampling task runs per subscribed sink. Unsubscribing cancels it.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::error::PressureError;
use crate::core::model::{PressureSource, PressureState};
use crate::core::registry::{RawReading, RawStateSource, ReadingSink};

const PROC_STAT: &str = "/proc/stat";
const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(1);

/// Utilisation cut-offs, each the lowest value mapped to its state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuThresholds {
    /// Lowest utilisation reported as `fair`.
    pub fair: f64,
    /// Lowest utilisation reported as `serious`.
    pub serious: f64,
    /// Lowest utilisation reported as `critical`.
    pub critical: f64,
}

impl Default for CpuThresholds {
    fn default() -> Self {
        Self {
            fair: 0.3,
            serious: 0.6,
            critical: 0.9,
        }
    }
}

impl CpuThresholds {
    /// Maps a utilisation in `[0, 1]` onto a state.
    pub fn state_for(&self, utilisation: f64) -> PressureState {
        if utilisation >= self.critical {
            PressureState::Critical
        } else if utilisation >= self.serious {
            PressureState::Serious
        } else if utilisation >= self.fair {
            PressureState::Fair
        } else {
            PressureState::Nominal
        }
    }
}

/// Aggregate jiffy counters from one `/proc/stat` read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    /// idle + iowait.
    pub idle: u64,
    /// Sum of every counter on the line.
    pub total: u64,
}

/// Parses the aggregate `cpu` line of a `/proc/stat` document.
pub fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(str::parse::<u64>)
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: fields.iter().sum(),
    })
}

/// Utilisation between two reads; `None` when no time has passed.
pub fn utilisation(prev: CpuTimes, cur: CpuTimes) -> Option<f64> {
    let total = cur.total.checked_sub(prev.total)?;
    if total == 0 {
        return None;
    }
    let idle = cur.idle.saturating_sub(prev.idle).min(total);
    Some(1.0 - idle as f64 / total as f64)
}

/// # CPU Probe
///
/// `RawStateSource` for the `cpu` source on Linux.
pub struct CpuProbe {
    stat_path: PathBuf,
    poll_period: Duration,
    thresholds: CpuThresholds,
    last_state: Arc<Mutex<Option<PressureState>>>,
    tasks: Mutex<Vec<(ReadingSink, CancellationToken)>>,
}

impl CpuProbe {
    /// A probe over `/proc/stat` polling once per second.
    pub fn new() -> Self {
        Self::with_stat_path(PROC_STAT)
    }

    /// A probe reading counters from `path` instead of `/proc/stat`.
    pub fn with_stat_path(path: impl AsRef<Path>) -> Self {
        Self {
            stat_path: path.as_ref().to_path_buf(),
            poll_period: DEFAULT_POLL_PERIOD,
            thresholds: CpuThresholds::default(),
            last_state: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Sets the poll period.
    pub fn poll_period(mut self, period: Duration) -> Self {
        self.poll_period = period;
        self
    }

    /// Sets the utilisation thresholds.
    pub fn thresholds(mut self, thresholds: CpuThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Number of running sampling tasks.
    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().expect("Probe lock poisoned").len()
    }
}

impl Default for CpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl RawStateSource for CpuProbe {
    fn is_supported(&self, source: PressureSource) -> bool {
        source == PressureSource::Cpu && cfg!(target_os = "linux") && self.stat_path.is_file()
    }

    fn current_state(&self, source: PressureSource) -> Option<PressureState> {
        if source != PressureSource::Cpu {
            return None;
        }
        *self.last_state.lock().expect("Probe lock poisoned")
    }

    fn subscribe(&self, source: PressureSource, sink: ReadingSink) -> Result<(), PressureError> {
        if !self.is_supported(source) {
            return Err(PressureError::NotSupported(source));
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| PressureError::Backend(format!("CPU probe needs a tokio runtime: {e}")))?;

        let mut tasks = self.tasks.lock().expect("Probe lock poisoned");
        if tasks.iter().any(|(s, _)| s.same_target(&sink)) {
            return Ok(());
        }

        let token = CancellationToken::new();
        handle.spawn(sample_loop(
            self.stat_path.clone(),
            self.poll_period,
            self.thresholds,
            Arc::clone(&self.last_state),
            sink.clone(),
            token.clone(),
        ));
        tasks.push((sink, token));
        log::info!("CPU probe sampling {} every {:?}", self.stat_path.display(), self.poll_period);
        Ok(())
    }

    fn unsubscribe(&self, source: PressureSource, sink: &ReadingSink) {
        if source != PressureSource::Cpu {
            return;
        }
        let mut tasks = self.tasks.lock().expect("Probe lock poisoned");
        tasks.retain(|(s, token)| {
            if s.same_target(sink) {
                token.cancel();
                false
            } else {
                true
            }
        });
    }
}

async fn sample_loop(
    stat_path: PathBuf,
    period: Duration,
    thresholds: CpuThresholds,
    last_state: Arc<Mutex<Option<PressureState>>>,
    sink: ReadingSink,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    let mut prev: Option<CpuTimes> = None;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let cur = match tokio::fs::read_to_string(&stat_path).await {
            Ok(content) => parse_cpu_times(&content),
            Err(e) => {
                log::warn!("CPU probe failed to read {}: {}", stat_path.display(), e);
                continue;
            }
        };
        let Some(cur) = cur else {
            log::warn!("CPU probe found no aggregate cpu line in {}", stat_path.display());
            continue;
        };

        if let Some(util) = prev.and_then(|prev| utilisation(prev, cur)) {
            let state = thresholds.state_for(util);
            *last_state.lock().expect("Probe lock poisoned") = Some(state);
            let reading = RawReading {
                source: PressureSource::Cpu,
                state,
                at: Instant::now(),
            };
            if !sink.push(reading) {
                log::debug!("CPU probe sink closed; stopping");
                break;
            }
        }
        prev = Some(cur);
    }
    log::debug!("CPU probe sampling task ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\nintr 1\n";

    #[test]
    fn test_parse_aggregate_line() {
        let times = parse_cpu_times(STAT).unwrap();
        assert_eq!(times.idle, 800);
        assert_eq!(times.total, 1000);
        assert!(parse_cpu_times("intr 1\n").is_none());
        assert!(parse_cpu_times("cpu  1 2\n").is_none());
    }

    #[test]
    fn test_utilisation_between_reads() {
        let prev = CpuTimes { idle: 800, total: 1000 };
        let cur = CpuTimes { idle: 850, total: 1100 };
        let util = utilisation(prev, cur).unwrap();
        assert!((util - 0.5).abs() < 1e-9);
        assert!(utilisation(cur, cur).is_none());
    }

    #[test]
    fn test_thresholds_map_to_states() {
        let t = CpuThresholds::default();
        assert_eq!(t.state_for(0.0), PressureState::Nominal);
        assert_eq!(t.state_for(0.3), PressureState::Fair);
        assert_eq!(t.state_for(0.75), PressureState::Serious);
        assert_eq!(t.state_for(0.95), PressureState::Critical);
    }

    #[test]
    fn test_thermals_unsupported() {
        let probe = CpuProbe::new();
        assert!(!probe.is_supported(PressureSource::Thermals));
        assert_eq!(probe.current_state(PressureSource::Thermals), None);
    }

    #[test]
    fn test_missing_stat_file_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let probe = CpuProbe::with_stat_path(dir.path().join("stat"));
        assert!(!probe.is_supported(PressureSource::Cpu));
    }
}
