use std::path::{Path, PathBuf};
use std::{env, fmt, fs};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::rate_guard::RateObfuscationConfig;

/// Environment variable naming a JSON engine config file.
pub const CONFIG_ENV_VAR: &str = "PRESSURE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// # Engine Config
///
/// Everything a `Dispatcher` is built with. Every field has a default, so an
/// empty JSON object is a valid config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Interval applied when `observe` is called without `sampleInterval`.
    pub default_sample_interval_ms: u32,
    /// Rate obfuscation parameter ranges.
    pub rate_obfuscation: RateObfuscationConfig,
}

impl EngineConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    /// Checks that every range is ordered and the threshold is non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.rate_obfuscation;
        if r.min_changes_threshold == 0 {
            return Err(ConfigError::Invalid(
                "minChangesThreshold must be at least 1".to_string(),
            ));
        }
        let ranges = [
            ("ChangesThreshold", u64::from(r.min_changes_threshold), u64::from(r.max_changes_threshold)),
            ("PenaltyTimeMs", r.min_penalty_time_ms, r.max_penalty_time_ms),
            ("ObservationWindowMs", r.min_observation_window_ms, r.max_observation_window_ms),
        ];
        for (name, min, max) in ranges {
            if min > max {
                return Err(ConfigError::Invalid(format!(
                    "min{name} ({min}) is greater than max{name} ({max})"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.rate_obfuscation;
        write!(
            f,
            "EngineConfig
    Default sample interval: {} ms,
    Rate obfuscation: {},
    Changes threshold: {}..={},
    Penalty: {}..={} ms,
    Observation window: {}..={} ms,
    Seed: {:?}
",
            self.default_sample_interval_ms,
            if r.enabled { "enabled" } else { "disabled" },
            r.min_changes_threshold,
            r.max_changes_threshold,
            r.min_penalty_time_ms,
            r.max_penalty_time_ms,
            r.min_observation_window_ms,
            r.max_observation_window_ms,
            r.seed
        )
    }
}

/// # Load Engine Config
///
/// Resolves the engine configuration:
/// 1.  `path`, when given;
/// 2.  otherwise the file named by `PRESSURE_CONFIG`, when set;
/// 3.  otherwise the defaults.
pub fn load_engine_config(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    if let Some(path) = path {
        log::info!("Loading engine config from {}", path.display());
        return EngineConfig::from_json_file(path);
    }
    match env::var(CONFIG_ENV_VAR) {
        Ok(value) if !value.trim().is_empty() => {
            log::info!("Loading engine config from ${} ({})", CONFIG_ENV_VAR, value);
            EngineConfig::from_json_file(Path::new(&value))
        }
        _ => {
            log::debug!("No engine config file given; using defaults");
            Ok(EngineConfig::default())
        }
    }
}
