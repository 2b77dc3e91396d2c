use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "pressure_monitor.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Observes a pressure source and prints every delivered batch as a JSON line", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "PRESSURE_MONITOR_SOURCE", help = "Source to observe (cpu, thermals).")]
    pub source: Option<String>,

    #[clap(long, env = "PRESSURE_MONITOR_SAMPLE_INTERVAL_MS", allow_hyphen_values = true, help = "sampleInterval passed to observe, in milliseconds.")]
    pub sample_interval_ms: Option<i64>,

    #[clap(long, env = "PRESSURE_MONITOR_POLL_MS", help = "CPU probe poll period in milliseconds.")]
    pub poll_ms: Option<u64>,

    #[clap(long, env = "PRESSURE_MONITOR_REPLAY", help = "Replay a JSON scenario through a virtual source instead of probing the CPU.")]
    pub replay: Option<PathBuf>,

    #[clap(long, env = "PRESSURE_MONITOR_DURATION_SECS", help = "Stop after this many seconds.")]
    pub duration_secs: Option<u64>,

    #[clap(long, env = "PRESSURE_CONFIG", help = "Path to the JSON engine configuration file.")]
    pub engine_config: Option<PathBuf>,

    #[clap(long, env = "PRESSURE_MONITOR_CONFIG_PATH", help = "Path to the JSON monitor configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "PRESSURE_MONITOR_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "PRESSURE_MONITOR_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            source: other.source.or(self.source),
            sample_interval_ms: other.sample_interval_ms.or(self.sample_interval_ms),
            poll_ms: other.poll_ms.or(self.poll_ms),
            replay: other.replay.or(self.replay),
            duration_secs: other.duration_secs.or(self.duration_secs),
            engine_config: other.engine_config.or(self.engine_config),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
        }
    }

    pub fn defaults() -> Config {
        Config {
            source: Some("cpu".to_string()),
            poll_ms: Some(1000),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ..Default::default()
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }
}

/// Layers built-in defaults, the JSON config file, then CLI arguments and
/// environment variables.
pub fn load_config() -> Config {
    resolve_config(Config::parse())
}

pub fn resolve_config(cli_args: Config) -> Config {
    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }

    current_config.merge(cli_args)
}

// The logger is not installed yet when this runs, so problems go to stderr.
fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        return None;
    }
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Config>(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}
