//! Scripted virtual-source replays.
//!
//! A scenario file names one source and a list of steps. Each step waits
//! `afterMs` milliseconds after the previous one, then pushes `state`:
//!
//! ```json
//! {"source": "cpu", "supported": true,
//!  "steps": [{"afterMs": 0, "state": "fair"}, {"afterMs": 500, "state": "critical"}]}
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use lib_pressure::{PressureSource, PressureState, SourceRegistry, VirtualSourceOptions};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default)]
    pub after_ms: u64,
    pub state: PressureState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub source: PressureSource,
    #[serde(default = "default_supported")]
    pub supported: bool,
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_supported() -> bool {
    true
}

impl Scenario {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid scenario JSON")
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        Self::from_json_str(&content)
    }

    /// Creates the scenario's virtual source in `registry`.
    pub fn install(&self, registry: &SourceRegistry) -> Result<()> {
        registry.create(
            self.source,
            VirtualSourceOptions {
                supported: self.supported,
            },
        )?;
        Ok(())
    }

    /// Plays every step into `registry`, stopping early if `cancel` fires.
    ///
    /// # Returns
    /// The number of steps pushed.
    pub async fn play(&self, registry: &SourceRegistry, cancel: &CancellationToken) -> Result<usize> {
        let mut played = 0;
        for step in &self.steps {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::info!("Replay cancelled after {} of {} steps", played, self.steps.len());
                    return Ok(played);
                }
                _ = tokio::time::sleep(Duration::from_millis(step.after_ms)) => {}
            }
            registry.update(self.source, step.state)?;
            played += 1;
        }
        log::info!("Replay of '{}' finished ({} steps)", self.source, played);
        Ok(played)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"{
        "source": "cpu",
        "steps": [
            {"afterMs": 0, "state": "fair"},
            {"afterMs": 100, "state": "serious"},
            {"afterMs": 100, "state": "critical"}
        ]
    }"#;

    #[test]
    fn test_parse_defaults_supported() {
        let scenario = Scenario::from_json_str(SCENARIO).unwrap();
        assert_eq!(scenario.source, PressureSource::Cpu);
        assert!(scenario.supported);
        assert_eq!(scenario.steps.len(), 3);
        assert_eq!(scenario.steps[1].after_ms, 100);
        assert!(Scenario::from_json_str(r#"{"source": "gpu"}"#).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_pushes_every_step() {
        let scenario = Scenario::from_json_str(SCENARIO).unwrap();
        let registry = SourceRegistry::new();
        scenario.install(&registry).unwrap();

        let played = scenario.play(&registry, &CancellationToken::new()).await.unwrap();
        assert_eq!(played, 3);
        assert_eq!(
            registry.info(PressureSource::Cpu).unwrap().state,
            Some(PressureState::Critical)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_replay() {
        let scenario = Scenario::from_json_str(SCENARIO).unwrap();
        let registry = SourceRegistry::new();
        scenario.install(&registry).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(scenario.play(&registry, &cancel).await.unwrap(), 0);
    }
}
