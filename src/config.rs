//! External engine configuration.
//!
//! `EngineConfig` is the post-parse shape consumed by the session
//! coordinator: per-scenario setting overrides, connection-pool sizing,
//! the target-scenario filter, and reporting cadence. Configs load from
//! JSON files; duration fields are strings like `"30s"` or `"5m"`.
//!
//! Override semantics are field-wise: a settings entry replaces only the
//! fields it supplies, and names are never rewritten.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::EngineError;
use crate::scenario::Scenario;
use crate::timeline::LoadSimulation;
use crate::utils::opt_duration_from_str;

/// Settings overriding one scenario's programmatic defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioSetting {
    pub scenario_name: String,

    #[serde(default, deserialize_with = "opt_duration_from_str")]
    pub warm_up_duration: Option<Duration>,

    #[serde(default)]
    pub load_simulations_settings: Vec<LoadSimulation>,

    #[serde(default)]
    pub custom_settings: Option<String>,
}

impl ScenarioSetting {
    /// Apply this entry onto a scenario. Only supplied fields override.
    pub(crate) fn apply(&self, scenario: &mut Scenario) {
        if let Some(warm_up) = self.warm_up_duration {
            scenario.warm_up_duration = warm_up;
        }
        if !self.load_simulations_settings.is_empty() {
            scenario.load_simulations = self.load_simulations_settings.clone();
        }
        if let Some(custom) = &self.custom_settings {
            scenario.custom_settings = custom.clone();
        }
        info!(scenario = %self.scenario_name, "Applied external scenario settings");
    }
}

/// Override of one pool's connection count, keyed by resolved pool name
/// (`"{scenario}.{pool}"`).
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionPoolSetting {
    pub pool_name: String,
    pub connection_count: usize,
}

/// Reporting cadence for sinks and worker plugins.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportingConfig {
    #[serde(default, deserialize_with = "opt_duration_from_str")]
    pub send_stats_interval: Option<Duration>,
}

impl ReportingConfig {
    pub const DEFAULT_SEND_STATS_INTERVAL: Duration = Duration::from_secs(10);

    pub fn send_stats_interval(&self) -> Duration {
        self.send_stats_interval
            .unwrap_or(Self::DEFAULT_SEND_STATS_INTERVAL)
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            send_stats_interval: None,
        }
    }
}

/// External configuration applied on top of programmatic scenarios.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scenarios_settings: Vec<ScenarioSetting>,

    #[serde(default)]
    pub connection_pool_settings: Vec<ConnectionPoolSetting>,

    /// Scenarios to actually run; `None` means all registered scenarios.
    #[serde(default)]
    pub target_scenarios: Option<Vec<String>>,

    #[serde(default)]
    pub reporting: ReportingConfig,

    /// Opaque per-plugin configuration blobs, forwarded to registered
    /// worker plugins at start.
    #[serde(default)]
    pub worker_plugins: Vec<serde_json::Value>,
}

impl EngineConfig {
    /// Load a config from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        if ext != "json" {
            return Err(EngineError::UnsupportedConfigFormat { ext });
        }

        let raw = std::fs::read_to_string(path).map_err(|e| EngineError::ConfigParseFailed {
            path: path.display().to_string(),
            cause: e.to_string(),
        })?;

        let config: EngineConfig =
            serde_json::from_str(&raw).map_err(|e| EngineError::ConfigParseFailed {
                path: path.display().to_string(),
                cause: e.to_string(),
            })?;

        info!(path = %path.display(), "Engine config loaded");
        Ok(config)
    }

    /// The settings entry for a scenario, if present.
    pub fn scenario_setting(&self, scenario_name: &str) -> Option<&ScenarioSetting> {
        self.scenarios_settings
            .iter()
            .find(|s| s.scenario_name == scenario_name)
    }

    /// Pool-count override for a resolved pool name, if present.
    pub fn pool_count_override(&self, resolved_pool_name: &str) -> Option<usize> {
        self.connection_pool_settings
            .iter()
            .find(|s| s.pool_name == resolved_pool_name)
            .map(|s| s.connection_count)
    }
}
