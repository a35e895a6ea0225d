use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::TaskConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub database_url: Option<String>,
    pub coordinator: CoordinatorConfig,
    pub autopilot: AutopilotConfig,
    pub quality_gate: QualityGateConfig,
    pub tasks: TaskDefaults,
    pub server: ServerConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Reads a TOML config file; secrets still come from the environment when set.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config.with_env_overrides())
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.openai_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            self.anthropic_api_key = Some(key);
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub communication_timeout_secs: u64,
    pub max_agents: usize,
    pub max_concurrent_tasks: usize,
    pub consecutive_timeouts_before_error: u32,
    /// Only agents sharing a specialization tag may take a task that lists any.
    pub strict_specialization: bool,
    pub max_sessions: usize,
}

impl CoordinatorConfig {
    pub fn communication_timeout(&self) -> Duration {
        Duration::from_secs(self.communication_timeout_secs)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            communication_timeout_secs: 30,
            max_agents: 10,
            max_concurrent_tasks: 3,
            consecutive_timeouts_before_error: 2,
            strict_specialization: false,
            max_sessions: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopilotConfig {
    pub max_iterations: u32,
    pub confidence_floor: f32,
    pub max_duration_secs: Option<u64>,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            confidence_floor: 0.6,
            max_duration_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DimensionWeights {
    pub functional: f32,
    pub requirements: f32,
    pub error_free: f32,
}

impl DimensionWeights {
    pub fn total(&self) -> f32 {
        self.functional + self.requirements + self.error_free
    }
}

impl Default for DimensionWeights {
    fn default() -> Self {
        Self {
            functional: 1.0,
            requirements: 1.0,
            error_free: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityGateConfig {
    pub weights: DimensionWeights,
    /// Maximum allowed spread between repeated evaluations of the same input.
    pub tolerance: f32,
    /// Scorer samples per dimension; the median is used.
    pub samples: usize,
    pub default_threshold: f32,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            weights: DimensionWeights::default(),
            tolerance: 0.05,
            samples: 1,
            default_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskDefaults {
    pub default_retry_count: u32,
    pub default_timeout_secs: u64,
}

impl TaskDefaults {
    pub fn task_config(&self, quality_threshold: f32) -> TaskConfig {
        TaskConfig {
            timeout_seconds: self.default_timeout_secs,
            retry_count: self.default_retry_count,
            quality_threshold,
        }
    }
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            default_retry_count: 3,
            default_timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}
