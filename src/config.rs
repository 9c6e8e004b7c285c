//! YAML configuration for the core's own operating parameters: which engines
//! exist, their capacities, and the dispatch policy (spec.md §9 Design
//! Notes: "ambient concerns are carried even when a Non-goal excludes an
//! outer surface"). Structurally mirrors the teacher's `cli/config.rs`
//! (`Config::from_file`/`from_yaml`, typed sub-configs, `#[serde(default =
//! ...)]` fallbacks, a `ConfigError` enum) applied to this crate's domain
//! instead of an HTTP server's.

use crate::dispatcher::{DispatcherConfig, Engine};
use crate::instruction::FILL_NO_CHUNK;
use crate::latency::LatencyProfile;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration: the engine fleet plus dispatch policy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engines: Vec<EngineConfig>,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engines.is_empty() {
            return Err(ConfigError::Validation(
                "at least one engine must be configured".into(),
            ));
        }
        for engine in &self.engines {
            if engine.threads_capacity == 0 {
                return Err(ConfigError::Validation(format!(
                    "engine `{}` must have a non-zero threads_capacity",
                    engine.id
                )));
            }
        }
        Ok(())
    }

    /// Build the dispatcher's runtime `Engine` records from configuration.
    pub fn engines(&self) -> Vec<Engine> {
        self.engines
            .iter()
            .map(|e| {
                let mut engine = Engine::new(
                    e.id.clone(),
                    e.tokenizer.clone(),
                    e.address.clone(),
                    e.threads_capacity,
                    e.tokens_capacity,
                )
                .with_fill_chunk_size(e.fill_chunk_size);
                engine.requests_num_upperbound = e.requests_num_upperbound;
                engine
            })
            .collect()
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            dag_aware: self.dispatcher.dag_aware,
            app_fifo: self.dispatcher.app_fifo,
            max_queue_size: self.dispatcher.max_queue_size,
            throughput_threshold: self.dispatcher.throughput_threshold,
        }
    }
}

/// One engine in the fleet: wire address, capacities, and the simulated
/// latency profile used when no real engine client is wired in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub id: String,
    pub tokenizer: String,
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_threads_capacity")]
    pub threads_capacity: usize,
    #[serde(default = "default_tokens_capacity")]
    pub tokens_capacity: u64,
    #[serde(default)]
    pub requests_num_upperbound: Option<u32>,
    #[serde(default = "default_fill_chunk_size")]
    pub fill_chunk_size: usize,
    #[serde(default)]
    pub latency: LatencyConfig,
}

fn default_address() -> String {
    "sim://local".to_string()
}

fn default_threads_capacity() -> usize {
    8
}

fn default_tokens_capacity() -> u64 {
    32_768
}

fn default_fill_chunk_size() -> usize {
    FILL_NO_CHUNK
}

/// Latency simulation configuration for a single engine, in the shape of the
/// teacher's `LatencyConfig` (named profile, or explicit mean/stddev pairs).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LatencyConfig {
    pub profile: Option<String>,
    pub ttft_mean_ms: Option<u64>,
    pub ttft_stddev_ms: Option<u64>,
    pub tbt_mean_ms: Option<u64>,
    pub tbt_stddev_ms: Option<u64>,
}

impl LatencyConfig {
    pub fn resolve(&self) -> LatencyProfile {
        if let Some(profile) = &self.profile {
            match profile.to_lowercase().as_str() {
                "instant" => LatencyProfile::instant(),
                "fast" => LatencyProfile::fast(),
                _ => LatencyProfile::default_profile(),
            }
        } else if self.ttft_mean_ms.is_some() || self.tbt_mean_ms.is_some() {
            LatencyProfile::new(
                self.ttft_mean_ms.unwrap_or(400),
                self.ttft_stddev_ms.unwrap_or(100),
                self.tbt_mean_ms.unwrap_or(30),
                self.tbt_stddev_ms.unwrap_or(10),
            )
        } else {
            LatencyProfile::default_profile()
        }
    }
}

/// Dispatch policy configuration, one-to-one with `DispatcherConfig`
/// (spec.md §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSection {
    #[serde(default)]
    pub dag_aware: bool,
    #[serde(default)]
    pub app_fifo: bool,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_throughput_threshold")]
    pub throughput_threshold: u32,
}

fn default_max_queue_size() -> usize {
    1024
}

fn default_throughput_threshold() -> u32 {
    16
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            dag_aware: false,
            app_fifo: false,
            max_queue_size: default_max_queue_size(),
            throughput_threshold: default_throughput_threshold(),
        }
    }
}

/// Runtime-wide knobs not owned by the dispatcher or a single engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_recycle_pool_size")]
    pub recycle_pool_size: usize,
}

fn default_recycle_pool_size() -> usize {
    crate::ids::RECYCLE_POOL_SIZE
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            recycle_pool_size: default_recycle_pool_size(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(String),
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Validation(String),
}
