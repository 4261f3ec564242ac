//! Configuration types for gpuplace

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::memory::{deserialize_memory, deserialize_optional_memory};
use crate::{GpuplaceError, GpuplaceResult, GIB};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Runner configuration
    pub runner: RunnerConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> GpuplaceResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GpuplaceError::Config(format!("Failed to read config file: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| GpuplaceError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub rest_address: String,
    /// Port for the scheduler control plane
    pub scheduler_port: u16,
    /// Port for the runner slot API
    pub runner_port: u16,
    /// Enable CORS
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rest_address: "0.0.0.0".to_string(),
            scheduler_port: 9090,
            runner_port: 9191,
            cors_enabled: true,
        }
    }
}

/// How the scheduler picks among runners that can host a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RankingPolicy {
    /// Runner with the most free memory left after placement
    #[default]
    LeastLoaded,
    /// First runner by identifier
    FirstFit,
}

impl std::str::FromStr for RankingPolicy {
    type Err = GpuplaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "least-loaded" => Ok(RankingPolicy::LeastLoaded),
            "first-fit" => Ok(RankingPolicy::FirstFit),
            other => Err(GpuplaceError::Config(format!("unknown ranking '{}'", other))),
        }
    }
}

impl std::fmt::Display for RankingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RankingPolicy::LeastLoaded => write!(f, "least-loaded"),
            RankingPolicy::FirstFit => write!(f, "first-fit"),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Attempts per workload before it is reported unschedulable
    pub max_attempts: u32,
    /// Timeout for one slot-creation round-trip
    pub slot_start_timeout_secs: u64,
    /// A runner silent for this long is declared lost
    pub runner_timeout_secs: u64,
    /// How often runner liveness is checked
    pub liveness_interval_secs: u64,
    /// Runner ranking policy
    pub ranking: RankingPolicy,
    /// First delay before a queued workload is retried
    pub queue_backoff_initial_ms: u64,
    /// Upper bound on the retry delay of a queued workload
    pub queue_backoff_max_secs: u64,
    /// Evict idle slots when nothing else fits
    pub evict_stale_slots: bool,
    /// A slot idle for this long may be evicted
    pub stale_slot_secs: u64,
    /// Scheduling decisions kept for introspection
    pub decision_log_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            slot_start_timeout_secs: 600,
            runner_timeout_secs: 30,
            liveness_interval_secs: 5,
            ranking: RankingPolicy::LeastLoaded,
            queue_backoff_initial_ms: 500,
            queue_backoff_max_secs: 30,
            evict_stale_slots: false,
            stale_slot_secs: 300,
            decision_log_size: 200,
        }
    }
}

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Runner identifier; defaults to the host name
    pub runner_id: Option<String>,
    /// Scheduler base URL status reports are pushed to
    pub scheduler_url: String,
    /// URL the scheduler should use to reach this runner's slot API
    pub advertise_url: Option<String>,
    /// Seconds between status reports
    pub report_interval_secs: u64,
    /// Seconds between hardware refreshes
    pub refresh_interval_secs: u64,
    /// Simulate a single GPU instead of querying hardware
    pub cpu_only: bool,
    /// Operator memory cap, also the simulated capacity in CPU-only mode
    #[serde(deserialize_with = "deserialize_optional_memory")]
    pub memory: Option<u64>,
    /// Capacity assumed when hardware detection fails
    #[serde(deserialize_with = "deserialize_memory")]
    pub fallback_memory: u64,
    /// Path to the vLLM executable
    pub vllm_path: PathBuf,
    /// Path to the Ollama executable
    pub ollama_path: PathBuf,
    /// First port handed to started runtimes
    pub runtime_base_port: u16,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runner_id: None,
            scheduler_url: "http://localhost:9090".to_string(),
            advertise_url: None,
            report_interval_secs: 5,
            refresh_interval_secs: 2,
            cpu_only: false,
            memory: None,
            fallback_memory: 16 * GIB,
            vllm_path: PathBuf::from("vllm"),
            ollama_path: PathBuf::from("ollama"),
            runtime_base_port: 31000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
