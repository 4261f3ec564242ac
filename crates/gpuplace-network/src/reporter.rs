//! Runner status reporter
//!
//! Packages the inventory tracker's latest snapshot into a [`RunnerStatus`]
//! and pushes it to the scheduler on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use gpuplace_core::{GpuplaceError, GpuplaceResult, RunnerConfig, RunnerStatus};
use gpuplace_runtime::InventoryTracker;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reporter configuration
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Base URL of the scheduler API
    pub scheduler_url: String,
    /// URL the scheduler should use to reach this runner's slot API
    pub advertise_url: Option<String>,
    /// Time between reports
    pub interval: Duration,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            scheduler_url: "http://localhost:9090".to_string(),
            advertise_url: None,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
        }
    }
}

impl ReporterConfig {
    /// Derive reporter settings from the runner configuration
    pub fn from_runner(config: &RunnerConfig) -> Self {
        Self {
            scheduler_url: config.scheduler_url.clone(),
            advertise_url: config.advertise_url.clone(),
            interval: Duration::from_secs(config.report_interval_secs.max(1)),
            ..Default::default()
        }
    }
}

/// Periodically ships the runner's inventory to the scheduler
pub struct StatusReporter {
    config: ReporterConfig,
    tracker: Arc<InventoryTracker>,
    client: reqwest::Client,
}

impl StatusReporter {
    /// Create a new reporter
    pub fn new(config: ReporterConfig, tracker: Arc<InventoryTracker>) -> GpuplaceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GpuplaceError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            tracker,
            client,
        })
    }

    /// Status ingestion URL for this runner
    pub fn status_url(&self) -> String {
        format!(
            "{}/api/v1/runners/{}/status",
            self.config.scheduler_url.trim_end_matches('/'),
            self.tracker.runner_id()
        )
    }

    /// Build the status record to send
    pub async fn build_status(&self) -> RunnerStatus {
        let status = self.tracker.snapshot().await;
        match &self.config.advertise_url {
            Some(url) => status.with_endpoint(url.trim_end_matches('/')),
            None => status,
        }
    }

    /// Send one report
    pub async fn report_once(&self) -> GpuplaceResult<()> {
        let status = self.build_status().await;
        let url = self.status_url();

        let response = self
            .client
            .post(&url)
            .json(&status)
            .send()
            .await
            .map_err(|e| GpuplaceError::Network(format!("status report to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            let code = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GpuplaceError::Network(format!(
                "scheduler rejected status ({}): {}",
                code, body
            )));
        }

        debug!(
            runner_id = %status.runner_id,
            gpus = status.gpu_count,
            free = status.free_memory_bytes,
            degraded = status.degraded,
            "Status reported"
        );
        Ok(())
    }

    /// Report on the configured interval until the task is aborted
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                runner_id = %self.tracker.runner_id(),
                scheduler = %self.config.scheduler_url,
                interval_secs = self.config.interval.as_secs(),
                "Starting status reporter"
            );

            let mut interval = tokio::time::interval(self.config.interval);
            let mut connected = false;
            loop {
                interval.tick().await;
                match self.report_once().await {
                    Ok(()) => {
                        if !connected {
                            info!(runner_id = %self.tracker.runner_id(), "Connected to scheduler");
                            connected = true;
                        }
                    }
                    Err(e) => {
                        warn!(runner_id = %self.tracker.runner_id(), error = %e, "Status report failed");
                        connected = false;
                    }
                }
            }
        })
    }
}
