//! Runner registry: latest status per runner and when it was last heard from

use std::collections::HashMap;
use std::time::{Duration, Instant};

use gpuplace_core::{GpuplaceResult, RunnerStatus};
use tokio::sync::RwLock;
use tracing::{debug, info};

struct RunnerEntry {
    status: RunnerStatus,
    last_seen: Instant,
}

/// Read-mostly table of runner status snapshots
#[derive(Default)]
pub struct RunnerRegistry {
    runners: RwLock<HashMap<String, RunnerEntry>>,
}

impl RunnerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status report, replacing the previous one
    ///
    /// Returns `true` when the runner was not registered before.
    pub async fn ingest(&self, status: RunnerStatus) -> GpuplaceResult<bool> {
        status.validate()?;

        let runner_id = status.runner_id.clone();
        let gpu_count = status.gpu_count;
        let degraded = status.degraded;

        let previous = self.runners.write().await.insert(
            runner_id.clone(),
            RunnerEntry {
                status,
                last_seen: Instant::now(),
            },
        );

        if previous.is_none() {
            info!(
                runner_id = %runner_id,
                gpus = gpu_count,
                degraded = degraded,
                "Runner registered"
            );
        } else {
            debug!(runner_id = %runner_id, "Runner status updated");
        }

        Ok(previous.is_none())
    }

    /// Latest status of a runner
    pub async fn get(&self, runner_id: &str) -> Option<RunnerStatus> {
        self.runners
            .read()
            .await
            .get(runner_id)
            .map(|e| e.status.clone())
    }

    /// Time since the runner last reported
    pub async fn last_seen(&self, runner_id: &str) -> Option<Duration> {
        self.runners
            .read()
            .await
            .get(runner_id)
            .map(|e| e.last_seen.elapsed())
    }

    /// Every runner's latest status, ordered by runner id
    pub async fn snapshot(&self) -> Vec<RunnerStatus> {
        let mut all: Vec<RunnerStatus> = self
            .runners
            .read()
            .await
            .values()
            .map(|e| e.status.clone())
            .collect();
        all.sort_by(|a, b| a.runner_id.cmp(&b.runner_id));
        all
    }

    /// Forget a runner
    pub async fn remove(&self, runner_id: &str) -> Option<RunnerStatus> {
        self.runners
            .write()
            .await
            .remove(runner_id)
            .map(|e| e.status)
    }

    /// Remove and return runners silent for longer than `timeout`
    pub async fn remove_stale(&self, timeout: Duration) -> Vec<String> {
        let mut runners = self.runners.write().await;
        let stale: Vec<String> = runners
            .iter()
            .filter(|(_, e)| e.last_seen.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            runners.remove(id);
        }
        stale
    }

    /// Number of registered runners
    pub async fn len(&self) -> usize {
        self.runners.read().await.len()
    }

    /// Whether no runner is registered
    pub async fn is_empty(&self) -> bool {
        self.runners.read().await.is_empty()
    }
}
