//! GPU inventory records and runner status reports

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{GpuplaceError, GpuplaceResult};

/// Memory figures for one physical GPU on a runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    /// Device ordinal, unique within a runner
    pub index: u32,
    /// Device name as reported by the driver
    #[serde(default)]
    pub name: String,
    /// Total memory in bytes
    pub total_memory_bytes: u64,
    /// Free memory in bytes
    pub free_memory_bytes: u64,
    /// Used memory in bytes
    pub used_memory_bytes: u64,
}

impl GpuInfo {
    /// A GPU with nothing loaded on it
    pub fn idle(index: u32, total_memory_bytes: u64) -> Self {
        Self {
            index,
            name: format!("GPU {}", index),
            total_memory_bytes,
            free_memory_bytes: total_memory_bytes,
            used_memory_bytes: 0,
        }
    }
}

/// A runner's full inventory snapshot, sent to the scheduler every few seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerStatus {
    /// Runner identifier
    pub runner_id: String,
    /// Number of GPUs on the runner
    pub gpu_count: u32,
    /// Per-GPU memory, ordered by index
    pub gpus: Vec<GpuInfo>,
    /// Sum of total memory across GPUs
    pub total_memory_bytes: u64,
    /// Sum of free memory across GPUs
    pub free_memory_bytes: u64,
    /// Sum of used memory across GPUs
    pub used_memory_bytes: u64,
    /// Inventory was synthesized rather than read from hardware
    #[serde(default)]
    pub degraded: bool,
    /// Base URL of the runner's slot API
    #[serde(default)]
    pub endpoint: Option<String>,
    /// When the snapshot was taken
    #[serde(default = "Utc::now")]
    pub reported_at: DateTime<Utc>,
}

impl RunnerStatus {
    /// Build a status from per-GPU records, computing the aggregates
    pub fn from_gpus(runner_id: impl Into<String>, mut gpus: Vec<GpuInfo>, degraded: bool) -> Self {
        gpus.sort_by_key(|g| g.index);
        let total_memory_bytes = gpus.iter().map(|g| g.total_memory_bytes).sum();
        let free_memory_bytes = gpus.iter().map(|g| g.free_memory_bytes).sum();
        let used_memory_bytes = gpus.iter().map(|g| g.used_memory_bytes).sum();

        Self {
            runner_id: runner_id.into(),
            gpu_count: gpus.len() as u32,
            gpus,
            total_memory_bytes,
            free_memory_bytes,
            used_memory_bytes,
            degraded,
            endpoint: None,
            reported_at: Utc::now(),
        }
    }

    /// Attach the runner's slot API endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Look up a GPU by its index
    pub fn gpu(&self, index: u32) -> Option<&GpuInfo> {
        self.gpus.iter().find(|g| g.index == index)
    }

    /// Check the report is internally consistent
    pub fn validate(&self) -> GpuplaceResult<()> {
        if self.runner_id.trim().is_empty() {
            return Err(GpuplaceError::InvalidStatus("empty runner id".to_string()));
        }

        if self.gpu_count as usize != self.gpus.len() {
            return Err(GpuplaceError::InvalidStatus(format!(
                "gpu_count {} does not match {} reported GPUs",
                self.gpu_count,
                self.gpus.len()
            )));
        }

        let mut seen = HashSet::new();
        for gpu in &self.gpus {
            if !seen.insert(gpu.index) {
                return Err(GpuplaceError::InvalidStatus(format!(
                    "duplicate GPU index {}",
                    gpu.index
                )));
            }
            let accounted = gpu.free_memory_bytes.checked_add(gpu.used_memory_bytes);
            if accounted.map_or(true, |sum| sum > gpu.total_memory_bytes) {
                return Err(GpuplaceError::InvalidStatus(format!(
                    "GPU {} reports more free+used than total memory",
                    gpu.index
                )));
            }
        }

        let free: u64 = self.gpus.iter().map(|g| g.free_memory_bytes).sum();
        if free != self.free_memory_bytes {
            return Err(GpuplaceError::InvalidStatus(format!(
                "aggregate free memory {} differs from per-GPU sum {}",
                self.free_memory_bytes, free
            )));
        }

        let total: u64 = self.gpus.iter().map(|g| g.total_memory_bytes).sum();
        if total != self.total_memory_bytes {
            return Err(GpuplaceError::InvalidStatus(format!(
                "aggregate total memory {} differs from per-GPU sum {}",
                self.total_memory_bytes, total
            )));
        }

        Ok(())
    }
}

/// Cap the inventory's total memory at `cap` bytes
///
/// Per-GPU totals shrink proportionally; used memory is kept and free memory
/// is whatever remains under the new total.
pub fn apply_memory_cap(gpus: &mut [GpuInfo], cap: u64) {
    let total: u64 = gpus.iter().map(|g| g.total_memory_bytes).sum();
    if total == 0 || cap >= total {
        return;
    }

    for gpu in gpus.iter_mut() {
        let scaled = (gpu.total_memory_bytes as u128 * cap as u128 / total as u128) as u64;
        gpu.total_memory_bytes = scaled;
        gpu.used_memory_bytes = gpu.used_memory_bytes.min(scaled);
        gpu.free_memory_bytes = scaled - gpu.used_memory_bytes;
    }
}
