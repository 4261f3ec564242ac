//! Allocation ledger: the authoritative table of active GPU allocations

use std::collections::HashMap;

use gpuplace_core::{GpuAllocation, RunnerStatus, WorkloadId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::engine::{effective_capacity, GpuCapacity};

type LedgerKey = (WorkloadId, String);
type EntriesMap = HashMap<LedgerKey, GpuAllocation>;

/// A reservation lost a race against a concurrent one
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerConflict {
    /// The allocation names a GPU the runner does not report
    #[error("runner {runner_id} has no GPU {gpu_index}")]
    UnknownGpu { runner_id: String, gpu_index: u32 },

    /// Not enough unreserved memory left on a GPU
    #[error("GPU {gpu_index} on runner {runner_id} needs {required} bytes, {available} available")]
    Insufficient {
        runner_id: String,
        gpu_index: u32,
        required: u64,
        available: u64,
    },
}

/// A GPU whose reservations exceed its total memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overcommit {
    pub runner_id: String,
    pub gpu_index: u32,
    pub reserved_bytes: u64,
    /// Zero when the runner no longer reports the GPU
    pub total_memory_bytes: u64,
}

/// Concurrency-safe store of allocations keyed by (workload, runner)
///
/// Every read and write goes through one lock, so callers computing free
/// memory for a runner always see a whole set of allocations.
#[derive(Default)]
pub struct AllocationLedger {
    entries: RwLock<EntriesMap>,
}

impl AllocationLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite an allocation
    pub async fn store(&self, allocation: GpuAllocation) -> Option<GpuAllocation> {
        let key = (allocation.workload_id, allocation.runner_id.clone());
        debug!(
            workload_id = %allocation.workload_id,
            runner_id = %allocation.runner_id,
            gpus = ?allocation.placement.gpu_indices(),
            "Stored allocation"
        );
        self.entries.write().await.insert(key, allocation)
    }

    /// Insert an allocation only if every GPU it touches still has room
    ///
    /// Capacity is recomputed from `status` and the ledger's contents while
    /// holding the write lock, so two concurrent reservations can never both
    /// claim the same free memory. An existing entry under the same key is
    /// replaced and does not count against the new one.
    pub async fn reserve(
        &self,
        allocation: GpuAllocation,
        status: &RunnerStatus,
    ) -> Result<(), LedgerConflict> {
        let key = (allocation.workload_id, allocation.runner_id.clone());
        let mut entries = self.entries.write().await;

        let reserved = reserved_per_gpu(
            entries
                .iter()
                .filter(|(k, _)| k.1 == allocation.runner_id && **k != key)
                .map(|(_, a)| a),
        );
        let capacity = effective_capacity(status, &reserved);

        for gpu_index in allocation.placement.gpu_indices() {
            let gpu = capacity
                .iter()
                .find(|g| g.index == gpu_index)
                .ok_or_else(|| LedgerConflict::UnknownGpu {
                    runner_id: allocation.runner_id.clone(),
                    gpu_index,
                })?;

            let required = allocation.reserved_on_gpu(gpu_index);
            if gpu.free_memory_bytes < required {
                return Err(LedgerConflict::Insufficient {
                    runner_id: allocation.runner_id.clone(),
                    gpu_index,
                    required,
                    available: gpu.free_memory_bytes,
                });
            }
        }

        info!(
            workload_id = %allocation.workload_id,
            runner_id = %allocation.runner_id,
            gpus = ?allocation.placement.gpu_indices(),
            memory_bytes = allocation.memory_requirement_bytes,
            "Reserved allocation"
        );
        entries.insert(key, allocation);
        Ok(())
    }

    /// Look up an allocation
    pub async fn get(&self, workload_id: WorkloadId, runner_id: &str) -> Option<GpuAllocation> {
        self.entries
            .read()
            .await
            .get(&(workload_id, runner_id.to_string()))
            .cloned()
    }

    /// Remove an allocation; removing a missing entry is a no-op
    pub async fn clear(&self, workload_id: WorkloadId, runner_id: &str) -> Option<GpuAllocation> {
        let removed = self
            .entries
            .write()
            .await
            .remove(&(workload_id, runner_id.to_string()));
        if removed.is_some() {
            debug!(workload_id = %workload_id, runner_id = %runner_id, "Cleared allocation");
        }
        removed
    }

    /// Remove every allocation on a runner
    pub async fn clear_all_for_runner(&self, runner_id: &str) -> Vec<GpuAllocation> {
        let mut entries = self.entries.write().await;
        let keys: Vec<LedgerKey> = entries
            .keys()
            .filter(|(_, r)| r == runner_id)
            .cloned()
            .collect();

        let removed: Vec<GpuAllocation> = keys.iter().filter_map(|k| entries.remove(k)).collect();
        if !removed.is_empty() {
            info!(
                runner_id = %runner_id,
                count = removed.len(),
                "Cleared all allocations for runner"
            );
        }
        removed
    }

    /// Allocations held on a runner
    pub async fn for_runner(&self, runner_id: &str) -> Vec<GpuAllocation> {
        self.entries
            .read()
            .await
            .values()
            .filter(|a| a.runner_id == runner_id)
            .cloned()
            .collect()
    }

    /// Every allocation, ordered by runner then workload
    pub async fn list(&self) -> Vec<GpuAllocation> {
        let mut all: Vec<GpuAllocation> = self.entries.read().await.values().cloned().collect();
        all.sort_by(|a, b| {
            a.runner_id
                .cmp(&b.runner_id)
                .then(a.workload_id.cmp(&b.workload_id))
        });
        all
    }

    /// Bytes reserved per GPU index on a runner
    pub async fn allocated_per_gpu(&self, runner_id: &str) -> HashMap<u32, u64> {
        let entries = self.entries.read().await;
        reserved_per_gpu(entries.values().filter(|a| a.runner_id == runner_id))
    }

    /// Effective per-GPU capacity of a runner, read under one lock
    pub async fn capacity(&self, status: &RunnerStatus) -> Vec<GpuCapacity> {
        let reserved = self.allocated_per_gpu(&status.runner_id).await;
        effective_capacity(status, &reserved)
    }

    /// GPUs of a runner holding more reservations than they have memory
    ///
    /// `reserve` makes this impossible; a non-empty result means an entry
    /// was stored unchecked or the runner reported shrunken hardware.
    pub async fn overcommitted(&self, status: &RunnerStatus) -> Vec<Overcommit> {
        let reserved = self.allocated_per_gpu(&status.runner_id).await;
        let mut found: Vec<Overcommit> = reserved
            .into_iter()
            .filter_map(|(gpu_index, reserved_bytes)| {
                let total = status
                    .gpus
                    .iter()
                    .find(|g| g.index == gpu_index)
                    .map_or(0, |g| g.total_memory_bytes);
                (reserved_bytes > total).then(|| Overcommit {
                    runner_id: status.runner_id.clone(),
                    gpu_index,
                    reserved_bytes,
                    total_memory_bytes: total,
                })
            })
            .collect();
        found.sort_by_key(|o| o.gpu_index);
        found
    }

    /// Number of active allocations
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the ledger holds nothing
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn reserved_per_gpu<'a>(allocations: impl Iterator<Item = &'a GpuAllocation>) -> HashMap<u32, u64> {
    let mut reserved: HashMap<u32, u64> = HashMap::new();
    for allocation in allocations {
        for index in allocation.placement.gpu_indices() {
            *reserved.entry(index).or_insert(0) += allocation.reserved_on_gpu(index);
        }
    }
    reserved
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuplace_core::{GpuInfo, Placement, GIB};
    use std::sync::Arc;
    use uuid::Uuid;

    fn status(runner: &str, gpus: &[u64]) -> RunnerStatus {
        RunnerStatus::from_gpus(
            runner,
            gpus.iter()
                .enumerate()
                .map(|(i, &t)| GpuInfo::idle(i as u32, t))
                .collect(),
            false,
        )
    }

    fn single(runner: &str, gpu: u32, bytes: u64) -> GpuAllocation {
        GpuAllocation::new(Uuid::new_v4(), runner, Placement::Single { gpu_index: gpu }, bytes)
    }

    #[tokio::test]
    async fn test_store_get_clear() {
        let ledger = AllocationLedger::new();
        let allocation = single("r1", 0, 8 * GIB);
        let id = allocation.workload_id;

        assert!(ledger.store(allocation.clone()).await.is_none());
        assert_eq!(ledger.get(id, "r1").await, Some(allocation));
        assert!(ledger.get(id, "r2").await.is_none());

        assert!(ledger.clear(id, "r1").await.is_some());
        assert!(ledger.get(id, "r1").await.is_none());
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let ledger = AllocationLedger::new();
        let allocation = single("r1", 0, 8 * GIB);
        let id = allocation.workload_id;
        ledger.store(allocation).await;

        ledger.clear(id, "r1").await;
        assert!(ledger.clear(id, "r1").await.is_none());
        assert!(ledger.is_empty().await);
        assert!(ledger.allocated_per_gpu("r1").await.is_empty());
    }

    #[tokio::test]
    async fn test_store_overwrites() {
        let ledger = AllocationLedger::new();
        let mut allocation = single("r1", 0, 8 * GIB);
        ledger.store(allocation.clone()).await;

        allocation.placement = Placement::Single { gpu_index: 1 };
        let previous = ledger.store(allocation.clone()).await;
        assert_eq!(previous.map(|a| a.placement), Some(Placement::Single { gpu_index: 0 }));
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_clear_all_for_runner() {
        let ledger = AllocationLedger::new();
        ledger.store(single("r1", 0, 8 * GIB)).await;
        ledger.store(single("r1", 1, 8 * GIB)).await;
        ledger.store(single("r2", 0, 8 * GIB)).await;

        let removed = ledger.clear_all_for_runner("r1").await;
        assert_eq!(removed.len(), 2);
        assert!(ledger.for_runner("r1").await.is_empty());
        assert_eq!(ledger.for_runner("r2").await.len(), 1);
        assert!(ledger.clear_all_for_runner("r1").await.is_empty());
    }

    #[tokio::test]
    async fn test_allocated_per_gpu_counts_split_share() {
        let ledger = AllocationLedger::new();
        ledger.store(single("r1", 0, 4 * GIB)).await;
        ledger
            .store(GpuAllocation::new(
                Uuid::new_v4(),
                "r1",
                Placement::Multi {
                    gpu_indices: vec![0, 1],
                },
                20 * GIB,
            ))
            .await;

        let per_gpu = ledger.allocated_per_gpu("r1").await;
        assert_eq!(per_gpu[&0], 15 * GIB);
        assert_eq!(per_gpu[&1], 11 * GIB);
    }

    #[tokio::test]
    async fn test_reserve_rejects_overcommit() {
        let ledger = AllocationLedger::new();
        let status = status("r1", &[24 * GIB]);

        ledger.reserve(single("r1", 0, 16 * GIB), &status).await.unwrap();
        let conflict = ledger
            .reserve(single("r1", 0, 10 * GIB), &status)
            .await
            .unwrap_err();
        assert!(matches!(
            conflict,
            LedgerConflict::Insufficient { gpu_index: 0, .. }
        ));
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_reserve_unknown_gpu() {
        let ledger = AllocationLedger::new();
        let status = status("r1", &[24 * GIB]);
        let result = ledger.reserve(single("r1", 3, GIB), &status).await;
        assert!(matches!(result, Err(LedgerConflict::UnknownGpu { gpu_index: 3, .. })));
    }

    #[tokio::test]
    async fn test_reserve_replaces_own_entry() {
        let ledger = AllocationLedger::new();
        let status = status("r1", &[24 * GIB]);
        let allocation = single("r1", 0, 20 * GIB);

        ledger.reserve(allocation.clone(), &status).await.unwrap();
        ledger.reserve(allocation, &status).await.unwrap();
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_overcommit() {
        let ledger = Arc::new(AllocationLedger::new());
        let status = Arc::new(status("r1", &[24 * GIB, 24 * GIB]));

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let ledger = ledger.clone();
                let status = status.clone();
                tokio::spawn(async move {
                    ledger
                        .reserve(single("r1", i % 2, 10 * GIB), &status)
                        .await
                        .is_ok()
                })
            })
            .collect();

        let mut granted = 0;
        for result in futures::future::join_all(tasks).await {
            if result.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, 4);
        let per_gpu = ledger.allocated_per_gpu("r1").await;
        for gpu in &status.gpus {
            assert!(per_gpu.get(&gpu.index).copied().unwrap_or(0) <= gpu.total_memory_bytes);
        }
    }
}
