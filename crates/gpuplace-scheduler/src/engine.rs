//! Allocation engine: turns a memory requirement into a GPU placement
//!
//! Everything here is a pure function of its inputs. The caller supplies the
//! runner's *effective* capacity (reported memory minus what the ledger holds),
//! so the engine never needs to know what is already allocated.

use std::cmp::Reverse;
use std::collections::HashMap;

use gpuplace_core::{
    per_gpu_requirement, GpuAllocation, ParallelismConstraint, Placement, RunnerStatus,
};
use tracing::debug;
use uuid::Uuid;

/// Memory one GPU can still offer to new placements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuCapacity {
    /// Device ordinal
    pub index: u32,
    /// Total memory in bytes
    pub total_memory_bytes: u64,
    /// Effective free memory in bytes
    pub free_memory_bytes: u64,
}

/// Combine a status report with the ledger's per-GPU reservations
///
/// A GPU's effective free memory is the smaller of what the runner last
/// reported and what remains of its total once ledger reservations are
/// subtracted. Reservations the runner has not observed yet are covered by
/// the second term; memory already in use by a loaded model by the first.
pub fn effective_capacity(status: &RunnerStatus, reserved: &HashMap<u32, u64>) -> Vec<GpuCapacity> {
    status
        .gpus
        .iter()
        .map(|gpu| {
            let held = reserved.get(&gpu.index).copied().unwrap_or(0);
            let unreserved = gpu.total_memory_bytes.saturating_sub(held);
            GpuCapacity {
                index: gpu.index,
                total_memory_bytes: gpu.total_memory_bytes,
                free_memory_bytes: gpu.free_memory_bytes.min(unreserved),
            }
        })
        .collect()
}

/// Sum of effective free memory across a runner's GPUs
pub fn aggregate_free(gpus: &[GpuCapacity]) -> u64 {
    gpus.iter().map(|g| g.free_memory_bytes).sum()
}

/// Compute a placement, or `None` if the requirement does not fit
///
/// A single GPU is always preferred. Otherwise the smallest GPU count that
/// satisfies both the overhead-adjusted per-GPU requirement and the optional
/// parallelism constraint wins.
pub fn allocate(
    requirement: u64,
    gpus: &[GpuCapacity],
    constraint: Option<ParallelismConstraint>,
) -> Option<Placement> {
    if let Some(gpu_index) = single_gpu(requirement, gpus) {
        return Some(Placement::Single { gpu_index });
    }

    multi_gpu(requirement, gpus, constraint).map(|gpu_indices| Placement::Multi { gpu_indices })
}

/// GPU with the most free memory among those that fit, lowest index on ties
pub fn single_gpu(requirement: u64, gpus: &[GpuCapacity]) -> Option<u32> {
    gpus.iter()
        .filter(|g| g.free_memory_bytes >= requirement)
        .max_by_key(|g| (g.free_memory_bytes, Reverse(g.index)))
        .map(|g| g.index)
}

/// Smallest even split across two or more GPUs, indices ascending
pub fn multi_gpu(
    requirement: u64,
    gpus: &[GpuCapacity],
    constraint: Option<ParallelismConstraint>,
) -> Option<Vec<u32>> {
    let mut by_free: Vec<&GpuCapacity> = gpus.iter().collect();
    by_free.sort_by_key(|g| (Reverse(g.free_memory_bytes), g.index));

    for n in 2..=gpus.len() as u32 {
        if let Some(c) = constraint {
            if !c.allows(n) {
                debug!(gpus = n, constraint = ?c, "Split rejected by parallelism constraint");
                continue;
            }
        }

        let per_gpu = per_gpu_requirement(requirement, n);
        let chosen = &by_free[..n as usize];
        if chosen.iter().all(|g| g.free_memory_bytes >= per_gpu) {
            let mut indices: Vec<u32> = chosen.iter().map(|g| g.index).collect();
            indices.sort_unstable();
            return Some(indices);
        }

        debug!(
            gpus = n,
            per_gpu_bytes = per_gpu,
            "Split does not fit"
        );
    }

    None
}

/// Return an allocation's memory to the GPUs it reserved
///
/// Assumes the slot's process frees what it held, so the runner's next report
/// will show it as free again. Never exceeds a GPU's total.
pub fn release(gpus: &mut [GpuCapacity], allocation: &GpuAllocation) {
    for gpu in gpus.iter_mut() {
        let held = allocation.reserved_on_gpu(gpu.index);
        gpu.free_memory_bytes = gpu
            .free_memory_bytes
            .saturating_add(held)
            .min(gpu.total_memory_bytes);
    }
}

/// Find the shortest prefix of `evictable` whose release makes room
///
/// `evictable` is consumed in order, so callers put the slots they would
/// rather lose first. Returns the placement the requirement would get and
/// the slots to evict, or `None` when evicting all of them is not enough.
pub fn plan_eviction(
    requirement: u64,
    gpus: &[GpuCapacity],
    evictable: &[(Uuid, GpuAllocation)],
    constraint: Option<ParallelismConstraint>,
) -> Option<(Placement, Vec<Uuid>)> {
    let mut capacity = gpus.to_vec();
    let mut victims = Vec::new();

    for (slot_id, allocation) in evictable {
        release(&mut capacity, allocation);
        victims.push(*slot_id);
        if let Some(placement) = allocate(requirement, &capacity, constraint) {
            return Some((placement, victims));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuplace_core::{GpuInfo, GIB};

    fn capacity(free: &[u64]) -> Vec<GpuCapacity> {
        free.iter()
            .enumerate()
            .map(|(i, &f)| GpuCapacity {
                index: i as u32,
                total_memory_bytes: f.max(24 * GIB),
                free_memory_bytes: f,
            })
            .collect()
    }

    #[test]
    fn test_single_gpu_fit() {
        let gpus = capacity(&[24 * GIB]);
        assert_eq!(
            allocate(10 * GIB, &gpus, None),
            Some(Placement::Single { gpu_index: 0 })
        );
    }

    #[test]
    fn test_single_gpu_prefers_most_free() {
        let gpus = capacity(&[12 * GIB, 20 * GIB, 16 * GIB]);
        assert_eq!(single_gpu(10 * GIB, &gpus), Some(1));
    }

    #[test]
    fn test_single_gpu_tie_breaks_on_lowest_index() {
        let gpus = capacity(&[8 * GIB, 16 * GIB, 16 * GIB]);
        assert_eq!(single_gpu(10 * GIB, &gpus), Some(1));
    }

    #[test]
    fn test_two_way_split() {
        let gpus = capacity(&[12 * GIB, 12 * GIB]);
        assert_eq!(
            allocate(20 * GIB, &gpus, None),
            Some(Placement::Multi {
                gpu_indices: vec![0, 1]
            })
        );
    }

    #[test]
    fn test_split_overhead_rejects() {
        // ceil(23/2) * 1.10 = 12.65 GiB per GPU
        let gpus = capacity(&[12 * GIB, 12 * GIB]);
        assert_eq!(allocate(23 * GIB, &gpus, None), None);
    }

    #[test]
    fn test_split_exactly_at_overhead_boundary() {
        let per_gpu = per_gpu_requirement(20 * GIB, 2);
        let gpus = capacity(&[per_gpu, per_gpu]);
        assert!(multi_gpu(20 * GIB, &gpus, None).is_some());

        let gpus = capacity(&[per_gpu, per_gpu - 1]);
        assert!(multi_gpu(20 * GIB, &gpus, None).is_none());
    }

    #[test]
    fn test_split_prefers_smallest_count() {
        let gpus = capacity(&[16 * GIB, 16 * GIB, 16 * GIB, 16 * GIB]);
        assert_eq!(multi_gpu(24 * GIB, &gpus, None), Some(vec![0, 1]));
    }

    #[test]
    fn test_split_uses_freest_gpus_in_ascending_order() {
        let gpus = capacity(&[4 * GIB, 12 * GIB, 2 * GIB, 12 * GIB]);
        assert_eq!(multi_gpu(20 * GIB, &gpus, None), Some(vec![1, 3]));
    }

    #[test]
    fn test_divisor_constraint_skips_invalid_counts() {
        // Three GPUs would fit, but 3 does not divide 32
        let gpus = capacity(&[10 * GIB, 10 * GIB, 10 * GIB, 10 * GIB]);
        let constraint = Some(ParallelismConstraint::DivisorOf(32));
        assert_eq!(
            multi_gpu(26 * GIB, &gpus, constraint),
            Some(vec![0, 1, 2, 3])
        );
        assert_eq!(multi_gpu(26 * GIB, &gpus, None), Some(vec![0, 1, 2]));
    }

    #[test]
    fn test_constraint_with_no_valid_count() {
        let gpus = capacity(&[10 * GIB, 10 * GIB, 10 * GIB]);
        let constraint = Some(ParallelismConstraint::DivisorOf(7));
        assert_eq!(allocate(20 * GIB, &gpus, constraint), None);
    }

    #[test]
    fn test_constraint_does_not_block_single_gpu() {
        let gpus = capacity(&[24 * GIB]);
        let constraint = Some(ParallelismConstraint::DivisorOf(7));
        assert_eq!(
            allocate(8 * GIB, &gpus, constraint),
            Some(Placement::Single { gpu_index: 0 })
        );
    }

    #[test]
    fn test_no_gpus() {
        assert_eq!(allocate(GIB, &[], None), None);
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let gpus = capacity(&[12 * GIB, 16 * GIB, 16 * GIB, 12 * GIB]);
        let first = allocate(28 * GIB, &gpus, None);
        for _ in 0..50 {
            assert_eq!(allocate(28 * GIB, &gpus, None), first);
        }
    }

    #[test]
    fn test_effective_capacity_subtracts_reservations() {
        let status = RunnerStatus::from_gpus(
            "r1",
            vec![GpuInfo::idle(0, 24 * GIB), GpuInfo::idle(1, 24 * GIB)],
            false,
        );
        let reserved = HashMap::from([(0, 8 * GIB)]);
        let gpus = effective_capacity(&status, &reserved);
        assert_eq!(gpus[0].free_memory_bytes, 16 * GIB);
        assert_eq!(gpus[1].free_memory_bytes, 24 * GIB);
        assert_eq!(aggregate_free(&gpus), 40 * GIB);
    }

    #[test]
    fn test_effective_capacity_does_not_double_count() {
        // Runner already reports the reserved model as used memory
        let mut gpu = GpuInfo::idle(0, 24 * GIB);
        gpu.used_memory_bytes = 8 * GIB;
        gpu.free_memory_bytes = 16 * GIB;
        let status = RunnerStatus::from_gpus("r1", vec![gpu], false);
        let reserved = HashMap::from([(0, 8 * GIB)]);
        let gpus = effective_capacity(&status, &reserved);
        assert_eq!(gpus[0].free_memory_bytes, 16 * GIB);
    }

    fn held(gpu_index: u32, memory: u64) -> (Uuid, GpuAllocation) {
        let allocation =
            GpuAllocation::new(Uuid::new_v4(), "r1", Placement::Single { gpu_index }, memory);
        (Uuid::new_v4(), allocation)
    }

    #[test]
    fn test_release_is_capped_at_total() {
        let mut gpus = capacity(&[4 * GIB, 20 * GIB]);
        release(&mut gpus, &held(1, 8 * GIB).1);
        assert_eq!(gpus[0].free_memory_bytes, 4 * GIB);
        assert_eq!(gpus[1].free_memory_bytes, 24 * GIB);
    }

    #[test]
    fn test_plan_eviction_takes_shortest_prefix() {
        // Two 8 GiB slots on GPU 0, one 6 GiB slot on GPU 1
        let gpus = capacity(&[8 * GIB, 10 * GIB]);
        let evictable = vec![held(0, 8 * GIB), held(1, 6 * GIB), held(0, 8 * GIB)];
        assert_eq!(allocate(16 * GIB, &gpus, None), None);

        let (placement, victims) = plan_eviction(16 * GIB, &gpus, &evictable, None).unwrap();
        assert_eq!(placement, Placement::Single { gpu_index: 0 });
        assert_eq!(victims, vec![evictable[0].0]);

        let (placement, victims) = plan_eviction(24 * GIB, &gpus, &evictable, None).unwrap();
        assert_eq!(
            placement,
            Placement::Multi {
                gpu_indices: vec![0, 1]
            }
        );
        assert_eq!(victims, vec![evictable[0].0, evictable[1].0]);
    }

    #[test]
    fn test_plan_eviction_not_enough() {
        let gpus = capacity(&[8 * GIB]);
        let evictable = vec![held(0, 8 * GIB)];
        assert_eq!(plan_eviction(32 * GIB, &gpus, &evictable, None), None);
        assert_eq!(plan_eviction(GIB, &gpus, &[], None), None);
    }
}
