//! Workload, placement, allocation and slot type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::memory::deserialize_memory;
use crate::{GpuplaceError, GpuplaceResult};

/// Identifier of a submitted workload
pub type WorkloadId = Uuid;

/// Identifier of a runner machine
pub type RunnerId = String;

/// Supported model runtimes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Vllm,
    Ollama,
}

impl std::fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeKind::Vllm => write!(f, "vllm"),
            RuntimeKind::Ollama => write!(f, "ollama"),
        }
    }
}

impl std::str::FromStr for RuntimeKind {
    type Err = GpuplaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vllm" => Ok(RuntimeKind::Vllm),
            "ollama" => Ok(RuntimeKind::Ollama),
            other => Err(GpuplaceError::Config(format!("unknown runtime '{}'", other))),
        }
    }
}

/// Constraint on how many GPUs a model may be split across
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelismConstraint {
    /// GPU count must evenly divide this number (e.g. attention heads)
    DivisorOf(u32),
    /// GPU count must not exceed this number
    AtMost(u32),
}

impl ParallelismConstraint {
    /// Whether splitting across `gpu_count` GPUs is allowed
    pub fn allows(&self, gpu_count: u32) -> bool {
        match *self {
            ParallelismConstraint::DivisorOf(n) => gpu_count != 0 && n % gpu_count == 0,
            ParallelismConstraint::AtMost(max) => gpu_count <= max,
        }
    }
}

/// A pending or running inference request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    /// Unique workload identifier
    #[serde(default = "Uuid::new_v4")]
    pub id: WorkloadId,
    /// Model reference
    pub model: String,
    /// Runtime that will host the model
    pub runtime: RuntimeKind,
    /// Memory the model needs, in bytes
    #[serde(deserialize_with = "deserialize_memory")]
    pub model_memory_requirement_bytes: u64,
    /// Context length passed to the runtime
    #[serde(default)]
    pub context_length: u32,
    /// Extra runtime arguments
    #[serde(default)]
    pub runtime_args: Vec<String>,
    /// Optional tensor-parallelism constraint
    #[serde(default)]
    pub parallelism: Option<ParallelismConstraint>,
}

impl Workload {
    /// Create a workload with default values
    pub fn new(model: impl Into<String>, runtime: RuntimeKind, memory_bytes: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            model: model.into(),
            runtime,
            model_memory_requirement_bytes: memory_bytes,
            context_length: 0,
            runtime_args: Vec::new(),
            parallelism: None,
        }
    }

    /// Attach a parallelism constraint
    pub fn with_parallelism(mut self, constraint: ParallelismConstraint) -> Self {
        self.parallelism = Some(constraint);
        self
    }

    /// Reject workloads the scheduler cannot reason about
    pub fn validate(&self) -> GpuplaceResult<()> {
        if self.model.trim().is_empty() {
            return Err(GpuplaceError::Config("workload has no model".to_string()));
        }
        if self.model_memory_requirement_bytes == 0 {
            return Err(GpuplaceError::InvalidMemory(format!(
                "workload {} requires zero bytes",
                self.id
            )));
        }
        if let Some(ParallelismConstraint::DivisorOf(0)) = self.parallelism {
            return Err(GpuplaceError::Config(
                "parallelism divisor must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where a model lands on one runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Placement {
    /// Whole model on one GPU
    Single { gpu_index: u32 },
    /// Model split evenly across several GPUs, indices ascending
    Multi { gpu_indices: Vec<u32> },
}

impl Placement {
    /// All GPU indices this placement touches
    pub fn gpu_indices(&self) -> Vec<u32> {
        match self {
            Placement::Single { gpu_index } => vec![*gpu_index],
            Placement::Multi { gpu_indices } => gpu_indices.clone(),
        }
    }

    /// Number of GPUs used
    pub fn gpu_count(&self) -> u32 {
        match self {
            Placement::Single { .. } => 1,
            Placement::Multi { gpu_indices } => gpu_indices.len() as u32,
        }
    }

    /// Tensor-parallel degree implied by the placement
    pub fn tensor_parallel_size(&self) -> u32 {
        self.gpu_count()
    }

    /// Whether the placement references a GPU
    pub fn uses_gpu(&self, index: u32) -> bool {
        match self {
            Placement::Single { gpu_index } => *gpu_index == index,
            Placement::Multi { gpu_indices } => gpu_indices.contains(&index),
        }
    }
}

/// Percentage of extra memory each GPU in a multi-GPU split must hold
pub const MULTI_GPU_OVERHEAD_PERCENT: u64 = 10;

/// Memory each GPU must provide when `requirement` is split across `gpu_count` GPUs
pub fn per_gpu_requirement(requirement: u64, gpu_count: u32) -> u64 {
    if gpu_count <= 1 {
        return requirement;
    }
    let share = requirement.div_ceil(gpu_count as u64) as u128;
    let with_overhead = (share * (100 + MULTI_GPU_OVERHEAD_PERCENT) as u128).div_ceil(100);
    u64::try_from(with_overhead).unwrap_or(u64::MAX)
}

/// The authoritative placement decision for one workload on one runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuAllocation {
    /// Workload this allocation belongs to
    pub workload_id: WorkloadId,
    /// Runner hosting the allocation
    pub runner_id: RunnerId,
    /// Chosen GPU(s)
    pub placement: Placement,
    /// Tensor-parallel degree handed to the runtime
    pub tensor_parallel_size: u32,
    /// Memory requirement of the workload in bytes
    pub memory_requirement_bytes: u64,
}

impl GpuAllocation {
    /// Create an allocation from an engine placement
    pub fn new(
        workload_id: WorkloadId,
        runner_id: impl Into<RunnerId>,
        placement: Placement,
        memory_requirement_bytes: u64,
    ) -> Self {
        let tensor_parallel_size = placement.tensor_parallel_size();
        Self {
            workload_id,
            runner_id: runner_id.into(),
            placement,
            tensor_parallel_size,
            memory_requirement_bytes,
        }
    }

    /// Single GPU index, if this is a single-GPU placement
    pub fn single_gpu_index(&self) -> Option<u32> {
        match &self.placement {
            Placement::Single { gpu_index } => Some(*gpu_index),
            Placement::Multi { .. } => None,
        }
    }

    /// Ordered GPU indices, if this is a multi-GPU placement
    pub fn multi_gpu_indices(&self) -> Option<&[u32]> {
        match &self.placement {
            Placement::Single { .. } => None,
            Placement::Multi { gpu_indices } => Some(gpu_indices),
        }
    }

    /// Bytes this allocation reserves on the given GPU
    pub fn reserved_on_gpu(&self, index: u32) -> u64 {
        if !self.placement.uses_gpu(index) {
            return 0;
        }
        per_gpu_requirement(self.memory_requirement_bytes, self.placement.gpu_count())
    }
}

/// Lifecycle state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    /// Slot-creation request in flight
    Starting,
    /// Runtime confirmed the model is loaded
    Running,
    /// Runtime started but could not honor the allocation exactly
    Degraded,
    /// Workload finished
    Completed,
    /// Slot was evicted
    Evicted,
    /// Runner disappeared while the slot was active
    Lost,
}

impl SlotState {
    /// Whether the slot still holds GPU memory
    pub fn is_active(&self) -> bool {
        matches!(self, SlotState::Starting | SlotState::Running | SlotState::Degraded)
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotState::Starting => write!(f, "Starting"),
            SlotState::Running => write!(f, "Running"),
            SlotState::Degraded => write!(f, "Degraded"),
            SlotState::Completed => write!(f, "Completed"),
            SlotState::Evicted => write!(f, "Evicted"),
            SlotState::Lost => write!(f, "Lost"),
        }
    }
}

/// A running instance of a model on a runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    /// Unique slot identifier
    pub id: Uuid,
    /// Workload served by this slot
    pub workload_id: WorkloadId,
    /// Runner hosting the slot
    pub runner_id: RunnerId,
    /// Model reference
    pub model: String,
    /// Runtime hosting the model
    pub runtime: RuntimeKind,
    /// Copy of the allocation for the slot's lifetime
    pub allocation: GpuAllocation,
    /// Current state
    pub state: SlotState,
    /// Degradation reason reported by the runtime
    pub note: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last time the slot served a request
    #[serde(default = "Utc::now")]
    pub last_activity_at: DateTime<Utc>,
}

impl Slot {
    /// Create a new slot for a committed allocation
    pub fn new(workload: &Workload, allocation: GpuAllocation) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workload_id: workload.id,
            runner_id: allocation.runner_id.clone(),
            model: workload.model.clone(),
            runtime: workload.runtime,
            allocation,
            state: SlotState::Starting,
            note: None,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Whether the slot has been idle for at least `idle`
    pub fn idle_for(&self, idle: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.last_activity_at >= idle
    }
}

/// Slot-creation request sent from the scheduler to a runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSlotRequest {
    /// Slot identifier chosen by the scheduler
    pub slot_id: Uuid,
    /// Runtime to start
    pub runtime: RuntimeKind,
    /// Model reference
    pub model: String,
    /// Memory requirement in bytes
    pub model_memory_requirement_bytes: u64,
    /// Context length
    #[serde(default)]
    pub context_length: u32,
    /// Extra runtime arguments
    #[serde(default)]
    pub runtime_args: Vec<String>,
    /// Single-GPU placement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_index: Option<u32>,
    /// Multi-GPU placement, ordered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_indices: Option<Vec<u32>>,
    /// 0 means the runtime may auto-select
    #[serde(default)]
    pub tensor_parallel_size: u32,
}

impl CreateSlotRequest {
    /// Build the request for a slot
    pub fn for_slot(slot: &Slot, workload: &Workload) -> Self {
        Self {
            slot_id: slot.id,
            runtime: workload.runtime,
            model: workload.model.clone(),
            model_memory_requirement_bytes: workload.model_memory_requirement_bytes,
            context_length: workload.context_length,
            runtime_args: workload.runtime_args.clone(),
            gpu_index: slot.allocation.single_gpu_index(),
            gpu_indices: slot.allocation.multi_gpu_indices().map(|g| g.to_vec()),
            tensor_parallel_size: slot.allocation.tensor_parallel_size,
        }
    }

    /// Visible device list, in order, if a placement was given
    pub fn visible_devices(&self) -> Option<Vec<u32>> {
        match (&self.gpu_indices, self.gpu_index) {
            (Some(indices), _) if !indices.is_empty() => Some(indices.clone()),
            (_, Some(index)) => Some(vec![index]),
            _ => None,
        }
    }
}

/// What the runtime adapter says after starting a slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SlotStartReport {
    /// Process started on exactly the requested GPUs
    Started,
    /// Process started but the allocation was not honored exactly
    Degraded { reason: String },
}

/// Placement state of a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementState {
    Pending,
    Filtering,
    Allocating,
    Committed,
    RuntimeStarting,
    Running,
    RuntimeFailed,
    Unschedulable,
    Completed,
    Evicted,
    Cancelled,
    Lost,
}

impl PlacementState {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlacementState::Unschedulable
                | PlacementState::Completed
                | PlacementState::Evicted
                | PlacementState::Cancelled
                | PlacementState::Lost
        )
    }

    /// Whether the workload has GPU memory committed in the ledger
    pub fn is_committed(&self) -> bool {
        matches!(
            self,
            PlacementState::Committed | PlacementState::RuntimeStarting | PlacementState::Running
        )
    }
}

impl std::fmt::Display for PlacementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlacementState::Pending => "Pending",
            PlacementState::Filtering => "Filtering",
            PlacementState::Allocating => "Allocating",
            PlacementState::Committed => "Committed",
            PlacementState::RuntimeStarting => "RuntimeStarting",
            PlacementState::Running => "Running",
            PlacementState::RuntimeFailed => "RuntimeFailed",
            PlacementState::Unschedulable => "Unschedulable",
            PlacementState::Completed => "Completed",
            PlacementState::Evicted => "Evicted",
            PlacementState::Cancelled => "Cancelled",
            PlacementState::Lost => "Lost",
        };
        write!(f, "{}", s)
    }
}

/// Why a workload could not be placed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnschedulableReason {
    /// No runner has reported status
    NoRunners,
    /// No runner/GPU combination fits the requirement right now
    NoFit { required_bytes: u64, runners_considered: usize },
    /// Every attempt failed at the runtime or lost a ledger race
    RetriesExhausted { attempts: u32, last_error: String },
}

impl UnschedulableReason {
    /// Whether new capacity could change the answer
    ///
    /// Workloads rejected for a retryable reason wait in the pending queue.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UnschedulableReason::NoRunners | UnschedulableReason::NoFit { .. }
        )
    }
}

impl std::fmt::Display for UnschedulableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnschedulableReason::NoRunners => write!(f, "no runners available"),
            UnschedulableReason::NoFit {
                required_bytes,
                runners_considered,
            } => write!(
                f,
                "no placement for {} across {} runner(s)",
                crate::format_bytes(*required_bytes),
                runners_considered
            ),
            UnschedulableReason::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {} attempt(s): {}", attempts, last_error),
        }
    }
}

/// Typed result of scheduling one workload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    /// A slot is running with a committed allocation
    Scheduled { slot: Slot },
    /// The workload cannot be placed right now
    Unschedulable { reason: UnschedulableReason },
    /// The workload was cancelled before it started
    Cancelled,
}

impl ScheduleOutcome {
    /// The slot, if scheduling succeeded
    pub fn slot(&self) -> Option<&Slot> {
        match self {
            ScheduleOutcome::Scheduled { slot } => Some(slot),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GIB;

    #[test]
    fn test_per_gpu_requirement_overhead() {
        assert_eq!(per_gpu_requirement(20 * GIB, 2), 11 * GIB);
        assert_eq!(per_gpu_requirement(20 * GIB, 1), 20 * GIB);
        // ceil(23/2) * 1.10 = 12.65 GiB
        let per = per_gpu_requirement(23 * GIB, 2);
        assert!(per > 12 * GIB);
        assert_eq!(per, (23 * GIB).div_ceil(2) * 110 / 100 + 1);
    }

    #[test]
    fn test_per_gpu_requirement_rounds_up() {
        assert_eq!(per_gpu_requirement(3, 2), 3);
        assert_eq!(per_gpu_requirement(10, 3), 5);
    }

    #[test]
    fn test_parallelism_constraint() {
        assert!(ParallelismConstraint::DivisorOf(32).allows(2));
        assert!(ParallelismConstraint::DivisorOf(32).allows(4));
        assert!(!ParallelismConstraint::DivisorOf(32).allows(3));
        assert!(!ParallelismConstraint::DivisorOf(32).allows(0));
        assert!(ParallelismConstraint::AtMost(2).allows(2));
        assert!(!ParallelismConstraint::AtMost(2).allows(3));
    }

    #[test]
    fn test_allocation_accessors() {
        let id = Uuid::new_v4();
        let single = GpuAllocation::new(id, "r1", Placement::Single { gpu_index: 1 }, 8 * GIB);
        assert_eq!(single.single_gpu_index(), Some(1));
        assert!(single.multi_gpu_indices().is_none());
        assert_eq!(single.tensor_parallel_size, 1);
        assert_eq!(single.reserved_on_gpu(1), 8 * GIB);
        assert_eq!(single.reserved_on_gpu(0), 0);

        let multi = GpuAllocation::new(
            id,
            "r1",
            Placement::Multi {
                gpu_indices: vec![0, 1],
            },
            20 * GIB,
        );
        assert_eq!(multi.single_gpu_index(), None);
        assert_eq!(multi.multi_gpu_indices(), Some(&[0, 1][..]));
        assert_eq!(multi.tensor_parallel_size, 2);
        assert_eq!(multi.reserved_on_gpu(0), 11 * GIB);
        assert_eq!(multi.reserved_on_gpu(2), 0);
    }

    #[test]
    fn test_create_slot_request_wire_format() {
        let workload = Workload::new("llama3:70b", RuntimeKind::Vllm, 20 * GIB);
        let allocation = GpuAllocation::new(
            workload.id,
            "r1",
            Placement::Multi {
                gpu_indices: vec![0, 1],
            },
            workload.model_memory_requirement_bytes,
        );
        let slot = Slot::new(&workload, allocation);
        let req = CreateSlotRequest::for_slot(&slot, &workload);

        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("gpu_index").is_none());
        assert_eq!(json["gpu_indices"], serde_json::json!([0, 1]));
        assert_eq!(json["tensor_parallel_size"], 2);
        assert_eq!(json["runtime"], "vllm");
        assert_eq!(req.visible_devices(), Some(vec![0, 1]));
    }

    #[test]
    fn test_retryable_reasons() {
        assert!(UnschedulableReason::NoRunners.is_retryable());
        assert!(UnschedulableReason::NoFit {
            required_bytes: GIB,
            runners_considered: 2
        }
        .is_retryable());
        assert!(!UnschedulableReason::RetriesExhausted {
            attempts: 3,
            last_error: "CUDA out of memory".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_slot_idle_time() {
        let workload = Workload::new("llama3:8b", RuntimeKind::Ollama, 4 * GIB);
        let allocation = GpuAllocation::new(
            workload.id,
            "r1",
            Placement::Single { gpu_index: 0 },
            4 * GIB,
        );
        let slot = Slot::new(&workload, allocation);
        assert_eq!(slot.created_at, slot.last_activity_at);

        let later = slot.last_activity_at + chrono::Duration::seconds(120);
        assert!(slot.idle_for(chrono::Duration::seconds(60), later));
        assert!(!slot.idle_for(chrono::Duration::seconds(300), later));
    }

    #[test]
    fn test_workload_memory_from_spec() {
        let json = r#"{"model": "qwen", "runtime": "ollama", "model_memory_requirement_bytes": "8GiB"}"#;
        let workload: Workload = serde_json::from_str(json).unwrap();
        assert_eq!(workload.model_memory_requirement_bytes, 8 * GIB);
        assert!(workload.validate().is_ok());
    }

    #[test]
    fn test_workload_validation() {
        let zero = Workload::new("m", RuntimeKind::Vllm, 0);
        assert!(zero.validate().is_err());

        let bad = Workload::new("m", RuntimeKind::Vllm, GIB)
            .with_parallelism(ParallelismConstraint::DivisorOf(0));
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_placement_state_classification() {
        assert!(PlacementState::Unschedulable.is_terminal());
        assert!(!PlacementState::RuntimeFailed.is_terminal());
        assert!(PlacementState::RuntimeStarting.is_committed());
        assert!(!PlacementState::Allocating.is_committed());
        assert_eq!(PlacementState::RuntimeStarting.to_string(), "RuntimeStarting");
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = ScheduleOutcome::Unschedulable {
            reason: UnschedulableReason::NoFit {
                required_bytes: GIB,
                runners_considered: 2,
            },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "unschedulable");
        assert_eq!(json["reason"]["reason"], "no_fit");
    }
}
