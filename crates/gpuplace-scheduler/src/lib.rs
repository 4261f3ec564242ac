//! gpuplace-scheduler: GPU placement for gpuplace
//!
//! This crate decides which GPUs on which runner host each workload:
//! - Allocation engine (single-GPU best fit, multi-GPU even split)
//! - Allocation ledger, the authoritative table of placements
//! - Runner registry with liveness tracking
//! - Runner ranking
//! - Decision log of recent placements
//! - Scheduler core driving the placement state machine

pub mod client;
pub mod decisions;
pub mod engine;
pub mod ledger;
pub mod ranking;
pub mod registry;
pub mod scheduler;

pub use client::{SlotClient, SlotTarget};
pub use decisions::{DecisionKind, DecisionLog, SchedulingDecision};
pub use ledger::{AllocationLedger, LedgerConflict, Overcommit};
pub use ranking::{Candidate, RankingStrategy};
pub use registry::RunnerRegistry;
pub use scheduler::{RunnerSummary, Scheduler, StatsSnapshot, WorkloadStatus};
