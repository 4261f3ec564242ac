//! Bounded log of recent scheduling decisions

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use gpuplace_core::WorkloadId;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// What the scheduler decided for a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// A slot started
    Scheduled,
    /// Nothing fits right now; the workload waits for capacity
    Queued,
    /// Placement gave up for good
    Unschedulable,
    /// Another placement claimed the capacity first
    LedgerRace,
    /// The runtime failed to start a slot
    RuntimeFailed,
    /// An idle slot was evicted to make room
    Evicted,
    /// The workload was cancelled mid-placement
    Cancelled,
}

/// One entry in the decision log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingDecision {
    pub at: DateTime<Utc>,
    pub workload_id: WorkloadId,
    pub kind: DecisionKind,
    pub runner_id: Option<String>,
    pub gpus: Vec<u32>,
    pub detail: String,
}

impl SchedulingDecision {
    pub fn new(workload_id: WorkloadId, kind: DecisionKind, detail: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            workload_id,
            kind,
            runner_id: None,
            gpus: Vec::new(),
            detail: detail.into(),
        }
    }

    pub fn on(mut self, runner_id: &str, gpus: Vec<u32>) -> Self {
        self.runner_id = Some(runner_id.to_string());
        self.gpus = gpus;
        self
    }
}

/// Ring buffer of decisions; the oldest entry is dropped once full
pub struct DecisionLog {
    capacity: usize,
    entries: Mutex<VecDeque<SchedulingDecision>>,
}

impl DecisionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub async fn record(&self, decision: SchedulingDecision) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().await;
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(decision);
    }

    /// Up to `limit` decisions, newest first
    pub async fn recent(&self, limit: usize) -> Vec<SchedulingDecision> {
        self.entries
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Decisions recorded for one workload, oldest first
    pub async fn for_workload(&self, workload_id: WorkloadId) -> Vec<SchedulingDecision> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|d| d.workload_id == workload_id)
            .cloned()
            .collect()
    }
}
