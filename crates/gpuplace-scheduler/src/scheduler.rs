//! Main scheduler logic

use chrono::Utc;
use gpuplace_core::{
    per_gpu_requirement, CreateSlotRequest, GpuAllocation, GpuplaceError, GpuplaceResult,
    PlacementState, RunnerStatus, ScheduleOutcome, SchedulerConfig, Slot, SlotStartReport,
    SlotState, UnschedulableReason, Workload, WorkloadId,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::{SlotClient, SlotTarget};
use crate::decisions::{DecisionKind, DecisionLog, SchedulingDecision};
use crate::engine::{aggregate_free, allocate, plan_eviction};
use crate::ledger::{AllocationLedger, Overcommit};
use crate::ranking::{strategy_for, Candidate, RankingStrategy};
use crate::registry::RunnerRegistry;

type WorkloadsMap = HashMap<WorkloadId, WorkloadRecord>;
type SlotsMap = HashMap<Uuid, Slot>;

struct WorkloadRecord {
    workload: Workload,
    state: PlacementState,
    attempts: u32,
    runner_id: Option<String>,
    slot_id: Option<Uuid>,
    cancelled: Arc<Notify>,
    /// Submission order
    seq: u64,
    /// Waiting in the pending queue
    queued: bool,
    backoff: Duration,
    next_retry: Instant,
}

/// Externally visible view of a workload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadStatus {
    /// The submitted workload
    pub workload: Workload,
    /// Current placement state
    pub state: PlacementState,
    /// Placement attempts made in the latest round
    pub attempts: u32,
    /// Runner holding the allocation, if committed
    pub runner_id: Option<String>,
    /// Slot serving the workload, if any
    pub slot_id: Option<Uuid>,
    /// Waiting in the pending queue for capacity
    #[serde(default)]
    pub queued: bool,
}

/// Runner as seen by the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSummary {
    pub runner_id: String,
    pub gpu_count: u32,
    pub degraded: bool,
    pub endpoint: Option<String>,
    pub total_memory_bytes: u64,
    /// Free memory the runner last reported
    pub free_memory_bytes: u64,
    /// Free memory once ledger reservations are accounted for
    pub effective_free_memory_bytes: u64,
    pub allocations: usize,
    pub last_seen_secs: u64,
}

/// Scheduler counters
#[derive(Default)]
pub struct SchedulerStats {
    scheduled: AtomicU64,
    unschedulable: AtomicU64,
    queued: AtomicU64,
    cancelled: AtomicU64,
    runtime_failures: AtomicU64,
    ledger_races: AtomicU64,
    stale_evictions: AtomicU64,
    runners_lost: AtomicU64,
    slots_lost: AtomicU64,
}

/// Point-in-time copy of [`SchedulerStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub scheduled: u64,
    pub unschedulable: u64,
    #[serde(default)]
    pub queued: u64,
    pub cancelled: u64,
    pub runtime_failures: u64,
    pub ledger_races: u64,
    #[serde(default)]
    pub stale_evictions: u64,
    pub runners_lost: u64,
    pub slots_lost: u64,
}

impl SchedulerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            unschedulable: self.unschedulable.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            runtime_failures: self.runtime_failures.load(Ordering::Relaxed),
            ledger_races: self.ledger_races.load(Ordering::Relaxed),
            stale_evictions: self.stale_evictions.load(Ordering::Relaxed),
            runners_lost: self.runners_lost.load(Ordering::Relaxed),
            slots_lost: self.slots_lost.load(Ordering::Relaxed),
        }
    }
}

enum SlotAttempt {
    Started(Slot),
    Failed(String),
    Cancelled,
}

/// Scheduler places workloads on runner GPUs
///
/// Lock order is workloads, then slots; the ledger, registry and decision
/// log hold their own locks and are never awaited while a scheduler lock is
/// held.
pub struct Scheduler {
    /// Scheduler configuration
    config: SchedulerConfig,
    /// Authoritative allocation table
    ledger: Arc<AllocationLedger>,
    /// Latest runner status reports
    registry: Arc<RunnerRegistry>,
    /// Client for runner slot APIs
    slot_client: Arc<dyn SlotClient>,
    /// Runner ranking strategy
    ranking: Arc<dyn RankingStrategy>,
    /// Workloads indexed by ID
    workloads: RwLock<WorkloadsMap>,
    /// Slots indexed by ID
    slots: RwLock<SlotsMap>,
    /// Recent scheduling decisions
    decisions: DecisionLog,
    /// Woken when capacity may have appeared
    capacity_changed: Notify,
    next_seq: AtomicU64,
    /// Counters
    stats: SchedulerStats,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        config: SchedulerConfig,
        ledger: Arc<AllocationLedger>,
        registry: Arc<RunnerRegistry>,
        slot_client: Arc<dyn SlotClient>,
    ) -> Self {
        let ranking = strategy_for(config.ranking);

        info!(
            ranking = ranking.name(),
            max_attempts = config.max_attempts,
            slot_start_timeout_secs = config.slot_start_timeout_secs,
            runner_timeout_secs = config.runner_timeout_secs,
            evict_stale_slots = config.evict_stale_slots,
            "Scheduler initialized"
        );

        Self {
            decisions: DecisionLog::new(config.decision_log_size),
            config,
            ledger,
            registry,
            slot_client,
            ranking,
            workloads: RwLock::new(HashMap::new()),
            slots: RwLock::new(HashMap::new()),
            capacity_changed: Notify::new(),
            next_seq: AtomicU64::new(0),
            stats: SchedulerStats::default(),
        }
    }

    /// Replace the ranking strategy chosen from the configuration
    pub fn with_ranking(mut self, ranking: Arc<dyn RankingStrategy>) -> Self {
        self.ranking = ranking;
        self
    }

    /// Scheduler configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// The allocation ledger
    pub fn ledger(&self) -> &Arc<AllocationLedger> {
        &self.ledger
    }

    /// The runner registry
    pub fn registry(&self) -> &Arc<RunnerRegistry> {
        &self.registry
    }

    /// Record a runner status report
    pub async fn ingest_status(&self, status: RunnerStatus) -> GpuplaceResult<()> {
        self.registry.ingest(status).await?;
        self.capacity_freed();
        Ok(())
    }

    fn capacity_freed(&self) {
        self.capacity_changed.notify_one();
    }

    /// Place a workload and start its slot
    ///
    /// Scheduling failures are reported through [`ScheduleOutcome`]; an
    /// error means the request itself was unacceptable. A workload that does
    /// not fit anywhere yet is reported `NoFit` (or `NoRunners`) but stays
    /// `Pending` in the queue until capacity appears or it is cancelled.
    ///
    /// The placement runs on its own task: dropping the returned future
    /// does not interrupt it.
    pub async fn schedule(self: &Arc<Self>, workload: Workload) -> GpuplaceResult<ScheduleOutcome> {
        workload.validate()?;
        let cancelled = self.register(&workload).await?;

        info!(
            workload_id = %workload.id,
            model = %workload.model,
            runtime = %workload.runtime,
            memory_bytes = workload.model_memory_requirement_bytes,
            "Scheduling workload"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move { this.place(workload, cancelled, false).await })
            .await
            .map_err(|e| GpuplaceError::Internal(format!("placement task failed: {}", e)))
    }

    async fn register(&self, workload: &Workload) -> GpuplaceResult<Arc<Notify>> {
        let mut workloads = self.workloads.write().await;

        if let Some(existing) = workloads.get(&workload.id) {
            if !existing.state.is_terminal() {
                return Err(GpuplaceError::InvalidState(format!(
                    "workload {} is already {}",
                    workload.id, existing.state
                )));
            }
            // Resubmission acknowledges a slot lost with its runner
            if let Some(slot_id) = existing.slot_id {
                let mut slots = self.slots.write().await;
                if slots.get(&slot_id).map(|s| s.state) == Some(SlotState::Lost) {
                    slots.remove(&slot_id);
                }
            }
        }

        let cancelled = Arc::new(Notify::new());
        workloads.insert(
            workload.id,
            WorkloadRecord {
                workload: workload.clone(),
                state: PlacementState::Pending,
                attempts: 0,
                runner_id: None,
                slot_id: None,
                cancelled: cancelled.clone(),
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                queued: false,
                backoff: self.initial_backoff(),
                next_retry: Instant::now(),
            },
        );
        Ok(cancelled)
    }

    fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.config.queue_backoff_initial_ms.max(1))
    }

    /// Run one placement round and settle the workload's state
    async fn place(&self, workload: Workload, cancelled: Arc<Notify>, retry: bool) -> ScheduleOutcome {
        let outcome = self.run_attempts(&workload, &cancelled).await;

        match &outcome {
            ScheduleOutcome::Scheduled { slot } => {
                SchedulerStats::bump(&self.stats.scheduled);
                info!(
                    workload_id = %workload.id,
                    slot_id = %slot.id,
                    runner_id = %slot.runner_id,
                    gpus = ?slot.allocation.placement.gpu_indices(),
                    "Workload running"
                );
                self.decisions
                    .record(
                        SchedulingDecision::new(workload.id, DecisionKind::Scheduled, "slot started")
                            .on(&slot.runner_id, slot.allocation.placement.gpu_indices()),
                    )
                    .await;
            }
            ScheduleOutcome::Unschedulable { reason } if reason.is_retryable() => {
                let queued = self.enqueue(workload.id, retry).await;
                if queued && !retry {
                    SchedulerStats::bump(&self.stats.queued);
                    info!(workload_id = %workload.id, reason = %reason, "Workload queued");
                    self.decisions
                        .record(SchedulingDecision::new(
                            workload.id,
                            DecisionKind::Queued,
                            reason.to_string(),
                        ))
                        .await;
                } else if queued {
                    debug!(workload_id = %workload.id, reason = %reason, "Queued workload still does not fit");
                }
            }
            ScheduleOutcome::Unschedulable { reason } => {
                SchedulerStats::bump(&self.stats.unschedulable);
                self.advance(workload.id, PlacementState::Unschedulable).await;
                info!(workload_id = %workload.id, reason = %reason, "Workload unschedulable");
                self.decisions
                    .record(SchedulingDecision::new(
                        workload.id,
                        DecisionKind::Unschedulable,
                        reason.to_string(),
                    ))
                    .await;
            }
            ScheduleOutcome::Cancelled => {
                debug!(workload_id = %workload.id, "Scheduling abandoned after cancellation");
                self.decisions
                    .record(SchedulingDecision::new(
                        workload.id,
                        DecisionKind::Cancelled,
                        "cancelled during placement",
                    ))
                    .await;
            }
        }

        outcome
    }

    /// Park a workload in the pending queue; false if it was cancelled
    async fn enqueue(&self, id: WorkloadId, retry: bool) -> bool {
        let max = Duration::from_secs(self.config.queue_backoff_max_secs.max(1));
        let initial = self.initial_backoff();
        let mut workloads = self.workloads.write().await;
        match workloads
            .get_mut(&id)
            .filter(|r| r.state != PlacementState::Cancelled)
        {
            Some(record) => {
                record.backoff = if retry {
                    record.backoff.saturating_mul(2).min(max)
                } else {
                    initial
                };
                record.state = PlacementState::Pending;
                record.queued = true;
                record.next_retry = Instant::now() + record.backoff;
                true
            }
            None => false,
        }
    }

    /// Retry queued workloads in submission order
    ///
    /// With `force` every queued workload is retried; otherwise only those
    /// whose backoff has elapsed. Returns each retried workload's outcome.
    pub async fn retry_queued(&self, force: bool) -> Vec<(WorkloadId, ScheduleOutcome)> {
        let now = Instant::now();
        let mut due: Vec<(u64, Workload, Arc<Notify>)> = {
            let mut workloads = self.workloads.write().await;
            workloads
                .values_mut()
                .filter(|r| {
                    r.queued && r.state == PlacementState::Pending && (force || r.next_retry <= now)
                })
                .map(|r| {
                    r.queued = false;
                    (r.seq, r.workload.clone(), r.cancelled.clone())
                })
                .collect()
        };
        due.sort_by_key(|(seq, _, _)| *seq);

        let mut outcomes = Vec::with_capacity(due.len());
        for (_, workload, cancelled) in due {
            debug!(workload_id = %workload.id, "Retrying queued workload");
            let id = workload.id;
            outcomes.push((id, self.place(workload, cancelled, true).await));
        }
        outcomes
    }

    /// Retry queued workloads on backoff and whenever capacity changes
    pub fn spawn_queue_loop(self: Arc<Self>) -> JoinHandle<()> {
        let tick = self.initial_backoff();
        tokio::spawn(async move {
            loop {
                let force = tokio::select! {
                    _ = self.capacity_changed.notified() => true,
                    _ = tokio::time::sleep(tick) => false,
                };
                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    this.retry_queued(force).await;
                });
            }
        })
    }

    async fn run_attempts(&self, workload: &Workload, cancelled: &Notify) -> ScheduleOutcome {
        let id = workload.id;
        let required = workload.model_memory_requirement_bytes;
        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_error = String::new();
        let mut attempts = 0u32;
        let mut evicted = false;

        loop {
            if attempts >= self.config.max_attempts {
                return ScheduleOutcome::Unschedulable {
                    reason: UnschedulableReason::RetriesExhausted {
                        attempts,
                        last_error,
                    },
                };
            }

            if !self.advance(id, PlacementState::Filtering).await {
                return ScheduleOutcome::Cancelled;
            }

            let runners = self.registry.snapshot().await;
            if runners.is_empty() {
                return ScheduleOutcome::Unschedulable {
                    reason: UnschedulableReason::NoRunners,
                };
            }
            let eligible: Vec<RunnerStatus> = runners
                .into_iter()
                .filter(|r| !excluded.contains(&r.runner_id))
                .collect();

            if !self.advance(id, PlacementState::Allocating).await {
                return ScheduleOutcome::Cancelled;
            }

            let candidates = self.candidates(workload, &eligible).await;
            let Some(choice) = self.ranking.pick(&candidates).cloned() else {
                if self.config.evict_stale_slots
                    && !evicted
                    && self.make_room(workload, &eligible).await
                {
                    evicted = true;
                    continue;
                }
                let reason = if excluded.is_empty() {
                    UnschedulableReason::NoFit {
                        required_bytes: required,
                        runners_considered: eligible.len(),
                    }
                } else {
                    UnschedulableReason::RetriesExhausted {
                        attempts,
                        last_error,
                    }
                };
                return ScheduleOutcome::Unschedulable { reason };
            };
            let Some(status) = eligible.iter().find(|r| r.runner_id == choice.runner_id) else {
                continue;
            };

            attempts += 1;
            let allocation = GpuAllocation::new(id, &choice.runner_id, choice.placement, required);

            if let Err(conflict) = self.ledger.reserve(allocation.clone(), status).await {
                SchedulerStats::bump(&self.stats.ledger_races);
                warn!(
                    workload_id = %id,
                    runner_id = %choice.runner_id,
                    attempt = attempts,
                    error = %conflict,
                    "Allocation race lost, retrying"
                );
                last_error = conflict.to_string();
                self.record_attempts(id, attempts).await;
                self.decisions
                    .record(
                        SchedulingDecision::new(id, DecisionKind::LedgerRace, last_error.clone())
                            .on(&choice.runner_id, allocation.placement.gpu_indices()),
                    )
                    .await;
                continue;
            }

            if !self.commit(id, &allocation.runner_id, attempts).await {
                self.ledger.clear(id, &allocation.runner_id).await;
                return ScheduleOutcome::Cancelled;
            }

            let target = SlotTarget {
                runner_id: choice.runner_id.clone(),
                endpoint: choice.endpoint.clone(),
            };

            match self.start_slot(workload, &allocation, &target, cancelled).await {
                SlotAttempt::Started(slot) => return ScheduleOutcome::Scheduled { slot },
                SlotAttempt::Cancelled => return ScheduleOutcome::Cancelled,
                SlotAttempt::Failed(error) => {
                    SchedulerStats::bump(&self.stats.runtime_failures);
                    warn!(
                        workload_id = %id,
                        runner_id = %choice.runner_id,
                        attempt = attempts,
                        error = %error,
                        "Runtime failed to start slot"
                    );
                    self.decisions
                        .record(
                            SchedulingDecision::new(id, DecisionKind::RuntimeFailed, error.clone())
                                .on(&choice.runner_id, allocation.placement.gpu_indices()),
                        )
                        .await;
                    excluded.insert(choice.runner_id);
                    last_error = error;

                    if !self.advance(id, PlacementState::RuntimeFailed).await
                        || !self.advance(id, PlacementState::Pending).await
                    {
                        return ScheduleOutcome::Cancelled;
                    }
                }
            }
        }
    }

    async fn candidates(&self, workload: &Workload, runners: &[RunnerStatus]) -> Vec<Candidate> {
        let required = workload.model_memory_requirement_bytes;
        let mut candidates = Vec::new();

        for status in runners {
            let capacity = self.ledger.capacity(status).await;
            let free = aggregate_free(&capacity);
            if free < required {
                debug!(
                    runner_id = %status.runner_id,
                    free_bytes = free,
                    required_bytes = required,
                    "Runner filtered on aggregate memory"
                );
                continue;
            }

            match allocate(required, &capacity, workload.parallelism) {
                Some(placement) => {
                    let per_gpu = per_gpu_requirement(required, placement.gpu_count());
                    let reserved = per_gpu.saturating_mul(placement.gpu_count() as u64);
                    debug!(
                        runner_id = %status.runner_id,
                        gpus = ?placement.gpu_indices(),
                        "Runner can host workload"
                    );
                    candidates.push(Candidate {
                        runner_id: status.runner_id.clone(),
                        endpoint: status.endpoint.clone(),
                        placement,
                        free_after_bytes: free.saturating_sub(reserved),
                    });
                }
                None => {
                    debug!(runner_id = %status.runner_id, "Workload does not fit on runner");
                }
            }
        }

        candidates
    }

    /// Evict the stalest idle slots on one runner so `workload` fits
    ///
    /// The runner needing the fewest evictions wins, lowest runner id on
    /// ties. Returns whether anything was evicted.
    async fn make_room(&self, workload: &Workload, runners: &[RunnerStatus]) -> bool {
        let idle = chrono::Duration::seconds(self.config.stale_slot_secs.min(u32::MAX as u64) as i64);
        let now = Utc::now();
        let mut evictable: Vec<Slot> = self
            .slots
            .read()
            .await
            .values()
            .filter(|s| {
                matches!(s.state, SlotState::Running | SlotState::Degraded)
                    && s.workload_id != workload.id
                    && s.idle_for(idle, now)
            })
            .cloned()
            .collect();
        if evictable.is_empty() {
            return false;
        }
        evictable.sort_by_key(|s| (s.last_activity_at, s.created_at));

        let mut best: Option<(&str, Vec<Uuid>)> = None;
        for status in runners {
            let on_runner: Vec<(Uuid, GpuAllocation)> = evictable
                .iter()
                .filter(|s| s.runner_id == status.runner_id)
                .map(|s| (s.id, s.allocation.clone()))
                .collect();
            let capacity = self.ledger.capacity(status).await;
            if let Some((_, victims)) = plan_eviction(
                workload.model_memory_requirement_bytes,
                &capacity,
                &on_runner,
                workload.parallelism,
            ) {
                if best.as_ref().map_or(true, |(_, b)| victims.len() < b.len()) {
                    best = Some((status.runner_id.as_str(), victims));
                }
            }
        }

        let Some((runner_id, victims)) = best else {
            debug!(workload_id = %workload.id, "Evicting idle slots would not make room");
            return false;
        };

        info!(
            workload_id = %workload.id,
            runner_id = %runner_id,
            slots = victims.len(),
            "Evicting idle slots to make room"
        );

        let mut any = false;
        for slot_id in victims {
            match self.evict(slot_id).await {
                Ok(slot) => {
                    any = true;
                    SchedulerStats::bump(&self.stats.stale_evictions);
                    self.decisions
                        .record(
                            SchedulingDecision::new(
                                slot.workload_id,
                                DecisionKind::Evicted,
                                format!("idle slot evicted for workload {}", workload.id),
                            )
                            .on(&slot.runner_id, slot.allocation.placement.gpu_indices()),
                        )
                        .await;
                }
                Err(e) => {
                    warn!(slot_id = %slot_id, error = %e, "Idle slot eviction failed");
                }
            }
        }
        any
    }

    async fn start_slot(
        &self,
        workload: &Workload,
        allocation: &GpuAllocation,
        target: &SlotTarget,
        cancelled: &Notify,
    ) -> SlotAttempt {
        let slot = Slot::new(workload, allocation.clone());
        let slot_id = slot.id;

        let accepted = {
            let mut workloads = self.workloads.write().await;
            match workloads
                .get_mut(&workload.id)
                .filter(|r| r.state != PlacementState::Cancelled)
            {
                Some(record) => {
                    record.state = PlacementState::RuntimeStarting;
                    record.slot_id = Some(slot_id);
                    self.slots.write().await.insert(slot_id, slot.clone());
                    true
                }
                None => false,
            }
        };
        if !accepted {
            self.ledger.clear(workload.id, &allocation.runner_id).await;
            return SlotAttempt::Cancelled;
        }

        // A runner lost before the slot was inserted cleared the reservation
        // without seeing the slot
        if self.ledger.get(workload.id, &allocation.runner_id).await.is_none() {
            self.slots.write().await.remove(&slot_id);
            return self
                .released_attempt(workload.id, "allocation released before the slot started")
                .await;
        }

        let request = CreateSlotRequest::for_slot(&slot, workload);
        let timeout = Duration::from_secs(self.config.slot_start_timeout_secs);

        info!(
            workload_id = %workload.id,
            slot_id = %slot_id,
            runner_id = %target.runner_id,
            gpus = ?allocation.placement.gpu_indices(),
            tensor_parallel_size = allocation.tensor_parallel_size,
            "Starting slot"
        );

        let result = tokio::select! {
            result = tokio::time::timeout(timeout, self.slot_client.create_slot(target, &request)) => Some(result),
            _ = cancelled.notified() => None,
        };

        let report = match result {
            None => {
                self.abandon_slot(workload.id, allocation, slot_id, target).await;
                return SlotAttempt::Cancelled;
            }
            Some(Err(_)) => {
                self.abandon_slot(workload.id, allocation, slot_id, target).await;
                return SlotAttempt::Failed(format!(
                    "slot start timed out after {}s",
                    self.config.slot_start_timeout_secs
                ));
            }
            Some(Ok(Err(e))) => {
                self.ledger.clear(workload.id, &allocation.runner_id).await;
                self.slots.write().await.remove(&slot_id);
                return SlotAttempt::Failed(e.to_string());
            }
            Some(Ok(Ok(report))) => report,
        };

        if self.ledger.get(workload.id, &allocation.runner_id).await.is_none() {
            self.abandon_slot(workload.id, allocation, slot_id, target).await;
            return self
                .released_attempt(workload.id, "allocation released while the slot was starting")
                .await;
        }

        let finished = {
            let mut workloads = self.workloads.write().await;
            let mut slots = self.slots.write().await;
            let record = workloads
                .get_mut(&workload.id)
                .filter(|r| r.state != PlacementState::Cancelled);
            let live = slots
                .get_mut(&slot_id)
                .filter(|s| s.state == SlotState::Starting);

            match (record, live) {
                (Some(record), Some(slot)) => {
                    match report {
                        SlotStartReport::Started => slot.state = SlotState::Running,
                        SlotStartReport::Degraded { reason } => {
                            warn!(slot_id = %slot_id, reason = %reason, "Slot started degraded");
                            slot.state = SlotState::Degraded;
                            slot.note = Some(reason);
                        }
                    }
                    slot.last_activity_at = Utc::now();
                    record.state = PlacementState::Running;
                    Ok(slot.clone())
                }
                (None, _) => Err(None),
                (Some(_), None) => Err(Some("runner lost while the slot was starting")),
            }
        };

        match finished {
            Ok(slot) => SlotAttempt::Started(slot),
            Err(None) => {
                self.abandon_slot(workload.id, allocation, slot_id, target).await;
                SlotAttempt::Cancelled
            }
            Err(Some(reason)) => {
                self.abandon_slot(workload.id, allocation, slot_id, target).await;
                SlotAttempt::Failed(reason.to_string())
            }
        }
    }

    /// Outcome of an attempt whose reservation vanished underneath it
    async fn released_attempt(&self, id: WorkloadId, reason: &str) -> SlotAttempt {
        let cancelled = self
            .workloads
            .read()
            .await
            .get(&id)
            .map_or(true, |r| r.state == PlacementState::Cancelled);
        if cancelled {
            SlotAttempt::Cancelled
        } else {
            SlotAttempt::Failed(reason.to_string())
        }
    }

    /// Release an attempt's allocation and ask the runner to drop the slot
    async fn abandon_slot(
        &self,
        workload_id: WorkloadId,
        allocation: &GpuAllocation,
        slot_id: Uuid,
        target: &SlotTarget,
    ) {
        self.ledger.clear(workload_id, &allocation.runner_id).await;
        self.slots.write().await.remove(&slot_id);
        self.capacity_freed();
        self.teardown(target, slot_id).await;
    }

    async fn teardown(&self, target: &SlotTarget, slot_id: Uuid) {
        if let Err(e) = self.slot_client.delete_slot(target, slot_id).await {
            warn!(
                runner_id = %target.runner_id,
                slot_id = %slot_id,
                error = %e,
                "Slot teardown failed"
            );
        }
    }

    async fn target_for(&self, runner_id: &str) -> SlotTarget {
        SlotTarget {
            runner_id: runner_id.to_string(),
            endpoint: self
                .registry
                .get(runner_id)
                .await
                .and_then(|s| s.endpoint),
        }
    }

    /// Move a workload to `state` unless it was cancelled
    async fn advance(&self, id: WorkloadId, state: PlacementState) -> bool {
        let mut workloads = self.workloads.write().await;
        match workloads
            .get_mut(&id)
            .filter(|r| r.state != PlacementState::Cancelled)
        {
            Some(record) => {
                debug!(workload_id = %id, from = %record.state, to = %state, "Placement state");
                record.state = state;
                true
            }
            None => false,
        }
    }

    async fn commit(&self, id: WorkloadId, runner_id: &str, attempts: u32) -> bool {
        let mut workloads = self.workloads.write().await;
        match workloads
            .get_mut(&id)
            .filter(|r| r.state != PlacementState::Cancelled)
        {
            Some(record) => {
                record.state = PlacementState::Committed;
                record.runner_id = Some(runner_id.to_string());
                record.attempts = attempts;
                true
            }
            None => false,
        }
    }

    async fn record_attempts(&self, id: WorkloadId, attempts: u32) {
        if let Some(record) = self.workloads.write().await.get_mut(&id) {
            record.attempts = attempts;
        }
    }

    /// Cancel a workload, releasing anything it committed
    ///
    /// Returns the state the workload was in. Cancelling a finished workload
    /// is a no-op; a queued workload simply leaves the queue.
    pub async fn cancel(&self, id: WorkloadId) -> GpuplaceResult<PlacementState> {
        let (prior, runner_id, slot_id) = {
            let mut workloads = self.workloads.write().await;
            let mut slots = self.slots.write().await;
            let record = workloads
                .get_mut(&id)
                .ok_or_else(|| GpuplaceError::WorkloadNotFound(id.to_string()))?;

            let prior = record.state;
            if prior.is_terminal() {
                return Ok(prior);
            }
            record.state = PlacementState::Cancelled;
            record.queued = false;
            record.cancelled.notify_one();

            if prior == PlacementState::Running {
                if let Some(slot_id) = record.slot_id {
                    if let Some(slot) = slots.get_mut(&slot_id) {
                        slot.state = SlotState::Evicted;
                    }
                }
            }

            (prior, record.runner_id.clone(), record.slot_id)
        };

        SchedulerStats::bump(&self.stats.cancelled);
        info!(workload_id = %id, prior_state = %prior, "Workload cancelled");

        if prior.is_committed() {
            if let Some(runner_id) = &runner_id {
                self.ledger.clear(id, runner_id).await;
                self.capacity_freed();
            }
        }

        if prior == PlacementState::Running {
            if let (Some(runner_id), Some(slot_id)) = (runner_id, slot_id) {
                let target = self.target_for(&runner_id).await;
                self.teardown(&target, slot_id).await;
            }
        }

        Ok(prior)
    }

    /// Mark a running workload completed and release its allocation
    pub async fn complete(&self, id: WorkloadId) -> GpuplaceResult<Slot> {
        self.finish(id, PlacementState::Completed, SlotState::Completed)
            .await
    }

    /// Evict a slot and release its allocation
    ///
    /// Evicting a slot that is already inactive (for example one lost with
    /// its runner) acknowledges it and removes it from the slot list.
    pub async fn evict(&self, slot_id: Uuid) -> GpuplaceResult<Slot> {
        let slot = self
            .slots
            .read()
            .await
            .get(&slot_id)
            .cloned()
            .ok_or_else(|| GpuplaceError::SlotNotFound(slot_id.to_string()))?;

        match slot.state {
            SlotState::Starting => Err(GpuplaceError::InvalidState(format!(
                "slot {} is still starting",
                slot_id
            ))),
            SlotState::Running | SlotState::Degraded => {
                self.finish(slot.workload_id, PlacementState::Evicted, SlotState::Evicted)
                    .await
            }
            _ => {
                self.slots.write().await.remove(&slot_id);
                info!(slot_id = %slot_id, state = %slot.state, "Inactive slot acknowledged");
                Ok(slot)
            }
        }
    }

    /// Note that a slot served traffic, resetting its idle clock
    pub async fn record_activity(&self, slot_id: Uuid) -> GpuplaceResult<Slot> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(&slot_id)
            .ok_or_else(|| GpuplaceError::SlotNotFound(slot_id.to_string()))?;
        if !matches!(slot.state, SlotState::Running | SlotState::Degraded) {
            return Err(GpuplaceError::InvalidState(format!(
                "slot {} is {}",
                slot_id, slot.state
            )));
        }
        slot.last_activity_at = Utc::now();
        Ok(slot.clone())
    }

    async fn finish(
        &self,
        id: WorkloadId,
        workload_state: PlacementState,
        slot_state: SlotState,
    ) -> GpuplaceResult<Slot> {
        let slot = {
            let mut workloads = self.workloads.write().await;
            let mut slots = self.slots.write().await;
            let record = workloads
                .get_mut(&id)
                .ok_or_else(|| GpuplaceError::WorkloadNotFound(id.to_string()))?;

            if record.state != PlacementState::Running {
                return Err(GpuplaceError::InvalidState(format!(
                    "workload {} is {}, not Running",
                    id, record.state
                )));
            }

            let slot = match record.slot_id {
                Some(slot_id) => slots.get_mut(&slot_id),
                None => None,
            }
            .ok_or_else(|| GpuplaceError::Internal(format!("workload {} has no slot", id)))?;

            record.state = workload_state;
            slot.state = slot_state;
            slot.clone()
        };

        self.ledger.clear(id, &slot.runner_id).await;
        self.capacity_freed();
        let target = self.target_for(&slot.runner_id).await;
        self.teardown(&target, slot.id).await;

        info!(
            workload_id = %id,
            slot_id = %slot.id,
            runner_id = %slot.runner_id,
            state = %workload_state,
            "Released allocation"
        );

        Ok(slot)
    }

    /// Declare a runner disconnected, releasing everything placed on it
    pub async fn disconnect_runner(&self, runner_id: &str) -> GpuplaceResult<Vec<Uuid>> {
        let known = self.registry.remove(runner_id).await.is_some();
        if !known && self.ledger.for_runner(runner_id).await.is_empty() {
            return Err(GpuplaceError::RunnerNotFound(runner_id.to_string()));
        }
        Ok(self.runner_lost(runner_id).await)
    }

    /// Drop every runner that stopped reporting
    pub async fn reap_stale_runners(&self) -> Vec<String> {
        let timeout = Duration::from_secs(self.config.runner_timeout_secs);
        let stale = self.registry.remove_stale(timeout).await;
        for runner_id in &stale {
            warn!(runner_id = %runner_id, timeout_secs = timeout.as_secs(), "Runner stopped reporting");
            self.runner_lost(runner_id).await;
        }
        stale
    }

    async fn runner_lost(&self, runner_id: &str) -> Vec<Uuid> {
        let released = self.ledger.clear_all_for_runner(runner_id).await;

        let lost: Vec<Uuid> = {
            let mut workloads = self.workloads.write().await;
            let mut slots = self.slots.write().await;
            let mut lost = Vec::new();

            for slot in slots
                .values_mut()
                .filter(|s| s.runner_id == runner_id && s.state.is_active())
            {
                slot.state = SlotState::Lost;
                lost.push(slot.id);
                if let Some(record) = workloads.get_mut(&slot.workload_id) {
                    if record.state == PlacementState::Running {
                        record.state = PlacementState::Lost;
                    }
                }
            }
            lost
        };

        SchedulerStats::bump(&self.stats.runners_lost);
        self.stats
            .slots_lost
            .fetch_add(lost.len() as u64, Ordering::Relaxed);
        self.capacity_freed();

        warn!(
            runner_id = %runner_id,
            released_allocations = released.len(),
            lost_slots = lost.len(),
            "Runner lost"
        );

        lost
    }

    /// GPUs whose ledger reservations exceed their memory
    ///
    /// Each one found is logged as an error; a healthy scheduler always
    /// returns an empty list.
    pub async fn check_overscheduling(&self) -> Vec<Overcommit> {
        let mut found = Vec::new();
        for status in self.registry.snapshot().await {
            for overcommit in self.ledger.overcommitted(&status).await {
                error!(
                    runner_id = %overcommit.runner_id,
                    gpu_index = overcommit.gpu_index,
                    reserved_bytes = overcommit.reserved_bytes,
                    total_memory_bytes = overcommit.total_memory_bytes,
                    "GPU overscheduled"
                );
                found.push(overcommit);
            }
        }
        found
    }

    /// Periodically reap runners that stopped reporting and check the ledger
    pub fn spawn_liveness_loop(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.liveness_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                self.reap_stale_runners().await;
                self.check_overscheduling().await;
            }
        })
    }

    /// Get a workload's status
    pub async fn workload(&self, id: WorkloadId) -> GpuplaceResult<WorkloadStatus> {
        self.workloads
            .read()
            .await
            .get(&id)
            .map(status_of)
            .ok_or_else(|| GpuplaceError::WorkloadNotFound(id.to_string()))
    }

    /// List all workloads
    pub async fn list_workloads(&self) -> Vec<WorkloadStatus> {
        self.workloads.read().await.values().map(status_of).collect()
    }

    /// Workloads waiting for capacity, in submission order
    pub async fn queued(&self) -> Vec<WorkloadStatus> {
        let workloads = self.workloads.read().await;
        let mut queued: Vec<&WorkloadRecord> = workloads
            .values()
            .filter(|r| r.queued && r.state == PlacementState::Pending)
            .collect();
        queued.sort_by_key(|r| r.seq);
        queued.into_iter().map(status_of).collect()
    }

    /// List all slots, including lost ones, oldest first
    pub async fn list_slots(&self) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self.slots.read().await.values().cloned().collect();
        slots.sort_by_key(|s| s.created_at);
        slots
    }

    /// List ledger contents
    pub async fn list_allocations(&self) -> Vec<GpuAllocation> {
        self.ledger.list().await
    }

    /// Most recent scheduling decisions, newest first
    pub async fn decisions(&self, limit: usize) -> Vec<SchedulingDecision> {
        self.decisions.recent(limit).await
    }

    /// Summaries of every registered runner
    pub async fn list_runners(&self) -> Vec<RunnerSummary> {
        let mut summaries = Vec::new();
        for status in self.registry.snapshot().await {
            let capacity = self.ledger.capacity(&status).await;
            let allocations = self.ledger.for_runner(&status.runner_id).await.len();
            let last_seen_secs = self
                .registry
                .last_seen(&status.runner_id)
                .await
                .map_or(0, |d| d.as_secs());

            summaries.push(RunnerSummary {
                runner_id: status.runner_id.clone(),
                gpu_count: status.gpu_count,
                degraded: status.degraded,
                endpoint: status.endpoint.clone(),
                total_memory_bytes: status.total_memory_bytes,
                free_memory_bytes: status.free_memory_bytes,
                effective_free_memory_bytes: aggregate_free(&capacity),
                allocations,
                last_seen_secs,
            });
        }
        summaries
    }

    /// Current counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

fn status_of(record: &WorkloadRecord) -> WorkloadStatus {
    WorkloadStatus {
        workload: record.workload.clone(),
        state: record.state,
        attempts: record.attempts,
        runner_id: record.runner_id.clone(),
        slot_id: record.slot_id,
        queued: record.queued,
    }
}
