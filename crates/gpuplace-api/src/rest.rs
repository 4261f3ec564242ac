//! Scheduler control-plane REST handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use gpuplace_core::{
    GpuAllocation, GpuplaceError, PlacementState, RunnerStatus, ScheduleOutcome, Slot, Workload,
};
use gpuplace_scheduler::{
    Overcommit, RunnerSummary, Scheduler, SchedulingDecision, StatsSnapshot,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

/// Application state shared across handlers
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

/// Create the scheduler API router
pub fn create_router(scheduler: Arc<Scheduler>) -> Router {
    let state = Arc::new(AppState { scheduler });

    Router::new()
        .route("/api/v1/runners", get(list_runners))
        .route("/api/v1/runners/:id", delete(disconnect_runner))
        .route("/api/v1/runners/:id/status", post(ingest_status))
        .route("/api/v1/allocations", get(list_allocations))
        .route("/api/v1/workloads", post(submit_workload))
        .route("/api/v1/workloads", get(list_workloads))
        .route("/api/v1/workloads/:id", delete(cancel_workload))
        .route("/api/v1/workloads/:id/complete", post(complete_workload))
        .route("/api/v1/slots", get(list_slots))
        .route("/api/v1/slots/:id/evict", post(evict_slot))
        .route("/api/v1/slots/:id/activity", post(record_activity))
        .route("/api/v1/decisions", get(list_decisions))
        .route("/api/v1/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Map a library error onto an HTTP status
pub(crate) fn error_response(e: GpuplaceError) -> (StatusCode, String) {
    let code = match &e {
        GpuplaceError::RunnerNotFound(_)
        | GpuplaceError::WorkloadNotFound(_)
        | GpuplaceError::SlotNotFound(_) => StatusCode::NOT_FOUND,
        GpuplaceError::InvalidState(_) => StatusCode::CONFLICT,
        GpuplaceError::InvalidStatus(_)
        | GpuplaceError::InvalidMemory(_)
        | GpuplaceError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, e.to_string())
}

/// Ingest a runner status report
async fn ingest_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(status): Json<RunnerStatus>,
) -> Result<StatusCode, (StatusCode, String)> {
    if status.runner_id != id {
        return Err((
            StatusCode::BAD_REQUEST,
            format!(
                "status for runner {} posted to runner {}",
                status.runner_id, id
            ),
        ));
    }

    debug!(runner_id = %id, gpus = status.gpu_count, "Status received");

    state
        .scheduler
        .ingest_status(status)
        .await
        .map_err(error_response)?;

    Ok(StatusCode::NO_CONTENT)
}

/// List known runners
async fn list_runners(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RunnerSummary>>, (StatusCode, String)> {
    Ok(Json(state.scheduler.list_runners().await))
}

/// Response for a runner disconnect
#[derive(Debug, Serialize, Deserialize)]
pub struct DisconnectResponse {
    pub runner_id: String,
    pub lost_slots: Vec<Uuid>,
}

/// Declare a runner disconnected
async fn disconnect_runner(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DisconnectResponse>, (StatusCode, String)> {
    info!(runner_id = %id, "Disconnecting runner");

    let lost_slots = state
        .scheduler
        .disconnect_runner(&id)
        .await
        .map_err(error_response)?;

    Ok(Json(DisconnectResponse {
        runner_id: id,
        lost_slots,
    }))
}

/// List ledger contents
async fn list_allocations(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<GpuAllocation>>, (StatusCode, String)> {
    Ok(Json(state.scheduler.list_allocations().await))
}

/// Submit a workload for placement
///
/// Placement continues if the client disconnects before it finishes.
async fn submit_workload(
    State(state): State<Arc<AppState>>,
    Json(workload): Json<Workload>,
) -> Result<Json<ScheduleOutcome>, (StatusCode, String)> {
    info!(
        workload_id = %workload.id,
        model = %workload.model,
        runtime = %workload.runtime,
        "Workload submitted"
    );

    let outcome = state
        .scheduler
        .schedule(workload)
        .await
        .map_err(error_response)?;

    Ok(Json(outcome))
}

/// Workload listing entry
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkloadResponse {
    pub id: Uuid,
    pub model: String,
    pub runtime: String,
    pub state: PlacementState,
    pub attempts: u32,
    pub runner_id: Option<String>,
    pub slot_id: Option<Uuid>,
    pub queued: bool,
}

/// List workloads and their placement state
async fn list_workloads(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<WorkloadResponse>>, (StatusCode, String)> {
    let workloads = state
        .scheduler
        .list_workloads()
        .await
        .into_iter()
        .map(|w| WorkloadResponse {
            id: w.workload.id,
            model: w.workload.model,
            runtime: w.workload.runtime.to_string(),
            state: w.state,
            attempts: w.attempts,
            runner_id: w.runner_id,
            slot_id: w.slot_id,
            queued: w.queued,
        })
        .collect();
    Ok(Json(workloads))
}

/// Response for a cancellation
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub workload_id: Uuid,
    pub prior_state: PlacementState,
}

/// Cancel a workload
async fn cancel_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    info!(workload_id = %id, "Cancelling workload");

    let prior_state = state.scheduler.cancel(id).await.map_err(error_response)?;

    Ok(Json(CancelResponse {
        workload_id: id,
        prior_state,
    }))
}

/// Mark a workload completed
async fn complete_workload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Slot>, (StatusCode, String)> {
    let slot = state.scheduler.complete(id).await.map_err(error_response)?;
    Ok(Json(slot))
}

/// List slots, lost ones included
async fn list_slots(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Slot>>, (StatusCode, String)> {
    Ok(Json(state.scheduler.list_slots().await))
}

/// Evict a slot
async fn evict_slot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Slot>, (StatusCode, String)> {
    info!(slot_id = %id, "Evicting slot");

    let slot = state.scheduler.evict(id).await.map_err(error_response)?;
    Ok(Json(slot))
}

/// Reset a slot's idle clock
async fn record_activity(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Slot>, (StatusCode, String)> {
    let slot = state
        .scheduler
        .record_activity(id)
        .await
        .map_err(error_response)?;
    Ok(Json(slot))
}

/// Query parameters for the decision log
#[derive(Debug, Deserialize)]
pub struct DecisionsQuery {
    pub limit: Option<usize>,
}

/// Recent scheduling decisions, newest first
async fn list_decisions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DecisionsQuery>,
) -> Result<Json<Vec<SchedulingDecision>>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(50);
    Ok(Json(state.scheduler.decisions(limit).await))
}

/// System status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub runners: usize,
    pub workloads: usize,
    pub slots: usize,
    pub allocations: usize,
    /// Workloads waiting for capacity
    pub queued: usize,
    /// GPUs whose reservations exceed their memory; always empty when healthy
    pub overcommitted: Vec<Overcommit>,
    pub stats: StatsSnapshot,
}

/// Get system status
async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let scheduler = &state.scheduler;

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        runners: scheduler.registry().len().await,
        workloads: scheduler.list_workloads().await.len(),
        slots: scheduler.list_slots().await.len(),
        allocations: scheduler.ledger().len().await,
        queued: scheduler.queued().await.len(),
        overcommitted: scheduler.check_overscheduling().await,
        stats: scheduler.stats(),
    }))
}
