//! Runner slot API handlers
//!
//! Served by each runner; the scheduler calls these to start and stop slots.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use gpuplace_core::{CreateSlotRequest, RunnerStatus, SlotStartReport};
use gpuplace_runtime::{InventoryTracker, SlotRuntime};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::rest::error_response;

/// Runner state shared across handlers
pub struct RunnerState {
    pub runtime: Arc<dyn SlotRuntime>,
    pub inventory: Arc<InventoryTracker>,
}

/// Create the runner slot API router
pub fn create_runner_router(
    runtime: Arc<dyn SlotRuntime>,
    inventory: Arc<InventoryTracker>,
) -> Router {
    let state = Arc::new(RunnerState { runtime, inventory });

    Router::new()
        .route("/api/v1/slots", post(create_slot))
        .route("/api/v1/slots", get(list_slots))
        .route("/api/v1/slots/:id", delete(delete_slot))
        .route("/api/v1/inventory", get(get_inventory))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start a slot on the requested GPUs
async fn create_slot(
    State(state): State<Arc<RunnerState>>,
    Json(request): Json<CreateSlotRequest>,
) -> Result<Json<SlotStartReport>, (StatusCode, String)> {
    info!(
        slot_id = %request.slot_id,
        runtime = %request.runtime,
        model = %request.model,
        gpus = ?request.visible_devices(),
        "Slot requested"
    );

    let report = state.runtime.start_slot(&request).await.map_err(|e| {
        warn!(slot_id = %request.slot_id, error = %e, "Slot failed to start");
        error_response(e)
    })?;

    Ok(Json(report))
}

/// List slots with a live process
async fn list_slots(
    State(state): State<Arc<RunnerState>>,
) -> Result<Json<Vec<Uuid>>, (StatusCode, String)> {
    Ok(Json(state.runtime.slots().await))
}

/// Stop a slot
async fn delete_slot(
    State(state): State<Arc<RunnerState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    info!(slot_id = %id, "Stopping slot");

    state.runtime.stop_slot(id).await.map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Current inventory snapshot
async fn get_inventory(
    State(state): State<Arc<RunnerState>>,
) -> Result<Json<RunnerStatus>, (StatusCode, String)> {
    Ok(Json(state.inventory.snapshot().await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use gpuplace_core::{GpuplaceError, GpuplaceResult, RuntimeKind, GIB};
    use gpuplace_runtime::InventoryConfig;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct FakeRuntime {
        slots: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl SlotRuntime for FakeRuntime {
        async fn start_slot(&self, request: &CreateSlotRequest) -> GpuplaceResult<SlotStartReport> {
            if request.runtime == RuntimeKind::Vllm && request.visible_devices().is_none() {
                return Err(GpuplaceError::Runtime("vLLM needs a GPU placement".to_string()));
            }
            self.slots.lock().unwrap().push(request.slot_id);
            Ok(SlotStartReport::Started)
        }

        async fn stop_slot(&self, slot_id: Uuid) -> GpuplaceResult<()> {
            let mut slots = self.slots.lock().unwrap();
            let before = slots.len();
            slots.retain(|s| *s != slot_id);
            if slots.len() == before {
                return Err(GpuplaceError::SlotNotFound(slot_id.to_string()));
            }
            Ok(())
        }

        async fn is_running(&self, slot_id: Uuid) -> GpuplaceResult<bool> {
            Ok(self.slots.lock().unwrap().contains(&slot_id))
        }

        async fn slots(&self) -> Vec<Uuid> {
            self.slots.lock().unwrap().clone()
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn router() -> Router {
        let inventory = Arc::new(InventoryTracker::detect(&InventoryConfig {
            runner_id: "runner-a".to_string(),
            cpu_only: true,
            memory: Some(24 * GIB),
            fallback_memory: 16 * GIB,
        }));
        create_runner_router(Arc::new(FakeRuntime::default()), inventory)
    }

    fn slot_request(gpu_index: Option<u32>) -> CreateSlotRequest {
        CreateSlotRequest {
            slot_id: Uuid::new_v4(),
            runtime: RuntimeKind::Vllm,
            model: "meta-llama/Llama-3-8B".to_string(),
            model_memory_requirement_bytes: 16 * GIB,
            context_length: 4096,
            runtime_args: Vec::new(),
            gpu_index,
            gpu_indices: None,
            tensor_parallel_size: 1,
        }
    }

    fn post_slot(request: &CreateSlotRequest) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/slots")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(request).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_delete_slot() {
        let router = router();
        let request = slot_request(Some(0));

        let response = router.clone().oneshot(post_slot(&request)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let report: SlotStartReport = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(report, SlotStartReport::Started);

        let delete = Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/slots/{}", request.slot_id))
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let delete = Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/slots/{}", request.slot_id))
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_failure_is_server_error() {
        let response = router().oneshot(post_slot(&slot_request(None))).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_inventory() {
        let request = Request::builder()
            .uri("/api/v1/inventory")
            .body(Body::empty())
            .unwrap();
        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let status: RunnerStatus = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status.runner_id, "runner-a");
        assert_eq!(status.total_memory_bytes, 24 * GIB);
        assert!(status.degraded);
    }
}
