//! Seam between the scheduler and the runners' slot APIs

use async_trait::async_trait;
use gpuplace_core::{CreateSlotRequest, GpuplaceResult, SlotStartReport};
use uuid::Uuid;

/// Where a slot request is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTarget {
    /// Runner identifier
    pub runner_id: String,
    /// Base URL of the runner's slot API, as reported in its status
    pub endpoint: Option<String>,
}

/// Client for starting and stopping slots on runners
#[async_trait]
pub trait SlotClient: Send + Sync {
    /// Ask the runner to start a slot with the given placement
    async fn create_slot(
        &self,
        target: &SlotTarget,
        request: &CreateSlotRequest,
    ) -> GpuplaceResult<SlotStartReport>;

    /// Ask the runner to stop a slot
    async fn delete_slot(&self, target: &SlotTarget, slot_id: Uuid) -> GpuplaceResult<()>;
}
