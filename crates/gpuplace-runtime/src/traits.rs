//! Runtime trait definitions

use async_trait::async_trait;
use gpuplace_core::{CreateSlotRequest, GpuplaceResult, SlotStartReport};
use uuid::Uuid;

/// Runtime trait for managing slots on a runner
#[async_trait]
pub trait SlotRuntime: Send + Sync {
    /// Start the model process for a slot on the requested GPUs
    async fn start_slot(&self, request: &CreateSlotRequest) -> GpuplaceResult<SlotStartReport>;

    /// Stop a running slot
    async fn stop_slot(&self, slot_id: Uuid) -> GpuplaceResult<()>;

    /// Check if a slot's process is still alive
    async fn is_running(&self, slot_id: Uuid) -> GpuplaceResult<bool>;

    /// Slots this runtime currently manages
    async fn slots(&self) -> Vec<Uuid>;

    /// Get the runtime name
    fn name(&self) -> &'static str;
}
