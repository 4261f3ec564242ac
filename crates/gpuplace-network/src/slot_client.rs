//! HTTP slot client
//!
//! Talks to a runner's slot API at the endpoint the runner advertised in
//! its status reports.

use std::time::Duration;

use async_trait::async_trait;
use gpuplace_core::{CreateSlotRequest, GpuplaceError, GpuplaceResult, SlotStartReport};
use gpuplace_scheduler::{SlotClient, SlotTarget};
use tracing::debug;
use uuid::Uuid;

/// [`SlotClient`] over the runners' REST API
pub struct HttpSlotClient {
    client: reqwest::Client,
}

impl HttpSlotClient {
    /// Create a new client with a request timeout
    ///
    /// The timeout bounds the whole start request; the scheduler applies
    /// its own slot start timeout on top.
    pub fn new(timeout: Duration) -> GpuplaceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GpuplaceError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn base_url(target: &SlotTarget) -> GpuplaceResult<&str> {
        target
            .endpoint
            .as_deref()
            .map(|e| e.trim_end_matches('/'))
            .ok_or_else(|| {
                GpuplaceError::Network(format!(
                    "runner {} has not advertised a slot endpoint",
                    target.runner_id
                ))
            })
    }

    async fn error_from(response: reqwest::Response) -> GpuplaceError {
        let code = response.status();
        let body = response.text().await.unwrap_or_default();
        if code == reqwest::StatusCode::NOT_FOUND {
            GpuplaceError::SlotNotFound(body)
        } else {
            GpuplaceError::Runtime(format!("runner returned {}: {}", code, body))
        }
    }
}

#[async_trait]
impl SlotClient for HttpSlotClient {
    async fn create_slot(
        &self,
        target: &SlotTarget,
        request: &CreateSlotRequest,
    ) -> GpuplaceResult<SlotStartReport> {
        let url = format!("{}/api/v1/slots", Self::base_url(target)?);
        debug!(runner_id = %target.runner_id, slot_id = %request.slot_id, url = %url, "Creating slot");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| GpuplaceError::Network(format!("create slot on {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| GpuplaceError::Network(e.to_string()))?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn delete_slot(&self, target: &SlotTarget, slot_id: Uuid) -> GpuplaceResult<()> {
        let url = format!("{}/api/v1/slots/{}", Self::base_url(target)?, slot_id);
        debug!(runner_id = %target.runner_id, slot_id = %slot_id, url = %url, "Deleting slot");

        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| GpuplaceError::Network(format!("delete slot on {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuplace_core::RuntimeKind;

    fn request() -> CreateSlotRequest {
        CreateSlotRequest {
            slot_id: Uuid::new_v4(),
            runtime: RuntimeKind::Vllm,
            model: "meta-llama/Llama-3-8B".to_string(),
            model_memory_requirement_bytes: 16 << 30,
            context_length: 8192,
            runtime_args: Vec::new(),
            gpu_index: Some(0),
            gpu_indices: None,
            tensor_parallel_size: 1,
        }
    }

    #[test]
    fn test_base_url() {
        let target = SlotTarget {
            runner_id: "runner-a".to_string(),
            endpoint: Some("http://10.0.0.5:9191/".to_string()),
        };
        assert_eq!(HttpSlotClient::base_url(&target).unwrap(), "http://10.0.0.5:9191");
    }

    #[tokio::test]
    async fn test_missing_endpoint_fails() {
        let client = HttpSlotClient::new(Duration::from_secs(2)).unwrap();
        let target = SlotTarget {
            runner_id: "runner-a".to_string(),
            endpoint: None,
        };

        assert!(matches!(
            client.create_slot(&target, &request()).await,
            Err(GpuplaceError::Network(_))
        ));
        assert!(matches!(
            client.delete_slot(&target, Uuid::new_v4()).await,
            Err(GpuplaceError::Network(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_runner_is_network_error() {
        let client = HttpSlotClient::new(Duration::from_secs(2)).unwrap();
        let target = SlotTarget {
            runner_id: "runner-a".to_string(),
            endpoint: Some("http://127.0.0.1:1".to_string()),
        };

        assert!(matches!(
            client.create_slot(&target, &request()).await,
            Err(GpuplaceError::Network(_))
        ));
    }
}
