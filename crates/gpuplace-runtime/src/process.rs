//! Process-based runtime implementation
//!
//! This runtime launches each slot's model server as a direct OS process,
//! configured by the matching [`RuntimeAdapter`].

use async_trait::async_trait;
use gpuplace_core::{
    CreateSlotRequest, GpuplaceError, GpuplaceResult, RunnerConfig, RuntimeKind, SlotStartReport,
};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{OllamaConfig, ProcessSpec, RuntimeAdapter, VllmConfig};
use crate::inventory::InventoryTracker;
use crate::traits::SlotRuntime;

/// Process-based runtime configuration
#[derive(Debug, Clone)]
pub struct ProcessRuntimeConfig {
    /// vLLM adapter settings
    pub vllm: VllmConfig,
    /// Ollama adapter settings
    pub ollama: OllamaConfig,
    /// First port handed to slot processes
    pub base_port: u16,
    /// How long a fresh process must survive to count as started
    pub startup_grace: Duration,
}

impl Default for ProcessRuntimeConfig {
    fn default() -> Self {
        Self {
            vllm: VllmConfig::default(),
            ollama: OllamaConfig::default(),
            base_port: 31000,
            startup_grace: Duration::from_millis(500),
        }
    }
}

impl ProcessRuntimeConfig {
    /// Derive runtime settings from the runner configuration
    pub fn from_runner(config: &RunnerConfig) -> Self {
        Self {
            vllm: VllmConfig {
                binary: config.vllm_path.clone(),
                cpu_only: config.cpu_only,
                ..Default::default()
            },
            ollama: OllamaConfig {
                binary: config.ollama_path.clone(),
                cpu_only: config.cpu_only,
                ..Default::default()
            },
            base_port: config.runtime_base_port,
            ..Default::default()
        }
    }
}

struct SlotProcess {
    child: Child,
    port: u16,
}

/// Process-based runtime for managing slots
pub struct ProcessRuntime {
    config: ProcessRuntimeConfig,
    inventory: Arc<InventoryTracker>,
    processes: Mutex<HashMap<Uuid, SlotProcess>>,
}

impl ProcessRuntime {
    /// Create a new process runtime
    pub fn new(config: ProcessRuntimeConfig, inventory: Arc<InventoryTracker>) -> Self {
        Self {
            config,
            inventory,
            processes: Mutex::new(HashMap::new()),
        }
    }

    fn adapter_for(&self, runtime: RuntimeKind) -> RuntimeAdapter {
        match runtime {
            RuntimeKind::Vllm => RuntimeAdapter::Vllm(self.config.vllm.clone()),
            RuntimeKind::Ollama => RuntimeAdapter::Ollama(self.config.ollama.clone()),
        }
    }

    /// Lowest port at or above the base port not used by a slot
    fn next_port(&self, processes: &HashMap<Uuid, SlotProcess>) -> GpuplaceResult<u16> {
        let used: Vec<u16> = processes.values().map(|p| p.port).collect();
        (self.config.base_port..=u16::MAX)
            .find(|p| !used.contains(p))
            .ok_or_else(|| GpuplaceError::Runtime("no free ports for slot".to_string()))
    }

    /// Build the command for a process spec
    fn build_command(spec: &ProcessSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);

        cmd
    }

    /// Spawn a process for a slot and wait out the startup grace period
    pub async fn spawn(&self, slot_id: Uuid, spec: ProcessSpec) -> GpuplaceResult<u32> {
        let mut processes = self.processes.lock().await;
        self.spawn_locked(&mut processes, slot_id, spec).await
    }

    async fn spawn_locked(
        &self,
        processes: &mut HashMap<Uuid, SlotProcess>,
        slot_id: Uuid,
        spec: ProcessSpec,
    ) -> GpuplaceResult<u32> {
        if processes.contains_key(&slot_id) {
            return Err(GpuplaceError::Runtime(format!(
                "slot {} already has a process",
                slot_id
            )));
        }

        let mut child = Self::build_command(&spec).spawn().map_err(|e| {
            error!(slot_id = %slot_id, program = ?spec.program, error = %e, "Failed to spawn slot process");
            GpuplaceError::Runtime(format!("Failed to spawn {}: {}", spec.program.display(), e))
        })?;
        let pid = child.id().unwrap_or(0);

        debug!(slot_id = %slot_id, pid = pid, "Slot process spawned");

        tokio::time::sleep(self.config.startup_grace).await;
        if let Some(status) = child.try_wait()? {
            return Err(GpuplaceError::Runtime(format!(
                "{} exited during startup: {}",
                spec.program.display(),
                status
            )));
        }

        processes.insert(
            slot_id,
            SlotProcess {
                child,
                port: spec.port,
            },
        );
        Ok(pid)
    }

    /// Port a slot serves on
    pub async fn port_of(&self, slot_id: Uuid) -> Option<u16> {
        self.processes.lock().await.get(&slot_id).map(|p| p.port)
    }
}

#[async_trait]
impl SlotRuntime for ProcessRuntime {
    async fn start_slot(&self, request: &CreateSlotRequest) -> GpuplaceResult<SlotStartReport> {
        if let Some(devices) = request.visible_devices() {
            for index in devices {
                if !self.inventory.has_gpu(index).await {
                    return Err(GpuplaceError::Runtime(format!(
                        "GPU {} is not present on runner {}",
                        index,
                        self.inventory.runner_id()
                    )));
                }
            }
        }

        let adapter = self.adapter_for(request.runtime);
        let mut processes = self.processes.lock().await;
        let port = self.next_port(&processes)?;
        let spec = adapter.configure(request, port)?;

        info!(
            slot_id = %request.slot_id,
            runtime = %request.runtime,
            model = %request.model,
            gpus = ?request.visible_devices(),
            tensor_parallel_size = request.tensor_parallel_size,
            port = port,
            "Starting slot process"
        );

        let pid = self.spawn_locked(&mut processes, request.slot_id, spec).await?;
        drop(processes);

        let report = adapter.start_report(request);
        if let SlotStartReport::Degraded { reason } = &report {
            warn!(slot_id = %request.slot_id, reason = %reason, "Slot started degraded");
        }
        info!(slot_id = %request.slot_id, pid = pid, "Slot process running");

        Ok(report)
    }

    async fn stop_slot(&self, slot_id: Uuid) -> GpuplaceResult<()> {
        let process = self.processes.lock().await.remove(&slot_id);
        let Some(mut process) = process else {
            return Err(GpuplaceError::SlotNotFound(slot_id.to_string()));
        };

        info!(slot_id = %slot_id, pid = ?process.child.id(), "Stopping slot process");

        process.child.start_kill()?;
        if tokio::time::timeout(Duration::from_secs(10), process.child.wait())
            .await
            .is_err()
        {
            warn!(slot_id = %slot_id, "Slot process did not exit within 10s");
        }
        Ok(())
    }

    async fn is_running(&self, slot_id: Uuid) -> GpuplaceResult<bool> {
        let mut processes = self.processes.lock().await;
        match processes.get_mut(&slot_id) {
            Some(process) => Ok(process.child.try_wait()?.is_none()),
            None => Ok(false),
        }
    }

    async fn slots(&self) -> Vec<Uuid> {
        self.processes.lock().await.keys().copied().collect()
    }

    fn name(&self) -> &'static str {
        "process"
    }
}
