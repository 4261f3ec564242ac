//! GPU inventory tracker
//!
//! Owns the runner's view of its GPUs. Detection never fails startup: when
//! the hardware cannot be queried (or CPU-only mode is forced) a single
//! synthesized GPU stands in and the runner is reported as degraded.
//! Detection is retried on every refresh until hardware shows up.

use std::sync::Arc;
use std::time::Duration;

use gpuplace_core::{
    apply_memory_cap, format_bytes, GpuInfo, GpuProbe, GpuplaceError, GpuplaceResult, NvmlProbe,
    RunnerConfig, RunnerStatus, SimulatedProbe,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Settings for inventory detection
#[derive(Debug, Clone)]
pub struct InventoryConfig {
    /// Runner identifier stamped on every snapshot
    pub runner_id: String,
    /// Skip hardware detection and simulate one GPU
    pub cpu_only: bool,
    /// Operator memory cap, also the simulated capacity
    pub memory: Option<u64>,
    /// Capacity synthesized when detection fails
    pub fallback_memory: u64,
}

impl InventoryConfig {
    /// Derive inventory settings from the runner configuration
    pub fn from_runner(runner_id: impl Into<String>, config: &RunnerConfig) -> Self {
        Self {
            runner_id: runner_id.into(),
            cpu_only: config.cpu_only,
            memory: config.memory,
            fallback_memory: config.fallback_memory,
        }
    }
}

/// Opens a hardware probe
pub type ProbeDetector = Arc<dyn Fn() -> GpuplaceResult<Arc<dyn GpuProbe>> + Send + Sync>;

fn nvml_detector() -> ProbeDetector {
    Arc::new(|| NvmlProbe::init().map(|probe| Arc::new(probe) as Arc<dyn GpuProbe>))
}

/// Tracks per-GPU memory on the local runner
pub struct InventoryTracker {
    runner_id: String,
    cpu_only: bool,
    /// Source of readings; `None` while detection has not found hardware
    probe: RwLock<Option<Arc<dyn GpuProbe>>>,
    detector: ProbeDetector,
    memory_cap: Option<u64>,
    current: RwLock<RunnerStatus>,
}

impl InventoryTracker {
    /// Detect the local GPUs through NVML
    pub fn detect(config: &InventoryConfig) -> Self {
        Self::detect_with(config, nvml_detector())
    }

    /// Detect the local GPUs with a custom detector
    pub fn detect_with(config: &InventoryConfig, detector: ProbeDetector) -> Self {
        if config.cpu_only {
            let probe = match config.memory {
                Some(memory) => SimulatedProbe::new(memory),
                None => SimulatedProbe::from_host(),
            };
            info!(
                runner_id = %config.runner_id,
                memory = %format_bytes(probe.memory_bytes()),
                "CPU-only mode, simulating a single GPU"
            );
            let gpus = probe.query().unwrap_or_default();
            return Self::from_gpus(config, None, gpus, true).with_detector(detector);
        }

        match detector() {
            Ok(probe) => Self::with_probe(config, probe).with_detector(detector),
            Err(e) => {
                warn!(error = %e, "GPU detection failed, using degraded inventory");
                Self::degraded(config).with_detector(detector)
            }
        }
    }

    /// Replace the detector used to retry hardware detection
    pub fn with_detector(mut self, detector: ProbeDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Build a tracker around an explicit probe
    pub fn with_probe(config: &InventoryConfig, probe: Arc<dyn GpuProbe>) -> Self {
        match probe.query() {
            Ok(gpus) => {
                info!(
                    runner_id = %config.runner_id,
                    probe = probe.name(),
                    gpus = gpus.len(),
                    "Detected GPUs"
                );
                Self::from_gpus(config, Some(probe), gpus, false)
            }
            Err(e) => {
                warn!(
                    probe = probe.name(),
                    error = %e,
                    "GPU query failed, using degraded inventory"
                );
                let mut tracker = Self::degraded(config);
                tracker.probe = RwLock::new(Some(probe));
                tracker
            }
        }
    }

    fn degraded(config: &InventoryConfig) -> Self {
        let gpus = vec![GpuInfo {
            name: "Estimated GPU".to_string(),
            ..GpuInfo::idle(0, config.fallback_memory)
        }];
        Self::from_gpus(config, None, gpus, true)
    }

    fn from_gpus(
        config: &InventoryConfig,
        probe: Option<Arc<dyn GpuProbe>>,
        mut gpus: Vec<GpuInfo>,
        degraded: bool,
    ) -> Self {
        if let Some(cap) = config.memory {
            apply_memory_cap(&mut gpus, cap);
        }
        Self {
            runner_id: config.runner_id.clone(),
            cpu_only: config.cpu_only,
            probe: RwLock::new(probe),
            detector: nvml_detector(),
            memory_cap: config.memory,
            current: RwLock::new(RunnerStatus::from_gpus(&config.runner_id, gpus, degraded)),
        }
    }

    /// Runner identifier
    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    /// Latest snapshot
    pub async fn snapshot(&self) -> RunnerStatus {
        let mut status = self.current.read().await.clone();
        status.reported_at = chrono::Utc::now();
        status
    }

    /// Whether the inventory is synthesized
    pub async fn is_degraded(&self) -> bool {
        self.current.read().await.degraded
    }

    /// Re-query the hardware
    ///
    /// On failure the previous snapshot is kept and the error is returned
    /// for the caller to log. Without a probe, detection is attempted again
    /// unless the runner is CPU-only.
    pub async fn refresh(&self) -> GpuplaceResult<()> {
        let current_probe = self.probe.read().await.clone();
        let probe = match current_probe {
            Some(probe) => probe,
            None if self.cpu_only => return Ok(()),
            None => match self.redetect().await {
                Some(probe) => probe,
                None => return Ok(()),
            },
        };

        let mut gpus = tokio::task::spawn_blocking(move || probe.query())
            .await
            .map_err(|e| GpuplaceError::Internal(format!("probe task failed: {}", e)))??;

        if let Some(cap) = self.memory_cap {
            apply_memory_cap(&mut gpus, cap);
        }

        let status = RunnerStatus::from_gpus(&self.runner_id, gpus, false);
        let mut current = self.current.write().await;
        if current.degraded {
            info!(runner_id = %self.runner_id, "GPU query recovered, inventory no longer degraded");
        }
        debug!(
            runner_id = %self.runner_id,
            free = status.free_memory_bytes,
            used = status.used_memory_bytes,
            "Inventory refreshed"
        );
        *current = status;
        Ok(())
    }

    async fn redetect(&self) -> Option<Arc<dyn GpuProbe>> {
        let detector = self.detector.clone();
        let detected = match tokio::task::spawn_blocking(move || detector()).await {
            Ok(detected) => detected,
            Err(e) => Err(GpuplaceError::Internal(format!("detection task failed: {}", e))),
        };
        match detected {
            Ok(probe) => {
                info!(runner_id = %self.runner_id, probe = probe.name(), "GPU detection succeeded");
                *self.probe.write().await = Some(probe.clone());
                Some(probe)
            }
            Err(e) => {
                debug!(runner_id = %self.runner_id, error = %e, "GPUs still unavailable");
                None
            }
        }
    }

    /// Refresh on a fixed interval, warning on failures
    pub fn spawn_refresh_loop(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Err(e) = self.refresh().await {
                    warn!(
                        runner_id = %self.runner_id,
                        error = %e,
                        "Inventory refresh failed, keeping previous snapshot"
                    );
                }
            }
        })
    }

    /// Whether a GPU index exists on this runner
    pub async fn has_gpu(&self, index: u32) -> bool {
        self.current.read().await.gpu(index).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuplace_core::GIB;
    use std::sync::Mutex;

    /// Returns queued results in order, repeating the last one
    struct ScriptedProbe {
        results: Mutex<Vec<GpuplaceResult<Vec<GpuInfo>>>>,
    }

    impl ScriptedProbe {
        fn new(results: Vec<GpuplaceResult<Vec<GpuInfo>>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
            })
        }
    }

    impl GpuProbe for ScriptedProbe {
        fn query(&self) -> GpuplaceResult<Vec<GpuInfo>> {
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                return results.remove(0);
            }
            match results.first() {
                Some(Ok(gpus)) => Ok(gpus.clone()),
                _ => Err(GpuplaceError::Detection("driver not loaded".to_string())),
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn config() -> InventoryConfig {
        InventoryConfig {
            runner_id: "runner-a".to_string(),
            cpu_only: false,
            memory: None,
            fallback_memory: 16 * GIB,
        }
    }

    fn two_gpus(free: u64) -> Vec<GpuInfo> {
        (0..2)
            .map(|i| GpuInfo {
                index: i,
                name: "NVIDIA A100".to_string(),
                total_memory_bytes: 40 * GIB,
                free_memory_bytes: free,
                used_memory_bytes: 40 * GIB - free,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_detect_with_working_probe() {
        let tracker = InventoryTracker::with_probe(&config(), ScriptedProbe::new(vec![Ok(two_gpus(40 * GIB))]));
        let status = tracker.snapshot().await;

        assert_eq!(status.runner_id, "runner-a");
        assert_eq!(status.gpu_count, 2);
        assert_eq!(status.free_memory_bytes, 80 * GIB);
        assert!(!status.degraded);
        assert!(status.validate().is_ok());
    }

    #[tokio::test]
    async fn test_detection_failure_degrades() {
        let probe = ScriptedProbe::new(vec![Err(GpuplaceError::Detection("no driver".to_string()))]);
        let tracker = InventoryTracker::with_probe(&config(), probe);
        let status = tracker.snapshot().await;

        assert!(status.degraded);
        assert_eq!(status.gpu_count, 1);
        assert_eq!(status.total_memory_bytes, 16 * GIB);
        assert!(status.validate().is_ok());
    }

    #[tokio::test]
    async fn test_cpu_only_mode() {
        let config = InventoryConfig {
            cpu_only: true,
            memory: Some(32 * GIB),
            ..config()
        };
        let tracker = InventoryTracker::detect(&config);
        let status = tracker.snapshot().await;

        assert!(status.degraded);
        assert_eq!(status.gpu_count, 1);
        assert_eq!(status.gpus[0].total_memory_bytes, 32 * GIB);
        assert!(tracker.refresh().await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_updates_snapshot() {
        let probe = ScriptedProbe::new(vec![Ok(two_gpus(40 * GIB)), Ok(two_gpus(10 * GIB))]);
        let tracker = InventoryTracker::with_probe(&config(), probe);

        tracker.refresh().await.unwrap();
        assert_eq!(tracker.snapshot().await.free_memory_bytes, 20 * GIB);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_previous_snapshot() {
        let probe = ScriptedProbe::new(vec![
            Ok(two_gpus(30 * GIB)),
            Err(GpuplaceError::Detection("timeout".to_string())),
        ]);
        let tracker = InventoryTracker::with_probe(&config(), probe);

        assert!(tracker.refresh().await.is_err());
        let status = tracker.snapshot().await;
        assert_eq!(status.free_memory_bytes, 60 * GIB);
        assert!(!status.degraded);
    }

    #[tokio::test]
    async fn test_refresh_recovers_from_degraded() {
        let probe = ScriptedProbe::new(vec![
            Err(GpuplaceError::Detection("busy".to_string())),
            Ok(two_gpus(40 * GIB)),
        ]);
        let tracker = InventoryTracker::with_probe(&config(), probe);
        assert!(tracker.is_degraded().await);

        tracker.refresh().await.unwrap();
        assert!(!tracker.is_degraded().await);
        assert_eq!(tracker.snapshot().await.gpu_count, 2);
        assert!(tracker.has_gpu(1).await);
    }

    /// Fails the first `failures` calls, then hands out the probe
    fn flaky_detector(
        failures: usize,
        probe: Arc<ScriptedProbe>,
        calls: Arc<std::sync::atomic::AtomicUsize>,
    ) -> ProbeDetector {
        Arc::new(move || {
            let call = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call < failures {
                Err(GpuplaceError::Detection("driver not loaded".to_string()))
            } else {
                Ok(probe.clone() as Arc<dyn GpuProbe>)
            }
        })
    }

    #[tokio::test]
    async fn test_detection_retried_while_degraded() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let probe = ScriptedProbe::new(vec![Ok(two_gpus(40 * GIB))]);
        let tracker = InventoryTracker::detect_with(&config(), flaky_detector(2, probe, calls.clone()));
        assert!(tracker.is_degraded().await);

        tracker.refresh().await.unwrap();
        assert!(tracker.is_degraded().await);

        tracker.refresh().await.unwrap();
        assert!(!tracker.is_degraded().await);
        assert_eq!(tracker.snapshot().await.free_memory_bytes, 80 * GIB);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);

        tracker.refresh().await.unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cpu_only_never_detects() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let probe = ScriptedProbe::new(vec![Ok(two_gpus(40 * GIB))]);
        let config = InventoryConfig {
            cpu_only: true,
            memory: Some(8 * GIB),
            ..config()
        };
        let tracker = InventoryTracker::detect_with(&config, flaky_detector(0, probe, calls.clone()));

        tracker.refresh().await.unwrap();
        assert!(tracker.is_degraded().await);
        assert_eq!(tracker.snapshot().await.gpu_count, 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_memory_cap_applied() {
        let config = InventoryConfig {
            memory: Some(40 * GIB),
            ..config()
        };
        let tracker = InventoryTracker::with_probe(&config, ScriptedProbe::new(vec![Ok(two_gpus(40 * GIB))]));
        let status = tracker.snapshot().await;
        assert_eq!(status.total_memory_bytes, 40 * GIB);
        assert_eq!(status.gpus[0].total_memory_bytes, 20 * GIB);
    }
}
