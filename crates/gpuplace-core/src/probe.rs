//! Hardware probes that read per-GPU memory from the local machine

use nvml_wrapper::Nvml;
use tracing::{debug, warn};

use crate::{GpuInfo, GpuplaceError, GpuplaceResult, GIB, KIB};

/// Capacity assumed when neither the hardware nor the host can tell us
pub const DEFAULT_SIMULATED_MEMORY: u64 = 16 * GIB;

/// Source of per-GPU memory readings
pub trait GpuProbe: Send + Sync {
    /// Query every GPU on the machine
    fn query(&self) -> GpuplaceResult<Vec<GpuInfo>>;

    /// Get the probe name
    fn name(&self) -> &'static str;
}

/// NVIDIA probe backed by NVML
pub struct NvmlProbe {
    nvml: Nvml,
}

impl NvmlProbe {
    /// Load the NVML library; fails when the driver is absent
    pub fn init() -> GpuplaceResult<Self> {
        let nvml = Nvml::init()?;
        Ok(Self { nvml })
    }
}

impl GpuProbe for NvmlProbe {
    fn query(&self) -> GpuplaceResult<Vec<GpuInfo>> {
        let count = self.nvml.device_count()?;
        if count == 0 {
            return Err(GpuplaceError::Detection("NVML reports no devices".to_string()));
        }

        let mut gpus = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = self.nvml.device_by_index(index)?;
            let memory = device.memory_info()?;
            let name = device.name().unwrap_or_else(|_| format!("GPU {}", index));

            debug!(
                gpu = index,
                total = memory.total,
                free = memory.free,
                "Read GPU memory"
            );

            gpus.push(GpuInfo {
                index,
                name,
                total_memory_bytes: memory.total,
                free_memory_bytes: memory.free,
                used_memory_bytes: memory.used,
            });
        }

        Ok(gpus)
    }

    fn name(&self) -> &'static str {
        "nvml"
    }
}

/// Synthesized single-GPU inventory for machines without GPUs
#[derive(Debug, Clone)]
pub struct SimulatedProbe {
    memory_bytes: u64,
}

impl SimulatedProbe {
    /// Simulate one GPU of the given capacity
    pub fn new(memory_bytes: u64) -> Self {
        Self { memory_bytes }
    }

    /// Simulate one GPU sized to the host's memory
    pub fn from_host() -> Self {
        let memory_bytes = host_memory_bytes().unwrap_or_else(|| {
            warn!(
                default = DEFAULT_SIMULATED_MEMORY,
                "Could not read host memory, using default simulated capacity"
            );
            DEFAULT_SIMULATED_MEMORY
        });
        Self::new(memory_bytes)
    }

    /// Simulated capacity in bytes
    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }
}

impl GpuProbe for SimulatedProbe {
    fn query(&self) -> GpuplaceResult<Vec<GpuInfo>> {
        let mut gpu = GpuInfo::idle(0, self.memory_bytes);
        gpu.name = "Simulated GPU".to_string();
        Ok(vec![gpu])
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

/// Total host memory, read from /proc/meminfo
pub fn host_memory_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_total(&meminfo)
}

fn parse_meminfo_total(meminfo: &str) -> Option<u64> {
    // MemTotal:       16333764 kB
    meminfo
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * KIB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_probe_single_gpu() {
        let probe = SimulatedProbe::new(24 * GIB);
        let gpus = probe.query().unwrap();
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].index, 0);
        assert_eq!(gpus[0].free_memory_bytes, 24 * GIB);
        assert_eq!(probe.name(), "simulated");
    }

    #[test]
    fn test_parse_meminfo_total() {
        let meminfo = "MemTotal:       16333764 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_meminfo_total(meminfo), Some(16333764 * KIB));
        assert_eq!(parse_meminfo_total("MemFree: 12 kB"), None);
    }
}
