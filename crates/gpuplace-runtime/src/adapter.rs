//! Runtime adapters: translate a slot request into a process to launch
//!
//! Each variant owns its runtime's conventions for exposing GPUs and
//! parallelism. Flags the operator already passed through `runtime_args`
//! are never added a second time.

use std::path::PathBuf;

use gpuplace_core::{CreateSlotRequest, GpuplaceError, GpuplaceResult, RuntimeKind, SlotStartReport};

/// Everything needed to spawn a runtime process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Executable
    pub program: PathBuf,
    /// Command-line arguments
    pub args: Vec<String>,
    /// Environment variables set on top of the runner's environment
    pub env: Vec<(String, String)>,
    /// Port the runtime serves on
    pub port: u16,
}

impl ProcessSpec {
    /// Look up an environment variable
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Value following a flag, if the flag is present
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(|v| v.as_str())
    }
}

/// vLLM settings
#[derive(Debug, Clone)]
pub struct VllmConfig {
    /// Path to the `vllm` executable
    pub binary: PathBuf,
    /// Address the server binds to
    pub host: String,
    /// Run on CPU instead of GPUs
    pub cpu_only: bool,
}

impl Default for VllmConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("vllm"),
            host: "127.0.0.1".to_string(),
            cpu_only: false,
        }
    }
}

/// Ollama settings
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Path to the `ollama` executable
    pub binary: PathBuf,
    /// Address the server binds to
    pub host: String,
    /// Hide every GPU from the process
    pub cpu_only: bool,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ollama"),
            host: "127.0.0.1".to_string(),
            cpu_only: false,
        }
    }
}

/// A model runtime the runner can launch
#[derive(Debug, Clone)]
pub enum RuntimeAdapter {
    Vllm(VllmConfig),
    Ollama(OllamaConfig),
}

impl RuntimeAdapter {
    /// Runtime this adapter launches
    pub fn kind(&self) -> RuntimeKind {
        match self {
            RuntimeAdapter::Vllm(_) => RuntimeKind::Vllm,
            RuntimeAdapter::Ollama(_) => RuntimeKind::Ollama,
        }
    }

    /// Build the process for a slot request
    pub fn configure(&self, request: &CreateSlotRequest, port: u16) -> GpuplaceResult<ProcessSpec> {
        if request.runtime != self.kind() {
            return Err(GpuplaceError::Runtime(format!(
                "{} adapter cannot start a {} slot",
                self.kind(),
                request.runtime
            )));
        }

        match self {
            RuntimeAdapter::Vllm(config) => configure_vllm(config, request, port),
            RuntimeAdapter::Ollama(config) => Ok(configure_ollama(config, request, port)),
        }
    }

    /// How faithfully the runtime honors the request's placement
    pub fn start_report(&self, request: &CreateSlotRequest) -> SlotStartReport {
        match self {
            RuntimeAdapter::Ollama(_) if request.tensor_parallel_size > 1 => {
                SlotStartReport::Degraded {
                    reason: format!(
                        "ollama splits layers itself and ignores tensor parallel size {}",
                        request.tensor_parallel_size
                    ),
                }
            }
            RuntimeAdapter::Vllm(config) if config.cpu_only => SlotStartReport::Degraded {
                reason: "vllm running on CPU".to_string(),
            },
            _ => SlotStartReport::Started,
        }
    }
}

fn configure_vllm(
    config: &VllmConfig,
    request: &CreateSlotRequest,
    port: u16,
) -> GpuplaceResult<ProcessSpec> {
    let devices = request.visible_devices().ok_or_else(|| {
        GpuplaceError::Runtime(format!(
            "vllm slot {} has no GPU placement",
            request.slot_id
        ))
    })?;

    let custom = &request.runtime_args;
    let mut args = vec!["serve".to_string(), request.model.clone()];
    push_default(&mut args, custom, "--host", config.host.clone());
    push_default(&mut args, custom, "--port", port.to_string());
    push_default(&mut args, custom, "--served-model-name", request.model.clone());

    if request.context_length > 0 {
        push_default(&mut args, custom, "--max-model-len", request.context_length.to_string());
    }

    if config.cpu_only {
        push_default(&mut args, custom, "--device", "cpu".to_string());
        push_default(&mut args, custom, "--tensor-parallel-size", "1".to_string());
    } else if request.tensor_parallel_size > 0 {
        push_default(
            &mut args,
            custom,
            "--tensor-parallel-size",
            request.tensor_parallel_size.to_string(),
        );
    }

    args.extend(custom.iter().cloned());

    Ok(ProcessSpec {
        program: config.binary.clone(),
        args,
        env: vec![
            ("CUDA_VISIBLE_DEVICES".to_string(), device_list(&devices)),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ],
        port,
    })
}

fn configure_ollama(config: &OllamaConfig, request: &CreateSlotRequest, port: u16) -> ProcessSpec {
    let mut env = vec![
        ("OLLAMA_HOST".to_string(), format!("{}:{}", config.host, port)),
        ("OLLAMA_KEEP_ALIVE".to_string(), "-1".to_string()),
        ("OLLAMA_MAX_LOADED_MODELS".to_string(), "1".to_string()),
    ];

    match request.visible_devices() {
        Some(devices) => env.push(("CUDA_VISIBLE_DEVICES".to_string(), device_list(&devices))),
        None if config.cpu_only => env.push(("CUDA_VISIBLE_DEVICES".to_string(), "-1".to_string())),
        None => {}
    }

    if request.context_length > 0 {
        env.push((
            "OLLAMA_CONTEXT_LENGTH".to_string(),
            request.context_length.to_string(),
        ));
    }

    let mut args = vec!["serve".to_string()];
    args.extend(request.runtime_args.iter().cloned());

    ProcessSpec {
        program: config.binary.clone(),
        args,
        env,
        port,
    }
}

fn push_default(args: &mut Vec<String>, custom: &[String], flag: &str, value: String) {
    let overridden = custom
        .iter()
        .any(|a| a == flag || a.starts_with(&format!("{}=", flag)));
    if !overridden {
        args.push(flag.to_string());
        args.push(value);
    }
}

fn device_list(devices: &[u32]) -> String {
    devices
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuplace_core::GIB;
    use uuid::Uuid;

    fn request(runtime: RuntimeKind) -> CreateSlotRequest {
        CreateSlotRequest {
            slot_id: Uuid::new_v4(),
            runtime,
            model: "Qwen/Qwen2.5-7B-Instruct".to_string(),
            model_memory_requirement_bytes: 20 * GIB,
            context_length: 8192,
            runtime_args: Vec::new(),
            gpu_index: None,
            gpu_indices: Some(vec![2, 3]),
            tensor_parallel_size: 2,
        }
    }

    #[test]
    fn test_vllm_multi_gpu() {
        let adapter = RuntimeAdapter::Vllm(VllmConfig::default());
        let spec = adapter.configure(&request(RuntimeKind::Vllm), 31000).unwrap();

        assert_eq!(spec.env_var("CUDA_VISIBLE_DEVICES"), Some("2,3"));
        assert_eq!(spec.flag_value("--tensor-parallel-size"), Some("2"));
        assert_eq!(spec.flag_value("--max-model-len"), Some("8192"));
        assert_eq!(spec.flag_value("--port"), Some("31000"));
        assert_eq!(spec.args[0], "serve");
        assert_eq!(adapter.start_report(&request(RuntimeKind::Vllm)), SlotStartReport::Started);
    }

    #[test]
    fn test_vllm_single_gpu() {
        let mut req = request(RuntimeKind::Vllm);
        req.gpu_indices = None;
        req.gpu_index = Some(1);
        req.tensor_parallel_size = 1;

        let spec = RuntimeAdapter::Vllm(VllmConfig::default())
            .configure(&req, 31000)
            .unwrap();
        assert_eq!(spec.env_var("CUDA_VISIBLE_DEVICES"), Some("1"));
        assert_eq!(spec.flag_value("--tensor-parallel-size"), Some("1"));
    }

    #[test]
    fn test_vllm_auto_parallelism_omits_flag() {
        let mut req = request(RuntimeKind::Vllm);
        req.tensor_parallel_size = 0;
        let spec = RuntimeAdapter::Vllm(VllmConfig::default())
            .configure(&req, 31000)
            .unwrap();
        assert_eq!(spec.flag_value("--tensor-parallel-size"), None);
    }

    #[test]
    fn test_vllm_requires_placement() {
        let mut req = request(RuntimeKind::Vllm);
        req.gpu_indices = None;
        let result = RuntimeAdapter::Vllm(VllmConfig::default()).configure(&req, 31000);
        assert!(matches!(result, Err(GpuplaceError::Runtime(_))));
    }

    #[test]
    fn test_vllm_custom_args_win() {
        let mut req = request(RuntimeKind::Vllm);
        req.runtime_args = vec!["--max-model-len".to_string(), "4096".to_string()];
        let spec = RuntimeAdapter::Vllm(VllmConfig::default())
            .configure(&req, 31000)
            .unwrap();
        assert_eq!(spec.flag_value("--max-model-len"), Some("4096"));
        assert_eq!(spec.args.iter().filter(|a| *a == "--max-model-len").count(), 1);
    }

    #[test]
    fn test_vllm_cpu_only() {
        let adapter = RuntimeAdapter::Vllm(VllmConfig {
            cpu_only: true,
            ..Default::default()
        });
        let req = request(RuntimeKind::Vllm);
        let spec = adapter.configure(&req, 31000).unwrap();
        assert_eq!(spec.flag_value("--device"), Some("cpu"));
        assert_eq!(spec.flag_value("--tensor-parallel-size"), Some("1"));
        assert!(matches!(adapter.start_report(&req), SlotStartReport::Degraded { .. }));
    }

    #[test]
    fn test_ollama_env() {
        let adapter = RuntimeAdapter::Ollama(OllamaConfig::default());
        let req = request(RuntimeKind::Ollama);
        let spec = adapter.configure(&req, 31001).unwrap();

        assert_eq!(spec.args, vec!["serve"]);
        assert_eq!(spec.env_var("CUDA_VISIBLE_DEVICES"), Some("2,3"));
        assert_eq!(spec.env_var("OLLAMA_KEEP_ALIVE"), Some("-1"));
        assert_eq!(spec.env_var("OLLAMA_MAX_LOADED_MODELS"), Some("1"));
        assert_eq!(spec.env_var("OLLAMA_CONTEXT_LENGTH"), Some("8192"));
        assert_eq!(spec.env_var("OLLAMA_HOST"), Some("127.0.0.1:31001"));
        assert!(matches!(adapter.start_report(&req), SlotStartReport::Degraded { .. }));
    }

    #[test]
    fn test_ollama_without_placement_sees_all_gpus() {
        let mut req = request(RuntimeKind::Ollama);
        req.gpu_indices = None;
        req.tensor_parallel_size = 0;

        let spec = RuntimeAdapter::Ollama(OllamaConfig::default())
            .configure(&req, 31001)
            .unwrap();
        assert_eq!(spec.env_var("CUDA_VISIBLE_DEVICES"), None);

        let cpu = RuntimeAdapter::Ollama(OllamaConfig {
            cpu_only: true,
            ..Default::default()
        });
        let spec = cpu.configure(&req, 31001).unwrap();
        assert_eq!(spec.env_var("CUDA_VISIBLE_DEVICES"), Some("-1"));
        assert_eq!(cpu.start_report(&req), SlotStartReport::Started);
    }

    #[test]
    fn test_runtime_mismatch() {
        let adapter = RuntimeAdapter::Ollama(OllamaConfig::default());
        assert!(adapter.configure(&request(RuntimeKind::Vllm), 31000).is_err());
    }
}
