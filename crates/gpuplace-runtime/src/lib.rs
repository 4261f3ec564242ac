//! gpuplace-runtime: Runner-side components
//!
//! This crate provides what runs on each runner machine:
//! - GPU inventory tracker with degraded fallback
//! - Runtime adapters for vLLM and Ollama
//! - Process-based runtime that launches slots

pub mod adapter;
pub mod inventory;
pub mod process;
pub mod traits;

pub use adapter::{OllamaConfig, ProcessSpec, RuntimeAdapter, VllmConfig};
pub use inventory::{InventoryConfig, InventoryTracker, ProbeDetector};
pub use process::{ProcessRuntime, ProcessRuntimeConfig};
pub use traits::SlotRuntime;
