//! gpuplace-core: Core types for the gpuplace GPU scheduler
//!
//! This crate provides the fundamental types used throughout the gpuplace system:
//! - GPU inventory records and runner status reports
//! - Workload, placement, allocation and slot types
//! - Memory specification parsing
//! - Hardware probes
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod gpu;
pub mod memory;
pub mod model;
pub mod probe;

pub use config::*;
pub use error::*;
pub use gpu::*;
pub use memory::*;
pub use model::*;
pub use probe::*;
