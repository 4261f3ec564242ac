//! gpuplace-network: Runner and scheduler HTTP plumbing
//!
//! This crate provides the two HTTP clients that connect runners and the scheduler:
//! - Status reporter pushing runner inventory to the scheduler
//! - Slot client the scheduler uses to start and stop slots on runners

pub mod reporter;
pub mod slot_client;

pub use reporter::{ReporterConfig, StatusReporter};
pub use slot_client::HttpSlotClient;
