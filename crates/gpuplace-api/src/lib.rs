//! gpuplace-api: REST API servers for gpuplace
//!
//! This crate provides the two HTTP surfaces:
//! - Scheduler control plane (status ingestion, workloads, slots, runners)
//! - Runner slot API (create and stop slots, inventory)

pub mod rest;
pub mod runner;

pub use rest::create_router;
pub use runner::create_runner_router;
