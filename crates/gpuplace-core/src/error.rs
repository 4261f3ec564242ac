//! Error types for gpuplace

use thiserror::Error;

/// Main error type for gpuplace
#[derive(Error, Debug)]
pub enum GpuplaceError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Memory specification could not be parsed
    #[error("Invalid memory specification: {0}")]
    InvalidMemory(String),

    /// Hardware query failed
    #[error("GPU detection error: {0}")]
    Detection(String),

    /// Runner status report violates its own invariants
    #[error("Invalid runner status: {0}")]
    InvalidStatus(String),

    /// Runtime adapter error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Runner not found
    #[error("Runner not found: {0}")]
    RunnerNotFound(String),

    /// Workload not found
    #[error("Workload not found: {0}")]
    WorkloadNotFound(String),

    /// Slot not found
    #[error("Slot not found: {0}")]
    SlotNotFound(String),

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpuplace operations
pub type GpuplaceResult<T> = Result<T, GpuplaceError>;

impl From<serde_json::Error> for GpuplaceError {
    fn from(err: serde_json::Error) -> Self {
        GpuplaceError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for GpuplaceError {
    fn from(err: toml::de::Error) -> Self {
        GpuplaceError::Config(err.to_string())
    }
}

impl From<nvml_wrapper::error::NvmlError> for GpuplaceError {
    fn from(err: nvml_wrapper::error::NvmlError) -> Self {
        GpuplaceError::Detection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GpuplaceError::InvalidMemory("8XB".to_string());
        assert_eq!(err.to_string(), "Invalid memory specification: 8XB");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GpuplaceError = io_err.into();
        assert!(matches!(err, GpuplaceError::Io(_)));
    }

    #[test]
    fn test_error_from_toml() {
        let err: GpuplaceError = toml::from_str::<toml::Value>("= broken").unwrap_err().into();
        assert!(matches!(err, GpuplaceError::Config(_)));
    }
}
