//! Error types for the execution engine
//!
//! This module defines the failure vocabulary of the engine. The split follows
//! the propagation policy: `Validation` and `BackendUnavailable` fail fast,
//! synchronously, before any resource is allocated; every other failure is
//! captured inside the engine, sanitized, persisted and returned to the caller
//! as a well-formed `ExecutionResult`, never thrown past the engine boundary.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Execution timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

/// Errors raised by an individual capability. These surface inside the
/// sandbox as ordinary script-level errors, not as host-level failures,
/// so a script can catch them.
#[derive(Error, Debug, Clone)]
pub enum CapabilityError {
    #[error("unknown capability method: {0}")]
    UnknownMethod(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("http: {0}")]
    Http(String),
    #[error("bot: {0}")]
    Bot(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
}

// Specific error for the container backend
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Bollard (Docker client) error: {0}")]
    Bollard(#[from] bollard::errors::Error),
    #[error("Container output exceeded {limit} bytes")]
    OutputOverflow { limit: usize },
    #[error("Container execution timed out")]
    Timeout,
}
