//! Execution backends
//!
//! Three interchangeable isolation strategies behind one contract. They
//! differ only in isolation strength and overhead:
//!
//! - [`restricted::RestrictedBackend`]: in-process V8 isolate, fastest,
//!   weakest. Not a true security boundary on its own; always paired with
//!   the external hard-deadline race.
//! - [`worker::WorkerBackend`]: dedicated child process with a hard memory
//!   ceiling, message-based communication, never reused.
//! - [`container::ContainerBackend`]: ephemeral network-disabled container
//!   with CPU/memory quotas and a read-only root filesystem.
//!
//! Whatever happens inside, `run` always returns a well-formed
//! `ExecutionResult` in a terminal state.

use std::sync::Arc;

use async_trait::async_trait;

use crate::capabilities::CapabilitySet;
use crate::core_types::{BackendKind, ExecutionLimits, ExecutionResult};

pub mod container;
pub mod restricted;
pub mod worker;

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Run one script to a terminal state. The backend owns its underlying
    /// resource (thread, child process, container) for exactly this one
    /// execution; only the reaper may force-terminate it.
    async fn run(
        &self,
        code: &str,
        capabilities: Arc<CapabilitySet>,
        limits: &ExecutionLimits,
    ) -> ExecutionResult;
}
