//! Restricted-context backend
//!
//! Runs the script in-process, inside a fresh V8 isolate on a dedicated
//! thread (isolates are `!Send`). The sandbox sees only the capability
//! bindings and safe JS primitives; `Deno`, `eval` and the Function
//! constructors are stripped during bootstrap. Lowest overhead, weakest
//! isolation: a hostile script can still pressure process memory, so every
//! run races the watchdog deadline and heap ceiling in `runtime`, plus an
//! outer grace timeout here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::ExecutionBackend;
use crate::capabilities::{CapabilityHost, CapabilitySet};
use crate::core_types::{BackendKind, ExecutionLimits, ExecutionResult, ExecutionState};
use crate::runtime::{self, RunError};

/// Slack granted past the script deadline before the outer race gives up on
/// the isolate thread entirely.
const REAP_GRACE: Duration = Duration::from_millis(500);

pub struct RestrictedBackend;

impl RestrictedBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RestrictedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionBackend for RestrictedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Restricted
    }

    async fn run(
        &self,
        code: &str,
        capabilities: Arc<CapabilitySet>,
        limits: &ExecutionLimits,
    ) -> ExecutionResult {
        let started = Instant::now();
        let code = code.to_string();
        let context = capabilities.context().clone();
        let limits_for_run = limits.clone();
        let host: Arc<dyn CapabilityHost> = capabilities;

        let (tx, rx) = oneshot::channel();
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = tx.send(Err(RunError::Internal(e.to_string())));
                    return;
                }
            };
            let outcome =
                rt.block_on(runtime::run_script(host, &code, &context, &limits_for_run));
            if tx.send(outcome).is_err() {
                log::warn!("restricted run finished after its receiver was dropped");
            }
        });

        // The watchdog inside run_script enforces the deadline; this outer
        // race covers the isolate thread wedging before it even starts.
        let outcome = match tokio::time::timeout(limits.time() + REAP_GRACE, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RunError::Internal("isolate thread panicked".to_string())),
            Err(_) => {
                log::error!("restricted execution missed its deadline and the grace period");
                Err(RunError::Timeout)
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(output) => {
                let mut result = ExecutionResult::completed(output.result, elapsed_ms);
                result.truncated = output.truncated;
                result
            }
            Err(RunError::Timeout) => ExecutionResult::failed(
                ExecutionState::FailedTimeout,
                format!("execution timeout after {} ms", limits.time_ms),
                elapsed_ms,
            ),
            Err(RunError::HeapLimit) => ExecutionResult::failed(
                ExecutionState::FailedResourceLimit,
                format!("memory limit of {} bytes exceeded", limits.memory_bytes),
                elapsed_ms,
            ),
            Err(RunError::Js(message)) => {
                ExecutionResult::failed(ExecutionState::FailedError, message, elapsed_ms)
            }
            Err(RunError::Internal(detail)) => {
                log::error!("restricted backend internal failure: {}", detail);
                ExecutionResult::failed(
                    ExecutionState::FailedError,
                    "internal execution failure",
                    elapsed_ms,
                )
            }
        }
    }
}
