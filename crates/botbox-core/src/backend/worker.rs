//! Isolated-worker backend
//!
//! Spawns a dedicated `botbox-worker` child process per execution. The child
//! applies a hard memory ceiling to itself (`RLIMIT_AS`, fixed at creation)
//! before touching any user code, then runs the shared script runtime.
//! Communication is strictly message-based: the job goes in on stdin,
//! capability calls come back as events and are served here against the
//! host-side capability set, and exactly one result event closes the run.
//! On deadline expiry the child is killed unconditionally and never reused.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

use super::ExecutionBackend;
use crate::capabilities::{CapabilityHost, CapabilitySet};
use crate::config::WorkerConfig;
use crate::core_types::{BackendKind, ExecutionLimits, ExecutionResult, ExecutionState};
use crate::errors::EngineError;
use crate::reaper::Reaper;
use crate::worker_protocol::{WorkerEvent, WorkerJob, WorkerOutcome, WorkerReply};

/// Slack past the script deadline for the child to wind down on its own
/// before the reaper kills it.
const REAP_GRACE: Duration = Duration::from_millis(500);

pub struct WorkerBackend {
    binary: PathBuf,
}

impl WorkerBackend {
    pub fn new(config: &WorkerConfig) -> Result<Self, EngineError> {
        let binary = match &config.binary_path {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    return Err(EngineError::BackendUnavailable(format!(
                        "worker binary not found at {}",
                        path.display()
                    )));
                }
                path
            }
            None => Self::discover_binary().ok_or_else(|| {
                EngineError::BackendUnavailable("worker binary not found".to_string())
            })?,
        };
        Ok(Self { binary })
    }

    /// Probe the usual locations for the worker binary.
    fn discover_binary() -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                candidates.push(dir.join("botbox-worker"));
            }
        }
        candidates.push(PathBuf::from("./target/debug/botbox-worker"));
        candidates.push(PathBuf::from("./target/release/botbox-worker"));
        candidates.push(PathBuf::from("/usr/local/bin/botbox-worker"));

        for path in candidates {
            if path.exists() {
                log::debug!("found worker binary at {}", path.display());
                return Some(path);
            }
        }
        None
    }

    async fn drive(
        &self,
        execution_id: Uuid,
        code: &str,
        capabilities: &Arc<CapabilitySet>,
        limits: &ExecutionLimits,
    ) -> Result<WorkerOutcome, ExecutionState> {
        let mut child = Command::new(&self.binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                log::error!("execution {}: failed to spawn worker: {}", execution_id, e);
                ExecutionState::FailedError
            })?;

        let mut stdin = child.stdin.take().expect("worker stdin piped");
        let stdout = child.stdout.take().expect("worker stdout piped");
        let mut lines = BufReader::new(stdout).lines();

        let job = WorkerJob {
            code: code.to_string(),
            context: capabilities.context().clone(),
            limits: limits.clone(),
        };
        let job_line = match serde_json::to_string(&job) {
            Ok(line) => line,
            Err(e) => {
                log::error!("execution {}: job serialization failed: {}", execution_id, e);
                Reaper::kill_child(execution_id, &mut child).await;
                return Err(ExecutionState::FailedError);
            }
        };
        if stdin
            .write_all(format!("{}\n", job_line).as_bytes())
            .await
            .is_err()
        {
            Reaper::kill_child(execution_id, &mut child).await;
            return Err(ExecutionState::FailedError);
        }

        let deadline = tokio::time::Instant::now() + limits.time() + REAP_GRACE;
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = tokio::time::sleep_until(deadline) => {
                    log::warn!("execution {}: worker deadline expired, reaping", execution_id);
                    Reaper::kill_child(execution_id, &mut child).await;
                    return Err(ExecutionState::FailedTimeout);
                }
            };

            let line = match line {
                Ok(Some(line)) => line,
                // EOF without a result event: the child crashed or was
                // killed by its own rlimit.
                Ok(None) => {
                    let status = child.wait().await.ok();
                    log::error!(
                        "execution {}: worker exited without a result ({:?})",
                        execution_id,
                        status
                    );
                    return Err(ExecutionState::FailedError);
                }
                Err(e) => {
                    log::error!("execution {}: worker read failed: {}", execution_id, e);
                    Reaper::kill_child(execution_id, &mut child).await;
                    return Err(ExecutionState::FailedError);
                }
            };

            let event: WorkerEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    log::error!(
                        "execution {}: malformed worker event ({}): {:?}",
                        execution_id,
                        e,
                        line
                    );
                    Reaper::kill_child(execution_id, &mut child).await;
                    return Err(ExecutionState::FailedError);
                }
            };

            match event {
                WorkerEvent::Console { level, message } => {
                    capabilities.console_log(&level, &message);
                }
                WorkerEvent::Call {
                    id,
                    capability,
                    method,
                    args,
                } => {
                    let reply = match capabilities.call(&capability, &method, args).await {
                        Ok(value) => WorkerReply {
                            id,
                            ok: Some(value),
                            err: None,
                        },
                        Err(e) => WorkerReply {
                            id,
                            ok: None,
                            err: Some(e.to_string()),
                        },
                    };
                    let reply_line =
                        serde_json::to_string(&reply).unwrap_or_else(|_| "{}".to_string());
                    if stdin
                        .write_all(format!("{}\n", reply_line).as_bytes())
                        .await
                        .is_err()
                    {
                        Reaper::kill_child(execution_id, &mut child).await;
                        return Err(ExecutionState::FailedError);
                    }
                }
                WorkerEvent::Result { outcome } => {
                    // Give the child a moment to exit cleanly, then make sure.
                    match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
                        Ok(_) => {}
                        Err(_) => Reaper::kill_child(execution_id, &mut child).await,
                    }
                    return Ok(outcome);
                }
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for WorkerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Worker
    }

    async fn run(
        &self,
        code: &str,
        capabilities: Arc<CapabilitySet>,
        limits: &ExecutionLimits,
    ) -> ExecutionResult {
        let started = Instant::now();
        let execution_id = capabilities.execution_id;
        let outcome = self.drive(execution_id, code, &capabilities, limits).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(WorkerOutcome::Ok {
                result,
                truncated,
                memory_bytes,
            }) => {
                let mut out = ExecutionResult::completed(result, elapsed_ms);
                out.truncated = truncated;
                out.memory_bytes = memory_bytes;
                out
            }
            Ok(WorkerOutcome::Timeout) | Err(ExecutionState::FailedTimeout) => {
                ExecutionResult::failed(
                    ExecutionState::FailedTimeout,
                    format!("execution timeout after {} ms", limits.time_ms),
                    elapsed_ms,
                )
            }
            Ok(WorkerOutcome::MemoryExceeded) => ExecutionResult::failed(
                ExecutionState::FailedResourceLimit,
                format!("memory limit of {} bytes exceeded", limits.memory_bytes),
                elapsed_ms,
            ),
            Ok(WorkerOutcome::ScriptError { message }) => {
                ExecutionResult::failed(ExecutionState::FailedError, message, elapsed_ms)
            }
            Ok(WorkerOutcome::Internal { message }) => {
                log::error!("execution {}: worker internal failure: {}", execution_id, message);
                ExecutionResult::failed(
                    ExecutionState::FailedError,
                    "internal execution failure",
                    elapsed_ms,
                )
            }
            Err(state) => {
                ExecutionResult::failed(state, "worker execution failed", elapsed_ms)
            }
        }
    }
}
