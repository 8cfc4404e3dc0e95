//! Container backend
//!
//! Strongest isolation: each execution gets an ephemeral container with
//! networking disabled, a read-only root filesystem, all capabilities
//! dropped, a non-root user, and explicit CPU/memory/pid quotas. The script
//! is passed as the container's sole command (`node -e …`); stdout/stderr
//! are streamed with an inline byte ceiling; crossing it kills the
//! container immediately. Containers are created with auto-remove and are
//! additionally force-removed by the reaper on timeout or overflow.
//!
//! The capability bridge does not cross the container boundary: console
//! output is recovered from the captured stdout, and `storage`/`http`/`bot`
//! are not bound inside the container.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use super::ExecutionBackend;
use crate::capabilities::{CapabilityHost, CapabilitySet};
use crate::config::ContainerConfig;
use crate::core_types::{
    truncate_output, BackendKind, ContextValue, ExecutionLimits, ExecutionResult, ExecutionState,
};
use crate::errors::ContainerError;
use crate::reaper::Reaper;
use crate::runtime::is_safe_binding;

/// Sentinel prefixing the single stdout line that carries the result
/// envelope out of the container.
const RESULT_MARKER: &str = "__BOTBOX_RESULT__";

/// Exit code Linux reports for an OOM/SIGKILL'd container process.
const EXIT_OOM_KILLED: i64 = 137;

/// Slack past the script deadline before the reaper steps in.
const REAP_GRACE: Duration = Duration::from_millis(1_000);

pub struct ContainerBackend {
    docker: Docker,
    config: ContainerConfig,
}

/// Raw captured log bytes for one container run. Docker delivers frames
/// split at arbitrary byte offsets, so a multi-byte character can straddle
/// two frames; bytes are accumulated as-is and decoded exactly once, lossily,
/// after the stream is done.
struct LogCapture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    ceiling: usize,
}

impl LogCapture {
    fn new(ceiling: usize) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            ceiling,
        }
    }

    /// Append a stdout frame. Returns false once the ceiling is crossed.
    fn push_stdout(&mut self, frame: &[u8]) -> bool {
        self.stdout.extend_from_slice(frame);
        self.total() <= self.ceiling
    }

    /// Append a stderr frame. Returns false once the ceiling is crossed.
    fn push_stderr(&mut self, frame: &[u8]) -> bool {
        self.stderr.extend_from_slice(frame);
        self.total() <= self.ceiling
    }

    fn total(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }

    fn finish(self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}

impl ContainerBackend {
    pub fn new(config: ContainerConfig) -> Result<Self, ContainerError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker, config })
    }

    /// Build the Node program the container runs: frozen context bindings,
    /// then the user code as an async function body whose outcome is printed
    /// as a marked envelope line.
    fn build_program(
        code: &str,
        context: &std::collections::HashMap<String, ContextValue>,
    ) -> String {
        let context_json: std::collections::HashMap<&str, Value> = context
            .iter()
            .map(|(k, v)| (k.as_str(), v.to_json()))
            .collect();
        let context_literal =
            serde_json::to_string(&context_json).unwrap_or_else(|_| "{}".to_string());

        let mut bindings = String::new();
        for key in context.keys() {
            if is_safe_binding(key) {
                bindings.push_str(&format!(
                    "Object.defineProperty(globalThis, {key:?}, {{ value: context[{key:?}], writable: false, configurable: false }});\n",
                ));
            }
        }

        format!(
            r#""use strict";
const context = Object.freeze({context_literal});
{bindings}
(async () => {{
    try {{
        const __fn = async () => {{ {code}
        }};
        const __result = await __fn();
        console.log({marker:?} + JSON.stringify({{
            ok: __result === undefined ? null : __result
        }}));
    }} catch (e) {{
        console.log({marker:?} + JSON.stringify({{
            error: String((e && e.message) || e)
        }}));
    }}
}})();
"#,
            marker = RESULT_MARKER,
        )
    }

    async fn run_container(
        &self,
        execution_id: Uuid,
        program: &str,
        limits: &ExecutionLimits,
    ) -> Result<(i64, String, String), ContainerError> {
        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(format!("botbox-exec-{}", execution_id)),
            ..Default::default()
        });

        let create_body = ContainerCreateBody {
            image: Some(self.config.image.clone()),
            cmd: Some(vec![
                "node".to_string(),
                "-e".to_string(),
                program.to_string(),
            ]),
            user: Some("65534:65534".to_string()),
            network_disabled: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(limits.memory_bytes as i64),
                memory_swap: Some(limits.memory_bytes as i64),
                nano_cpus: Some(self.config.nano_cpus),
                pids_limit: Some(self.config.pids_limit),
                network_mode: Some("none".to_string()),
                readonly_rootfs: Some(true),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges:true".to_string()]),
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self.docker.create_container(options, create_body).await?;
        self.docker
            .start_container(&container.id, None::<BollardStartContainerOptionsQuery>)
            .await?;

        let mut wait_stream = self
            .docker
            .wait_container(&container.id, None::<BollardWaitContainerOptionsQuery>);
        let mut log_stream = self.docker.logs(
            &container.id,
            Some(BollardLogsOptionsQuery {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            }),
        );

        // The envelope line rides on stdout alongside console output, so the
        // stream ceiling sits above the result ceiling proper.
        let log_ceiling = limits.output_bytes.saturating_mul(2) + 16 * 1024;
        let mut capture = LogCapture::new(log_ceiling);
        let deadline = tokio::time::sleep(limits.time() + REAP_GRACE);
        tokio::pin!(deadline);

        let status_code = loop {
            tokio::select! {
                chunk = log_stream.next() => match chunk {
                    Some(Ok(LogOutput::StdOut { message })) => {
                        if !capture.push_stdout(&message) {
                            Reaper::remove_container(execution_id, &self.docker, &container.id).await;
                            return Err(ContainerError::OutputOverflow { limit: log_ceiling });
                        }
                    }
                    Some(Ok(LogOutput::StdErr { message })) => {
                        if !capture.push_stderr(&message) {
                            Reaper::remove_container(execution_id, &self.docker, &container.id).await;
                            return Err(ContainerError::OutputOverflow { limit: log_ceiling });
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        Reaper::remove_container(execution_id, &self.docker, &container.id).await;
                        return Err(ContainerError::Bollard(e));
                    }
                    // Log stream closed; fall through to the wait stream.
                    None => {
                        match wait_stream.next().await {
                            Some(Ok(response)) => break response.status_code,
                            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => break code,
                            Some(Err(e)) => return Err(ContainerError::Bollard(e)),
                            None => break -1,
                        }
                    }
                },
                wait = wait_stream.next() => match wait {
                    Some(Ok(response)) => break response.status_code,
                    Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => break code,
                    Some(Err(e)) => {
                        Reaper::remove_container(execution_id, &self.docker, &container.id).await;
                        return Err(ContainerError::Bollard(e));
                    }
                    None => break -1,
                },
                _ = &mut deadline => {
                    log::warn!("execution {}: container deadline expired, reaping", execution_id);
                    Reaper::remove_container(execution_id, &self.docker, &container.id).await;
                    return Err(ContainerError::Timeout);
                }
            }
        };

        // Drain whatever the log stream still buffers after exit.
        while let Some(Ok(chunk)) = log_stream.next().await {
            let within_ceiling = match chunk {
                LogOutput::StdOut { message } => capture.push_stdout(&message),
                LogOutput::StdErr { message } => capture.push_stderr(&message),
                _ => true,
            };
            if !within_ceiling {
                break;
            }
        }

        let (stdout, stderr) = capture.finish();
        Ok((status_code, stdout, stderr))
    }

    /// Split captured stdout into console lines and the result envelope.
    fn interpret_output(
        stdout: &str,
        stderr: &str,
        capabilities: &CapabilitySet,
    ) -> Option<Value> {
        let mut envelope = None;
        for line in stdout.lines() {
            if let Some(raw) = line.strip_prefix(RESULT_MARKER) {
                envelope = serde_json::from_str(raw).ok();
            } else if !line.is_empty() {
                capabilities.console_log("log", line);
            }
        }
        for line in stderr.lines() {
            if !line.is_empty() {
                capabilities.console_log("error", line);
            }
        }
        envelope
    }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn run(
        &self,
        code: &str,
        capabilities: Arc<CapabilitySet>,
        limits: &ExecutionLimits,
    ) -> ExecutionResult {
        let started = Instant::now();
        let execution_id = capabilities.execution_id;
        let program = Self::build_program(code, capabilities.context());

        let outcome = self.run_container(execution_id, &program, limits).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (status_code, stdout, stderr) = match outcome {
            Ok(parts) => parts,
            Err(ContainerError::Timeout) => {
                return ExecutionResult::failed(
                    ExecutionState::FailedTimeout,
                    format!("execution timeout after {} ms", limits.time_ms),
                    elapsed_ms,
                )
            }
            Err(ContainerError::OutputOverflow { limit }) => {
                return ExecutionResult::failed(
                    ExecutionState::FailedResourceLimit,
                    format!("output exceeded {} bytes", limit),
                    elapsed_ms,
                )
            }
            Err(e) => {
                log::error!("execution {}: container failure: {}", execution_id, e);
                return ExecutionResult::failed(
                    ExecutionState::FailedError,
                    "internal execution failure",
                    elapsed_ms,
                );
            }
        };

        let envelope = Self::interpret_output(&stdout, &stderr, &capabilities);

        if status_code == EXIT_OOM_KILLED {
            return ExecutionResult::failed(
                ExecutionState::FailedResourceLimit,
                format!("memory limit of {} bytes exceeded", limits.memory_bytes),
                elapsed_ms,
            );
        }

        match envelope {
            Some(envelope) => {
                if let Some(error) = envelope.get("error").and_then(Value::as_str) {
                    return ExecutionResult::failed(
                        ExecutionState::FailedError,
                        error.to_string(),
                        elapsed_ms,
                    );
                }
                let result = envelope.get("ok").cloned().unwrap_or(Value::Null);
                let serialized = serde_json::to_string(&result).unwrap_or_default();
                if serialized.len() > limits.output_bytes {
                    let (cut, _) = truncate_output(&serialized, limits.output_bytes);
                    let mut out =
                        ExecutionResult::completed(Value::String(cut), elapsed_ms);
                    out.truncated = true;
                    return out;
                }
                ExecutionResult::completed(result, elapsed_ms)
            }
            None => {
                log::error!(
                    "execution {}: container exited ({}) without a result envelope",
                    execution_id,
                    status_code
                );
                ExecutionResult::failed(
                    ExecutionState::FailedError,
                    "script produced no result",
                    elapsed_ms,
                )
            }
        }
    }
}
