//! Core type definitions shared across the engine
//!
//! These types form the contract between the caller, the scheduler, the
//! backends and the result store: what a submitted execution looks like, the
//! states it moves through, and the shape every backend must produce. The
//! state machine is monotonic: once an execution reaches a terminal state it
//! is never revisited.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::EngineError;

/// Marker appended whenever a result payload is cut at the output ceiling.
pub const TRUNCATION_MARKER: &str = "…[output truncated]";

/// Primitive value injected into the sandbox as a read-only context binding.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ContextValue {
    pub fn to_json(&self) -> Value {
        match self {
            ContextValue::Bool(b) => Value::Bool(*b),
            ContextValue::Int(i) => Value::from(*i),
            ContextValue::Float(f) => Value::from(*f),
            ContextValue::Str(s) => Value::String(s.clone()),
        }
    }
}

/// Which isolation strategy runs the script.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process V8 isolate with a hardened global scope. Fastest, weakest.
    Restricted,
    /// Dedicated child process with a hard memory ceiling.
    Worker,
    /// Ephemeral network-disabled OS container.
    Container,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Restricted => write!(f, "restricted"),
            BackendKind::Worker => write!(f, "worker"),
            BackendKind::Container => write!(f, "container"),
        }
    }
}

/// Per-call options. Unset fields fall back to the engine's static defaults.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ExecutionOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_modules: Option<Vec<String>>,
}

/// Hard resource ceilings for one execution, resolved from options + defaults.
/// Enforced externally to the script, never relied upon to be self-honored.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExecutionLimits {
    pub time_ms: u64,
    pub memory_bytes: u64,
    pub output_bytes: usize,
    pub allowed_modules: Vec<String>,
}

impl ExecutionLimits {
    pub fn resolve(options: &ExecutionOptions, config: &EngineConfig) -> Self {
        Self {
            time_ms: options.time_ms.unwrap_or(config.default_time_ms),
            memory_bytes: options.memory_bytes.unwrap_or(config.default_memory_bytes),
            output_bytes: options.output_bytes.unwrap_or(config.default_output_bytes),
            allowed_modules: options
                .allowed_modules
                .clone()
                .unwrap_or_else(|| config.allowed_modules.clone()),
        }
    }

    pub fn time(&self) -> Duration {
        Duration::from_millis(self.time_ms)
    }
}

/// One captured console line from inside the sandbox.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConsoleEntry {
    pub level: String,
    pub message: String,
}

/// States an execution moves through. Transitions are monotonic:
/// `Queued → Running → {Completed, FailedTimeout, FailedResourceLimit, FailedError}`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionState {
    Queued,
    Running,
    Completed,
    FailedTimeout,
    FailedResourceLimit,
    FailedError,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionState::Queued | ExecutionState::Running)
    }
}

/// The outcome every backend must produce, success or failure alike.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    /// Sanitized return value of the script, capped at the output ceiling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Sanitized error message. Stack traces are withheld outside debug builds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the return value was cut at the output ceiling.
    #[serde(default)]
    pub truncated: bool,
    pub execution_time_ms: u64,
    /// Best-effort peak memory, where the backend can observe it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub logs: Vec<ConsoleEntry>,
    /// Terminal state this result corresponds to.
    pub state: ExecutionState,
}

impl ExecutionResult {
    pub fn completed(result: Value, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            truncated: false,
            execution_time_ms,
            memory_bytes: None,
            logs: Vec::new(),
            state: ExecutionState::Completed,
        }
    }

    pub fn failed(state: ExecutionState, error: impl Into<String>, execution_time_ms: u64) -> Self {
        debug_assert!(state.is_terminal());
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            truncated: false,
            execution_time_ms,
            memory_bytes: None,
            logs: Vec::new(),
            state,
        }
    }

    pub fn with_logs(mut self, logs: Vec<ConsoleEntry>) -> Self {
        self.logs = logs;
        self
    }
}

/// Status entry persisted to the result store under `exec:{id}`.
/// Expires with the store TTL; `not_found` after expiry is a valid outcome.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StatusRecord {
    pub id: Uuid,
    pub state: ExecutionState,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
}

/// A submitted execution waiting in the queue. The completion channel is the
/// caller's pending future; it resolves exactly once, at a terminal state.
#[derive(Debug)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub code: String,
    pub context: HashMap<String, ContextValue>,
    pub backend: BackendKind,
    pub limits: ExecutionLimits,
    pub submitted_at: DateTime<Utc>,
    pub completion: oneshot::Sender<Result<ExecutionResult, EngineError>>,
}

/// Truncate a serialized result payload at the output ceiling, appending the
/// explicit truncation marker. Cuts on a char boundary so the payload stays
/// valid UTF-8. Oversized output is never silently dropped.
pub fn truncate_output(payload: &str, limit: usize) -> (String, bool) {
    if payload.len() <= limit {
        return (payload.to_string(), false);
    }
    let mut cut = limit;
    while cut > 0 && !payload.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = payload[..cut].to_string();
    out.push_str(TRUNCATION_MARKER);
    (out, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!ExecutionState::Queued.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
        assert!(ExecutionState::Completed.is_terminal());
        assert!(ExecutionState::FailedTimeout.is_terminal());
        assert!(ExecutionState::FailedResourceLimit.is_terminal());
        assert!(ExecutionState::FailedError.is_terminal());
    }

    #[test]
    fn truncation_appends_marker() {
        let (out, truncated) = truncate_output("abcdefgh", 4);
        assert!(truncated);
        assert!(out.starts_with("abcd"));
        assert!(out.ends_with(TRUNCATION_MARKER));

        let (out, truncated) = truncate_output("tiny", 100);
        assert!(!truncated);
        assert_eq!(out, "tiny");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 'é' is two bytes; a limit landing mid-char must back off.
        let (out, truncated) = truncate_output("ééééé", 3);
        assert!(truncated);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert!(out.strip_suffix(TRUNCATION_MARKER).unwrap().len() <= 3);
    }
}
