//! Wire protocol between the engine and the `botbox-worker` child process
//!
//! Communication is strictly message-based: newline-delimited JSON, one
//! message per line. The parent writes a single `WorkerJob` to the child's
//! stdin; the child emits `WorkerEvent`s on stdout (console lines, capability
//! calls, and finally exactly one result) and receives `WorkerReply` lines on
//! stdin for its capability calls. Stderr carries only logs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core_types::{ContextValue, ExecutionLimits};

/// Serialized capability-call argument ceiling, enforced bridge-side in the
/// child so a script cannot inflate parent memory through a single call.
pub const MAX_CALL_ARGS_BYTES: usize = 1024 * 1024;

/// The one job a worker child executes before exiting.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerJob {
    pub code: String,
    pub context: HashMap<String, ContextValue>,
    pub limits: ExecutionLimits,
}

/// Child → parent messages.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// A console line from inside the sandbox.
    Console { level: String, message: String },
    /// A capability call to be served by the parent.
    Call {
        id: u64,
        capability: String,
        method: String,
        args: Value,
    },
    /// Terminal outcome. Exactly one per job, always the last event.
    Result { outcome: WorkerOutcome },
}

/// Parent → child reply to one `WorkerEvent::Call`.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerReply {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerOutcome {
    Ok {
        result: Value,
        truncated: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        memory_bytes: Option<u64>,
    },
    Timeout,
    MemoryExceeded,
    ScriptError {
        message: String,
    },
    Internal {
        message: String,
    },
}
