//! botbox-worker: one sandboxed execution per process.
//!
//! The parent engine spawns one of these per job on the isolated-worker
//! backend. The job arrives as a single JSON line on stdin; events (console
//! lines, capability calls, and exactly one result) leave on stdout; stderr
//! carries only logs. Capability calls are bridged back to the parent, which
//! holds the quotas and the store; this process has no authority of its own
//! and exits after one job, so nothing leaks between executions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::oneshot;

use botbox_core::capabilities::CapabilityHost;
use botbox_core::errors::CapabilityError;
use botbox_core::runtime::{run_script, RunError};
use botbox_core::worker_protocol::{
    WorkerEvent, WorkerJob, WorkerOutcome, WorkerReply, MAX_CALL_ARGS_BYTES,
};

/// V8 reserves address space well beyond the script heap; the in-runtime heap
/// ceiling is the precise limit, `RLIMIT_AS` the process-level backstop.
#[cfg(unix)]
const ADDRESS_SPACE_HEADROOM: u64 = 1 << 30;

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<WorkerReply>>>>;

/// Capability host that forwards every call to the parent over stdio and
/// parks the caller on a oneshot until the matching reply line arrives.
struct StdioBridge {
    pending: PendingReplies,
    next_id: AtomicU64,
}

impl StdioBridge {
    fn new(pending: PendingReplies) -> Self {
        Self {
            pending,
            next_id: AtomicU64::new(1),
        }
    }
}

fn emit(event: &WorkerEvent) {
    use std::io::Write;
    match serde_json::to_string(event) {
        Ok(line) => {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "{}", line);
            let _ = out.flush();
        }
        Err(e) => log::error!("failed to serialize event: {}", e),
    }
}

fn bridge_error(capability: &str, message: String) -> CapabilityError {
    if message.starts_with("quota exceeded") {
        return CapabilityError::QuotaExceeded(message);
    }
    match capability {
        "storage" => CapabilityError::Storage(message),
        "http" => CapabilityError::Http(message),
        "bot" => CapabilityError::Bot(message),
        other => CapabilityError::UnknownMethod(format!("{}: {}", other, message)),
    }
}

#[async_trait]
impl CapabilityHost for StdioBridge {
    async fn call(
        &self,
        capability: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, CapabilityError> {
        let serialized = serde_json::to_string(&args)
            .map_err(|e| bridge_error(capability, format!("unserializable arguments: {}", e)))?;
        if serialized.len() > MAX_CALL_ARGS_BYTES {
            return Err(CapabilityError::QuotaExceeded(format!(
                "capability call arguments exceed {} bytes",
                MAX_CALL_ARGS_BYTES
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| bridge_error(capability, "bridge state poisoned".to_string()))?
            .insert(id, tx);

        emit(&WorkerEvent::Call {
            id,
            capability: capability.to_string(),
            method: method.to_string(),
            args,
        });

        let reply = rx
            .await
            .map_err(|_| bridge_error(capability, "parent closed the bridge".to_string()))?;
        match reply.err {
            Some(message) => Err(bridge_error(capability, message)),
            None => Ok(reply.ok.unwrap_or(Value::Null)),
        }
    }

    fn console_log(&self, level: &str, message: &str) {
        emit(&WorkerEvent::Console {
            level: level.to_string(),
            message: message.to_string(),
        });
    }
}

/// Route reply lines from the parent to their waiting capability calls.
async fn read_replies(mut lines: Lines<BufReader<Stdin>>, pending: PendingReplies) {
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let reply: WorkerReply = match serde_json::from_str(&line) {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("ignoring malformed reply line: {}", e);
                continue;
            }
        };
        let sender = match pending.lock() {
            Ok(mut map) => map.remove(&reply.id),
            Err(_) => return,
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => log::warn!("reply {} has no pending call", reply.id),
        }
    }
}

#[cfg(unix)]
fn apply_memory_rlimit(memory_bytes: u64) {
    use nix::sys::resource::{setrlimit, Resource};
    let ceiling = memory_bytes
        .saturating_mul(4)
        .saturating_add(ADDRESS_SPACE_HEADROOM);
    if let Err(e) = setrlimit(Resource::RLIMIT_AS, ceiling, ceiling) {
        log::warn!("failed to set RLIMIT_AS: {}", e);
    }
}

#[cfg(unix)]
fn peak_rss_bytes() -> Option<u64> {
    use nix::sys::resource::{getrusage, UsageWho};
    match getrusage(UsageWho::RUSAGE_SELF) {
        // ru_maxrss is in kilobytes on Linux.
        Ok(usage) => Some(usage.max_rss() as u64 * 1024),
        Err(e) => {
            log::warn!("getrusage failed: {}", e);
            None
        }
    }
}

#[cfg(not(unix))]
fn apply_memory_rlimit(_memory_bytes: u64) {}

#[cfg(not(unix))]
fn peak_rss_bytes() -> Option<u64> {
    None
}

async fn run_job() -> i32 {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let job_line = match lines.next_line().await {
        Ok(Some(line)) => line,
        Ok(None) => {
            log::error!("stdin closed before a job arrived");
            return 1;
        }
        Err(e) => {
            log::error!("failed to read job: {}", e);
            return 1;
        }
    };
    let job: WorkerJob = match serde_json::from_str(&job_line) {
        Ok(job) => job,
        Err(e) => {
            emit(&WorkerEvent::Result {
                outcome: WorkerOutcome::Internal {
                    message: format!("malformed job: {}", e),
                },
            });
            return 1;
        }
    };

    // Ceiling goes up before any user code runs.
    apply_memory_rlimit(job.limits.memory_bytes);

    let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
    let reader = tokio::spawn(read_replies(lines, Arc::clone(&pending)));
    let bridge: Arc<dyn CapabilityHost> = Arc::new(StdioBridge::new(Arc::clone(&pending)));

    let outcome = match run_script(bridge, &job.code, &job.context, &job.limits).await {
        Ok(output) => WorkerOutcome::Ok {
            result: output.result,
            truncated: output.truncated,
            memory_bytes: peak_rss_bytes(),
        },
        Err(RunError::Timeout) => WorkerOutcome::Timeout,
        Err(RunError::HeapLimit) => WorkerOutcome::MemoryExceeded,
        Err(RunError::Js(message)) => WorkerOutcome::ScriptError { message },
        Err(RunError::Internal(message)) => {
            log::error!("runtime failure: {}", message);
            WorkerOutcome::Internal { message }
        }
    };

    reader.abort();
    emit(&WorkerEvent::Result { outcome });
    0
}

fn main() {
    // Logs go to stderr only; stdout belongs to the protocol.
    env_logger::init();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("failed to build runtime: {}", e);
            std::process::exit(1);
        }
    };
    std::process::exit(runtime.block_on(run_job()));
}
