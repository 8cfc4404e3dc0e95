//! Shared V8 script runtime
//!
//! Both the restricted backend and the worker binary run scripts through this
//! module: a fresh `deno_core::JsRuntime` per execution, with the capability
//! surface bridged in as ops and everything else stripped out of the global
//! scope. V8 isolates are `!Send`, so `run_script` must be called from a
//! dedicated thread driving a current-thread tokio runtime.
//!
//! Hard limits are enforced outside the script: a heap ceiling with a
//! near-heap-limit callback, a watchdog thread that terminates execution at
//! the wall-clock deadline, and an output byte cap applied to the serialized
//! result. Scripts are never trusted to self-terminate.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deno_core::error::AnyError;
use deno_core::{extension, op2, v8, JsRuntime, OpState, PollEventLoopOptions, RuntimeOptions};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::capabilities::CapabilityHost;
use crate::core_types::{truncate_output, ContextValue, ExecutionLimits};

/// Failure classes a run can end in. `Js` is a script-level error (already
/// sanitized); the rest map onto the engine's terminal failure states.
#[derive(Debug, Clone)]
pub enum RunError {
    Timeout,
    HeapLimit,
    Js(String),
    Internal(String),
}

/// Successful run: the script's return value, capped at the output ceiling.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub result: Value,
    pub truncated: bool,
}

/// Result value handed back from JS through `op_set_result`.
struct ResultSlot(String);

/// Host handle reachable from ops.
struct HostHandle(Arc<dyn CapabilityHost>);

#[op2(fast)]
fn op_console_log(state: &mut OpState, #[string] level: String, #[string] message: String) {
    if let Some(host) = state.try_borrow::<HostHandle>() {
        host.0.console_log(&level, &message);
    }
}

#[op2(async)]
#[string]
async fn op_capability_call(
    state: Rc<RefCell<OpState>>,
    #[string] capability: String,
    #[string] method: String,
    #[string] args: String,
) -> Result<String, AnyError> {
    let host = {
        let state = state.borrow();
        state
            .try_borrow::<HostHandle>()
            .map(|h| Arc::clone(&h.0))
            .ok_or_else(|| deno_core::anyhow::anyhow!("no capability host bound"))?
    };
    let args: Value = serde_json::from_str(&args)
        .map_err(|e| deno_core::anyhow::anyhow!("malformed capability args: {}", e))?;
    let result = host
        .call(&capability, &method, args)
        .await
        .map_err(|e| deno_core::anyhow::anyhow!("{}", e))?;
    Ok(serde_json::to_string(&result)?)
}

#[op2(fast)]
fn op_set_result(state: &mut OpState, #[string] envelope: String) {
    state.put(ResultSlot(envelope));
}

extension!(
    botbox_ext,
    ops = [op_console_log, op_capability_call, op_set_result]
);

/// Utility modules a script may pull in through the gated `require()` shim.
/// Sources here are engine-controlled constants, installed before the global
/// scope is hardened.
const MODULE_SOURCES: &[(&str, &str)] = &[(
    "text",
    r#"
    __botbox_modules["text"] = Object.freeze({
        truncate: (s, n) => {
            s = String(s);
            return s.length <= n ? s : s.slice(0, Math.max(0, n - 1)) + "…";
        },
        capitalize: (s) => {
            s = String(s);
            return s.length === 0 ? s : s[0].toUpperCase() + s.slice(1);
        },
        slugify: (s) => String(s)
            .toLowerCase()
            .replace(/[^a-z0-9]+/g, "-")
            .replace(/^-+|-+$/g, ""),
    });
    "#,
)];

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("identifier pattern"));

/// Names a context binding must not shadow.
const RESERVED_BINDINGS: &[&str] = &[
    "context", "console", "storage", "http", "bot", "require", "globalThis",
];

/// Whether a context key may be exposed as a top-level read-only binding.
pub(crate) fn is_safe_binding(key: &str) -> bool {
    IDENTIFIER.is_match(key) && !RESERVED_BINDINGS.contains(&key)
}

struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

// V8 invokes this when the isolate approaches its heap ceiling. Terminate
// execution and grant a small grace so the termination can propagate instead
// of aborting the process.
extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points at the Box<HeapLimitState> owned by `run_script`,
    // which joins the watchdog and drops the runtime before the box goes away.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

fn create_runtime(host: Arc<dyn CapabilityHost>, heap_limit: usize) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, heap_limit.max(1 << 20));
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![botbox_ext::init_ops()],
        create_params: Some(create_params),
        ..Default::default()
    });
    runtime.op_state().borrow_mut().put(HostHandle(host));
    runtime
}

/// Build the bootstrap script: context bindings, allowed utility modules,
/// the four capability globals, and then the teardown of everything a script
/// must not reach (`Deno`, `eval`, the Function constructors).
fn bootstrap_source(context: &HashMap<String, ContextValue>, allowed_modules: &[String]) -> String {
    let mut source = String::from("globalThis.__botbox_modules = {};\n");

    for name in allowed_modules {
        match MODULE_SOURCES.iter().find(|(n, _)| n == name) {
            Some((_, module_source)) => source.push_str(module_source),
            None => log::warn!("allowed module {:?} has no registered source", name),
        }
    }

    let context_json: HashMap<&str, Value> = context
        .iter()
        .map(|(k, v)| (k.as_str(), v.to_json()))
        .collect();
    let context_literal =
        serde_json::to_string(&context_json).unwrap_or_else(|_| "{}".to_string());

    source.push_str(&format!(
        "globalThis.__botbox_context = {};\n",
        context_literal
    ));

    // Read-only top-level bindings for each identifier-safe context key.
    for key in context.keys() {
        if is_safe_binding(key) {
            source.push_str(&format!(
                "Object.defineProperty(globalThis, {key:?}, {{ value: __botbox_context[{key:?}], writable: false, configurable: false }});\n",
            ));
        }
    }

    source.push_str(
        r#"
        ((ops) => {
            const callOp = ops.op_capability_call;
            const logOp = (level, args) =>
                ops.op_console_log(level, args.map((a) => {
                    try { return typeof a === "string" ? a : JSON.stringify(a); }
                    catch (_) { return String(a); }
                }).join(" "));
            const setResult = (json) => ops.op_set_result(json);

            const call = async (capability, method, args) => {
                const raw = await callOp(capability, method, JSON.stringify(args || {}));
                return JSON.parse(raw);
            };

            globalThis.console = Object.freeze({
                log: (...a) => logOp("log", a),
                info: (...a) => logOp("info", a),
                warn: (...a) => logOp("warn", a),
                error: (...a) => logOp("error", a),
                debug: (...a) => logOp("debug", a),
            });

            globalThis.storage = Object.freeze({
                get: (key) => call("storage", "get", { key }),
                set: (key, value) => call("storage", "set", { key, value }),
                delete: (key) => call("storage", "delete", { key }),
                list: () => call("storage", "list", {}),
            });

            globalThis.http = Object.freeze({
                get: (url, options) =>
                    call("http", "get", Object.assign({}, options || {}, { url })),
            });

            globalThis.bot = Object.freeze({
                sendMessage: (channel, content) =>
                    call("bot", "sendMessage", { channel, content }),
                getData: (key) => call("bot", "getData", { key }),
                setData: (key, value) => call("bot", "setData", { key, value }),
                schedule: (delayMs, payload) =>
                    call("bot", "schedule", { delayMs, payload }),
            });

            const modules = globalThis.__botbox_modules;
            delete globalThis.__botbox_modules;
            globalThis.require = Object.freeze((name) => {
                if (Object.prototype.hasOwnProperty.call(modules, name)) {
                    return modules[name];
                }
                throw new Error("module not allowed: " + name);
            });

            globalThis.context = Object.freeze(globalThis.__botbox_context);
            delete globalThis.__botbox_context;

            globalThis.__botbox = Object.freeze({ setResult });

            delete globalThis.Deno;
            delete globalThis.eval;
            const AsyncFunction = (async function () {}).constructor;
            const GeneratorFunction = (function* () {}).constructor;
            Object.defineProperty(Function.prototype, "constructor", {
                value: undefined, configurable: false, writable: false
            });
            Object.defineProperty(AsyncFunction.prototype, "constructor", {
                value: undefined, configurable: false, writable: false
            });
            Object.defineProperty(GeneratorFunction.prototype, "constructor", {
                value: undefined, configurable: false, writable: false
            });
        })(Deno.core.ops);
        "#,
    );

    source
}

/// Wrap the user's code as an async function body and route its return value
/// (or thrown error) into the result slot.
fn wrap_user_code(code: &str) -> String {
    format!(
        r#"
        (async () => {{
            try {{
                const __fn = async () => {{ {code}
                }};
                const __result = await __fn();
                __botbox.setResult(JSON.stringify({{
                    ok: __result === undefined ? null : __result
                }}));
            }} catch (e) {{
                __botbox.setResult(JSON.stringify({{
                    error: String((e && e.message) || e),
                    stack: e && e.stack ? String(e.stack) : null
                }}));
            }}
        }})();
        "#
    )
}

/// Execute one script to completion inside a fresh isolate.
///
/// Must run on a dedicated thread (isolates are `!Send`). The caller still
/// races this against its own external deadline; the watchdog here is the
/// inner layer of that defense.
pub async fn run_script(
    host: Arc<dyn CapabilityHost>,
    code: &str,
    context: &HashMap<String, ContextValue>,
    limits: &ExecutionLimits,
) -> Result<RunOutput, RunError> {
    let mut runtime = create_runtime(Arc::clone(&host), limits.memory_bytes as usize);

    let bootstrap = bootstrap_source(context, &limits.allowed_modules);
    runtime
        .execute_script("[botbox:bootstrap]", bootstrap)
        .map_err(|e| RunError::Internal(format!("bootstrap failed: {}", e)))?;

    // Heap ceiling: terminate instead of letting V8 abort the process.
    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    // Watchdog: hard wall-clock deadline independent of anything the script
    // does. Handles CPU-bound loops that never yield to the event loop.
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = Arc::clone(&timed_out);
    let deadline = limits.time();
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(deadline) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    let exec_error = match runtime.execute_script("[botbox:execute]", wrap_user_code(code)) {
        Ok(_) => {
            // Drive pending ops (capability calls) to completion, bounded by
            // the same deadline for the async path.
            match tokio::time::timeout(
                deadline + Duration::from_millis(50),
                runtime.run_event_loop(PollEventLoopOptions::default()),
            )
            .await
            {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => {
                    timed_out.store(true, Ordering::SeqCst);
                    None
                }
            }
        }
        Err(e) => Some(e.to_string()),
    };

    // Join the watchdog before the runtime drops so the IsolateHandle cannot
    // outlive the isolate.
    let _ = cancel_tx.send(());
    let _ = watchdog.join();

    if heap_state.triggered.load(Ordering::SeqCst) {
        return Err(RunError::HeapLimit);
    }
    if timed_out.load(Ordering::SeqCst) {
        return Err(RunError::Timeout);
    }
    if let Some(message) = exec_error {
        return Err(RunError::Js(sanitize_js_error(&message)));
    }

    let envelope = {
        let state = runtime.op_state();
        let state = state.borrow();
        state.try_borrow::<ResultSlot>().map(|slot| slot.0.clone())
    };
    let envelope = envelope.ok_or_else(|| {
        RunError::Js("script completed without producing a result".to_string())
    })?;
    let envelope: Value =
        serde_json::from_str(&envelope).map_err(|e| RunError::Internal(e.to_string()))?;

    if let Some(error) = envelope.get("error") {
        let message = error.as_str().unwrap_or("unknown error").to_string();
        let stack = envelope.get("stack").and_then(Value::as_str);
        return Err(RunError::Js(compose_script_error(&message, stack)));
    }

    let result = envelope.get("ok").cloned().unwrap_or(Value::Null);
    let serialized =
        serde_json::to_string(&result).map_err(|e| RunError::Internal(e.to_string()))?;
    if serialized.len() > limits.output_bytes {
        let (cut, _) = truncate_output(&serialized, limits.output_bytes);
        return Ok(RunOutput {
            result: Value::String(cut),
            truncated: true,
        });
    }

    Ok(RunOutput {
        result,
        truncated: false,
    })
}

/// Strip file/line detail out of host-side JS errors.
fn sanitize_js_error(message: &str) -> String {
    message
        .lines()
        .next()
        .unwrap_or("script error")
        .to_string()
}

// Stack traces stay host-side outside debug builds.
fn compose_script_error(message: &str, stack: Option<&str>) -> String {
    if cfg!(debug_assertions) {
        match stack {
            Some(stack) => format!("{}\n{}", message, stack),
            None => message.to_string(),
        }
    } else {
        message.to_string()
    }
}
