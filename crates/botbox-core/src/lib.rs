//! Sandboxed execution engine for untrusted bot scripts.
//!
//! This crate runs short JavaScript programs submitted by chat-platform bots
//! under hard, externally enforced resource ceilings, and exposes a small
//! capability surface (console, storage, http, bot actions) instead of any
//! ambient authority. Scripts never see the host: everything they can do is
//! mediated by a quota-checked capability call.
//!
//! # Architecture Overview
//!
//! - **Validation**: size and pattern pre-flight checks before any resource
//!   is allocated
//! - **Scheduling**: FIFO admission with bounded concurrency, event-driven
//! - **Capabilities**: per-execution console/storage/http/bot handles with
//!   independent quotas and tenant-scoped persistence
//! - **Backends**: an in-process restricted JavaScript runtime, a
//!   per-execution worker subprocess, and an ephemeral locked-down container
//! - **Reaping**: external deadline and memory enforcement with exactly-once
//!   terminal status writes
//! - **Results**: TTL'd status/result records queryable after the fact

pub mod backend;
pub mod capabilities;
pub mod config;
pub mod core_types;
pub mod engine;
pub mod errors;
pub mod reaper;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod validator;
pub mod worker_protocol;

pub use backend::ExecutionBackend;
pub use capabilities::{BotIntent, BotIntentKind, CapabilityHost, OutboundSink, QueueingOutboundSink};
pub use config::EngineConfig;
pub use core_types::{
    BackendKind, ContextValue, ExecutionOptions, ExecutionResult, ExecutionState, StatusRecord,
};
pub use engine::ExecutionEngine;
pub use errors::{CapabilityError, EngineError};
pub use store::{InMemoryResultStore, ResultStore};
