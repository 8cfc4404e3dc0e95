//! Engine facade
//!
//! `ExecutionEngine` is an explicit service object: construct it with a
//! config (and optionally your own store and outbound sink), call `execute`,
//! and `shutdown` it when done. Nothing here is process-global, so tests and
//! embedders can run several engines side by side.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::backend::container::ContainerBackend;
use crate::backend::restricted::RestrictedBackend;
use crate::backend::worker::WorkerBackend;
use crate::backend::ExecutionBackend;
use crate::capabilities::{CapabilityBuilder, OutboundSink, QueueingOutboundSink};
use crate::config::EngineConfig;
use crate::core_types::{
    BackendKind, ContextValue, ExecutionLimits, ExecutionOptions, ExecutionRequest,
    ExecutionResult, ExecutionState, StatusRecord,
};
use crate::errors::EngineError;
use crate::reaper::Reaper;
use crate::scheduler::Scheduler;
use crate::store::{status_key, InMemoryResultStore, ResultStore};
use crate::validator;

pub struct ExecutionEngine {
    config: EngineConfig,
    store: Arc<dyn ResultStore>,
    scheduler: Scheduler,
    available: Vec<BackendKind>,
}

impl ExecutionEngine {
    /// Build an engine with an in-memory store and a queueing outbound sink.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(InMemoryResultStore::new()),
            Arc::new(QueueingOutboundSink::new()),
        )
    }

    /// Build an engine over caller-supplied collaborators. The store backs
    /// both status records and the storage capability; the sink receives the
    /// intents scripts queue through the `bot` capability.
    pub fn with_collaborators(
        config: EngineConfig,
        store: Arc<dyn ResultStore>,
        outbound: Arc<dyn OutboundSink>,
    ) -> Self {
        let mut backends: HashMap<BackendKind, Arc<dyn ExecutionBackend>> = HashMap::new();
        backends.insert(BackendKind::Restricted, Arc::new(RestrictedBackend::new()));

        if config.worker.enabled {
            match WorkerBackend::new(&config.worker) {
                Ok(backend) => {
                    backends.insert(BackendKind::Worker, Arc::new(backend));
                }
                Err(e) => log::warn!("worker backend disabled: {}", e),
            }
        }
        if config.container.enabled {
            match ContainerBackend::new(config.container.clone()) {
                Ok(backend) => {
                    backends.insert(BackendKind::Container, Arc::new(backend));
                }
                Err(e) => log::warn!("container backend disabled: {}", e),
            }
        }
        let available: Vec<BackendKind> = backends.keys().copied().collect();
        log::info!("execution engine starting with backends {:?}", available);

        let status_ttl = Duration::from_secs(config.status_ttl_secs);
        let builder = CapabilityBuilder::new(
            config.capabilities.clone(),
            Arc::clone(&store),
            outbound,
        );
        let reaper = Reaper::new(Arc::clone(&store), status_ttl);
        let scheduler = Scheduler::spawn(
            backends,
            builder,
            reaper,
            Arc::clone(&store),
            config.concurrency,
            status_ttl,
        );

        Self {
            config,
            store,
            scheduler,
            available,
        }
    }

    /// Validate, enqueue, and await one execution.
    ///
    /// Validation and backend availability fail fast with an `Err`; every
    /// runtime failure after admission resolves as an `ExecutionResult` in a
    /// terminal failed state.
    pub async fn execute(
        &self,
        code: &str,
        context: HashMap<String, ContextValue>,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, EngineError> {
        let backend = options.backend.unwrap_or(self.config.default_backend);
        if !self.available.contains(&backend) {
            return Err(EngineError::BackendUnavailable(format!(
                "backend {} is not available",
                backend
            )));
        }

        validator::validate(code, &self.config)?;
        let limits = ExecutionLimits::resolve(&options, &self.config);
        let id = Uuid::new_v4();

        self.mark_queued(id).await;

        let (tx, rx) = oneshot::channel();
        let submitted = self.scheduler.submit(ExecutionRequest {
            id,
            code: code.to_string(),
            context,
            backend,
            limits,
            submitted_at: Utc::now(),
            completion: tx,
        });
        if let Err(e) = submitted {
            // A rejected submission must leave no status record behind.
            if let Err(del) = self.store.delete(&status_key(&id)).await {
                log::warn!("execution {}: failed to drop queued status: {}", id, del);
            }
            return Err(e);
        }

        match rx.await {
            Ok(outcome) => outcome,
            // Scheduler dropped the completion channel without resolving it.
            Err(_) => Err(EngineError::Internal(
                "execution was dropped before completion".to_string(),
            )),
        }
    }

    /// Look up the status record of a current or recent execution. Returns
    /// `None` once the record's TTL has expired.
    pub async fn execution_status(&self, id: Uuid) -> Result<Option<StatusRecord>, EngineError> {
        match self.store.get(&status_key(&id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Jobs admitted but not yet started.
    pub fn queue_len(&self) -> usize {
        self.scheduler.queue_len()
    }

    /// Backends this engine accepted at startup.
    pub fn available_backends(&self) -> &[BackendKind] {
        &self.available
    }

    /// Stop admitting executions. In-flight jobs finish; queued jobs resolve
    /// with a `BackendUnavailable` error.
    pub fn shutdown(&self) {
        log::info!("execution engine shutting down");
        self.scheduler.shutdown();
    }

    async fn mark_queued(&self, id: Uuid) {
        let record = StatusRecord {
            id,
            state: ExecutionState::Queued,
            updated_at: Utc::now(),
            result: None,
        };
        let ttl = Duration::from_secs(self.config.status_ttl_secs);
        match serde_json::to_string(&record) {
            Ok(raw) => {
                if let Err(e) = self.store.set(&status_key(&id), raw, Some(ttl)).await {
                    log::error!("execution {}: failed to persist queued status: {}", id, e);
                }
            }
            Err(e) => log::error!("execution {}: failed to serialize status: {}", id, e),
        }
    }
}
