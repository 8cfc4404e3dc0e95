//! FIFO scheduler
//!
//! A single drain task sits on an unbounded channel and admits jobs in
//! submission order. Concurrency is bounded by a semaphore: with the default
//! of one permit executions are strictly serial; with more permits jobs still
//! *start* in FIFO order but may overlap. The drain is event-driven; an idle
//! scheduler parks on the channel and burns no cycles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};

use crate::backend::ExecutionBackend;
use crate::capabilities::CapabilityBuilder;
use crate::core_types::{BackendKind, ExecutionRequest, ExecutionState, StatusRecord};
use crate::errors::EngineError;
use crate::reaper::Reaper;
use crate::store::{status_key, ResultStore};

enum QueueMsg {
    Job(Box<ExecutionRequest>),
    Shutdown,
}

/// Everything a job needs once it is dequeued.
struct DrainContext {
    backends: HashMap<BackendKind, Arc<dyn ExecutionBackend>>,
    builder: CapabilityBuilder,
    reaper: Reaper,
    store: Arc<dyn ResultStore>,
    status_ttl: Duration,
}

pub struct Scheduler {
    tx: mpsc::UnboundedSender<QueueMsg>,
    queue_len: Arc<AtomicUsize>,
    shutting_down: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn spawn(
        backends: HashMap<BackendKind, Arc<dyn ExecutionBackend>>,
        builder: CapabilityBuilder,
        reaper: Reaper,
        store: Arc<dyn ResultStore>,
        concurrency: usize,
        status_ttl: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue_len = Arc::new(AtomicUsize::new(0));
        let shutting_down = Arc::new(AtomicBool::new(false));

        let ctx = Arc::new(DrainContext {
            backends,
            builder,
            reaper,
            store,
            status_ttl,
        });
        tokio::spawn(drain(
            rx,
            ctx,
            concurrency.max(1),
            Arc::clone(&queue_len),
            Arc::clone(&shutting_down),
        ));

        Self {
            tx,
            queue_len,
            shutting_down,
        }
    }

    /// Enqueue a validated request. Rejected once shutdown has begun.
    pub fn submit(&self, request: ExecutionRequest) -> Result<(), EngineError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::BackendUnavailable(
                "engine is shutting down".to_string(),
            ));
        }
        self.queue_len.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(QueueMsg::Job(Box::new(request))).is_err() {
            self.queue_len.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::BackendUnavailable(
                "scheduler is not running".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of jobs admitted but not yet started.
    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::SeqCst)
    }

    /// Stop admitting jobs. Jobs already dequeued run to completion; jobs
    /// still queued are rejected by the drain task.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        // Wakes the drain even when the queue is empty.
        let _ = self.tx.send(QueueMsg::Shutdown);
    }
}

async fn drain(
    mut rx: mpsc::UnboundedReceiver<QueueMsg>,
    ctx: Arc<DrainContext>,
    concurrency: usize,
    queue_len: Arc<AtomicUsize>,
    shutting_down: Arc<AtomicBool>,
) {
    let permits = Arc::new(Semaphore::new(concurrency));
    while let Some(msg) = rx.recv().await {
        let request = match msg {
            QueueMsg::Job(request) => request,
            QueueMsg::Shutdown => continue,
        };

        // Acquiring before the shutdown check keeps in-flight work bounded
        // and rejects anything still queued when shutdown lands.
        let permit = match Arc::clone(&permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        queue_len.fetch_sub(1, Ordering::SeqCst);

        if shutting_down.load(Ordering::SeqCst) {
            let _ = request.completion.send(Err(EngineError::BackendUnavailable(
                "engine is shutting down".to_string(),
            )));
            drop(permit);
            continue;
        }

        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            run_job(*request, &ctx).await;
            drop(permit);
        });
    }
}

async fn run_job(request: ExecutionRequest, ctx: &DrainContext) {
    let backend = match ctx.backends.get(&request.backend) {
        Some(backend) => Arc::clone(backend),
        None => {
            // Availability is checked at submission; losing the race here
            // still resolves the caller's future.
            let _ = request.completion.send(Err(EngineError::BackendUnavailable(
                format!("backend {} is not available", request.backend),
            )));
            return;
        }
    };

    mark_running(ctx, request.id).await;

    let capabilities = ctx.builder.build(&request.context, request.id);
    log::info!(
        "execution {}: started on backend {} (queued {} ms)",
        request.id,
        request.backend,
        (Utc::now() - request.submitted_at).num_milliseconds().max(0)
    );

    let result = backend
        .run(&request.code, Arc::clone(&capabilities), &request.limits)
        .await;
    let result = result.with_logs(capabilities.drain_logs());

    log::info!(
        "execution {}: finished with state {:?} in {} ms",
        request.id,
        result.state,
        result.execution_time_ms
    );

    ctx.reaper.finalize(request.id, &result).await;
    let _ = request.completion.send(Ok(result));
}

async fn mark_running(ctx: &DrainContext, id: uuid::Uuid) {
    let record = StatusRecord {
        id,
        state: ExecutionState::Running,
        updated_at: Utc::now(),
        result: None,
    };
    match serde_json::to_string(&record) {
        Ok(raw) => {
            if let Err(e) = ctx
                .store
                .set(&status_key(&id), raw, Some(ctx.status_ttl))
                .await
            {
                log::error!("execution {}: failed to persist running status: {}", id, e);
            }
        }
        Err(e) => log::error!("execution {}: failed to serialize status: {}", id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::QueueingOutboundSink;
    use crate::config::CapabilityConfig;
    use crate::core_types::{ContextValue, ExecutionLimits, ExecutionResult};
    use crate::store::InMemoryResultStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::oneshot;
    use uuid::Uuid;

    /// Backend that records the order in which runs start.
    struct RecordingBackend {
        order: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ExecutionBackend for RecordingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Restricted
        }

        async fn run(
            &self,
            code: &str,
            _capabilities: Arc<crate::capabilities::CapabilitySet>,
            _limits: &ExecutionLimits,
        ) -> ExecutionResult {
            self.order
                .lock()
                .expect("order lock")
                .push(code.to_string());
            tokio::time::sleep(Duration::from_millis(5)).await;
            ExecutionResult::completed(json!(code), 5)
        }
    }

    fn test_scheduler(
        backend: Arc<RecordingBackend>,
        concurrency: usize,
    ) -> (Scheduler, Arc<InMemoryResultStore>) {
        let store: Arc<InMemoryResultStore> = Arc::new(InMemoryResultStore::new());
        let outbound = Arc::new(QueueingOutboundSink::new());
        let builder = CapabilityBuilder::new(
            CapabilityConfig::default(),
            store.clone() as Arc<dyn ResultStore>,
            outbound,
        );
        let reaper = Reaper::new(
            store.clone() as Arc<dyn ResultStore>,
            Duration::from_secs(60),
        );
        let mut backends: HashMap<BackendKind, Arc<dyn ExecutionBackend>> = HashMap::new();
        backends.insert(BackendKind::Restricted, backend);
        let scheduler = Scheduler::spawn(
            backends,
            builder,
            reaper,
            store.clone() as Arc<dyn ResultStore>,
            concurrency,
            Duration::from_secs(60),
        );
        (scheduler, store)
    }

    fn request(code: &str) -> (ExecutionRequest, oneshot::Receiver<Result<ExecutionResult, EngineError>>) {
        let (tx, rx) = oneshot::channel();
        let req = ExecutionRequest {
            id: Uuid::new_v4(),
            code: code.to_string(),
            context: HashMap::<String, ContextValue>::new(),
            backend: BackendKind::Restricted,
            limits: ExecutionLimits {
                time_ms: 1_000,
                memory_bytes: 64 << 20,
                output_bytes: 64 << 10,
                allowed_modules: vec![],
            },
            submitted_at: Utc::now(),
            completion: tx,
        };
        (req, rx)
    }

    #[tokio::test]
    async fn jobs_start_in_submission_order() {
        let backend = Arc::new(RecordingBackend {
            order: std::sync::Mutex::new(Vec::new()),
        });
        let (scheduler, _store) = test_scheduler(backend.clone(), 1);

        let mut receivers = Vec::new();
        for i in 0..5 {
            let (req, rx) = request(&format!("job-{i}"));
            scheduler.submit(req).expect("submit");
            receivers.push(rx);
        }
        for rx in receivers {
            rx.await.expect("completion").expect("result");
        }

        let order = backend.order.lock().expect("order lock").clone();
        assert_eq!(order, vec!["job-0", "job-1", "job-2", "job-3", "job-4"]);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_submissions() {
        let backend = Arc::new(RecordingBackend {
            order: std::sync::Mutex::new(Vec::new()),
        });
        let (scheduler, _store) = test_scheduler(backend, 1);

        scheduler.shutdown();
        let (req, _rx) = request("late");
        let err = scheduler.submit(req).expect_err("must reject");
        assert!(matches!(err, EngineError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn running_status_is_persisted() {
        let backend = Arc::new(RecordingBackend {
            order: std::sync::Mutex::new(Vec::new()),
        });
        let (scheduler, store) = test_scheduler(backend, 1);

        let (req, rx) = request("return 1;");
        let id = req.id;
        scheduler.submit(req).expect("submit");
        let result = rx.await.expect("completion").expect("result");
        assert_eq!(result.state, ExecutionState::Completed);

        let raw = store
            .get(&status_key(&id))
            .await
            .expect("get")
            .expect("record");
        let record: StatusRecord = serde_json::from_str(&raw).expect("parse");
        assert!(record.state.is_terminal());
        assert!(record.result.is_some());
    }
}
