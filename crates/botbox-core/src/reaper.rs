//! Resource reaper
//!
//! Every forced reclamation path goes through here: deadline expiry, output
//! overflow, and scheduler shutdown. The reaper is the only party besides the
//! owning backend allowed to terminate a backend resource, and it owns the
//! exactly-once terminal status write: an execution is never left `running`,
//! even when termination itself fails.

use std::sync::Arc;
use std::time::Duration;

use bollard::query_parameters::{
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StopContainerOptions as BollardStopContainerOptionsQuery,
};
use bollard::Docker;
use chrono::Utc;
use tokio::process::Child;
use uuid::Uuid;

use crate::core_types::{ExecutionResult, StatusRecord};
use crate::store::{status_key, ResultStore};

pub struct Reaper {
    store: Arc<dyn ResultStore>,
    status_ttl: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn ResultStore>, status_ttl: Duration) -> Self {
        Self { store, status_ttl }
    }

    /// Persist the terminal record for an execution, exactly once. A record
    /// already in a terminal state is never overwritten; failures to persist
    /// are logged and swallowed; the caller still gets its result.
    pub async fn finalize(&self, id: Uuid, result: &ExecutionResult) {
        let key = status_key(&id);
        match self.store.get(&key).await {
            Ok(Some(raw)) => {
                if let Ok(existing) = serde_json::from_str::<StatusRecord>(&raw) {
                    if existing.state.is_terminal() {
                        log::warn!(
                            "execution {} already finalized as {:?}, skipping write",
                            id,
                            existing.state
                        );
                        return;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("status read for {} failed: {}", id, e),
        }

        let record = StatusRecord {
            id,
            state: result.state,
            updated_at: Utc::now(),
            result: Some(result.clone()),
        };
        let raw = match serde_json::to_string(&record) {
            Ok(raw) => raw,
            Err(e) => {
                log::error!("failed to serialize terminal record for {}: {}", id, e);
                return;
            }
        };
        if let Err(e) = self.store.set(&key, raw, Some(self.status_ttl)).await {
            log::error!("failed to persist terminal record for {}: {}", id, e);
        }
    }

    /// Force-terminate a worker child. Termination failure is logged, never
    /// propagated; the execution is marked failed regardless.
    pub async fn kill_child(id: Uuid, child: &mut Child) {
        if let Err(e) = child.start_kill() {
            log::error!("execution {}: failed to kill worker child: {}", id, e);
            return;
        }
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => {
                log::debug!("execution {}: worker child reaped ({})", id, status)
            }
            Ok(Err(e)) => log::error!("execution {}: worker child wait failed: {}", id, e),
            Err(_) => log::error!("execution {}: worker child did not exit after kill", id),
        }
    }

    /// Force-terminate a container. The container is created with auto-remove,
    /// so the explicit remove may race it; both errors are expected noise.
    pub async fn remove_container(id: Uuid, docker: &Docker, container_id: &str) {
        if let Err(e) = docker
            .stop_container(
                container_id,
                Some(BollardStopContainerOptionsQuery {
                    t: Some(0),
                    ..Default::default()
                }),
            )
            .await
        {
            log::debug!("execution {}: container stop: {}", id, e);
        }
        if let Err(e) = docker
            .remove_container(
                container_id,
                Some(BollardRemoveContainerOptionsQuery {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            log::debug!("execution {}: container remove: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{ExecutionState, ExecutionResult};
    use crate::store::InMemoryResultStore;

    #[tokio::test]
    async fn finalize_writes_once_and_never_overwrites_terminal() {
        let store = Arc::new(InMemoryResultStore::new());
        let reaper = Reaper::new(store.clone(), Duration::from_secs(60));
        let id = Uuid::new_v4();

        let first = ExecutionResult::failed(ExecutionState::FailedTimeout, "timeout", 100);
        reaper.finalize(id, &first).await;

        let second = ExecutionResult::completed(serde_json::json!(1), 5);
        reaper.finalize(id, &second).await;

        let raw = store.get(&status_key(&id)).await.unwrap().unwrap();
        let record: StatusRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.state, ExecutionState::FailedTimeout);
    }
}
