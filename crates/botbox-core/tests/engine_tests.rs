//! End-to-end tests through the engine facade: validation, scheduling,
//! capability quotas, and the restricted/worker backends. Container tests
//! need a Docker daemon with the runtime image pulled and are ignored by
//! default.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use serial_test::serial;
use uuid::Uuid;

use botbox_core::capabilities::{BotIntentKind, QueueingOutboundSink};
use botbox_core::core_types::{StatusRecord, TRUNCATION_MARKER};
use botbox_core::store::InMemoryResultStore;
use botbox_core::{
    BackendKind, ContextValue, EngineConfig, EngineError, ExecutionEngine, ExecutionOptions,
    ExecutionState, ResultStore,
};

fn restricted_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.worker.enabled = false;
    config.container.enabled = false;
    config
}

fn no_context() -> HashMap<String, ContextValue> {
    HashMap::new()
}

fn tenant(name: &str) -> HashMap<String, ContextValue> {
    let mut context = HashMap::new();
    context.insert("tenant".to_string(), ContextValue::Str(name.to_string()));
    context
}

#[tokio::test]
async fn arithmetic_returns_its_value() -> Result<()> {
    let engine = ExecutionEngine::new(restricted_config());
    let result = engine
        .execute("return 1 + 1;", no_context(), ExecutionOptions::default())
        .await?;
    assert!(result.success);
    assert_eq!(result.state, ExecutionState::Completed);
    assert_eq!(result.result, Some(json!(2)));
    assert!(!result.truncated);
    Ok(())
}

#[tokio::test]
async fn missing_return_resolves_to_null() -> Result<()> {
    let engine = ExecutionEngine::new(restricted_config());
    let result = engine
        .execute(
            "console.log('hello', 42);",
            no_context(),
            ExecutionOptions::default(),
        )
        .await?;
    assert!(result.success);
    assert_eq!(result.result, Some(json!(null)));
    assert_eq!(result.logs.len(), 1);
    assert_eq!(result.logs[0].message, "hello 42");
    Ok(())
}

#[tokio::test]
async fn context_values_are_bound_read_only() -> Result<()> {
    let mut context = no_context();
    context.insert("name".to_string(), ContextValue::Str("ada".to_string()));
    context.insert("count".to_string(), ContextValue::Int(3));

    let engine = ExecutionEngine::new(restricted_config());
    let result = engine
        .execute(
            "return [name, context.count];",
            context,
            ExecutionOptions::default(),
        )
        .await?;
    assert_eq!(result.result, Some(json!(["ada", 3])));
    Ok(())
}

#[tokio::test]
async fn blocked_patterns_fail_validation_before_queueing() {
    let engine = ExecutionEngine::new(restricted_config());
    for code in [
        "eval('1')",
        "process.exit(1)",
        "const cp = require(moduleName);",
        "import('fs')",
        "({}).__proto__.x = 1",
    ] {
        let err = engine
            .execute(code, no_context(), ExecutionOptions::default())
            .await
            .expect_err(code);
        assert!(matches!(err, EngineError::Validation(_)), "{}", code);
    }
    assert_eq!(engine.queue_len(), 0);
}

#[tokio::test]
async fn oversized_code_fails_validation() {
    let engine = ExecutionEngine::new(restricted_config());
    let code = format!("const pad = \"{}\";", "a".repeat(40 * 1024));
    let err = engine
        .execute(&code, no_context(), ExecutionOptions::default())
        .await
        .expect_err("over the code ceiling");
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
#[serial]
async fn infinite_loop_hits_the_deadline() -> Result<()> {
    let engine = ExecutionEngine::new(restricted_config());
    let result = engine
        .execute(
            "while (true) {}",
            no_context(),
            ExecutionOptions {
                time_ms: Some(200),
                ..Default::default()
            },
        )
        .await?;
    assert!(!result.success);
    assert_eq!(result.state, ExecutionState::FailedTimeout);
    let error = result.error.unwrap_or_default();
    assert!(error.contains("timeout"), "unexpected error: {}", error);
    assert!(result.execution_time_ms >= 200);
    assert!(result.execution_time_ms < 5_000);
    Ok(())
}

#[tokio::test]
async fn thrown_errors_are_captured_not_propagated() -> Result<()> {
    let engine = ExecutionEngine::new(restricted_config());
    let result = engine
        .execute(
            "throw new Error('boom');",
            no_context(),
            ExecutionOptions::default(),
        )
        .await?;
    assert!(!result.success);
    assert_eq!(result.state, ExecutionState::FailedError);
    assert!(result.error.unwrap_or_default().contains("boom"));
    Ok(())
}

#[tokio::test]
async fn storage_is_scoped_per_tenant() -> Result<()> {
    let engine = ExecutionEngine::new(restricted_config());

    let result = engine
        .execute(
            "await storage.set('greeting', 'hello'); return await storage.list();",
            tenant("team-a"),
            ExecutionOptions::default(),
        )
        .await?;
    assert_eq!(result.result, Some(json!(["greeting"])));

    // Same tenant sees the value on a later execution.
    let result = engine
        .execute(
            "return await storage.get('greeting');",
            tenant("team-a"),
            ExecutionOptions::default(),
        )
        .await?;
    assert_eq!(result.result, Some(json!("hello")));

    // A different tenant does not.
    let result = engine
        .execute(
            "return await storage.get('greeting');",
            tenant("team-b"),
            ExecutionOptions::default(),
        )
        .await?;
    assert_eq!(result.result, Some(json!(null)));
    Ok(())
}

#[tokio::test]
async fn storage_value_ceiling_surfaces_as_script_error() -> Result<()> {
    let engine = ExecutionEngine::new(restricted_config());
    let result = engine
        .execute(
            r#"
            try {
                await storage.set('big', 'x'.repeat(20000));
                return 'accepted';
            } catch (e) {
                return String(e.message || e);
            }
            "#,
            tenant("team-a"),
            ExecutionOptions::default(),
        )
        .await?;
    let message = result
        .result
        .as_ref()
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    assert!(message.contains("value too large"), "got: {}", message);
    Ok(())
}

#[tokio::test]
async fn console_buffer_keeps_only_the_newest_entries() -> Result<()> {
    let engine = ExecutionEngine::new(restricted_config());
    let result = engine
        .execute(
            "for (let i = 0; i < 150; i++) { console.log('line ' + i); } return 'done';",
            no_context(),
            ExecutionOptions::default(),
        )
        .await?;
    assert_eq!(result.logs.len(), 100);
    assert_eq!(result.logs[0].message, "line 50");
    assert_eq!(result.logs[99].message, "line 149");
    Ok(())
}

#[tokio::test]
async fn http_rejects_hosts_off_the_allow_list() -> Result<()> {
    let engine = ExecutionEngine::new(restricted_config());
    let result = engine
        .execute(
            r#"
            try {
                await http.get('https://example.com/data');
                return 'reached';
            } catch (e) {
                return String(e.message || e);
            }
            "#,
            no_context(),
            ExecutionOptions::default(),
        )
        .await?;
    let message = result
        .result
        .as_ref()
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    assert!(message.contains("not on the allow-list"), "got: {}", message);
    Ok(())
}

#[tokio::test]
async fn oversized_results_are_truncated_with_marker() -> Result<()> {
    let engine = ExecutionEngine::new(restricted_config());
    let result = engine
        .execute(
            "return 'x'.repeat(5000);",
            no_context(),
            ExecutionOptions {
                output_bytes: Some(1024),
                ..Default::default()
            },
        )
        .await?;
    assert!(result.success);
    assert!(result.truncated);
    let payload = result
        .result
        .as_ref()
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    assert!(payload.ends_with(TRUNCATION_MARKER));
    Ok(())
}

#[tokio::test]
async fn require_serves_only_allowed_modules() -> Result<()> {
    let engine = ExecutionEngine::new(restricted_config());
    let result = engine
        .execute(
            "const text = require('text'); return text.slugify('Hello World!');",
            no_context(),
            ExecutionOptions::default(),
        )
        .await?;
    assert_eq!(result.result, Some(json!("hello-world")));

    let result = engine
        .execute(
            r#"
            try { require('fs'); return 'loaded'; }
            catch (e) { return String(e.message || e); }
            "#,
            no_context(),
            ExecutionOptions::default(),
        )
        .await?;
    let message = result
        .result
        .as_ref()
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    assert!(message.contains("module not allowed"), "got: {}", message);
    Ok(())
}

#[tokio::test]
async fn bot_actions_are_queued_as_intents() -> Result<()> {
    let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
    let outbound = Arc::new(QueueingOutboundSink::new());
    let engine = ExecutionEngine::with_collaborators(
        restricted_config(),
        store,
        Arc::clone(&outbound) as _,
    );

    let result = engine
        .execute(
            r#"
            await bot.sendMessage('general', 'build finished');
            await bot.setData('streak', 4);
            return 'queued';
            "#,
            tenant("team-a"),
            ExecutionOptions::default(),
        )
        .await?;
    assert!(result.success);

    let intents = outbound.drain();
    assert_eq!(intents.len(), 2);
    assert_eq!(intents[0].tenant, "team-a");
    match &intents[0].kind {
        BotIntentKind::SendMessage { channel, content } => {
            assert_eq!(channel, "general");
            assert_eq!(content, "build finished");
        }
        other => panic!("unexpected intent: {:?}", other),
    }
    assert!(matches!(intents[1].kind, BotIntentKind::SetData { .. }));
    Ok(())
}

#[tokio::test]
async fn status_record_reaches_a_terminal_state() -> Result<()> {
    let store: Arc<InMemoryResultStore> = Arc::new(InMemoryResultStore::new());
    let outbound = Arc::new(QueueingOutboundSink::new());
    let engine = ExecutionEngine::with_collaborators(
        restricted_config(),
        Arc::clone(&store) as Arc<dyn ResultStore>,
        outbound,
    );

    let result = engine
        .execute("return 7;", no_context(), ExecutionOptions::default())
        .await?;
    assert!(result.success);

    let keys = store.list_prefix("exec:").await?;
    assert_eq!(keys.len(), 1);
    let raw = store.get(&keys[0]).await?.expect("record present");
    let record: StatusRecord = serde_json::from_str(&raw)?;
    assert_eq!(record.state, ExecutionState::Completed);
    let stored = record.result.expect("terminal record carries the result");
    assert_eq!(stored.result, Some(json!(7)));
    Ok(())
}

#[tokio::test]
async fn unknown_execution_status_is_none() -> Result<()> {
    let engine = ExecutionEngine::new(restricted_config());
    assert!(engine.execution_status(Uuid::new_v4()).await?.is_none());
    Ok(())
}

mod worker_backend {
    use super::*;

    /// Live `botbox-worker` processes, counted through /proc.
    fn worker_process_count() -> usize {
        let mut count = 0;
        if let Ok(entries) = std::fs::read_dir("/proc") {
            for entry in entries.flatten() {
                if let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) {
                    if comm.trim() == "botbox-worker" {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    fn worker_config() -> EngineConfig {
        let mut config = restricted_config();
        config.worker.enabled = true;
        config.worker.binary_path = Some(env!("CARGO_BIN_EXE_botbox-worker").to_string());
        config.default_backend = BackendKind::Worker;
        config
    }

    #[tokio::test]
    #[serial]
    async fn runs_a_script_in_a_child_process() -> Result<()> {
        let engine = ExecutionEngine::new(worker_config());
        assert!(engine.available_backends().contains(&BackendKind::Worker));

        let result = engine
            .execute("return 6 * 7;", no_context(), ExecutionOptions::default())
            .await?;
        assert!(result.success);
        assert_eq!(result.result, Some(json!(42)));
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn bridges_console_and_storage_to_the_host() -> Result<()> {
        let engine = ExecutionEngine::new(worker_config());
        let result = engine
            .execute(
                r#"
                console.log('from the worker');
                await storage.set('k', 'v');
                return await storage.get('k');
                "#,
                tenant("team-w"),
                ExecutionOptions::default(),
            )
            .await?;
        assert!(result.success);
        assert_eq!(result.result, Some(json!("v")));
        assert!(result
            .logs
            .iter()
            .any(|entry| entry.message == "from the worker"));
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn child_is_reaped_on_deadline() -> Result<()> {
        let baseline = worker_process_count();
        let engine = ExecutionEngine::new(worker_config());
        let result = engine
            .execute(
                "while (true) {}",
                no_context(),
                ExecutionOptions {
                    time_ms: Some(200),
                    ..Default::default()
                },
            )
            .await?;
        assert!(!result.success);
        assert_eq!(result.state, ExecutionState::FailedTimeout);
        // The backend waits on the child before reporting, so no worker
        // process may outlive the result.
        assert_eq!(worker_process_count(), baseline);
        Ok(())
    }
}

mod container_backend {
    use super::*;

    fn container_config() -> EngineConfig {
        let mut config = restricted_config();
        config.container.enabled = true;
        config.default_backend = BackendKind::Container;
        config
    }

    // Needs a Docker daemon and the node:20-slim image pulled.
    #[tokio::test]
    #[ignore]
    async fn runs_a_script_in_a_container() -> Result<()> {
        let engine = ExecutionEngine::new(container_config());
        let result = engine
            .execute(
                "console.log('containerized'); return 2 + 3;",
                no_context(),
                ExecutionOptions::default(),
            )
            .await?;
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.result, Some(json!(5)));
        assert!(result
            .logs
            .iter()
            .any(|entry| entry.message == "containerized"));
        Ok(())
    }

    #[tokio::test]
    #[ignore]
    async fn container_deadline_is_enforced() -> Result<()> {
        let engine = ExecutionEngine::new(container_config());
        let result = engine
            .execute(
                "while (true) {}",
                no_context(),
                ExecutionOptions {
                    time_ms: Some(500),
                    ..Default::default()
                },
            )
            .await?;
        assert_eq!(result.state, ExecutionState::FailedTimeout);
        Ok(())
    }
}
