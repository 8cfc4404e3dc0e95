//! Capability surface exposed inside the sandbox
//!
//! Sandboxed code sees exactly four bindings (`console`, `storage`, `http`
//! and `bot`) and nothing else. Each capability enforces its own quota
//! independently; exhausting one budget never touches another's. Capability
//! failures surface inside the sandbox as ordinary script-level errors that
//! the script can catch, never as host-level exceptions.
//!
//! A `CapabilitySet` is built per execution, namespaced by execution id (or
//! by the `tenant` context binding when the caller provides one), and is
//! dropped when the execution reaches a terminal state.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::CapabilityConfig;
use crate::core_types::{ConsoleEntry, ContextValue};
use crate::errors::CapabilityError;
use crate::store::{data_prefix, ResultStore};

/// Uniform dispatch seam between the script runtime and the host-side
/// capabilities. The in-process backend calls straight into `CapabilitySet`;
/// the worker backend serves the same calls over its stdio protocol.
#[async_trait]
pub trait CapabilityHost: Send + Sync {
    /// Route one capability call. `capability` is `storage`/`http`/`bot`.
    async fn call(&self, capability: &str, method: &str, args: Value)
        -> Result<Value, CapabilityError>;

    /// Append a console entry. Must never block and never fail.
    fn console_log(&self, level: &str, message: &str);
}

/// An outbound action requested by a script. Intents are validated and
/// queued, never executed synchronously from inside the sandbox, so a
/// misbehaving script cannot hold the messaging path hostage.
#[derive(Debug, Clone, PartialEq)]
pub struct BotIntent {
    pub execution_id: Uuid,
    pub tenant: String,
    pub kind: BotIntentKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BotIntentKind {
    SendMessage { channel: String, content: String },
    SetData { key: String, value: Value },
    Schedule { delay_ms: u64, payload: Value },
}

/// Collaborator that receives queued bot intents and answers bot-data reads.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn enqueue(&self, intent: BotIntent) -> Result<(), CapabilityError>;

    async fn get_data(&self, tenant: &str, key: &str) -> Result<Option<Value>, CapabilityError>;
}

/// Sink that records intents in memory. Default collaborator for embedders
/// that drain the queue themselves, and the workhorse of the test suite.
pub struct QueueingOutboundSink {
    intents: Mutex<Vec<BotIntent>>,
    data: Mutex<HashMap<String, Value>>,
}

impl QueueingOutboundSink {
    pub fn new() -> Self {
        Self {
            intents: Mutex::new(Vec::new()),
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn drain(&self) -> Vec<BotIntent> {
        std::mem::take(&mut *self.intents.lock().expect("intent queue poisoned"))
    }

    pub fn len(&self) -> usize {
        self.intents.lock().expect("intent queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for QueueingOutboundSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboundSink for QueueingOutboundSink {
    async fn enqueue(&self, intent: BotIntent) -> Result<(), CapabilityError> {
        if let BotIntentKind::SetData { key, value } = &intent.kind {
            self.data
                .lock()
                .expect("bot data poisoned")
                .insert(format!("{}:{}", intent.tenant, key), value.clone());
        }
        self.intents
            .lock()
            .expect("intent queue poisoned")
            .push(intent);
        Ok(())
    }

    async fn get_data(&self, tenant: &str, key: &str) -> Result<Option<Value>, CapabilityError> {
        Ok(self
            .data
            .lock()
            .expect("bot data poisoned")
            .get(&format!("{}:{}", tenant, key))
            .cloned())
    }
}

/// Bounded console ring buffer. Entries beyond the depth evict the oldest;
/// long lines are cut at the entry cap. Pushing never blocks.
pub struct ConsoleBuffer {
    entries: Mutex<VecDeque<ConsoleEntry>>,
    max_entries: usize,
    max_entry_len: usize,
}

impl ConsoleBuffer {
    pub fn new(max_entries: usize, max_entry_len: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_entries.min(64))),
            max_entries,
            max_entry_len,
        }
    }

    pub fn push(&self, level: &str, message: &str) {
        let mut message = message.to_string();
        if message.len() > self.max_entry_len {
            let mut cut = self.max_entry_len;
            while cut > 0 && !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
            message.push('…');
        }
        let mut entries = self.entries.lock().expect("console buffer poisoned");
        if entries.len() == self.max_entries {
            entries.pop_front();
        }
        entries.push_back(ConsoleEntry {
            level: level.to_string(),
            message,
        });
    }

    pub fn drain(&self) -> Vec<ConsoleEntry> {
        self.entries
            .lock()
            .expect("console buffer poisoned")
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("console buffer poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The closed set of bindings one execution may reach. Owns references into
/// the result store (storage) and the outbound collaborator (bot); destroyed
/// when the execution terminates.
pub struct CapabilitySet {
    pub execution_id: Uuid,
    pub tenant: String,
    config: CapabilityConfig,
    console: ConsoleBuffer,
    store: Arc<dyn ResultStore>,
    outbound: Arc<dyn OutboundSink>,
    context: HashMap<String, ContextValue>,
    storage_writes: AtomicU32,
    http_requests: AtomicU32,
    bot_messages: AtomicU32,
}

/// Builds one `CapabilitySet` per execution.
pub struct CapabilityBuilder {
    config: CapabilityConfig,
    store: Arc<dyn ResultStore>,
    outbound: Arc<dyn OutboundSink>,
}

impl CapabilityBuilder {
    pub fn new(
        config: CapabilityConfig,
        store: Arc<dyn ResultStore>,
        outbound: Arc<dyn OutboundSink>,
    ) -> Self {
        Self {
            config,
            store,
            outbound,
        }
    }

    pub fn build(
        &self,
        context: &HashMap<String, ContextValue>,
        execution_id: Uuid,
    ) -> Arc<CapabilitySet> {
        // Storage and bot data are tenant-scoped when the caller names a
        // tenant; otherwise the execution id isolates them per run.
        let tenant = match context.get("tenant") {
            Some(ContextValue::Str(t)) if !t.is_empty() => t.clone(),
            _ => execution_id.to_string(),
        };
        Arc::new(CapabilitySet {
            execution_id,
            tenant,
            console: ConsoleBuffer::new(
                self.config.console_max_entries,
                self.config.console_max_entry_len,
            ),
            store: Arc::clone(&self.store),
            outbound: Arc::clone(&self.outbound),
            context: context.clone(),
            config: self.config.clone(),
            storage_writes: AtomicU32::new(0),
            http_requests: AtomicU32::new(0),
            bot_messages: AtomicU32::new(0),
        })
    }
}

impl CapabilitySet {
    pub fn context(&self) -> &HashMap<String, ContextValue> {
        &self.context
    }

    pub fn drain_logs(&self) -> Vec<ConsoleEntry> {
        self.console.drain()
    }

    pub fn console_len(&self) -> usize {
        self.console.len()
    }

    fn storage_key(&self, key: &str) -> Result<String, CapabilityError> {
        if key.is_empty() || key.len() > 256 || key.contains(':') {
            return Err(CapabilityError::Storage(format!("invalid key {:?}", key)));
        }
        Ok(format!("{}{}", data_prefix(&self.tenant), key))
    }

    async fn storage_call(&self, method: &str, args: Value) -> Result<Value, CapabilityError> {
        match method {
            "get" => {
                let key = required_str(&args, "key")?;
                let full = self.storage_key(&key)?;
                let raw = self
                    .store
                    .get(&full)
                    .await
                    .map_err(|e| CapabilityError::Storage(e.to_string()))?;
                Ok(match raw {
                    Some(raw) => serde_json::from_str(&raw)
                        .map_err(|e| CapabilityError::Storage(e.to_string()))?,
                    None => Value::Null,
                })
            }
            "set" => {
                let key = required_str(&args, "key")?;
                let value = args
                    .get("value")
                    .cloned()
                    .ok_or_else(|| CapabilityError::Storage("missing value".to_string()))?;
                let serialized = serde_json::to_string(&value)
                    .map_err(|e| CapabilityError::Storage(e.to_string()))?;
                if serialized.len() > self.config.storage_max_value_bytes {
                    return Err(CapabilityError::Storage(format!(
                        "value too large: {} bytes exceeds {}",
                        serialized.len(),
                        self.config.storage_max_value_bytes
                    )));
                }
                let writes = self.storage_writes.fetch_add(1, Ordering::SeqCst);
                if writes >= self.config.storage_max_writes {
                    return Err(CapabilityError::QuotaExceeded(format!(
                        "storage write quota of {} reached",
                        self.config.storage_max_writes
                    )));
                }
                let full = self.storage_key(&key)?;
                self.store
                    .set(
                        &full,
                        serialized,
                        Some(Duration::from_secs(self.config.storage_ttl_secs)),
                    )
                    .await
                    .map_err(|e| CapabilityError::Storage(e.to_string()))?;
                Ok(Value::Null)
            }
            "delete" => {
                let key = required_str(&args, "key")?;
                let full = self.storage_key(&key)?;
                self.store
                    .delete(&full)
                    .await
                    .map_err(|e| CapabilityError::Storage(e.to_string()))?;
                Ok(Value::Null)
            }
            "list" => {
                let prefix = data_prefix(&self.tenant);
                let keys = self
                    .store
                    .list_prefix(&prefix)
                    .await
                    .map_err(|e| CapabilityError::Storage(e.to_string()))?;
                let stripped: Vec<Value> = keys
                    .iter()
                    .filter_map(|k| k.strip_prefix(&prefix))
                    .map(|k| Value::String(k.to_string()))
                    .collect();
                Ok(Value::Array(stripped))
            }
            other => Err(CapabilityError::UnknownMethod(format!(
                "storage.{}",
                other
            ))),
        }
    }

    fn host_allowed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.config
            .http_allowed_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&host))
    }

    async fn http_call(&self, method: &str, args: Value) -> Result<Value, CapabilityError> {
        if method != "get" {
            return Err(CapabilityError::UnknownMethod(format!("http.{}", method)));
        }
        let raw_url = required_str(&args, "url")?;
        let url = reqwest::Url::parse(&raw_url)
            .map_err(|e| CapabilityError::Http(format!("invalid url: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CapabilityError::Http(format!(
                "scheme {:?} not allowed",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| CapabilityError::Http("url has no host".to_string()))?;
        // Allow-list check happens before any connection is attempted.
        if !self.host_allowed(host) {
            return Err(CapabilityError::Http(format!(
                "host {:?} is not on the allow-list",
                host
            )));
        }

        let requests = self.http_requests.fetch_add(1, Ordering::SeqCst);
        if requests >= self.config.http_max_requests {
            return Err(CapabilityError::QuotaExceeded(format!(
                "http request quota of {} reached",
                self.config.http_max_requests
            )));
        }

        let timeout_ms = args
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .map(|t| t.min(self.config.http_timeout_ms))
            .unwrap_or(self.config.http_timeout_ms);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .redirect(reqwest::redirect::Policy::limited(
                self.config.http_max_redirects,
            ))
            .build()
            .map_err(|e| CapabilityError::Http(e.to_string()))?;

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| CapabilityError::Http(sanitize_reqwest_error(&e)))?;
        let status = response.status().as_u16();

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CapabilityError::Http(sanitize_reqwest_error(&e)))?;
            if body.len() + chunk.len() > self.config.http_max_response_bytes {
                return Err(CapabilityError::Http(format!(
                    "response exceeds {} bytes",
                    self.config.http_max_response_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&body).into_owned();

        Ok(json!({ "status": status, "body": body }))
    }

    async fn bot_call(&self, method: &str, args: Value) -> Result<Value, CapabilityError> {
        match method {
            "sendMessage" => {
                let channel = required_str(&args, "channel")?;
                let content = required_str(&args, "content")?;
                if content.len() > self.config.bot_max_message_len {
                    return Err(CapabilityError::Bot(format!(
                        "message exceeds {} bytes",
                        self.config.bot_max_message_len
                    )));
                }
                self.charge_bot_quota()?;
                self.outbound
                    .enqueue(BotIntent {
                        execution_id: self.execution_id,
                        tenant: self.tenant.clone(),
                        kind: BotIntentKind::SendMessage { channel, content },
                    })
                    .await?;
                Ok(Value::Null)
            }
            "getData" => {
                let key = required_str(&args, "key")?;
                Ok(self
                    .outbound
                    .get_data(&self.tenant, &key)
                    .await?
                    .unwrap_or(Value::Null))
            }
            "setData" => {
                let key = required_str(&args, "key")?;
                let value = args
                    .get("value")
                    .cloned()
                    .ok_or_else(|| CapabilityError::Bot("missing value".to_string()))?;
                self.charge_bot_quota()?;
                self.outbound
                    .enqueue(BotIntent {
                        execution_id: self.execution_id,
                        tenant: self.tenant.clone(),
                        kind: BotIntentKind::SetData { key, value },
                    })
                    .await?;
                Ok(Value::Null)
            }
            "schedule" => {
                let delay_ms = args
                    .get("delayMs")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| CapabilityError::Bot("missing delayMs".to_string()))?;
                let payload = args.get("payload").cloned().unwrap_or(Value::Null);
                self.charge_bot_quota()?;
                self.outbound
                    .enqueue(BotIntent {
                        execution_id: self.execution_id,
                        tenant: self.tenant.clone(),
                        kind: BotIntentKind::Schedule { delay_ms, payload },
                    })
                    .await?;
                Ok(Value::Null)
            }
            other => Err(CapabilityError::UnknownMethod(format!("bot.{}", other))),
        }
    }

    fn charge_bot_quota(&self) -> Result<(), CapabilityError> {
        let sent = self.bot_messages.fetch_add(1, Ordering::SeqCst);
        if sent >= self.config.bot_max_messages {
            return Err(CapabilityError::QuotaExceeded(format!(
                "bot intent quota of {} reached",
                self.config.bot_max_messages
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CapabilityHost for CapabilitySet {
    async fn call(
        &self,
        capability: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, CapabilityError> {
        match capability {
            "storage" => self.storage_call(method, args).await,
            "http" => self.http_call(method, args).await,
            "bot" => self.bot_call(method, args).await,
            other => Err(CapabilityError::UnknownMethod(other.to_string())),
        }
    }

    fn console_log(&self, level: &str, message: &str) {
        self.console.push(level, message);
    }
}

fn required_str(args: &Value, field: &str) -> Result<String, CapabilityError> {
    args.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CapabilityError::UnknownMethod(format!("missing field {:?}", field)))
}

/// Strip connection detail out of reqwest errors before they reach the
/// sandbox; scripts only get the broad failure class.
fn sanitize_reqwest_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_redirect() {
        "too many redirects".to_string()
    } else if err.is_connect() {
        "connection failed".to_string()
    } else {
        "request failed".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryResultStore;

    fn builder_with(config: CapabilityConfig) -> (CapabilityBuilder, Arc<QueueingOutboundSink>) {
        let sink = Arc::new(QueueingOutboundSink::new());
        let builder = CapabilityBuilder::new(
            config,
            Arc::new(InMemoryResultStore::new()),
            sink.clone() as Arc<dyn OutboundSink>,
        );
        (builder, sink)
    }

    fn caps(config: CapabilityConfig) -> (Arc<CapabilitySet>, Arc<QueueingOutboundSink>) {
        let (builder, sink) = builder_with(config);
        (builder.build(&HashMap::new(), Uuid::new_v4()), sink)
    }

    #[test]
    fn console_buffer_evicts_oldest() {
        let buffer = ConsoleBuffer::new(3, 1024);
        for i in 0..5 {
            buffer.push("log", &format!("line {}", i));
        }
        let entries = buffer.drain();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "line 2");
        assert_eq!(entries[2].message, "line 4");
    }

    #[test]
    fn console_entries_are_size_capped() {
        let buffer = ConsoleBuffer::new(10, 8);
        buffer.push("log", "aaaaaaaaaaaaaaaaaaaa");
        let entries = buffer.drain();
        assert!(entries[0].message.starts_with("aaaaaaaa"));
        assert!(entries[0].message.ends_with('…'));
    }

    #[tokio::test]
    async fn storage_roundtrip_under_tenant_namespace() {
        let (caps, _) = caps(CapabilityConfig::default());
        caps.call("storage", "set", json!({"key": "x", "value": 42}))
            .await
            .unwrap();
        let got = caps
            .call("storage", "get", json!({"key": "x"}))
            .await
            .unwrap();
        assert_eq!(got, json!(42));
        let listed = caps.call("storage", "list", json!({})).await.unwrap();
        assert_eq!(listed, json!(["x"]));
    }

    #[tokio::test]
    async fn distinct_tenants_never_observe_each_other() {
        let (builder, _) = builder_with(CapabilityConfig::default());
        let store_key = |t: &str| {
            let mut ctx = HashMap::new();
            ctx.insert("tenant".to_string(), ContextValue::Str(t.to_string()));
            ctx
        };
        let a = builder.build(&store_key("bot-a"), Uuid::new_v4());
        let b = builder.build(&store_key("bot-b"), Uuid::new_v4());

        a.call("storage", "set", json!({"key": "k", "value": "from-a"}))
            .await
            .unwrap();
        let seen_by_b = b.call("storage", "get", json!({"key": "k"})).await.unwrap();
        assert_eq!(seen_by_b, Value::Null);
        assert_eq!(b.call("storage", "list", json!({})).await.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn oversized_storage_value_is_a_capability_error() {
        let mut config = CapabilityConfig::default();
        config.storage_max_value_bytes = 16;
        let (caps, _) = caps(config);
        let err = caps
            .call(
                "storage",
                "set",
                json!({"key": "big", "value": "x".repeat(64)}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("value too large"));
    }

    #[tokio::test]
    async fn storage_write_quota_is_independent_of_bot_quota() {
        let mut config = CapabilityConfig::default();
        config.storage_max_writes = 1;
        let (caps, _) = caps(config);
        caps.call("storage", "set", json!({"key": "a", "value": 1}))
            .await
            .unwrap();
        let err = caps
            .call("storage", "set", json!({"key": "b", "value": 2}))
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::QuotaExceeded(_)));
        // The bot budget is untouched by the storage breach.
        caps.call(
            "bot",
            "sendMessage",
            json!({"channel": "general", "content": "hi"}),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn http_rejects_non_allowlisted_host_without_network() {
        // No allow-listed hosts: every call must fail before any connection.
        let (caps, _) = caps(CapabilityConfig::default());
        let err = caps
            .call("http", "get", json!({"url": "https://evil.example/steal"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("allow-list"));

        let err = caps
            .call("http", "get", json!({"url": "file:///etc/passwd"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("scheme"));
    }

    #[tokio::test]
    async fn http_redirect_ceiling_is_enforced() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Local server that answers every request with a redirect to itself.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 302 Found\r\nLocation: http://127.0.0.1:{}/again\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    port
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });

        let mut config = CapabilityConfig::default();
        config.http_allowed_hosts = vec!["127.0.0.1".to_string()];
        config.http_max_redirects = 2;
        let (caps, _) = caps(config);
        let err = caps
            .call(
                "http",
                "get",
                json!({"url": format!("http://127.0.0.1:{}/", port)}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("too many redirects"));
    }

    #[tokio::test]
    async fn bot_intents_are_queued_not_executed() {
        let (caps, sink) = caps(CapabilityConfig::default());
        caps.call(
            "bot",
            "sendMessage",
            json!({"channel": "general", "content": "hello"}),
        )
        .await
        .unwrap();
        caps.call("bot", "schedule", json!({"delayMs": 5000, "payload": "ping"}))
            .await
            .unwrap();

        let intents = sink.drain();
        assert_eq!(intents.len(), 2);
        assert!(matches!(
            &intents[0].kind,
            BotIntentKind::SendMessage { channel, content }
                if channel == "general" && content == "hello"
        ));
        assert!(matches!(
            &intents[1].kind,
            BotIntentKind::Schedule { delay_ms: 5000, .. }
        ));
    }

    #[tokio::test]
    async fn bot_data_roundtrip() {
        let (caps, _) = caps(CapabilityConfig::default());
        caps.call("bot", "setData", json!({"key": "greeting", "value": "yo"}))
            .await
            .unwrap();
        let got = caps
            .call("bot", "getData", json!({"key": "greeting"}))
            .await
            .unwrap();
        assert_eq!(got, json!("yo"));
    }

    #[tokio::test]
    async fn oversized_bot_message_is_rejected() {
        let mut config = CapabilityConfig::default();
        config.bot_max_message_len = 8;
        let (caps, sink) = caps(config);
        let err = caps
            .call(
                "bot",
                "sendMessage",
                json!({"channel": "general", "content": "way too long for the cap"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Bot(_)));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn unknown_capability_and_method_are_rejected() {
        let (caps, _) = caps(CapabilityConfig::default());
        assert!(caps.call("fs", "read", json!({})).await.is_err());
        assert!(caps.call("storage", "purge", json!({})).await.is_err());
    }
}
