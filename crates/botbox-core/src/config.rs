//! Engine configuration
//!
//! Static defaults for every tunable the engine exposes, overridable per call
//! through `ExecutionOptions` and loadable from a TOML file for deployment
//! overrides. Every ceiling here is a hard external quota; sandboxed code is
//! never trusted to honor its own limits.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core_types::BackendKind;
use crate::errors::EngineError;

/// Top-level configuration for the execution engine.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Longest accepted script, in bytes. Checked before anything else.
    pub max_code_len: usize,
    /// Default wall-clock ceiling per execution.
    pub default_time_ms: u64,
    /// Default memory ceiling per execution.
    pub default_memory_bytes: u64,
    /// Default serialized-result ceiling per execution.
    pub default_output_bytes: usize,
    /// Utility modules a script may `require()` unless overridden per call.
    pub allowed_modules: Vec<String>,
    /// Backend used when the caller does not pick one.
    ///
    /// The restricted backend is not a true security boundary; deployments
    /// running genuinely untrusted, high-risk code should set this to
    /// `worker` or `container`.
    pub default_backend: BackendKind,
    /// Concurrent executions admitted by the scheduler.
    pub concurrency: usize,
    /// TTL for status/result entries in the result store, in seconds.
    pub status_ttl_secs: u64,
    pub validator: ValidatorConfig,
    pub capabilities: CapabilityConfig,
    pub worker: WorkerConfig,
    pub container: ContainerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_code_len: 32 * 1024,
            default_time_ms: 5_000,
            default_memory_bytes: 64 * 1024 * 1024,
            default_output_bytes: 64 * 1024,
            allowed_modules: vec!["text".to_string()],
            default_backend: BackendKind::Restricted,
            concurrency: 1,
            status_ttl_secs: 600,
            validator: ValidatorConfig::default(),
            capabilities: CapabilityConfig::default(),
            worker: WorkerConfig::default(),
            container: ContainerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// omitted field.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EngineError::Internal(format!("read config: {}", e)))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, EngineError> {
        toml::from_str(raw).map_err(|e| EngineError::Internal(format!("parse config: {}", e)))
    }
}

/// Pre-flight validation settings.
///
/// The pattern list is a heuristic, defense-in-depth layer in front of the
/// backend isolation, not a security boundary by itself.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Regex patterns a script must not match. Extends the built-in set.
    pub extra_blocked_patterns: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            extra_blocked_patterns: Vec::new(),
        }
    }
}

/// Quotas for the capability surface exposed inside the sandbox.
/// Each capability enforces its own budget; exhausting one never touches
/// another's.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Console ring buffer depth. Oldest entries are evicted.
    pub console_max_entries: usize,
    /// Longest accepted console line; longer lines are cut.
    pub console_max_entry_len: usize,
    /// Largest value accepted by `storage.set`.
    pub storage_max_value_bytes: usize,
    /// Writes allowed per execution.
    pub storage_max_writes: u32,
    /// TTL applied to storage writes, in seconds.
    pub storage_ttl_secs: u64,
    /// Hosts `http.get` may contact. Checked before any network call.
    pub http_allowed_hosts: Vec<String>,
    /// Per-request timeout for `http.get`, in milliseconds.
    pub http_timeout_ms: u64,
    /// Redirects followed per request.
    pub http_max_redirects: usize,
    /// Largest response body returned to the sandbox.
    pub http_max_response_bytes: usize,
    /// Requests allowed per execution.
    pub http_max_requests: u32,
    /// Outbound bot intents allowed per execution.
    pub bot_max_messages: u32,
    /// Longest accepted outbound message body.
    pub bot_max_message_len: usize,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            console_max_entries: 100,
            console_max_entry_len: 1_024,
            storage_max_value_bytes: 16 * 1024,
            storage_max_writes: 50,
            storage_ttl_secs: 24 * 60 * 60,
            http_allowed_hosts: Vec::new(),
            http_timeout_ms: 3_000,
            http_max_redirects: 3,
            http_max_response_bytes: 256 * 1024,
            http_max_requests: 10,
            bot_max_messages: 10,
            bot_max_message_len: 4_096,
        }
    }
}

/// Settings for the isolated-worker backend.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// Explicit path to the `botbox-worker` binary. When unset, common
    /// locations are probed at startup.
    pub binary_path: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary_path: None,
        }
    }
}

/// Settings for the container backend.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ContainerConfig {
    pub enabled: bool,
    /// Image the script runs in. Needs a `node` entrypoint on PATH.
    pub image: String,
    /// CPU quota in units of 10^-9 CPUs (Docker `NanoCpus`).
    pub nano_cpus: i64,
    /// Process-count ceiling inside the container.
    pub pids_limit: i64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: "node:20-slim".to_string(),
            nano_cpus: 500_000_000, // half a CPU
            pids_limit: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.default_backend, BackendKind::Restricted);
        assert!(config.max_code_len > 0);
        assert!(config.capabilities.http_allowed_hosts.is_empty());
    }

    #[test]
    fn toml_overrides_merge_with_defaults() {
        let raw = r#"
            default_time_ms = 250
            default_backend = "worker"

            [capabilities]
            http_allowed_hosts = ["api.example.com"]
        "#;
        let config = EngineConfig::from_toml(raw).unwrap();
        assert_eq!(config.default_time_ms, 250);
        assert_eq!(config.default_backend, BackendKind::Worker);
        assert_eq!(
            config.capabilities.http_allowed_hosts,
            vec!["api.example.com".to_string()]
        );
        // Untouched fields keep their defaults
        assert_eq!(config.concurrency, 1);
        assert_eq!(
            config.default_output_bytes,
            EngineConfig::default().default_output_bytes
        );
    }

    #[test]
    fn bad_toml_is_rejected() {
        assert!(EngineConfig::from_toml("default_time_ms = \"oops\"").is_err());
    }
}
