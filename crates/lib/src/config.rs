//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.cligate/config.json`) and environment.
//! Relative paths inside it (registry file, audit log) resolve against the file's directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::ratelimit::RateLimitConfig;
use crate::registry::CommandDescriptor;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Permitted commands (inline and/or from a file).
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Dangerous-pattern deny-list tuning.
    #[serde(default)]
    pub validator: ValidatorConfig,

    /// Global rate limit, applied per (actor, command). Commands may override it.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Process execution bounds.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Audit queue, sink and retry settings.
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 15151).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Auth settings. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require `Authorization: Bearer`.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret for the upstream application. Overridden by CLIGATE_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require the bearer token to match the configured token.
    Token,
}

fn default_gateway_port() -> u16 {
    15151
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Where permitted commands come from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// JSON file with `{ "commands": [...] }`. Relative paths resolve against the config file's parent.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Commands defined directly in the config.
    #[serde(default)]
    pub commands: Vec<CommandDescriptor>,
}

/// Deny-list tuning. The baseline always applies unless `replaceBaseline` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorConfig {
    /// Additional substrings that reject an argument.
    #[serde(default)]
    pub extra_deny_patterns: Vec<String>,

    /// Use only `extraDenyPatterns`. Intended for tests; logged at warn when set.
    #[serde(default)]
    pub replace_baseline: bool,
}

/// Process execution bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    /// Per-stream capture ceiling in bytes (default 1 MiB).
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Time between SIGTERM and SIGKILL when terminating a process group.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Environment variables copied from the service into the child; everything else is cleared.
    #[serde(default = "default_env_passthrough")]
    pub env_passthrough: Vec<String>,

    /// Working directory for the child (default: the service's).
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Cap on processes running at once. None or 0 = unlimited.
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_kill_grace_ms() -> u64 {
    2_000
}

fn default_env_passthrough() -> Vec<String> {
    vec!["PATH".to_string(), "LANG".to_string()]
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: default_max_output_bytes(),
            kill_grace_ms: default_kill_grace_ms(),
            env_passthrough: default_env_passthrough(),
            working_dir: None,
            max_concurrent: None,
        }
    }
}

/// What the audit logger does when its queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueFullPolicy {
    /// Wait up to `enqueueTimeoutMs` for room, then drop the new record (counted).
    #[default]
    Block,
    /// Evict the oldest queued record (counted) and enqueue the new one.
    DropOldest,
}

/// Audit logger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    /// JSON-lines file. Default: `audit.jsonl` next to the config file.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub full_policy: QueueFullPolicy,

    /// Longest a caller waits to enqueue under the `block` policy.
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,

    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Write attempts per record before the logger reports degraded health.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// fsync after every record.
    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_enqueue_timeout_ms() -> u64 {
    50
}

fn default_retry_initial_ms() -> u64 {
    100
}

fn default_retry_max_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_fsync() -> bool {
    true
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            queue_capacity: default_queue_capacity(),
            full_policy: QueueFullPolicy::default(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
            max_retries: default_max_retries(),
            fsync: default_fsync(),
        }
    }
}

impl Config {
    /// Reject settings that would make the service unsafe or unable to run.
    pub fn validate(&self) -> Result<()> {
        self.rate_limit
            .validate()
            .map_err(|e| anyhow::anyhow!("rateLimit: {}", e))?;
        if self.executor.max_output_bytes == 0 {
            anyhow::bail!("executor.maxOutputBytes must be greater than zero");
        }
        if self.audit.queue_capacity == 0 {
            anyhow::bail!("audit.queueCapacity must be greater than zero");
        }
        if self.audit.max_retries == 0 {
            anyhow::bail!("audit.maxRetries must be at least 1");
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the gateway token: env CLIGATE_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    non_empty_env("CLIGATE_GATEWAY_TOKEN").or_else(|| {
        config
            .gateway
            .auth
            .token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CLIGATE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".cligate").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or CLIGATE_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving relative paths).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config: Config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    config
        .validate()
        .with_context(|| format!("validating config from {}", path.display()))?;
    Ok((config, path))
}

fn config_dir(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn resolve_relative(config_path: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        config_dir(config_path).join(p)
    }
}

/// Registry file path, if configured.
pub fn resolve_registry_file(config: &Config, config_path: &Path) -> Option<PathBuf> {
    match &config.registry.file {
        Some(f) if !f.as_os_str().is_empty() => Some(resolve_relative(config_path, f)),
        _ => None,
    }
}

/// Audit log path: `audit.path` if set, else `audit.jsonl` next to the config file.
pub fn resolve_audit_path(config: &Config, config_path: &Path) -> PathBuf {
    match &config.audit.path {
        Some(p) if !p.as_os_str().is_empty() => resolve_relative(config_path, p),
        _ => config_dir(config_path).join("audit.jsonl"),
    }
}
