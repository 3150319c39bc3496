//! Service configuration.
//!
//! Configuration is read from an optional TOML file (`MAESTRO_CONFIG`)
//! with environment-variable overrides for everything deployments care
//! about. Secrets (API keys, bearer tokens) are never stored in the file;
//! the config holds only the *names* of the env vars that carry them.

use std::fmt;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Default per-RPC timeout when the caller does not pass one.
    pub rpc_timeout_ms: u64,
    /// Env var carrying the frontend bearer token. Empty token = dev mode.
    pub api_token_env: String,
    /// Env var carrying the worker-callback bearer token.
    pub callback_token_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            rpc_timeout_ms: 120_000,
            api_token_env: "MAESTRO_API_TOKEN".into(),
            callback_token_env: "MAESTRO_CALLBACK_TOKEN".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Env var carrying the store password (empty env = no auth).
    pub password_env: String,
    pub db: i64,
    /// Run against the bundled in-memory store instead of Redis
    /// (local development and tests).
    pub memory: bool,
    /// Per-command socket timeout. Commands get one retry.
    pub command_timeout_ms: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6379,
            tls: false,
            password_env: "MAESTRO_KV_PASSWORD".into(),
            db: 0,
            memory: false,
            command_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Env var carrying the provider API key.
    pub api_key_env: String,
    pub base_url: String,
    pub model: String,
    /// Soft context budget; crossing it triggers resummarization before
    /// the next turn.
    pub token_budget: u32,
    /// Raw turns kept verbatim after a resummarization pass.
    pub keep_last_turns: usize,
    pub max_turns: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key_env: "MAESTRO_LLM_API_KEY".into(),
            base_url: "https://api.anthropic.com".into(),
            model: "claude-sonnet-4-20250514".into(),
            token_budget: 80_000,
            keep_last_turns: 6,
            max_turns: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Base URL of the long-process worker fleet.
    pub base_url: String,
    /// Env var carrying the worker API key.
    pub api_key_env: String,
    /// Public base URL of this service, used by workers to reach
    /// `POST /lpt/callback`.
    pub callback_base_url: String,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9090".into(),
            api_key_env: "MAESTRO_WORKER_API_KEY".into(),
            callback_base_url: "http://localhost:8080".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
    /// TTL of the cross-instance tick lock. Must exceed the tick interval.
    pub lock_ttl_secs: u64,
    /// Bound on task executions started in parallel within one tick.
    pub max_parallel: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            lock_ttl_secs: 300,
            max_parallel: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub sweep_secs: u64,
    /// A workflow paused on an LPT longer than this is force-resumed with
    /// a timeout failure.
    pub max_lpt_wait_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            sweep_secs: 120,
            max_lpt_wait_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Sliding TTL of the per-(user, company) session blob.
    pub session_ttl_secs: u64,
    /// Sliding TTL of per-thread chat history.
    pub history_ttl_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 2 * 3600,
            history_ttl_secs: 24 * 3600,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub kv: KvConfig,
    pub llm: LlmConfig,
    pub workers: WorkersConfig,
    pub scheduler: SchedulerConfig,
    pub watchdog: WatchdogConfig,
    pub sessions: SessionsConfig,
}

impl Config {
    /// Load configuration: defaults ← optional TOML file ← env overrides.
    pub fn load() -> crate::Result<Self> {
        let mut cfg = match std::env::var("MAESTRO_CONFIG") {
            Ok(path) if !path.is_empty() => {
                let raw = std::fs::read_to_string(&path)?;
                toml::from_str(&raw)
                    .map_err(|e| crate::Error::Config(format!("{path}: {e}")))?
            }
            _ => Config::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    /// Apply `MAESTRO_*` environment overrides onto the loaded values.
    pub fn apply_env(&mut self) {
        env_str("MAESTRO_HOST", &mut self.server.host);
        env_parse("MAESTRO_PORT", &mut self.server.port);
        env_parse("MAESTRO_RPC_TIMEOUT_MS", &mut self.server.rpc_timeout_ms);
        env_str("MAESTRO_KV_HOST", &mut self.kv.host);
        env_parse("MAESTRO_KV_PORT", &mut self.kv.port);
        env_parse("MAESTRO_KV_TLS", &mut self.kv.tls);
        env_parse("MAESTRO_KV_DB", &mut self.kv.db);
        env_parse("MAESTRO_KV_MEMORY", &mut self.kv.memory);
        env_str("MAESTRO_LLM_BASE_URL", &mut self.llm.base_url);
        env_str("MAESTRO_LLM_MODEL", &mut self.llm.model);
        env_parse("MAESTRO_LLM_TOKEN_BUDGET", &mut self.llm.token_budget);
        env_str("MAESTRO_WORKER_BASE_URL", &mut self.workers.base_url);
        env_str(
            "MAESTRO_CALLBACK_BASE_URL",
            &mut self.workers.callback_base_url,
        );
        env_parse("MAESTRO_SCHEDULER_TICK_SECS", &mut self.scheduler.tick_secs);
        env_parse("MAESTRO_WATCHDOG_SWEEP_SECS", &mut self.watchdog.sweep_secs);
        env_parse(
            "MAESTRO_LPT_MAX_WAIT_SECS",
            &mut self.watchdog.max_lpt_wait_secs,
        );
    }

    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let mut error = |field: &str, message: String| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: field.into(),
                message,
            });
        };

        if self.server.port == 0 {
            error("server.port", "port must be greater than 0".into());
        }
        if self.server.host.is_empty() {
            error("server.host", "host must not be empty".into());
        }
        for (field, url) in [
            ("llm.base_url", &self.llm.base_url),
            ("workers.base_url", &self.workers.base_url),
            ("workers.callback_base_url", &self.workers.callback_base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                error(
                    field,
                    format!("must start with http:// or https:// (got \"{url}\")"),
                );
            }
        }
        if self.scheduler.lock_ttl_secs <= self.scheduler.tick_secs {
            error(
                "scheduler.lock_ttl_secs",
                format!(
                    "tick lock TTL ({}) must exceed the tick interval ({})",
                    self.scheduler.lock_ttl_secs, self.scheduler.tick_secs
                ),
            );
        }
        if self.llm.max_turns == 0 {
            error("llm.max_turns", "turn loop cap must be at least 1".into());
        }

        if std::env::var(&self.server.api_token_env).is_err() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "server.api_token_env".into(),
                message: format!(
                    "{} is not set — RPC auth is disabled",
                    self.server.api_token_env
                ),
            });
        }

        issues
    }
}

fn env_str(name: &str, target: &mut String) {
    if let Ok(v) = std::env::var(name) {
        if !v.is_empty() {
            *target = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(v) = std::env::var(name) {
        if let Ok(parsed) = v.parse::<T>() {
            *target = parsed;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}
