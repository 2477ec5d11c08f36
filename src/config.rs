use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::executor::rate_limit;

/// File-based overrides, loaded before env vars so env always wins. Every
/// field optional — absent fields fall back to the built-in default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    storage_dir: Option<PathBuf>,
    executor_command: Option<String>,
    executor_args: Option<Vec<String>>,
    bind_addr: Option<String>,
    tick_interval_seconds: Option<u64>,
    execution_timeout_seconds: Option<u64>,
    max_retries_default: Option<u32>,
    rate_limit_backoff_seconds: Option<i64>,
    rate_limit_signals: Option<Vec<String>>,
    output_capture_bytes: Option<usize>,
    execution_log_lines: Option<usize>,
    shutdown_grace_seconds: Option<u64>,
    cancel_grace_seconds: Option<u64>,
    broadcast_capacity: Option<usize>,
}

pub struct Config {
    /// Root directory for `queue_state.json` and `accounts/` (spec.md §6).
    pub storage_dir: PathBuf,
    /// The external AI CLI to invoke.
    pub executor_command: String,
    /// Extra arguments placed before the prompt's trailing positional arg.
    pub executor_args: Vec<String>,
    /// Address the control plane listens on.
    pub bind_addr: SocketAddr,
    pub tick_interval: Duration,
    pub execution_timeout: Duration,
    pub max_retries_default: u32,
    pub rate_limit_backoff_seconds: i64,
    pub rate_limit_signals: Vec<String>,
    pub output_capture_bytes: usize,
    pub execution_log_lines: usize,
    pub shutdown_grace: Duration,
    pub cancel_grace: Duration,
    pub broadcast_capacity: usize,
}

impl Config {
    /// Load defaults, overlay an optional TOML file (`CLAUDE_QUEUE_CONFIG`,
    /// falling back to `<storage_dir>/config.toml` if present), then overlay
    /// environment variables — the same "env wins" layering the teacher
    /// applies in `Config::from_env`, extended with a file layer since this
    /// daemon is long-running and benefits from a checked-in config.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = Self::defaults();

        let file_path = std::env::var("CLAUDE_QUEUE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| cfg.storage_dir.join("config.toml"));
        if file_path.exists() {
            let raw = std::fs::read_to_string(&file_path)?;
            let file_cfg: FileConfig = toml::from_str(&raw)?;
            cfg.apply_file(file_cfg);
        } else {
            tracing::debug!(path = %file_path.display(), "no config file found, using defaults + env");
        }

        cfg.apply_env();
        Ok(cfg)
    }

    /// Built-in defaults with no file or environment layer applied. Exposed
    /// so callers that assemble a `Config` in-process (tests, embedders) can
    /// start from a known-good baseline and override only what they need.
    pub fn defaults() -> Self {
        let storage_dir = dirs::home_dir()
            .map(|h| h.join(".claude-queue"))
            .unwrap_or_else(|| PathBuf::from(".claude-queue"));

        Self {
            storage_dir,
            executor_command: "claude".to_string(),
            executor_args: Vec::new(),
            bind_addr: "127.0.0.1:8787".parse().expect("valid default addr"),
            tick_interval: Duration::from_secs(1),
            execution_timeout: Duration::from_secs(3600),
            max_retries_default: 3,
            rate_limit_backoff_seconds: 60,
            rate_limit_signals: rate_limit::DEFAULT_SIGNALS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            output_capture_bytes: 1024 * 1024,
            execution_log_lines: 200,
            shutdown_grace: Duration::from_secs(5),
            cancel_grace: Duration::from_secs(2),
            broadcast_capacity: 256,
        }
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.storage_dir {
            self.storage_dir = v;
        }
        if let Some(v) = file.executor_command {
            self.executor_command = v;
        }
        if let Some(v) = file.executor_args {
            self.executor_args = v;
        }
        if let Some(v) = file.bind_addr {
            match v.parse() {
                Ok(addr) => self.bind_addr = addr,
                Err(e) => tracing::warn!(value = %v, error = %e, "invalid bind_addr in config file, ignoring"),
            }
        }
        if let Some(v) = file.tick_interval_seconds {
            self.tick_interval = Duration::from_secs(v);
        }
        if let Some(v) = file.execution_timeout_seconds {
            self.execution_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.max_retries_default {
            self.max_retries_default = v;
        }
        if let Some(v) = file.rate_limit_backoff_seconds {
            self.rate_limit_backoff_seconds = v;
        }
        if let Some(v) = file.rate_limit_signals {
            self.rate_limit_signals = v;
        }
        if let Some(v) = file.output_capture_bytes {
            self.output_capture_bytes = v;
        }
        if let Some(v) = file.execution_log_lines {
            self.execution_log_lines = v;
        }
        if let Some(v) = file.shutdown_grace_seconds {
            self.shutdown_grace = Duration::from_secs(v);
        }
        if let Some(v) = file.cancel_grace_seconds {
            self.cancel_grace = Duration::from_secs(v);
        }
        if let Some(v) = file.broadcast_capacity {
            self.broadcast_capacity = v;
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CLAUDE_QUEUE_STORAGE_DIR") {
            self.storage_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CLAUDE_QUEUE_EXECUTOR_COMMAND") {
            self.executor_command = v;
        }
        if let Ok(v) = std::env::var("CLAUDE_QUEUE_BIND_ADDR") {
            match v.parse() {
                Ok(addr) => self.bind_addr = addr,
                Err(e) => tracing::warn!(value = %v, error = %e, "invalid CLAUDE_QUEUE_BIND_ADDR, keeping previous value"),
            }
        }
        if let Ok(v) = std::env::var("CLAUDE_QUEUE_TICK_INTERVAL_SECONDS") {
            match v.parse() {
                Ok(secs) => self.tick_interval = Duration::from_secs(secs),
                Err(_) => tracing::warn!(value = %v, "invalid CLAUDE_QUEUE_TICK_INTERVAL_SECONDS, ignoring"),
            }
        }
        if let Ok(v) = std::env::var("CLAUDE_QUEUE_EXECUTION_TIMEOUT_SECONDS") {
            match v.parse() {
                Ok(secs) => self.execution_timeout = Duration::from_secs(secs),
                Err(_) => tracing::warn!(value = %v, "invalid CLAUDE_QUEUE_EXECUTION_TIMEOUT_SECONDS, ignoring"),
            }
        }
        if let Ok(v) = std::env::var("CLAUDE_QUEUE_MAX_RETRIES") {
            match v.parse() {
                Ok(n) => self.max_retries_default = n,
                Err(_) => tracing::warn!(value = %v, "invalid CLAUDE_QUEUE_MAX_RETRIES, ignoring"),
            }
        }
        if let Ok(v) = std::env::var("CLAUDE_QUEUE_RATE_LIMIT_BACKOFF_SECONDS") {
            match v.parse() {
                Ok(n) => self.rate_limit_backoff_seconds = n,
                Err(_) => tracing::warn!(value = %v, "invalid CLAUDE_QUEUE_RATE_LIMIT_BACKOFF_SECONDS, ignoring"),
            }
        }
        if let Ok(v) = std::env::var("CLAUDE_QUEUE_OUTPUT_CAPTURE_BYTES") {
            match v.parse() {
                Ok(n) => self.output_capture_bytes = n,
                Err(_) => tracing::warn!(value = %v, "invalid CLAUDE_QUEUE_OUTPUT_CAPTURE_BYTES, ignoring"),
            }
        }
        if let Ok(v) = std::env::var("CLAUDE_QUEUE_SHUTDOWN_GRACE_SECONDS") {
            match v.parse() {
                Ok(secs) => self.shutdown_grace = Duration::from_secs(secs),
                Err(_) => tracing::warn!(value = %v, "invalid CLAUDE_QUEUE_SHUTDOWN_GRACE_SECONDS, ignoring"),
            }
        }
    }

    pub fn accounts_root(&self) -> PathBuf {
        self.storage_dir.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = Config::defaults();
        assert_eq!(cfg.executor_command, "claude");
        assert!(cfg.rate_limit_signals.contains(&"rate limit".to_string()));
        assert_eq!(cfg.max_retries_default, 3);
    }

    #[test]
    fn file_layer_overrides_defaults() {
        let mut cfg = Config::defaults();
        cfg.apply_file(FileConfig {
            executor_command: Some("codex".to_string()),
            max_retries_default: Some(7),
            ..Default::default()
        });
        assert_eq!(cfg.executor_command, "codex");
        assert_eq!(cfg.max_retries_default, 7);
    }
}
