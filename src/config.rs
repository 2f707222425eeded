//! Configuration for agents and controllers.
//!
//! Loaded from a JSON file named by the `ESTHREAD_CONFIG` environment
//! variable, with per-field defaults. Timeouts are given in milliseconds on
//! disk and exposed as `Duration`s.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Controller settings.
    #[serde(default)]
    pub thread: ThreadConfigFile,

    /// Agent context settings.
    #[serde(default)]
    pub worker: WorkerOptions,
}

impl Config {
    /// Load from the file named by `ESTHREAD_CONFIG`, or defaults if unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var("ESTHREAD_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => {
                debug!("ESTHREAD_CONFIG not set, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse config JSON")?;
        Ok(config)
    }
}

/// Which kind of agent context to create.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// One controller per agent.
    #[default]
    Dedicated,
    /// Any number of controllers connect to one agent.
    Shared,
}

/// Options for creating an agent context.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerOptions {
    /// Name visible inside the agent and used for its thread.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub kind: WorkerKind,

    /// Stack size of the agent thread in bytes (platform default if unset).
    #[serde(default)]
    pub stack_size: Option<usize>,

    /// How long terminating waits for the agent thread to exit.
    #[serde(default = "default_terminate_timeout_ms")]
    pub terminate_timeout_ms: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: None,
            kind: WorkerKind::default(),
            stack_size: None,
            terminate_timeout_ms: default_terminate_timeout_ms(),
        }
    }
}

impl WorkerOptions {
    pub fn shared() -> Self {
        Self {
            kind: WorkerKind::Shared,
            ..Self::default()
        }
    }

    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    pub(crate) fn thread_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| "esthread-worker".to_string())
    }

    pub(crate) fn thread_builder(&self) -> std::thread::Builder {
        let builder = std::thread::Builder::new().name(self.thread_name());
        match self.stack_size {
            Some(size) => builder.stack_size(size),
            None => builder,
        }
    }
}

/// Controller settings as read from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadConfigFile {
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// Methods the agent must advertise for spawning to succeed.
    #[serde(default)]
    pub expected_methods: Vec<String>,
}

impl Default for ThreadConfigFile {
    fn default() -> Self {
        Self {
            ready_timeout_ms: default_ready_timeout_ms(),
            expected_methods: Vec::new(),
        }
    }
}

/// Parsed controller configuration with `Duration` fields.
#[derive(Debug, Clone)]
pub struct ThreadConfig {
    /// How long to wait for the agent's Ready message.
    pub ready_timeout: Duration,

    /// Methods that must be exposed by the agent.
    pub expected_methods: Vec<String>,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_millis(default_ready_timeout_ms()),
            expected_methods: Vec::new(),
        }
    }
}

impl ThreadConfig {
    /// Create from the JSON configuration values.
    pub fn from_file_config(file: &ThreadConfigFile) -> Self {
        Self {
            ready_timeout: Duration::from_millis(file.ready_timeout_ms),
            expected_methods: file.expected_methods.clone(),
        }
    }

    /// Create from environment variables, falling back to defaults.
    ///
    /// Reads `ESTHREAD_READY_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        Self {
            ready_timeout: std::env::var("ESTHREAD_READY_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map_or_else(
                    || Duration::from_millis(default_ready_timeout_ms()),
                    Duration::from_millis,
                ),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    #[must_use]
    pub fn expecting<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_methods = methods.into_iter().map(Into::into).collect();
        self
    }
}

const fn default_ready_timeout_ms() -> u64 {
    30_000
}

const fn default_terminate_timeout_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ThreadConfig::default();
        assert_eq!(config.ready_timeout, Duration::from_secs(30));
        assert!(config.expected_methods.is_empty());

        let options = WorkerOptions::default();
        assert_eq!(options.kind, WorkerKind::Dedicated);
        assert_eq!(options.terminate_timeout(), Duration::from_secs(5));
        assert_eq!(options.thread_name(), "esthread-worker");
    }

    #[test]
    fn from_env_defaults() {
        // When env vars are not set, from_env() uses the same defaults
        let config = ThreadConfig::from_env();
        assert_eq!(config.ready_timeout, Duration::from_secs(30));
    }

    #[test]
    fn parse_full_json() {
        let json = r#"{
            "thread": {
                "ready_timeout_ms": 1500,
                "expected_methods": ["hello_world", "take_time"]
            },
            "worker": {
                "name": "compute",
                "kind": "shared",
                "stack_size": 4194304,
                "terminate_timeout_ms": 250
            }
        }"#;

        let config = Config::from_json(json).unwrap();
        let thread = ThreadConfig::from_file_config(&config.thread);
        assert_eq!(thread.ready_timeout, Duration::from_millis(1500));
        assert_eq!(thread.expected_methods, vec!["hello_world", "take_time"]);

        assert_eq!(config.worker.name.as_deref(), Some("compute"));
        assert_eq!(config.worker.kind, WorkerKind::Shared);
        assert_eq!(config.worker.stack_size, Some(4_194_304));
        assert_eq!(config.worker.terminate_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn parse_empty_json_applies_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.thread.ready_timeout_ms, 30_000);
        assert_eq!(config.worker.kind, WorkerKind::Dedicated);
        assert!(config.worker.name.is_none());
    }

    #[test]
    fn rejects_unknown_kind() {
        let err = Config::from_json(r#"{"worker": {"kind": "remote"}}"#).unwrap_err();
        assert!(format!("{err:#}").contains("unknown variant"));
    }

    #[test]
    fn from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("esthread.json");
        std::fs::write(&path, r#"{"worker": {"name": "from-file"}}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.worker.name.as_deref(), Some("from-file"));
    }

    #[test]
    fn from_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::from_file(&dir.path().join("missing.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn builder_helpers() {
        let config = ThreadConfig::default()
            .with_ready_timeout(Duration::from_millis(10))
            .expecting(["a", "b"]);
        assert_eq!(config.ready_timeout, Duration::from_millis(10));
        assert_eq!(config.expected_methods, vec!["a", "b"]);
        assert_eq!(WorkerOptions::shared().kind, WorkerKind::Shared);
    }
}
