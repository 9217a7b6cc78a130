use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub use crate::config::interpreter::{DEFAULT_INTERPRETER, InterpreterConfig, MemoryLimit};

pub mod interpreter;
mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../rcage.example.toml");

/// Prefix for environment variable overrides (`RCAGE__POOL__MAX_SESSIONS`).
pub const ENV_PREFIX: &str = "RCAGE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid memory limit '{0}': expected digits with an optional K, M or G suffix")]
    InvalidMemoryLimit(String),

    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("interpreter '{name}' not found: {source}")]
    InterpreterNotFound {
        name: String,
        #[source]
        source: which::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for rcage
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// How the interpreter subprocess is located and launched.
    #[serde(default)]
    pub interpreter: InterpreterConfig,

    /// Session pool sizing and reaping.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Per-session execution defaults.
    #[serde(default)]
    pub session: SessionConfig,

    /// Static code validation settings.
    #[serde(default)]
    pub validator: ValidatorConfig,
}

/// Session pool settings
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of registered sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Idle duration after which a non-busy session is reaped, in seconds.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Interval between reaper sweeps, in seconds.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    /// Grace period granted to interpreters on shutdown, in milliseconds.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Per-session execution defaults
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Wall-clock budget for an execution without an explicit timeout.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl SessionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

/// Static validation settings
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    /// Maximum accepted source length, in characters.
    #[serde(default = "default_max_code_length")]
    pub max_code_length: usize,

    /// Packages accepted on top of the built-in allow-list.
    #[serde(default)]
    pub extra_allowed_packages: Vec<String>,

    /// Function names rejected on top of the built-in deny-list.
    #[serde(default)]
    pub extra_denied_functions: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_code_length: default_max_code_length(),
            extra_allowed_packages: Vec::new(),
            extra_denied_functions: Vec::new(),
        }
    }
}

impl Config {
    /// Create a new config from the embedded example
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_max_sessions() -> usize {
    5
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_code_length() -> usize {
    10_000
}
