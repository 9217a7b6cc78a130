use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, de};

use crate::config::ConfigError;

/// Interpreter used when the configuration does not name one
pub const DEFAULT_INTERPRETER: &str = "R";

const MEMORY_SUFFIXES: [char; 3] = ['K', 'M', 'G'];

/// Configuration for the interpreter subprocess
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// Executable name or path (bare names are resolved through PATH)
    #[serde(default = "default_path")]
    pub path: String,

    /// Arguments passed to every session process
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Arguments for the start-up availability probe
    #[serde(default = "default_version_args")]
    pub version_args: Vec<String>,

    /// Extra environment variables for session processes
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Memory ceiling exported as `R_MAX_MEM_SIZE`
    #[serde(default)]
    pub memory_limit: MemoryLimit,

    /// Readiness budget for a freshly spawned process, in milliseconds
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
}

impl InterpreterConfig {
    /// Create a config for an arbitrary executable with the given arguments
    pub fn command(path: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            path: path.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// Resolve the executable to an absolute path using the host's PATH.
    ///
    /// Paths containing a `/` are checked directly.
    pub fn resolve_binary(&self) -> Result<PathBuf, ConfigError> {
        which::which(&self.path).map_err(|source| ConfigError::InterpreterNotFound {
            name: self.path.clone(),
            source,
        })
    }

    /// Environment applied on top of the inherited one
    pub fn process_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("R_MAX_MEM_SIZE".to_owned(), self.memory_limit.to_string()));
        env
    }
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            args: default_args(),
            version_args: default_version_args(),
            env: HashMap::new(),
            memory_limit: MemoryLimit::default(),
            start_timeout_ms: default_start_timeout_ms(),
        }
    }
}

/// Memory size in R's `R_MAX_MEM_SIZE` notation (e.g. "512M")
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryLimit(String);

impl MemoryLimit {
    pub fn new(limit: &str) -> Result<Self, ConfigError> {
        let digits = limit.strip_suffix(MEMORY_SUFFIXES).unwrap_or(limit);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::InvalidMemoryLimit(limit.to_owned()));
        }
        Ok(Self(limit.to_owned()))
    }
}

impl Default for MemoryLimit {
    fn default() -> Self {
        Self("512M".to_owned())
    }
}

impl<'de> Deserialize<'de> for MemoryLimit {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        MemoryLimit::new(&s).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"digits with an optional K, M or G suffix",
            )
        })
    }
}

impl std::fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn default_path() -> String {
    DEFAULT_INTERPRETER.to_owned()
}

fn default_args() -> Vec<String> {
    vec!["--vanilla".to_owned(), "--slave".to_owned()]
}

fn default_version_args() -> Vec<String> {
    vec!["--version".to_owned()]
}

fn default_start_timeout_ms() -> u64 {
    5000
}
