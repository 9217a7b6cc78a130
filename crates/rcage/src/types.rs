use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One dataset row: column name to JSON value, in insertion order
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Prefix the interpreter wrapper writes when user code raises an error
pub const ERROR_PREFIX: &str = "ERROR:";

/// Marker for inline base64 images in interpreter output
pub const INLINE_IMAGE_PREFIX: &str = "data:image";

/// Result of running code in a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the interpreter reached the completion marker
    pub success: bool,

    /// Captured stdout with the completion marker removed, trimmed
    pub output: String,

    /// Captured stderr (warnings, messages), trimmed
    #[serde(default)]
    pub stderr: String,

    /// Wall time from write to marker
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl ExecutionResult {
    /// The message of an error the interpreter caught while running the code.
    ///
    /// Such failures still produce a successful result since the session
    /// survived them.
    pub fn reported_error(&self) -> Option<&str> {
        self.output.lines().find_map(|line| {
            line.trim_start()
                .strip_prefix(ERROR_PREFIX)
                .map(str::trim)
        })
    }

    /// Check if the output embeds a rendered image
    pub fn has_inline_image(&self) -> bool {
        self.output.contains(INLINE_IMAGE_PREFIX)
    }
}

/// Options for a single execution
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Wall-clock budget; the session default applies when unset
    pub timeout: Option<Duration>,

    /// Dataset bound to `data` before the code runs
    pub data: Option<Vec<Row>>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the wall-clock timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a dataset
    pub fn with_data(mut self, rows: Vec<Row>) -> Self {
        self.data = Some(rows);
        self
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unstarted,
    Starting,
    Ready,
    Executing,
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Snapshot of a session for introspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub id: String,
    pub state: SessionState,
    pub busy: bool,
    pub alive: bool,
    /// Seconds since the session was created
    pub age_secs: u64,
    /// Seconds since the session last ran code
    pub idle_secs: u64,
}

/// Code generated from a prompt together with the result of running it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptOutcome {
    pub code: String,
    pub result: ExecutionResult,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
