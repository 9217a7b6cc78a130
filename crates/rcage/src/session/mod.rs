//! Execution sessions
//!
//! An [`ExecutionSession`] owns one long-lived interpreter process and runs
//! one snippet at a time in it. Variables defined by earlier snippets stay
//! visible to later ones.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

pub use crate::session::wrap::{CompletionMarker, wrap_code};

use crate::config::InterpreterConfig;
use crate::session::process::InterpreterProcess;
use crate::types::{ExecutionResult, SessionState, SessionStats};

mod process;
mod wrap;

/// Interval between readiness checks while starting
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors that occur while starting or using a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not started")]
    NotStarted,

    #[error("session already started")]
    AlreadyStarted,

    #[error("session is busy")]
    Busy,

    #[error("execution timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("session terminated")]
    Terminated,

    #[error("interpreter process exited")]
    ProcessExited,

    #[error("failed to spawn interpreter: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("interpreter did not become ready in time")]
    StartTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
    process: Option<Arc<InterpreterProcess>>,
    /// Exit token of the most recent process, kept after termination
    exited: Option<CancellationToken>,
}

/// A session bound to one interpreter process
#[derive(Debug)]
pub struct ExecutionSession {
    id: String,
    interpreter: InterpreterConfig,
    default_timeout: Duration,
    created: Instant,
    last_used: Mutex<Instant>,
    busy: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

impl ExecutionSession {
    /// Create an unstarted session
    pub fn new(
        id: impl Into<String>,
        interpreter: InterpreterConfig,
        default_timeout: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            interpreter,
            default_timeout,
            created: now,
            last_used: Mutex::new(now),
            busy: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Unstarted,
                process: None,
                exited: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spawn the interpreter and wait until it is ready
    #[instrument(skip(self), fields(session = %self.id))]
    pub async fn start(&self) -> Result<(), SessionError> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != SessionState::Unstarted {
                return Err(SessionError::AlreadyStarted);
            }
            lifecycle.state = SessionState::Starting;
        }

        let process = match InterpreterProcess::spawn(&self.interpreter) {
            Ok(process) => Arc::new(process),
            Err(e) => {
                self.lifecycle().state = SessionState::Terminated;
                return Err(e);
            }
        };

        let deadline = Instant::now() + self.interpreter.start_timeout();
        while process.pid().is_none() || !process.is_running() {
            if process.has_exited() {
                self.lifecycle().state = SessionState::Terminated;
                return Err(SessionError::ProcessExited);
            }
            if Instant::now() >= deadline {
                process.terminate();
                self.lifecycle().state = SessionState::Terminated;
                return Err(SessionError::StartTimeout);
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        let mut lifecycle = self.lifecycle();
        if lifecycle.state != SessionState::Starting {
            // terminated while starting
            process.terminate();
            return Err(SessionError::Terminated);
        }
        lifecycle.state = SessionState::Ready;
        lifecycle.exited = Some(process.exited());
        lifecycle.process = Some(process);
        drop(lifecycle);

        self.touch();
        info!(session = %self.id, "session started");
        Ok(())
    }

    /// Run `code` and return its output.
    ///
    /// Uses the session's default timeout when `timeout` is `None`. A
    /// timeout leaves the process running and its late output is skipped by
    /// the next call, unless the code could not be fully sent, in which
    /// case the process is stopped.
    #[instrument(skip(self, code), fields(session = %self.id, len = code.len()))]
    pub async fn execute(
        &self,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, SessionError> {
        let process = self.live_process().ok_or(SessionError::NotStarted)?;
        let _guard = BusyGuard::acquire(self)?;
        self.touch();

        let timeout = timeout.unwrap_or(self.default_timeout);
        let marker = CompletionMarker::new();
        let wrapped = wrap_code(code, &marker);

        let result = process.round_trip(&wrapped, &marker, timeout).await;
        match &result {
            Ok(result) => debug!(elapsed = ?result.elapsed, "execution complete"),
            Err(e) => debug!(%e, "execution failed"),
        }
        result
    }

    /// Stop the interpreter. Pending executions return
    /// [`SessionError::Terminated`]. Idempotent.
    pub fn terminate(&self) {
        let mut lifecycle = self.lifecycle();
        let was = lifecycle.state;
        lifecycle.state = SessionState::Terminated;
        if let Some(process) = lifecycle.process.take() {
            process.terminate();
            debug!(session = %self.id, ?was, "session terminated");
        }
    }

    /// Wait up to `grace` for the interpreter to exit.
    ///
    /// Returns true if it exited or was never started.
    pub async fn wait_exited(&self, grace: Duration) -> bool {
        let exited = self.lifecycle().exited.clone();
        match exited {
            Some(token) => tokio::time::timeout(grace, token.cancelled())
                .await
                .is_ok(),
            None => true,
        }
    }

    /// Check if the session has a live interpreter
    pub fn is_alive(&self) -> bool {
        self.live_process().is_some()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Current state. A session whose process died on its own reports
    /// [`SessionState::Terminated`].
    pub fn state(&self) -> SessionState {
        let lifecycle = self.lifecycle();
        match lifecycle.state {
            SessionState::Ready | SessionState::Executing
                if !lifecycle.process.as_ref().is_some_and(|p| p.is_running()) =>
            {
                SessionState::Terminated
            }
            state => state,
        }
    }

    pub fn stats(&self) -> SessionStats {
        let now = Instant::now();
        SessionStats {
            id: self.id.clone(),
            state: self.state(),
            busy: self.is_busy(),
            alive: self.is_alive(),
            age_secs: now.saturating_duration_since(self.created).as_secs(),
            idle_secs: now.saturating_duration_since(self.last_used()).as_secs(),
        }
    }

    /// Refresh the last-used instant
    pub(crate) fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn live_process(&self) -> Option<Arc<InterpreterProcess>> {
        self.lifecycle()
            .process
            .as_ref()
            .filter(|process| process.is_running())
            .cloned()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ExecutionSession {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(process) = lifecycle.process.take() {
            process.terminate();
        }
    }
}

/// Holds the busy flag for the duration of one execution
struct BusyGuard<'a> {
    session: &'a ExecutionSession,
}

impl<'a> BusyGuard<'a> {
    fn acquire(session: &'a ExecutionSession) -> Result<Self, SessionError> {
        session
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SessionError::Busy)?;

        let mut lifecycle = session.lifecycle();
        if lifecycle.state == SessionState::Ready {
            lifecycle.state = SessionState::Executing;
        }
        Ok(Self { session })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut lifecycle = self.session.lifecycle();
        if lifecycle.state == SessionState::Executing {
            lifecycle.state = SessionState::Ready;
        }
        drop(lifecycle);
        self.session.busy.store(false, Ordering::Release);
    }
}
