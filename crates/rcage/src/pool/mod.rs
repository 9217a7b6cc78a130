//! Session pool
//!
//! Maps client session ids to [`ExecutionSession`]s, bounded by a maximum
//! size. New sessions evict the least recently used idle one when the pool
//! is full; when every session is busy the request is refused instead. A
//! background reaper removes sessions idle past the configured timeout.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, InterpreterConfig, PoolConfig, SessionConfig};
use crate::dataset::{DEFAULT_DATA_VARIABLE, generate_data_load};
use crate::pool::reaper::Reaper;
use crate::prompt::{CodeGenerator, TemplateGenerator};
use crate::session::{ExecutionSession, SessionError};
use crate::types::{ExecuteOptions, ExecutionResult, PromptOutcome, SessionStats};
use crate::validator::{CodeValidator, Verdict};

mod reaper;

/// Errors returned by pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("unsafe R code: {0}")]
    UnsafeCode(String),

    #[error("R runtime is not available")]
    Unavailable,

    #[error("all {max} sessions are busy")]
    Saturated { max: usize },

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl PoolError {
    /// Whether the same request may succeed later without changes.
    ///
    /// Rejected code, a missing runtime and interpreter start failures are
    /// fatal; contention and per-call failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::UnsafeCode(_) | PoolError::Unavailable => false,
            PoolError::Saturated { .. } => true,
            PoolError::Session(e) => matches!(
                e,
                SessionError::Busy
                    | SessionError::Timeout(_)
                    | SessionError::Terminated
                    | SessionError::ProcessExited
            ),
        }
    }
}

/// Owner of all live sessions
pub struct SessionPool {
    interpreter: InterpreterConfig,
    settings: PoolConfig,
    session: SessionConfig,
    sessions: Mutex<HashMap<String, Arc<ExecutionSession>>>,
    available: AtomicBool,
    validator: CodeValidator,
    generator: Arc<dyn CodeGenerator>,
    reaper: StdMutex<Option<Reaper>>,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("interpreter", &self.interpreter.path)
            .field("max_sessions", &self.settings.max_sessions)
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

impl SessionPool {
    /// Create a pool with the template prompt generator
    pub fn new(config: &Config) -> Self {
        Self::with_generator(config, Arc::new(TemplateGenerator))
    }

    /// Create a pool with a custom prompt generator
    pub fn with_generator(config: &Config, generator: Arc<dyn CodeGenerator>) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            settings: config.pool.clone(),
            session: config.session.clone(),
            sessions: Mutex::new(HashMap::new()),
            available: AtomicBool::new(false),
            validator: CodeValidator::new(&config.validator),
            generator,
            reaper: StdMutex::new(None),
        }
    }

    /// Probe the interpreter and, if it runs, start the reaper.
    ///
    /// A missing interpreter leaves the pool unavailable rather than
    /// failing; every execution then reports [`PoolError::Unavailable`].
    #[instrument(skip(self), fields(interpreter = %self.interpreter.path))]
    pub async fn initialize(self: &Arc<Self>) -> bool {
        match probe_interpreter(&self.interpreter).await {
            Ok(()) => {
                self.available.store(true, Ordering::Release);
                let reaper = Reaper::spawn(Arc::downgrade(self), self.settings.reap_interval());
                // replacing a previous reaper stops it
                *self.reaper.lock().unwrap_or_else(PoisonError::into_inner) = Some(reaper);
                info!("session pool initialized");
                true
            }
            Err(reason) => {
                self.available.store(false, Ordering::Release);
                warn!(%reason, "interpreter unavailable, executions will be refused");
                false
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn validator(&self) -> &CodeValidator {
        &self.validator
    }

    /// Return the live session for `id`, creating and starting one if needed
    #[instrument(skip(self))]
    pub async fn get_or_create_session(
        &self,
        id: &str,
    ) -> Result<Arc<ExecutionSession>, PoolError> {
        if !self.is_available() {
            return Err(PoolError::Unavailable);
        }

        let max = self.settings.max_sessions;
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get(id) {
                if session.is_alive() {
                    session.touch();
                    return Ok(session.clone());
                }
                if let Some(dead) = sessions.remove(id) {
                    debug!(session = %id, "replacing dead session");
                    dead.terminate();
                }
            }
            prune_dead(&mut sessions);
            if sessions.len() >= max && eviction_candidate(&sessions).is_none() {
                return Err(PoolError::Saturated { max });
            }
        }

        let session = Arc::new(ExecutionSession::new(
            id,
            self.interpreter.clone(),
            self.session.default_timeout(),
        ));
        session.start().await?;

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(id)
            && existing.is_alive()
        {
            // lost a creation race for the same id
            session.terminate();
            existing.touch();
            return Ok(existing.clone());
        }
        if let Some(dead) = sessions.remove(id) {
            dead.terminate();
        }

        prune_dead(&mut sessions);
        while sessions.len() >= max {
            let Some(victim) = eviction_candidate(&sessions) else {
                session.terminate();
                return Err(PoolError::Saturated { max });
            };
            if let Some(evicted) = sessions.remove(&victim) {
                evicted.terminate();
                info!(session = %victim, "evicted least recently used session");
            }
        }

        sessions.insert(id.to_owned(), session.clone());
        debug!(session = %id, count = sessions.len(), "session registered");
        Ok(session)
    }

    /// Validate and run code in the session for `id`
    #[instrument(skip(self, code, options), fields(len = code.len()))]
    pub async fn execute_code(
        &self,
        id: &str,
        code: &str,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult, PoolError> {
        if let Verdict::Unsafe(violation) = self.validator.validate(code) {
            warn!(session = %id, category = ?violation.category, reason = %violation.reason, "rejected unsafe code");
            return Err(PoolError::UnsafeCode(violation.reason));
        }
        if !self.is_available() {
            return Err(PoolError::Unavailable);
        }

        let session = self.get_or_create_session(id).await?;

        let program = match options.data.as_deref() {
            Some(rows) => format!("{}{code}", generate_data_load(rows, DEFAULT_DATA_VARIABLE)),
            None => code.to_owned(),
        };

        Ok(session.execute(&program, options.timeout).await?)
    }

    /// Expand a prompt into code and run it
    #[instrument(skip(self, prompt, options))]
    pub async fn execute_prompt(
        &self,
        id: &str,
        prompt: &str,
        options: ExecuteOptions,
    ) -> Result<PromptOutcome, PoolError> {
        let rows = options.data.as_deref().unwrap_or_default();
        let code = self.generator.generate(prompt, rows);
        debug!(session = %id, len = code.len(), "generated code from prompt");

        let result = self.execute_code(id, &code, options).await?;
        Ok(PromptOutcome { code, result })
    }

    /// Terminate and forget the session for `id`.
    ///
    /// Returns whether a session existed. A pending execution in it returns
    /// [`SessionError::Terminated`].
    #[instrument(skip(self))]
    pub async fn cancel_session(&self, id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(id);
        match removed {
            Some(session) => {
                session.terminate();
                info!(session = %id, "session cancelled");
                true
            }
            None => false,
        }
    }

    /// Remove dead sessions and idle sessions past the idle timeout.
    ///
    /// Busy sessions are never reaped. Returns how many were removed.
    pub async fn reap(&self) -> usize {
        let idle_timeout = self.settings.idle_timeout();
        let now = Instant::now();

        let mut sessions = self.sessions.lock().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| {
                !s.is_alive()
                    || (!s.is_busy() && now.saturating_duration_since(s.last_used()) > idle_timeout)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                session.terminate();
                debug!(session = %id, "reaped session");
            }
        }
        expired.len()
    }

    /// Shut the pool down: stop the reaper, terminate every session (busy or
    /// not) and wait a bounded grace period for the processes to exit.
    #[instrument(skip(self))]
    pub async fn cleanup(&self) {
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reaper) = reaper {
            reaper.stop().await;
        }
        self.available.store(false, Ordering::Release);

        let drained: Vec<Arc<ExecutionSession>> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.terminate();
        }

        let deadline = Instant::now() + self.settings.shutdown_grace();
        for session in &drained {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !session.wait_exited(remaining).await {
                warn!(session = %session.id(), "interpreter still running after shutdown grace");
            }
        }
        info!(count = drained.len(), "session pool shut down");
    }

    /// Number of registered sessions
    pub async fn active_session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Stats for every registered session, ordered by id
    pub async fn session_stats(&self) -> Vec<SessionStats> {
        let mut stats: Vec<SessionStats> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|s| s.stats())
            .collect();
        stats.sort_by(|a, b| a.id.cmp(&b.id));
        stats
    }

    /// Stats for one session
    pub async fn session(&self, id: &str) -> Option<SessionStats> {
        self.sessions.lock().await.get(id).map(|s| s.stats())
    }
}

/// Pick the least recently used non-busy entry. Ties go to the earliest in
/// iteration order.
pub(crate) fn select_eviction_candidate<'a, I>(candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, Instant, bool)>,
{
    let mut best: Option<(&'a str, Instant)> = None;
    for (id, last_used, busy) in candidates {
        if busy {
            continue;
        }
        if best.is_none_or(|(_, oldest)| last_used < oldest) {
            best = Some((id, last_used));
        }
    }
    best.map(|(id, _)| id)
}

fn eviction_candidate(sessions: &HashMap<String, Arc<ExecutionSession>>) -> Option<String> {
    select_eviction_candidate(
        sessions
            .iter()
            .map(|(id, s)| (id.as_str(), s.last_used(), s.is_busy())),
    )
    .map(str::to_owned)
}

fn prune_dead(sessions: &mut HashMap<String, Arc<ExecutionSession>>) {
    sessions.retain(|id, session| {
        let alive = session.is_alive() || session.is_busy();
        if !alive {
            debug!(session = %id, "dropping dead session");
            session.terminate();
        }
        alive
    });
}

/// Check that the interpreter resolves on PATH and answers its version probe
async fn probe_interpreter(config: &InterpreterConfig) -> Result<(), String> {
    let binary = config.resolve_binary().map_err(|e| e.to_string())?;

    let status = Command::new(&binary)
        .args(&config.version_args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();

    match tokio::time::timeout(config.start_timeout(), status).await {
        Ok(Ok(status)) if status.success() => {
            debug!(binary = %binary.display(), "interpreter probe succeeded");
            Ok(())
        }
        Ok(Ok(status)) => Err(format!("version check exited with {status}")),
        Ok(Err(e)) => Err(format!("failed to run version check: {e}")),
        Err(_) => Err("version check timed out".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_eviction_picks_least_recently_used() {
        let now = Instant::now();
        let old = now - Duration::from_secs(30);
        let older = now - Duration::from_secs(60);
        let candidates = vec![("a", old, false), ("b", older, false), ("c", now, false)];
        assert_eq!(select_eviction_candidate(candidates), Some("b"));
    }

    #[test]
    fn test_eviction_skips_busy() {
        let now = Instant::now();
        let older = now - Duration::from_secs(60);
        let candidates = vec![("a", older, true), ("b", now, false)];
        assert_eq!(select_eviction_candidate(candidates), Some("b"));
    }

    #[test]
    fn test_eviction_none_when_all_busy() {
        let now = Instant::now();
        let candidates = vec![("a", now, true), ("b", now, true)];
        assert_eq!(select_eviction_candidate(candidates), None);
        assert_eq!(select_eviction_candidate(Vec::new()), None);
    }

    #[test]
    fn test_eviction_ties_go_to_first() {
        let now = Instant::now();
        let candidates = vec![("a", now, false), ("b", now, false)];
        assert_eq!(select_eviction_candidate(candidates), Some("a"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!PoolError::UnsafeCode("x".to_owned()).is_retryable());
        assert!(!PoolError::Unavailable.is_retryable());
        assert!(PoolError::Saturated { max: 1 }.is_retryable());
        assert!(PoolError::from(SessionError::Busy).is_retryable());
        assert!(PoolError::from(SessionError::Timeout(Duration::from_secs(1))).is_retryable());
        assert!(!PoolError::from(SessionError::StartTimeout).is_retryable());
        assert!(
            !PoolError::from(SessionError::SpawnFailed(std::io::Error::other("x")))
                .is_retryable()
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            PoolError::UnsafeCode("Dangerous function detected: system".to_owned()).to_string(),
            "unsafe R code: Dangerous function detected: system"
        );
        assert_eq!(
            PoolError::Saturated { max: 5 }.to_string(),
            "all 5 sessions are busy"
        );
    }

    #[tokio::test]
    async fn test_unavailable_pool_refuses_work() {
        let mut config = Config::default();
        config.interpreter = InterpreterConfig::command("definitely-not-an-interpreter-xyz", ["x"]);
        let pool = Arc::new(SessionPool::new(&config));

        assert!(!pool.initialize().await);
        assert!(!pool.is_available());

        let result = pool
            .execute_code("s1", "print(1)", ExecuteOptions::new())
            .await;
        assert!(matches!(result, Err(PoolError::Unavailable)));

        // validation runs first
        let result = pool
            .execute_code("s1", "system('ls')", ExecuteOptions::new())
            .await;
        assert!(matches!(result, Err(PoolError::UnsafeCode(_))));

        assert_eq!(pool.active_session_count().await, 0);
    }
}
