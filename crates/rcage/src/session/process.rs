//! Interpreter subprocess handling
//!
//! Spawns the interpreter with piped stdio. Reader tasks forward stdout and
//! stderr into one channel and a monitor task owns the child, so the
//! session never blocks on the process itself.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::InterpreterConfig;
use crate::session::SessionError;
use crate::session::wrap::{CompletionMarker, find_marker};
use crate::types::ExecutionResult;

/// Time between SIGTERM and a hard kill
const KILL_GRACE: Duration = Duration::from_secs(2);

const READ_BUFFER_SIZE: usize = 4096;
const CHANNEL_CAPACITY: usize = 64;

/// A piece of interpreter output
#[derive(Debug)]
pub(crate) enum StreamChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Output channel plus the markers of calls that timed out before their
/// output was read
#[derive(Debug)]
struct OutputState {
    rx: mpsc::Receiver<StreamChunk>,
    abandoned: VecDeque<CompletionMarker>,
}

/// A running interpreter
#[derive(Debug)]
pub(crate) struct InterpreterProcess {
    pid: Option<u32>,
    stdin: Mutex<ChildStdin>,
    output: Mutex<OutputState>,
    /// Cancelled by the monitor once the child has exited
    exited: CancellationToken,
    /// Cancelled to request termination
    kill: CancellationToken,
}

impl InterpreterProcess {
    /// Spawn the interpreter and its supervision tasks
    #[instrument(skip(config), fields(path = %config.path))]
    pub fn spawn(config: &InterpreterConfig) -> Result<Self, SessionError> {
        let mut child = Command::new(&config.path)
            .args(&config.args)
            .envs(config.process_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SessionError::SpawnFailed)?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::Io(std::io::Error::other("stdin not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Io(std::io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SessionError::Io(std::io::Error::other("stderr not captured")))?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(forward(stdout, tx.clone(), StreamChunk::Stdout));
        tokio::spawn(forward(stderr, tx, StreamChunk::Stderr));

        let exited = CancellationToken::new();
        let kill = CancellationToken::new();
        tokio::spawn(monitor(child, pid, exited.clone(), kill.clone()));

        debug!(?pid, "interpreter spawned");

        Ok(Self {
            pid,
            stdin: Mutex::new(stdin),
            output: Mutex::new(OutputState {
                rx,
                abandoned: VecDeque::new(),
            }),
            exited,
            kill,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Check if the process has neither exited nor been asked to stop
    pub fn is_running(&self) -> bool {
        !self.exited.is_cancelled() && !self.kill.is_cancelled()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Token cancelled once the process has exited
    pub fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    /// Ask the monitor to stop the process. Idempotent.
    pub fn terminate(&self) {
        self.kill.cancel();
    }

    /// Send `input` and collect output until `marker` shows up on stdout.
    ///
    /// `timeout` bounds the whole call, delivering `input` included. When
    /// it expires after delivery the process keeps running and the marker
    /// is remembered, so the abandoned output is skipped by the next call.
    /// When it expires mid-delivery stdin may hold a truncated program and
    /// the process is terminated.
    pub async fn round_trip(
        &self,
        input: &str,
        marker: &CompletionMarker,
        timeout: Duration,
    ) -> Result<ExecutionResult, SessionError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let delivered = AtomicBool::new(false);

        let mut output = self.output.lock().await;

        let result = tokio::select! {
            biased;

            _ = self.kill.cancelled() => Err(SessionError::Terminated),

            _ = tokio::time::sleep_until(deadline) => Err(SessionError::Timeout(timeout)),

            result = self.exchange(&mut output, input, marker, &delivered, started) => result,
        };

        if matches!(result, Err(SessionError::Timeout(_))) {
            if delivered.load(Ordering::Acquire) {
                output.abandoned.push_back(marker.clone());
                debug!(abandoned = output.abandoned.len(), "call abandoned, output will be skipped");
            } else {
                warn!(pid = ?self.pid, "timed out while sending code, stopping interpreter");
                self.terminate();
            }
        }
        result
    }

    async fn exchange(
        &self,
        output: &mut OutputState,
        input: &str,
        marker: &CompletionMarker,
        delivered: &AtomicBool,
        started: Instant,
    ) -> Result<ExecutionResult, SessionError> {
        self.write(input.as_bytes()).await?;
        delivered.store(true, Ordering::Release);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut scanned = 0;

        loop {
            match output.rx.recv().await {
                Some(StreamChunk::Stdout(bytes)) => {
                    stdout.extend_from_slice(&bytes);

                    // output of abandoned calls ends at their markers
                    while let Some(stale) = output.abandoned.front() {
                        let Some(pos) = find_marker(&stdout, stale.as_bytes(), scanned) else {
                            break;
                        };
                        stdout.drain(..pos + stale.as_bytes().len());
                        stderr.clear();
                        scanned = 0;
                        output.abandoned.pop_front();
                    }

                    if output.abandoned.is_empty()
                        && let Some(pos) = find_marker(&stdout, marker.as_bytes(), scanned)
                    {
                        stdout.truncate(pos);
                        return Ok(ExecutionResult {
                            success: true,
                            output: String::from_utf8_lossy(&stdout).trim().to_owned(),
                            stderr: String::from_utf8_lossy(&stderr).trim().to_owned(),
                            elapsed: started.elapsed(),
                        });
                    }
                    scanned = stdout.len();
                }
                Some(StreamChunk::Stderr(bytes)) => stderr.extend_from_slice(&bytes),
                None => return Err(SessionError::ProcessExited),
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut stdin = self.stdin.lock().await;
        let result = async {
            stdin.write_all(data).await?;
            stdin.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                debug!(len = data.len(), "wrote to stdin");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                Err(SessionError::ProcessExited)
            }
            Err(e) => Err(SessionError::Io(e)),
        }
    }
}

/// Forward a pipe into the output channel until EOF
async fn forward<R>(mut pipe: R, tx: mpsc::Sender<StreamChunk>, wrap: fn(Vec<u8>) -> StreamChunk)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(?e, "interpreter pipe read error");
                break;
            }
        }
    }
}

/// Own the child until it exits, stopping it when asked
async fn monitor(
    mut child: Child,
    pid: Option<u32>,
    exited: CancellationToken,
    kill: CancellationToken,
) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => debug!(?pid, %status, "interpreter exited"),
            Err(e) => warn!(?pid, ?e, "failed to wait for interpreter"),
        },
        _ = kill.cancelled() => {
            if let Some(pid) = pid {
                send_sigterm(pid);
            }
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(_) => debug!(?pid, "interpreter stopped"),
                Err(_) => {
                    warn!(?pid, "interpreter ignored SIGTERM, killing");
                    if let Err(e) = child.start_kill() {
                        warn!(?pid, ?e, "failed to kill interpreter");
                    }
                    let _ = child.wait().await;
                }
            }
        }
    }
    exited.cancel();
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid, %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}
