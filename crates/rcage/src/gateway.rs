//! Transport-agnostic request handling
//!
//! Turns typed client messages into pool calls and emits typed replies on a
//! channel. Transports (the CLI's JSON-lines loop, a WebSocket server) only
//! move [`ClientMessage`] and [`ServerMessage`] values.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::pool::{PoolError, SessionPool};
use crate::types::{ExecuteOptions, ExecutionResult, Row, SessionStats};

/// Longest accepted code submission, in characters
pub const MAX_CODE_LENGTH: usize = 10_000;

/// Longest accepted prompt, in characters
pub const MAX_PROMPT_LENGTH: usize = 500;

/// Accepted range for client-supplied timeouts, in milliseconds
pub const TIMEOUT_RANGE_MS: std::ops::RangeInclusive<u64> = 1_000..=300_000;

/// Timeout applied when a request names none
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Inbound message
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ExecuteCode {
        #[serde(default)]
        request_id: Option<String>,
        code: String,
        #[serde(default)]
        data: Option<Vec<Row>>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    ExecutePrompt {
        #[serde(default)]
        request_id: Option<String>,
        prompt: String,
        #[serde(default)]
        data: Option<Vec<Row>>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    CancelExecution,
    GetSessionStats,
    Ping,
}

/// Outbound message
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        session_id: String,
    },
    ExecutionStarted {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    ExecutionComplete {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        result: ExecutionResult,
    },
    ExecutionError {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
        retryable: bool,
    },
    PromptStarted {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    PromptComplete {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        result: ExecutionResult,
        generated_code: String,
    },
    PromptError {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
        retryable: bool,
    },
    ExecutionCancelled {
        cancelled: bool,
    },
    SessionStats {
        active_sessions: usize,
        sessions: Vec<SessionStats>,
        available: bool,
    },
    Pong,
    Error {
        error: String,
    },
}

/// A request rejected before it reaches the pool
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("code must not be empty")]
    EmptyCode,

    #[error("code exceeds {max} characters")]
    CodeTooLong { max: usize },

    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("prompt exceeds {max} characters")]
    PromptTooLong { max: usize },

    #[error("timeout must be between {min} and {max} ms, got {got}")]
    TimeoutOutOfRange { min: u64, max: u64, got: u64 },
}

/// Check a code submission and resolve its timeout
pub fn validate_code_request(
    code: &str,
    timeout_ms: Option<u64>,
) -> Result<Duration, RequestError> {
    if code.trim().is_empty() {
        return Err(RequestError::EmptyCode);
    }
    if code.chars().count() > MAX_CODE_LENGTH {
        return Err(RequestError::CodeTooLong {
            max: MAX_CODE_LENGTH,
        });
    }
    resolve_timeout(timeout_ms)
}

/// Check a prompt submission and resolve its timeout
pub fn validate_prompt_request(
    prompt: &str,
    timeout_ms: Option<u64>,
) -> Result<Duration, RequestError> {
    if prompt.trim().is_empty() {
        return Err(RequestError::EmptyPrompt);
    }
    if prompt.chars().count() > MAX_PROMPT_LENGTH {
        return Err(RequestError::PromptTooLong {
            max: MAX_PROMPT_LENGTH,
        });
    }
    resolve_timeout(timeout_ms)
}

fn resolve_timeout(timeout_ms: Option<u64>) -> Result<Duration, RequestError> {
    match timeout_ms {
        None => Ok(DEFAULT_REQUEST_TIMEOUT),
        Some(ms) if TIMEOUT_RANGE_MS.contains(&ms) => Ok(Duration::from_millis(ms)),
        Some(got) => Err(RequestError::TimeoutOutOfRange {
            min: *TIMEOUT_RANGE_MS.start(),
            max: *TIMEOUT_RANGE_MS.end(),
            got,
        }),
    }
}

/// Dispatches client messages for one or more connections
#[derive(Debug, Clone)]
pub struct Gateway {
    pool: Arc<SessionPool>,
}

impl Gateway {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    /// Parse one raw JSON message and handle it. Malformed input gets an
    /// `error` reply.
    pub async fn handle_raw(&self, session_id: &str, raw: &str, tx: &mpsc::Sender<ServerMessage>) {
        match serde_json::from_str::<ClientMessage>(raw) {
            Ok(message) => self.handle(session_id, message, tx).await,
            Err(e) => {
                debug!(%e, "malformed client message");
                send(
                    tx,
                    ServerMessage::Error {
                        error: format!("invalid message: {e}"),
                    },
                )
                .await;
            }
        }
    }

    /// Handle one message for `session_id`, sending every reply on `tx`
    #[instrument(skip(self, message, tx))]
    pub async fn handle(
        &self,
        session_id: &str,
        message: ClientMessage,
        tx: &mpsc::Sender<ServerMessage>,
    ) {
        match message {
            ClientMessage::ExecuteCode {
                request_id,
                code,
                data,
                timeout_ms,
            } => {
                let timeout = match validate_code_request(&code, timeout_ms) {
                    Ok(timeout) => timeout,
                    Err(e) => {
                        send(
                            tx,
                            ServerMessage::ExecutionError {
                                request_id,
                                error: e.to_string(),
                                retryable: false,
                            },
                        )
                        .await;
                        return;
                    }
                };

                send(
                    tx,
                    ServerMessage::ExecutionStarted {
                        request_id: request_id.clone(),
                    },
                )
                .await;

                let options = options(timeout, data);
                let reply = match self.pool.execute_code(session_id, &code, options).await {
                    Ok(result) => ServerMessage::ExecutionComplete { request_id, result },
                    Err(e) => ServerMessage::ExecutionError {
                        request_id,
                        retryable: e.is_retryable(),
                        error: describe(&e),
                    },
                };
                send(tx, reply).await;
            }
            ClientMessage::ExecutePrompt {
                request_id,
                prompt,
                data,
                timeout_ms,
            } => {
                let timeout = match validate_prompt_request(&prompt, timeout_ms) {
                    Ok(timeout) => timeout,
                    Err(e) => {
                        send(
                            tx,
                            ServerMessage::PromptError {
                                request_id,
                                error: e.to_string(),
                                retryable: false,
                            },
                        )
                        .await;
                        return;
                    }
                };

                send(
                    tx,
                    ServerMessage::PromptStarted {
                        request_id: request_id.clone(),
                    },
                )
                .await;

                let options = options(timeout, data);
                let reply = match self.pool.execute_prompt(session_id, &prompt, options).await {
                    Ok(outcome) => ServerMessage::PromptComplete {
                        request_id,
                        result: outcome.result,
                        generated_code: outcome.code,
                    },
                    Err(e) => ServerMessage::PromptError {
                        request_id,
                        retryable: e.is_retryable(),
                        error: describe(&e),
                    },
                };
                send(tx, reply).await;
            }
            ClientMessage::CancelExecution => {
                let cancelled = self.pool.cancel_session(session_id).await;
                send(tx, ServerMessage::ExecutionCancelled { cancelled }).await;
            }
            ClientMessage::GetSessionStats => {
                let sessions = self.pool.session_stats().await;
                send(
                    tx,
                    ServerMessage::SessionStats {
                        active_sessions: sessions.len(),
                        sessions,
                        available: self.pool.is_available(),
                    },
                )
                .await;
            }
            ClientMessage::Ping => send(tx, ServerMessage::Pong).await,
        }
    }
}

fn options(timeout: Duration, data: Option<Vec<Row>>) -> ExecuteOptions {
    let options = ExecuteOptions::new().with_timeout(timeout);
    match data {
        Some(rows) => options.with_data(rows),
        None => options,
    }
}

fn describe(error: &PoolError) -> String {
    match error {
        PoolError::UnsafeCode(_) | PoolError::Unavailable | PoolError::Saturated { .. } => {
            error.to_string()
        }
        PoolError::Session(e) => {
            warn!(%e, "execution failed");
            e.to_string()
        }
    }
}

async fn send(tx: &mpsc::Sender<ServerMessage>, message: ServerMessage) {
    if tx.send(message).await.is_err() {
        debug!("client gone, dropping reply");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::{Config, InterpreterConfig};

    async fn unavailable_gateway() -> Gateway {
        let mut config = Config::default();
        config.interpreter = InterpreterConfig::command("definitely-not-an-interpreter-xyz", ["x"]);
        let pool = Arc::new(SessionPool::new(&config));
        pool.initialize().await;
        Gateway::new(pool)
    }

    async fn replies(gateway: &Gateway, raw: &str) -> Vec<serde_json::Value> {
        let (tx, mut rx) = mpsc::channel(16);
        gateway.handle_raw("s1", raw, &tx).await;
        drop(tx);
        let mut out = Vec::new();
        while let Some(message) = rx.recv().await {
            out.push(serde_json::to_value(message).unwrap());
        }
        out
    }

    #[test]
    fn test_parse_client_messages() {
        let message: ClientMessage = serde_json::from_value(json!({
            "type": "execute_code",
            "request_id": "r1",
            "code": "1 + 1",
            "data": [{"x": 1}],
            "timeout_ms": 5000
        }))
        .unwrap();
        match message {
            ClientMessage::ExecuteCode {
                request_id,
                code,
                data,
                timeout_ms,
            } => {
                assert_eq!(request_id.as_deref(), Some("r1"));
                assert_eq!(code, "1 + 1");
                assert_eq!(data.map(|d| d.len()), Some(1));
                assert_eq!(timeout_ms, Some(5000));
            }
            other => panic!("unexpected {other:?}"),
        }

        let message: ClientMessage = serde_json::from_value(json!({"type": "ping"})).unwrap();
        assert!(matches!(message, ClientMessage::Ping));
        let message: ClientMessage =
            serde_json::from_value(json!({"type": "cancel_execution"})).unwrap();
        assert!(matches!(message, ClientMessage::CancelExecution));
    }

    #[test]
    fn test_request_validation() {
        assert_eq!(
            validate_code_request("1", None),
            Ok(DEFAULT_REQUEST_TIMEOUT)
        );
        assert_eq!(
            validate_code_request("1", Some(1000)),
            Ok(Duration::from_secs(1))
        );
        assert_eq!(
            validate_code_request("  ", None),
            Err(RequestError::EmptyCode)
        );
        assert_eq!(
            validate_code_request(&"x".repeat(10_001), None),
            Err(RequestError::CodeTooLong { max: 10_000 })
        );
        assert!(matches!(
            validate_code_request("1", Some(999)),
            Err(RequestError::TimeoutOutOfRange { got: 999, .. })
        ));
        assert!(matches!(
            validate_code_request("1", Some(300_001)),
            Err(RequestError::TimeoutOutOfRange { .. })
        ));
        assert_eq!(
            validate_prompt_request(&"p".repeat(501), None),
            Err(RequestError::PromptTooLong { max: 500 })
        );
        assert!(validate_prompt_request("histogram", Some(300_000)).is_ok());
    }

    #[test]
    fn test_server_message_shape() {
        let value = serde_json::to_value(ServerMessage::ExecutionStarted {
            request_id: None,
        })
        .unwrap();
        assert_eq!(value, json!({"type": "execution_started"}));

        let value = serde_json::to_value(ServerMessage::Pong).unwrap();
        assert_eq!(value, json!({"type": "pong"}));
    }

    #[tokio::test]
    async fn test_ping() {
        let gateway = unavailable_gateway().await;
        assert_eq!(replies(&gateway, r#"{"type":"ping"}"#).await, vec![json!({"type": "pong"})]);
    }

    #[tokio::test]
    async fn test_malformed_message() {
        let gateway = unavailable_gateway().await;
        let out = replies(&gateway, r#"{"type":"launch_missiles"}"#).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["type"], "error");
    }

    #[tokio::test]
    async fn test_invalid_request_skips_started() {
        let gateway = unavailable_gateway().await;
        let out = replies(
            &gateway,
            r#"{"type":"execute_code","request_id":"r1","code":"1","timeout_ms":5}"#,
        )
        .await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["type"], "execution_error");
        assert_eq!(out[0]["request_id"], "r1");
        assert_eq!(out[0]["retryable"], false);
    }

    #[tokio::test]
    async fn test_execute_unsafe_code() {
        let gateway = unavailable_gateway().await;
        let out = replies(
            &gateway,
            r#"{"type":"execute_code","request_id":"r2","code":"system('rm -rf /')"}"#,
        )
        .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["type"], "execution_started");
        assert_eq!(out[1]["type"], "execution_error");
        assert_eq!(
            out[1]["error"],
            "unsafe R code: Dangerous function detected: system"
        );
    }

    #[tokio::test]
    async fn test_execute_when_unavailable() {
        let gateway = unavailable_gateway().await;
        let out = replies(&gateway, r#"{"type":"execute_prompt","prompt":"summary"}"#).await;
        assert_eq!(out[0]["type"], "prompt_started");
        assert_eq!(out[1]["type"], "prompt_error");
        assert_eq!(out[1]["error"], "R runtime is not available");
    }

    #[tokio::test]
    async fn test_stats_and_cancel() {
        let gateway = unavailable_gateway().await;
        let out = replies(&gateway, r#"{"type":"get_session_stats"}"#).await;
        assert_eq!(
            out,
            vec![json!({
                "type": "session_stats",
                "active_sessions": 0,
                "sessions": [],
                "available": false
            })]
        );

        let out = replies(&gateway, r#"{"type":"cancel_execution"}"#).await;
        assert_eq!(out, vec![json!({"type": "execution_cancelled", "cancelled": false})]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_round_trip() {
        let mut config = Config::default();
        config.interpreter = InterpreterConfig::command("sh", ["-c", "exec cat"]);
        config.interpreter.version_args = vec!["-c".to_owned(), "true".to_owned()];
        let pool = Arc::new(SessionPool::new(&config));
        assert!(pool.initialize().await);
        let gateway = Gateway::new(pool.clone());

        let out = replies(
            &gateway,
            r#"{"type":"execute_code","request_id":"r3","code":"x <- 41 + 1"}"#,
        )
        .await;
        assert_eq!(out[1]["type"], "execution_complete");
        assert_eq!(out[1]["request_id"], "r3");
        assert_eq!(out[1]["result"]["success"], true);

        let out = replies(&gateway, r#"{"type":"get_session_stats"}"#).await;
        assert_eq!(out[0]["active_sessions"], 1);
        assert_eq!(out[0]["sessions"][0]["id"], "s1");

        pool.cleanup().await;
    }
}
