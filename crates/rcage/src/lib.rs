//! A session-pooled sandbox for running untrusted R snippets.
//!
//! rcage screens submitted R code against a deny/allow policy, then runs it
//! in long-lived interpreter subprocesses keyed by client session id. Each
//! call's output is delimited by a per-call marker and bounded by a
//! wall-clock timeout. Idle sessions are reaped in the background.
//!
//! # Features
//!
//! - **Static validation**: Declarative rule table for dangerous calls, file system and network idioms, packages, and runaway loops.
//! - **Session pool**: Bounded, LRU-evicting pool with explicit saturation when every session is busy.
//! - **Datasets**: JSON rows become an R `data.frame` bound to `data` before the code runs.
//! - **Prompt templates**: Keyword-driven expansion of prompts into plotting and summary code.
//! - **Gateway**: Typed request/reply messages for any transport.
//! - **TOML configuration**: Interpreter, pool, session, and validator settings with environment overrides.
//!
//! Isolation is the process boundary plus the source filter; no namespaces,
//! cgroups or syscall filtering are applied.

pub use config::{Config, ConfigError, EXAMPLE_CONFIG, InterpreterConfig};
pub use gateway::{ClientMessage, Gateway, RequestError, ServerMessage};
pub use pool::{PoolError, SessionPool};
pub use prompt::{CodeGenerator, Template, TemplateGenerator};
pub use session::{ExecutionSession, SessionError};
pub use types::{
    ExecuteOptions, ExecutionResult, PromptOutcome, Row, SessionState, SessionStats,
};
pub use validator::{CodeValidator, RuleCategory, Verdict, Violation};

pub mod config;
pub mod dataset;
pub mod gateway;
pub mod pool;
pub mod prompt;
pub mod session;
pub mod types;
pub mod validator;
