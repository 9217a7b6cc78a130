//! Integration tests for rcage
//!
//! These tests drive a real R interpreter found on PATH.
//! Run with: cargo test -p rcage --features integration-tests
//!
//! Tests that start R are marked `#[ignore]`. To include them:
//!    cargo test -p rcage --features integration-tests -- --include-ignored

#![cfg(feature = "integration-tests")]

use std::fs;
use std::sync::Arc;

use rcage::{Config, Row, SessionPool};

mod config_loading;
mod execution;
mod gateway;
mod pool;

const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Helper to get fixture file content
pub(crate) fn fixture_source(name: &str) -> String {
    let path = format!("{FIXTURES_PATH}/sources/{name}");
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read fixture {path}: {e}"))
}

/// Rows built from a JSON array literal
pub(crate) fn rows(json: &str) -> Vec<Row> {
    serde_json::from_str(json).expect("fixture rows must be a JSON array of objects")
}

/// Start a pool against the system R, failing loudly when R is missing.
pub(crate) async fn test_pool(config: Config) -> Arc<SessionPool> {
    let pool = Arc::new(SessionPool::new(&config));
    assert!(pool.initialize().await, "R must be installed and on PATH");
    pool
}
