use std::time::Duration;

use rcage::Config;

use super::FIXTURES_PATH;

#[test]
fn test_load_valid_config() {
    let path = format!("{FIXTURES_PATH}/configs/valid_full.toml");
    let config = Config::from_file(&path).expect("Failed to load config");

    assert_eq!(config.interpreter.memory_limit.to_string(), "1G");
    assert_eq!(config.interpreter.start_timeout(), Duration::from_secs(8));
    assert_eq!(config.pool.max_sessions, 2);
    assert_eq!(config.pool.shutdown_grace(), Duration::from_millis(500));
    assert_eq!(config.session.default_timeout(), Duration::from_secs(15));
    assert_eq!(config.validator.extra_allowed_packages, vec!["data.table"]);
}

#[test]
fn test_load_minimal_config() {
    let path = format!("{FIXTURES_PATH}/configs/valid_minimal.toml");
    let config = Config::from_file(&path).expect("Failed to load config");

    assert_eq!(config.pool.max_sessions, 3);
    assert_eq!(config.interpreter.path, "R");
    assert_eq!(config.session.default_timeout_ms, 30_000);
}

#[test]
fn test_load_invalid_zero_sessions() {
    let path = format!("{FIXTURES_PATH}/configs/invalid_zero_sessions.toml");
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn test_load_invalid_empty_path() {
    let path = format!("{FIXTURES_PATH}/configs/invalid_empty_path.toml");
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn test_load_invalid_memory_limit() {
    let path = format!("{FIXTURES_PATH}/configs/invalid_memory_limit.toml");
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn test_layered_load_applies_file_over_defaults() {
    let path = format!("{FIXTURES_PATH}/configs/valid_minimal.toml");
    let config = Config::load(Some(std::path::Path::new(&path))).expect("Failed to load config");

    assert_eq!(config.pool.max_sessions, 3);
    assert_eq!(config.pool.idle_timeout_secs, 300);
}

#[test]
#[ignore = "requires R"]
fn test_resolve_interpreter_binary() {
    let config = Config::default();
    let binary = config
        .interpreter
        .resolve_binary()
        .expect("R should be on PATH");
    assert!(binary.is_absolute());
}
