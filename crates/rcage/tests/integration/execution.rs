use std::time::Duration;

use rcage::{Config, ExecuteOptions, PoolError, SessionError};

use super::{fixture_source, rows, test_pool};

#[tokio::test]
#[ignore = "requires R"]
async fn test_dataset_is_bound_to_data() {
    let pool = test_pool(Config::default()).await;
    let data = rows(r#"[{"x": 1}, {"x": 3}]"#);

    let result = pool
        .execute_code(
            "dataset",
            &fixture_source("sum_data.R"),
            ExecuteOptions::new().with_data(data),
        )
        .await
        .expect("Execution failed");

    assert!(result.success);
    assert!(result.output.contains("[1] 4"), "output: {}", result.output);
    pool.cleanup().await;
}

#[tokio::test]
#[ignore = "requires R"]
async fn test_state_persists_within_session() {
    let pool = test_pool(Config::default()).await;

    pool.execute_code("state", "counter <- 41", ExecuteOptions::new())
        .await
        .expect("Execution failed");
    let result = pool
        .execute_code("state", "print(counter + 1)", ExecuteOptions::new())
        .await
        .expect("Execution failed");

    assert!(result.output.contains("[1] 42"));
    pool.cleanup().await;
}

#[tokio::test]
#[ignore = "requires R"]
async fn test_error_is_reported_and_session_survives() {
    let pool = test_pool(Config::default()).await;

    let result = pool
        .execute_code("errors", &fixture_source("stop.R"), ExecuteOptions::new())
        .await
        .expect("Execution failed");
    let error = result.reported_error().expect("error line expected");
    assert!(error.contains("boom"));

    // assignments made before the error are kept
    let result = pool
        .execute_code("errors", "print(x)", ExecuteOptions::new())
        .await
        .expect("Execution failed");
    assert!(result.output.contains("[1] 1"));
    assert!(result.reported_error().is_none());
    pool.cleanup().await;
}

#[tokio::test]
#[ignore = "requires R"]
async fn test_timeout_keeps_session_usable() {
    let pool = test_pool(Config::default()).await;

    let err = pool
        .execute_code(
            "slow",
            "Sys.sleep(3)",
            ExecuteOptions::new().with_timeout(Duration::from_millis(500)),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PoolError::Session(SessionError::Timeout(_))
    ));

    let result = pool
        .execute_code(
            "slow",
            "print('after')",
            ExecuteOptions::new().with_timeout(Duration::from_secs(10)),
        )
        .await
        .expect("Execution failed");
    assert!(result.output.contains("after"));
    pool.cleanup().await;
}

#[tokio::test]
#[ignore = "requires R"]
async fn test_visible_values_are_printed() {
    let pool = test_pool(Config::default()).await;

    let result = pool
        .execute_code("visible", "1 + 1\ninvisible(7)", ExecuteOptions::new())
        .await
        .expect("Execution failed");

    assert!(result.output.contains("[1] 2"));
    assert!(!result.output.contains("[1] 7"));
    pool.cleanup().await;
}
