use std::time::{Duration, Instant};

use rcage::{Config, ExecuteOptions, PoolError};

use super::{fixture_source, test_pool};

#[tokio::test]
async fn test_unsafe_code_is_rejected_before_any_session() {
    // validation does not need a running interpreter
    let pool = std::sync::Arc::new(rcage::SessionPool::new(&Config::default()));

    let err = pool
        .execute_code("unsafe", &fixture_source("rm_rf.R"), ExecuteOptions::new())
        .await
        .unwrap_err();

    match err {
        PoolError::UnsafeCode(reason) => assert!(reason.contains("system")),
        other => panic!("expected UnsafeCode, got {other:?}"),
    }
    assert_eq!(pool.active_session_count().await, 0);
}

#[tokio::test]
#[ignore = "requires R"]
async fn test_sessions_run_in_parallel() {
    let pool = test_pool(Config::default()).await;
    for id in ["alpha", "beta"] {
        pool.get_or_create_session(id).await.expect("start failed");
    }

    let started = Instant::now();
    let (a, b) = tokio::join!(
        pool.execute_code("alpha", "Sys.sleep(1); print('a')", ExecuteOptions::new()),
        pool.execute_code("beta", "Sys.sleep(1); print('b')", ExecuteOptions::new()),
    );

    assert!(a.expect("alpha failed").output.contains("\"a\""));
    assert!(b.expect("beta failed").output.contains("\"b\""));
    // two one-second sleeps overlap
    assert!(started.elapsed() < Duration::from_millis(1900));
    assert_eq!(pool.active_session_count().await, 2);
    pool.cleanup().await;
}

#[tokio::test]
#[ignore = "requires R"]
async fn test_sessions_do_not_share_state() {
    let pool = test_pool(Config::default()).await;

    pool.execute_code("one", "secret <- 1", ExecuteOptions::new())
        .await
        .expect("Execution failed");
    let result = pool
        .execute_code("two", "print(exists('secret'))", ExecuteOptions::new())
        .await
        .expect("Execution failed");

    assert!(result.output.contains("FALSE"));
    pool.cleanup().await;
}

#[tokio::test]
#[ignore = "requires R"]
async fn test_lru_eviction_at_capacity() {
    let mut config = Config::default();
    config.pool.max_sessions = 2;
    let pool = test_pool(config).await;

    for id in ["first", "second", "third"] {
        pool.execute_code(id, "invisible(NULL)", ExecuteOptions::new())
            .await
            .expect("Execution failed");
    }

    assert_eq!(pool.active_session_count().await, 2);
    assert!(pool.session("first").await.is_none());
    assert!(pool.session("third").await.is_some());
    pool.cleanup().await;
}

#[tokio::test]
#[ignore = "requires R"]
async fn test_cancel_session_interrupts_execution() {
    let pool = test_pool(Config::default()).await;
    pool.get_or_create_session("cancel").await.expect("start failed");

    let runner = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.execute_code("cancel", "Sys.sleep(20)", ExecuteOptions::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(pool.cancel_session("cancel").await);
    let outcome = runner.await.expect("task panicked");
    assert!(outcome.is_err());
    assert!(pool.session("cancel").await.is_none());
    pool.cleanup().await;
}
