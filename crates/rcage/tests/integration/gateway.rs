use rcage::{ClientMessage, Config, Gateway, ServerMessage};
use tokio::sync::mpsc;

use super::{rows, test_pool};

async fn collect(gateway: &Gateway, message: ClientMessage) -> Vec<ServerMessage> {
    let (tx, mut rx) = mpsc::channel(16);
    gateway.handle("gateway", message, &tx).await;
    drop(tx);

    let mut replies = Vec::new();
    while let Some(reply) = rx.recv().await {
        replies.push(reply);
    }
    replies
}

#[tokio::test]
#[ignore = "requires R"]
async fn test_execute_code_round_trip() {
    let pool = test_pool(Config::default()).await;
    let gateway = Gateway::new(pool.clone());

    let replies = collect(
        &gateway,
        ClientMessage::ExecuteCode {
            request_id: Some("r1".to_owned()),
            code: "print(mean(data$v))".to_owned(),
            data: Some(rows(r#"[{"v": 2}, {"v": 4}]"#)),
            timeout_ms: Some(10_000),
        },
    )
    .await;

    assert!(matches!(replies[0], ServerMessage::ExecutionStarted { .. }));
    match &replies[1] {
        ServerMessage::ExecutionComplete { request_id, result } => {
            assert_eq!(request_id.as_deref(), Some("r1"));
            assert!(result.output.contains("[1] 3"));
        }
        other => panic!("unexpected reply {other:?}"),
    }
    pool.cleanup().await;
}

#[tokio::test]
#[ignore = "requires R"]
async fn test_execute_prompt_generates_and_runs_summary() {
    let pool = test_pool(Config::default()).await;
    let gateway = Gateway::new(pool.clone());

    let replies = collect(
        &gateway,
        ClientMessage::ExecutePrompt {
            request_id: None,
            prompt: "describe this".to_owned(),
            data: Some(rows(r#"[{"a": 1, "b": "x"}, {"a": 2, "b": "y"}]"#)),
            timeout_ms: None,
        },
    )
    .await;

    assert!(matches!(replies[0], ServerMessage::PromptStarted { .. }));
    match &replies[1] {
        ServerMessage::PromptComplete {
            result,
            generated_code,
            ..
        } => {
            assert!(generated_code.contains("summary"));
            assert!(result.success);
        }
        other => panic!("unexpected reply {other:?}"),
    }
    pool.cleanup().await;
}
