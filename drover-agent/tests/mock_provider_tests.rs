// ABOUTME: Tests for the mock provider used by higher-level deterministic tests.
// ABOUTME: Covers scripted responses, resume rules, spawn failure and the terminal facet.

use drover_agent::providers::mock::MockProvider;
use drover_agent::{
    AgentMessage, ErrorCode, ProviderError, ResultSubtype, SessionMode, SpawnOptions,
    TerminalSize,
};
use futures::StreamExt;
use serde_json::json;
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn test_scripted_responses_in_order() {
    let mock = MockProvider::new("mock")
        .on_prompt("read")
        .respond_with(vec![
            AgentMessage::ToolUse {
                id: "t1".to_string(),
                name: "Read".to_string(),
                input: json!({"path": "/tmp/foo"}),
            },
            AgentMessage::ToolResult {
                id: "t1".to_string(),
                content: "contents".to_string(),
                is_error: false,
            },
            AgentMessage::result(ResultSubtype::Success),
        ])
        .on_prompt("summarize")
        .respond_text("Short summary");

    let provider = mock.clone().into_provider();
    let session = provider
        .headless()
        .unwrap()
        .spawn(SpawnOptions::new("/tmp").with_prompt("please read foo"))
        .await
        .unwrap();
    session.send_message("now summarize").await.unwrap();
    session.close().await.unwrap();

    let kinds: Vec<_> = session.messages().map(|m| m.kind()).collect().await;
    assert_eq!(
        kinds,
        vec!["system", "tool_use", "tool_result", "result", "assistant", "result"]
    );
    assert_eq!(mock.prompts(), vec!["please read foo", "now summarize"]);
    assert_eq!(mock.spawn_count(), 1);
    assert_eq!(mock.close_count(), 1);
}

#[tokio::test]
async fn test_respond_error_ends_turn_with_error() {
    let mock = MockProvider::new("mock")
        .on_prompt("boom")
        .respond_error(ErrorCode::BackendError, "exploded");
    let session = mock
        .clone()
        .into_provider()
        .headless()
        .unwrap()
        .spawn(SpawnOptions::new("/tmp").with_prompt("boom"))
        .await
        .unwrap();
    session.close().await.unwrap();

    let messages: Vec<_> = session.messages().collect().await;
    assert!(matches!(&messages[1], AgentMessage::Error { message, .. } if message == "exploded"));
    assert!(matches!(
        &messages[2],
        AgentMessage::Result { subtype: ResultSubtype::Error, .. }
    ));
}

#[tokio::test]
async fn test_resume_requires_known_session() {
    let mock = MockProvider::new("mock").with_session("old-session");
    let provider = mock.clone().into_provider();
    let headless = provider.headless().unwrap();

    let resumed = headless
        .spawn(SpawnOptions::new("/tmp").with_resume("old-session"))
        .await
        .unwrap();
    assert_eq!(resumed.session_id().as_deref(), Some("old-session"));

    let missing = headless
        .spawn(SpawnOptions::new("/tmp").with_resume("nope"))
        .await;
    assert!(matches!(missing, Err(ProviderError::SessionNotFound(_))));
}

#[tokio::test]
async fn test_fail_spawn() {
    let mock = MockProvider::new("mock");
    mock.set_fail_spawn(true);
    let provider = mock.clone().into_provider();
    let result = provider
        .headless()
        .unwrap()
        .spawn(SpawnOptions::new("/tmp"))
        .await;
    assert!(matches!(result, Err(ProviderError::SpawnFailure { .. })));
    assert_eq!(mock.spawn_count(), 0);
}

#[tokio::test]
async fn test_terminal_echo_and_exit_listeners() {
    let mock = MockProvider::new("mock");
    let provider = mock.clone().into_provider();
    assert_eq!(
        provider.modes(),
        vec![SessionMode::Headless, SessionMode::Interactive]
    );

    let terminal = provider
        .interactive()
        .unwrap()
        .spawn(SpawnOptions::new("/tmp"), TerminalSize::default())
        .await
        .unwrap();

    let echoed = Arc::new(Mutex::new(Vec::new()));
    let sink = echoed.clone();
    terminal.on_data(Box::new(move |data| sink.lock().unwrap().extend_from_slice(data)));
    terminal.write(b"ls\r").await.unwrap();
    assert_eq!(echoed.lock().unwrap().as_slice(), b"ls\r");
    assert_eq!(mock.terminal_input(), b"ls\r".to_vec());

    terminal.kill().await.unwrap();
    terminal.kill().await.unwrap();
    assert_eq!(mock.close_count(), 1);

    // Registered after exit: fires immediately
    let exited = Arc::new(Mutex::new(None));
    let slot = exited.clone();
    terminal.on_exit(Box::new(move |info| *slot.lock().unwrap() = Some(info)));
    assert!(exited.lock().unwrap().is_some());
    assert!(matches!(terminal.write(b"x").await, Err(ProviderError::Closed)));
}
