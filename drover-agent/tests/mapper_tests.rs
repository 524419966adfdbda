// ABOUTME: Tests for mapping session-server events into AgentMessages.
// ABOUTME: Verifies per-tool dedup, text deltas, session filtering and turn completion.

use drover_agent::{AgentMessage, ErrorCode, EventMapper, ResultSubtype, ServerEvent};
use serde_json::{json, Value};

const SESSION: &str = "ses_1";

fn tool_event(status: &str, extra: Value) -> ServerEvent {
    let mut state = json!({ "status": status, "input": {"command": "ls"} });
    if let (Some(state), Some(extra)) = (state.as_object_mut(), extra.as_object()) {
        state.extend(extra.clone());
    }
    ServerEvent::new(
        "message.part.updated",
        json!({
            "part": {
                "id": "prt_1",
                "sessionID": SESSION,
                "messageID": "msg_a",
                "type": "tool",
                "callID": "call_1",
                "tool": "bash",
                "state": state
            }
        }),
    )
}

fn text_event(text: &str, delta: Option<&str>, message_id: &str) -> ServerEvent {
    let mut props = json!({
        "part": {
            "id": "prt_text",
            "sessionID": SESSION,
            "messageID": message_id,
            "type": "text",
            "text": text
        }
    });
    if let Some(delta) = delta {
        props["delta"] = json!(delta);
    }
    ServerEvent::new("message.part.updated", props)
}

fn message_event(message_id: &str, role: &str) -> ServerEvent {
    ServerEvent::new(
        "message.updated",
        json!({"info": {"id": message_id, "sessionID": SESSION, "role": role}}),
    )
}

fn map_all(mapper: &mut EventMapper, events: &[ServerEvent]) -> Vec<AgentMessage> {
    events.iter().flat_map(|e| mapper.map(e)).collect()
}

#[test]
fn test_tool_lifecycle_emits_one_use_and_one_result() {
    let mut mapper = EventMapper::new(SESSION);
    let messages = map_all(
        &mut mapper,
        &[
            tool_event("pending", json!({})),
            tool_event("running", json!({})),
            tool_event("running", json!({})),
            tool_event("completed", json!({"output": "Cargo.toml\nsrc"})),
            tool_event("completed", json!({"output": "Cargo.toml\nsrc"})),
        ],
    );

    assert_eq!(messages.len(), 2);
    assert!(matches!(&messages[0], AgentMessage::ToolUse { id, name, .. } if id == "call_1" && name == "bash"));
    assert_eq!(
        messages[1],
        AgentMessage::ToolResult {
            id: "call_1".to_string(),
            content: "Cargo.toml\nsrc".to_string(),
            is_error: false,
        }
    );
}

#[test]
fn test_first_seen_completed_emits_use_then_result() {
    let mut mapper = EventMapper::new(SESSION);
    let messages = mapper.map(&tool_event("completed", json!({"output": "ok"})));
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].kind(), "tool_use");
    assert_eq!(messages[1].kind(), "tool_result");
}

#[test]
fn test_tool_error_is_result_with_error_flag() {
    let mut mapper = EventMapper::new(SESSION);
    mapper.map(&tool_event("running", json!({})));
    let messages = mapper.map(&tool_event("error", json!({"error": "permission denied"})));
    assert_eq!(
        messages,
        vec![AgentMessage::ToolResult {
            id: "call_1".to_string(),
            content: "permission denied".to_string(),
            is_error: true,
        }]
    );
}

#[test]
fn test_text_prefers_delta_then_suffix() {
    let mut mapper = EventMapper::new(SESSION);
    let messages = map_all(
        &mut mapper,
        &[
            message_event("msg_a", "assistant"),
            text_event("Hel", Some("Hel"), "msg_a"),
            text_event("Hello", Some("lo"), "msg_a"),
            // Snapshot without delta only adds what is new
            text_event("Hello world", None, "msg_a"),
            text_event("Hello world", None, "msg_a"),
        ],
    );
    let text: Vec<_> = messages
        .iter()
        .map(|m| match m {
            AgentMessage::Assistant { content } => content.as_str(),
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(text, vec!["Hel", "lo", " world"]);
}

#[test]
fn test_user_message_parts_are_not_echoed() {
    let mut mapper = EventMapper::new(SESSION);
    mapper.map(&message_event("msg_user", "user"));
    mapper.map(&message_event("msg_a", "assistant"));
    assert!(mapper.map(&text_event("do the thing", None, "msg_user")).is_empty());
    assert_eq!(mapper.map(&text_event("On it", None, "msg_a")).len(), 1);
}

#[test]
fn test_parts_wait_for_their_message_role() {
    let mut mapper = EventMapper::new(SESSION);

    // The echo of a prompt can arrive before its message is announced
    assert!(mapper.map(&text_event("do the thing", None, "msg_user")).is_empty());
    assert!(mapper.map(&message_event("msg_user", "user")).is_empty());

    assert!(mapper.map(&text_event("On", Some("On"), "msg_a")).is_empty());
    assert_eq!(
        mapper.map(&message_event("msg_a", "assistant")),
        vec![AgentMessage::assistant("On")]
    );
    assert_eq!(
        mapper.map(&text_event("On it", Some(" it"), "msg_a")),
        vec![AgentMessage::assistant(" it")]
    );
}

#[test]
fn test_unannounced_parts_flush_when_turn_ends() {
    let mut mapper = EventMapper::new(SESSION);
    assert!(mapper.map(&text_event("Done", None, "msg_b")).is_empty());
    let messages = mapper.map(&ServerEvent::new("session.idle", json!({"sessionID": SESSION})));
    assert_eq!(
        messages,
        vec![
            AgentMessage::assistant("Done"),
            AgentMessage::result(ResultSubtype::Success)
        ]
    );
}

#[test]
fn test_other_sessions_are_discarded() {
    let mut mapper = EventMapper::new("ses_other");
    assert!(mapper.map(&tool_event("running", json!({}))).is_empty());
    assert!(mapper
        .map(&ServerEvent::new("session.idle", json!({"sessionID": SESSION})))
        .is_empty());
}

#[test]
fn test_idle_and_error_finish_the_turn() {
    let mut mapper = EventMapper::new(SESSION);
    let idle = mapper.map(&ServerEvent::new("session.idle", json!({"sessionID": SESSION})));
    assert_eq!(idle, vec![AgentMessage::result(ResultSubtype::Success)]);
    assert!(mapper.is_idle());

    let failed = mapper.map(&ServerEvent::new(
        "session.error",
        json!({"sessionID": SESSION, "error": {"name": "ProviderAuthError", "data": {"message": "bad key"}}}),
    ));
    assert_eq!(failed.len(), 2);
    assert!(matches!(&failed[0], AgentMessage::Error { code: ErrorCode::BackendError, message } if message == "bad key"));
    assert!(matches!(&failed[1], AgentMessage::Result { subtype: ResultSubtype::Error, .. }));
}

#[test]
fn test_reset_allows_reused_tool_ids() {
    let mut mapper = EventMapper::new(SESSION);
    mapper.map(&tool_event("completed", json!({"output": "1"})));
    assert!(mapper.map(&tool_event("completed", json!({"output": "1"}))).is_empty());

    mapper.reset();
    assert_eq!(mapper.map(&tool_event("completed", json!({"output": "2"}))).len(), 2);
}
