// ABOUTME: Translates server-pushed part/session events into AgentMessages.
// ABOUTME: Per-tool state machine guarantees one tool_use and one tool_result per call id.

use crate::message::{AgentMessage, ErrorCode, ResultSubtype};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Emission state of one tool invocation. Absent from the ledger means unseen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolPhase {
    UseEmitted,
    ResultEmitted,
}

/// What must be emitted when a tool is observed finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolTransition {
    /// Already reported
    Nothing,
    /// tool_use was emitted earlier; emit tool_result
    ResultOnly,
    /// First sighting is already finished; emit tool_use then tool_result
    UseAndResult,
}

/// Tracks `unseen -> use-emitted -> result-emitted` for every tool id in a session
#[derive(Debug, Default)]
pub struct ToolLedger {
    phases: HashMap<String, ToolPhase>,
}

impl ToolLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self, id: &str) -> Option<ToolPhase> {
        self.phases.get(id).copied()
    }

    /// Record a pending/running sighting. Returns true when tool_use must be emitted.
    pub fn on_started(&mut self, id: &str) -> bool {
        if self.phases.contains_key(id) {
            return false;
        }
        self.phases.insert(id.to_string(), ToolPhase::UseEmitted);
        true
    }

    /// Record a completed/error sighting
    pub fn on_finished(&mut self, id: &str) -> ToolTransition {
        match self.phases.get(id).copied() {
            None => {
                self.phases.insert(id.to_string(), ToolPhase::ResultEmitted);
                ToolTransition::UseAndResult
            }
            Some(ToolPhase::UseEmitted) => {
                self.phases.insert(id.to_string(), ToolPhase::ResultEmitted);
                ToolTransition::ResultOnly
            }
            Some(ToolPhase::ResultEmitted) => ToolTransition::Nothing,
        }
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn reset(&mut self) {
        self.phases.clear();
    }
}

/// Raw event pushed by a session server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub properties: Value,
}

impl ServerEvent {
    pub fn new(kind: impl Into<String>, properties: Value) -> Self {
        Self {
            kind: kind.into(),
            properties,
        }
    }

    /// Session the event belongs to, wherever the server put it
    pub fn session_id(&self) -> Option<&str> {
        let props = &self.properties;
        props
            .get("sessionID")
            .or_else(|| props.get("part").and_then(|p| p.get("sessionID")))
            .or_else(|| props.get("info").and_then(|i| i.get("sessionID")))
            .and_then(|v| v.as_str())
    }
}

/// Maps one server session's events into AgentMessages
#[derive(Debug)]
pub struct EventMapper {
    session_id: String,
    tools: ToolLedger,
    /// Bytes of each text part already emitted
    text_progress: HashMap<String, usize>,
    /// Message ids authored by the user; their parts are echoes, not output
    user_messages: HashSet<String>,
    /// Message ids known to come from the assistant
    assistant_messages: HashSet<String>,
    /// Text parts whose message role has not been announced yet, in arrival order
    pending: Vec<PendingText>,
    idle: bool,
}

#[derive(Debug)]
struct PendingText {
    message_id: String,
    part: Value,
    delta: Option<String>,
}

impl EventMapper {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            tools: ToolLedger::new(),
            text_progress: HashMap::new(),
            user_messages: HashSet::new(),
            assistant_messages: HashSet::new(),
            pending: Vec::new(),
            idle: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// True once the server reported the current turn finished
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Forget dedup state before an unrelated turn on a reused session
    pub fn reset(&mut self) {
        self.tools.reset();
        self.text_progress.clear();
        self.user_messages.clear();
        self.assistant_messages.clear();
        self.pending.clear();
        self.idle = false;
    }

    pub fn map(&mut self, event: &ServerEvent) -> Vec<AgentMessage> {
        if let Some(sid) = event.session_id() {
            if sid != self.session_id {
                return Vec::new();
            }
        }

        match event.kind.as_str() {
            "message.updated" => self.track_message(&event.properties),
            "message.part.updated" => self.map_part(&event.properties),
            "session.idle" => {
                self.idle = true;
                let mut messages = self.flush_pending();
                messages.push(AgentMessage::result(ResultSubtype::Success));
                messages
            }
            "session.error" => {
                self.idle = true;
                let message = error_text(event.properties.get("error"));
                let mut messages = self.flush_pending();
                messages.push(AgentMessage::error(ErrorCode::BackendError, message.clone()));
                messages.push(AgentMessage::Result {
                    subtype: ResultSubtype::Error,
                    text: Some(message),
                    usage: None,
                });
                messages
            }
            other => {
                tracing::trace!(kind = %other, "Ignoring server event");
                Vec::new()
            }
        }
    }

    /// Learn a message's role and settle any text parts that were waiting on it
    fn track_message(&mut self, props: &Value) -> Vec<AgentMessage> {
        let Some(info) = props.get("info") else {
            return Vec::new();
        };
        let Some(id) = info.get("id").and_then(|i| i.as_str()) else {
            return Vec::new();
        };
        let is_user = info.get("role").and_then(|r| r.as_str()) == Some("user");
        if is_user {
            self.user_messages.insert(id.to_string());
        } else {
            self.assistant_messages.insert(id.to_string());
        }

        let (settled, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.message_id == id);
        self.pending = waiting;
        if is_user {
            return Vec::new();
        }
        self.emit_pending(settled)
    }

    /// Parts still waiting when the turn ends are assumed to be output
    fn flush_pending(&mut self) -> Vec<AgentMessage> {
        let pending = std::mem::take(&mut self.pending);
        self.emit_pending(pending)
    }

    fn emit_pending(&mut self, pending: Vec<PendingText>) -> Vec<AgentMessage> {
        pending
            .into_iter()
            .filter_map(|p| self.map_text(&p.part, p.delta.as_deref()))
            .collect()
    }

    fn map_part(&mut self, props: &Value) -> Vec<AgentMessage> {
        let Some(part) = props.get("part") else {
            return Vec::new();
        };
        let message_id = part.get("messageID").and_then(|m| m.as_str());
        let role = part.get("role").and_then(|r| r.as_str());
        if role == Some("user") || message_id.is_some_and(|m| self.user_messages.contains(m)) {
            return Vec::new();
        }

        // Any new output means the session is busy again
        self.idle = false;

        let delta = props.get("delta").and_then(|d| d.as_str());
        match part.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                let role_known = role.is_some()
                    || message_id.map_or(true, |m| self.assistant_messages.contains(m));
                if role_known {
                    return self.map_text(part, delta).into_iter().collect();
                }
                // Could still be the echo of a user message; hold until its role is known
                self.pending.push(PendingText {
                    message_id: message_id.unwrap_or_default().to_string(),
                    part: part.clone(),
                    delta: delta.map(str::to_string),
                });
                Vec::new()
            }
            Some("tool") => self.map_tool(part),
            other => {
                tracing::trace!(part_type = ?other, "Ignoring part");
                Vec::new()
            }
        }
    }

    fn map_text(&mut self, part: &Value, delta: Option<&str>) -> Option<AgentMessage> {
        let part_id = part.get("id").and_then(|i| i.as_str()).unwrap_or("");
        let progress = self.text_progress.entry(part_id.to_string()).or_insert(0);

        if let Some(delta) = delta.filter(|d| !d.is_empty()) {
            *progress += delta.len();
            return Some(AgentMessage::assistant(delta));
        }

        // No delta: emit whatever the accumulated text holds beyond what was sent
        let text = part.get("text").and_then(|t| t.as_str())?;
        if text.len() <= *progress || !text.is_char_boundary(*progress) {
            return None;
        }
        let suffix = text[*progress..].to_string();
        *progress = text.len();
        Some(AgentMessage::assistant(suffix))
    }

    fn map_tool(&mut self, part: &Value) -> Vec<AgentMessage> {
        let Some(id) = part
            .get("callID")
            .or_else(|| part.get("id"))
            .and_then(|i| i.as_str())
        else {
            return Vec::new();
        };
        let name = part
            .get("tool")
            .and_then(|t| t.as_str())
            .unwrap_or("unknown")
            .to_string();
        let state = part.get("state").cloned().unwrap_or(Value::Null);
        let input = state
            .get("input")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        let status = state
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("pending");

        let tool_use = |id: &str| AgentMessage::ToolUse {
            id: id.to_string(),
            name: name.clone(),
            input: input.clone(),
        };

        match status {
            "pending" | "running" => {
                if self.tools.on_started(id) {
                    vec![tool_use(id)]
                } else {
                    Vec::new()
                }
            }
            "completed" | "error" => {
                let is_error = status == "error";
                let content = if is_error {
                    error_text(state.get("error"))
                } else {
                    value_text(state.get("output"))
                };
                let result = AgentMessage::ToolResult {
                    id: id.to_string(),
                    content,
                    is_error,
                };
                match self.tools.on_finished(id) {
                    ToolTransition::Nothing => Vec::new(),
                    ToolTransition::ResultOnly => vec![result],
                    ToolTransition::UseAndResult => vec![tool_use(id), result],
                }
            }
            other => {
                tracing::debug!(tool_id = %id, status = %other, "Unknown tool status");
                Vec::new()
            }
        }
    }
}

fn value_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn error_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(obj @ Value::Object(_)) => obj
            .get("data")
            .and_then(|d| d.get("message"))
            .or_else(|| obj.get("message"))
            .or_else(|| obj.get("name"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| obj.to_string()),
        _ => "unknown error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_walks_phases_once() {
        let mut ledger = ToolLedger::new();
        assert_eq!(ledger.phase("t"), None);
        assert!(ledger.on_started("t"));
        assert!(!ledger.on_started("t"));
        assert_eq!(ledger.phase("t"), Some(ToolPhase::UseEmitted));
        assert_eq!(ledger.on_finished("t"), ToolTransition::ResultOnly);
        assert_eq!(ledger.on_finished("t"), ToolTransition::Nothing);
        assert!(!ledger.on_started("t"));
        assert_eq!(ledger.phase("t"), Some(ToolPhase::ResultEmitted));
    }

    #[test]
    fn test_ledger_finished_first_emits_both() {
        let mut ledger = ToolLedger::new();
        assert_eq!(ledger.on_finished("t"), ToolTransition::UseAndResult);
        assert_eq!(ledger.len(), 1);
        ledger.reset();
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_error_text_prefers_nested_message() {
        let err = serde_json::json!({"name": "ProviderAuthError", "data": {"message": "bad key"}});
        assert_eq!(error_text(Some(&err)), "bad key");
        let named = serde_json::json!({"name": "Aborted"});
        assert_eq!(error_text(Some(&named)), "Aborted");
    }
}
