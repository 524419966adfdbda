// ABOUTME: Domain records shared by the engine: agents, tasks, channels and session transcripts.
// ABOUTME: Status and role enums round-trip through strings for storage and the CLI.

use chrono::{DateTime, Utc};
use drover_agent::{AgentMessage, SessionMode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Director,
    Worker,
    Steward,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Director => write!(f, "director"),
            Self::Worker => write!(f, "worker"),
            Self::Steward => write!(f, "steward"),
        }
    }
}

impl std::str::FromStr for AgentRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "director" => Ok(Self::Director),
            "worker" => Ok(Self::Worker),
            "steward" => Ok(Self::Steward),
            _ => anyhow::bail!("Unknown agent role: {}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Spun up per task and discarded
    Ephemeral,
    /// Long-lived worker kept in a terminal
    Persistent,
}

impl std::fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ephemeral => write!(f, "ephemeral"),
            Self::Persistent => write!(f, "persistent"),
        }
    }
}

impl std::str::FromStr for WorkerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ephemeral" => Ok(Self::Ephemeral),
            "persistent" => Ok(Self::Persistent),
            _ => anyhow::bail!("Unknown worker mode: {}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentCapabilities {
    pub skills: BTreeSet<String>,
    pub languages: BTreeSet<String>,
    pub max_concurrent_tasks: u32,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            skills: BTreeSet::new(),
            languages: BTreeSet::new(),
            max_concurrent_tasks: 1,
        }
    }
}

impl AgentCapabilities {
    pub fn new<S, L>(skills: S, languages: L, max_concurrent_tasks: u32) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        L: IntoIterator,
        L::Item: Into<String>,
    {
        Self {
            skills: skills.into_iter().map(Into::into).collect(),
            languages: languages.into_iter().map(Into::into).collect(),
            max_concurrent_tasks,
        }
    }
}

/// A registered worker identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntity {
    pub id: String,
    pub name: String,
    pub role: AgentRole,
    /// Only set for workers
    pub worker_mode: Option<WorkerMode>,
    pub capabilities: AgentCapabilities,
    /// Direct channel created at registration
    pub channel_id: String,
    /// Provider name in the registry
    pub provider: String,
    /// Last backend session id observed, used to resume
    pub last_session_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentEntity {
    /// Headless for ephemeral workers and stewards.
    /// Interactive for directors and persistent workers.
    pub fn session_mode(&self) -> SessionMode {
        match (self.role, self.worker_mode) {
            (AgentRole::Director, _) => SessionMode::Interactive,
            (AgentRole::Worker, Some(WorkerMode::Persistent)) => SessionMode::Interactive,
            (AgentRole::Worker, _) | (AgentRole::Steward, _) => SessionMode::Headless,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Blocked,
    Review,
    Closed,
    Tombstone,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        Self::Open,
        Self::InProgress,
        Self::Blocked,
        Self::Review,
        Self::Closed,
        Self::Tombstone,
    ];

    /// Closed and tombstoned tasks no longer count as work
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Tombstone)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Review => "review",
            Self::Closed => "closed",
            Self::Tombstone => "tombstone",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown task status: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub assignee: Option<String>,
    /// 1 (highest) to 5
    pub priority: u8,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const DEFAULT_PRIORITY: u8 = 3;

/// Fields for creating a task
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub priority: u8,
    pub metadata: Value,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            priority: DEFAULT_PRIORITY,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 5);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Task query; empty filter lists every task
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub assignee: Option<String>,
    pub unassigned: bool,
    /// Empty means any status
    pub statuses: Vec<TaskStatus>,
}

impl TaskFilter {
    pub fn assigned_to(agent_id: impl Into<String>) -> Self {
        Self {
            assignee: Some(agent_id.into()),
            ..Default::default()
        }
    }

    pub fn unassigned() -> Self {
        Self {
            unassigned: true,
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    /// Every status except closed and tombstone
    pub fn active(self) -> Self {
        self.with_statuses(TaskStatus::ALL.into_iter().filter(|s| !s.is_terminal()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Direct,
    Group,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Group => write!(f, "group"),
        }
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            _ => anyhow::bail!("Unknown channel kind: {}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub kind: ChannelKind,
    pub members: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    pub fn direct(name: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            kind: ChannelKind::Direct,
            members,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    pub id: String,
    pub channel_id: String,
    pub sender: String,
    pub content: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl ChannelMessage {
    pub fn new(
        channel_id: impl Into<String>,
        sender: impl Into<String>,
        content: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            sender: sender.into(),
            content: content.into(),
            metadata,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMessageType {
    System,
    Assistant,
    ToolUse,
    ToolResult,
    Error,
    Result,
    /// Input sent through the session manager
    User,
}

impl SessionMessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::Error => "error",
            Self::Result => "result",
            Self::User => "user",
        }
    }
}

impl std::fmt::Display for SessionMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionMessageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "assistant" => Ok(Self::Assistant),
            "tool_use" => Ok(Self::ToolUse),
            "tool_result" => Ok(Self::ToolResult),
            "error" => Ok(Self::Error),
            "result" => Ok(Self::Result),
            "user" => Ok(Self::User),
            _ => anyhow::bail!("Unknown session message type: {}", s),
        }
    }
}

/// Persisted copy of one session message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub message_type: SessionMessageType,
    pub content: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_output: Option<String>,
    pub is_error: bool,
    pub created_at: DateTime<Utc>,
}

impl SessionMessage {
    fn blank(session_id: &str, agent_id: &str, message_type: SessionMessageType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            message_type,
            content: None,
            tool_name: None,
            tool_input: None,
            tool_output: None,
            is_error: false,
            created_at: Utc::now(),
        }
    }

    /// Tool messages get ids derived from the tool id so replays replace instead of duplicating
    pub fn from_agent_message(session_id: &str, agent_id: &str, msg: &AgentMessage) -> Self {
        match msg {
            AgentMessage::System {
                subtype, metadata, ..
            } => {
                let mut record = Self::blank(session_id, agent_id, SessionMessageType::System);
                record.content = Some(subtype.clone());
                record.tool_input = Some(metadata.clone()).filter(|m| !m.is_null());
                record
            }
            AgentMessage::Assistant { content } => {
                let mut record = Self::blank(session_id, agent_id, SessionMessageType::Assistant);
                record.content = Some(content.clone());
                record
            }
            AgentMessage::ToolUse { id, name, input } => {
                let mut record = Self::blank(session_id, agent_id, SessionMessageType::ToolUse);
                record.id = format!("{}:tool_use:{}", session_id, id);
                record.tool_name = Some(name.clone());
                record.tool_input = Some(input.clone());
                record
            }
            AgentMessage::ToolResult {
                id,
                content,
                is_error,
            } => {
                let mut record = Self::blank(session_id, agent_id, SessionMessageType::ToolResult);
                record.id = format!("{}:tool_result:{}", session_id, id);
                record.tool_output = Some(content.clone());
                record.is_error = *is_error;
                record
            }
            AgentMessage::Error { code, message } => {
                let mut record = Self::blank(session_id, agent_id, SessionMessageType::Error);
                record.content = Some(format!("{:?}: {}", code, message));
                record.is_error = true;
                record
            }
            AgentMessage::Result { subtype, text, .. } => {
                let mut record = Self::blank(session_id, agent_id, SessionMessageType::Result);
                record.content = text.clone();
                record.is_error = *subtype == drover_agent::ResultSubtype::Error;
                record
            }
        }
    }

    pub fn user(session_id: &str, agent_id: &str, text: &str) -> Self {
        let mut record = Self::blank(session_id, agent_id, SessionMessageType::User);
        record.content = Some(text.to_string());
        record
    }
}
