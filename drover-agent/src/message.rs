// ABOUTME: Canonical AgentMessage union emitted by every provider.
// ABOUTME: Covers init, assistant text, tool lifecycle, errors and turn results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized message emitted to consumers regardless of backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Session-level notice; `subtype == "init"` opens every session
    System {
        subtype: String,
        /// Backend-assigned session id, when known
        session_id: Option<String>,
        #[serde(default)]
        metadata: Value,
    },

    /// Assistant text, possibly an incremental chunk
    Assistant { content: String },

    /// Tool invocation started
    ToolUse {
        /// Unique identifier for this tool invocation
        id: String,
        /// Tool name (e.g., "read", "bash", "edit")
        name: String,
        /// Full input passed to the tool
        input: Value,
    },

    /// Tool invocation finished
    ToolResult {
        /// Matches the id from ToolUse
        id: String,
        /// Tool output, or error text when `is_error`
        content: String,
        is_error: bool,
    },

    /// Error surfaced by the backend or by the event loop
    Error { code: ErrorCode, message: String },

    /// End of a turn
    Result {
        subtype: ResultSubtype,
        /// Final text, when the backend reports one
        text: Option<String>,
        /// Token usage and cost (if available)
        usage: Option<Usage>,
    },
}

impl AgentMessage {
    /// The init notice that opens a session
    pub fn init(session_id: impl Into<String>, metadata: Value) -> Self {
        Self::System {
            subtype: "init".to_string(),
            session_id: Some(session_id.into()),
            metadata,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    pub fn result(subtype: ResultSubtype) -> Self {
        Self::Result {
            subtype,
            text: None,
            usage: None,
        }
    }

    /// Wire name of the variant, also used as the persisted message type
    pub fn kind(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::Assistant { .. } => "assistant",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::Error { .. } => "error",
            Self::Result { .. } => "result",
        }
    }

    /// Tool invocation id for tool messages
    pub fn tool_id(&self) -> Option<&str> {
        match self {
            Self::ToolUse { id, .. } | Self::ToolResult { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Backend session id carried by a system init message
    pub fn init_session_id(&self) -> Option<&str> {
        match self {
            Self::System {
                subtype,
                session_id: Some(id),
                ..
            } if subtype == "init" => Some(id),
            _ => None,
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, Self::Result { .. })
    }
}

/// Typed error codes for programmatic handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Resumed session unknown to the backend
    SessionNotFound,
    /// Event loop lost its connection or pipe
    StreamError,
    /// Backend process exited abnormally
    ProcessExited,
    /// Backend-specific error
    BackendError,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultSubtype {
    Success,
    Error,
    Interrupted,
}

/// Token usage and cost tracking
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    /// Input tokens consumed
    pub input_tokens: u64,
    /// Output tokens generated
    pub output_tokens: u64,
    /// Tokens read from cache
    pub cache_read_tokens: Option<u64>,
    /// Tokens written to cache
    pub cache_write_tokens: Option<u64>,
    /// Total cost in USD
    pub cost_usd: Option<f64>,
}
