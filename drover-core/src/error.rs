// ABOUTME: Error type for the orchestration engine.
// ABOUTME: Store, lookup, assignment and provider failures in one typed enum.

use drover_agent::ProviderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DroverError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("invalid agent: {0}")]
    InvalidAgent(String),

    /// The store refused an assignment change
    #[error("assignment failed: {0}")]
    Assignment(String),

    #[error("no eligible agent for task {0}")]
    NoEligibleAgent(String),

    #[error("no active session for agent {0}")]
    NoActiveSession(String),

    #[error("no session to resume for agent {0}")]
    NoResumableSession(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("store error: {0}")]
    Store(String),
}

impl From<rusqlite::Error> for DroverError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for DroverError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(format!("serialization: {}", err))
    }
}

pub type DroverResult<T> = Result<T, DroverError>;
