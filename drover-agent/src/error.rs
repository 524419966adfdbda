// ABOUTME: Error taxonomy for provider spawn, resume and streaming failures.
// ABOUTME: Stream failures mid-session are surfaced as AgentMessage::Error instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Process or server failed to start
    #[error("failed to spawn {provider}: {reason}")]
    SpawnFailure { provider: String, reason: String },

    /// Backend not installed or not reachable
    #[error("provider '{0}' is not available")]
    Unavailable(String),

    /// Resume requested for a backend session id the backend does not know
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Backend event stream failed
    #[error("event stream failed: {0}")]
    Stream(String),

    /// A request against a running backend failed
    #[error("backend request failed: {0}")]
    Request(String),

    #[error("session is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    pub fn spawn(provider: impl Into<String>, reason: impl ToString) -> Self {
        Self::SpawnFailure {
            provider: provider.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;
