// ABOUTME: Provider traits: headless (message stream) and interactive (raw terminal) facets.
// ABOUTME: AgentProvider composes the facets a backend actually implements.

use crate::error::ProviderResult;
use crate::message::AgentMessage;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Stream of normalized messages from one session
pub type MessageStream = BoxStream<'static, AgentMessage>;

/// Options shared by both provider facets
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub working_directory: PathBuf,
    pub initial_prompt: Option<String>,
    /// Backend session id to continue instead of starting fresh
    pub resume_session_id: Option<String>,
    pub env: HashMap<String, String>,
}

impl SpawnOptions {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            ..Default::default()
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_prompt = Some(prompt.into());
        self
    }

    pub fn with_resume(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(session_id.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 120, rows: 40 }
    }
}

/// How a session is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Headless,
    Interactive,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Headless => write!(f, "headless"),
            Self::Interactive => write!(f, "interactive"),
        }
    }
}

/// Common surface of every provider facet
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name for logging and metrics
    fn name(&self) -> &str;

    /// Whether the backend is installed or reachable
    async fn is_available(&self) -> bool;
}

/// Backend driven by structured calls and events
#[async_trait]
pub trait HeadlessProvider: Provider {
    async fn spawn(&self, options: SpawnOptions) -> ProviderResult<Box<dyn HeadlessSession>>;
}

/// One running headless conversation
#[async_trait]
pub trait HeadlessSession: Send + Sync {
    /// Normalized messages; ends once the session is closed and drained
    fn messages(&self) -> MessageStream;

    /// Backend session id, once known
    fn session_id(&self) -> Option<String>;

    /// Start a new user turn
    async fn send_message(&self, text: &str) -> ProviderResult<()>;

    /// Best-effort request to stop generating
    async fn interrupt(&self) -> ProviderResult<()>;

    /// Release every resource the session holds. Safe to call repeatedly.
    async fn close(&self) -> ProviderResult<()>;
}

/// Exit report of an interactive process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<u32>,
    pub success: bool,
}

pub type DataListener = Box<dyn Fn(&[u8]) + Send + Sync>;
pub type ExitListener = Box<dyn Fn(ExitInfo) + Send + Sync>;

/// Backend driven by raw terminal input/output
#[async_trait]
pub trait InteractiveProvider: Provider {
    async fn spawn(
        &self,
        options: SpawnOptions,
        size: TerminalSize,
    ) -> ProviderResult<Box<dyn InteractiveSession>>;
}

/// One running terminal session
#[async_trait]
pub trait InteractiveSession: Send + Sync {
    /// Backend session id, once observed in the output
    fn session_id(&self) -> Option<String>;

    async fn write(&self, data: &[u8]) -> ProviderResult<()>;

    async fn resize(&self, size: TerminalSize) -> ProviderResult<()>;

    /// Kill the process. Safe to call repeatedly.
    async fn kill(&self) -> ProviderResult<()>;

    fn on_data(&self, listener: DataListener);

    /// Listeners registered after exit fire immediately
    fn on_exit(&self, listener: ExitListener);
}

/// A named backend and the facets it implements
#[derive(Clone)]
pub struct AgentProvider {
    name: String,
    headless: Option<Arc<dyn HeadlessProvider>>,
    interactive: Option<Arc<dyn InteractiveProvider>>,
}

impl AgentProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            headless: None,
            interactive: None,
        }
    }

    pub fn with_headless(mut self, provider: Arc<dyn HeadlessProvider>) -> Self {
        self.headless = Some(provider);
        self
    }

    pub fn with_interactive(mut self, provider: Arc<dyn InteractiveProvider>) -> Self {
        self.interactive = Some(provider);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn headless(&self) -> Option<Arc<dyn HeadlessProvider>> {
        self.headless.clone()
    }

    pub fn interactive(&self) -> Option<Arc<dyn InteractiveProvider>> {
        self.interactive.clone()
    }

    pub fn supports(&self, mode: SessionMode) -> bool {
        match mode {
            SessionMode::Headless => self.headless.is_some(),
            SessionMode::Interactive => self.interactive.is_some(),
        }
    }

    /// Modes this provider can run, headless first
    pub fn modes(&self) -> Vec<SessionMode> {
        [SessionMode::Headless, SessionMode::Interactive]
            .into_iter()
            .filter(|mode| self.supports(*mode))
            .collect()
    }

    /// Availability of the facet serving `mode`
    pub async fn is_available(&self, mode: SessionMode) -> bool {
        match mode {
            SessionMode::Headless => match &self.headless {
                Some(p) => p.is_available().await,
                None => false,
            },
            SessionMode::Interactive => match &self.interactive {
                Some(p) => p.is_available().await,
                None => false,
            },
        }
    }
}

impl std::fmt::Debug for AgentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentProvider")
            .field("name", &self.name)
            .field("modes", &self.modes())
            .finish()
    }
}
