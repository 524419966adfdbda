// ABOUTME: Pluggable agent provider abstraction for drover.
// ABOUTME: Spawns headless and interactive backends and normalizes them into AgentMessages.

pub mod config;
pub mod error;
pub mod mapper;
pub mod message;
pub mod provider;
pub mod providers;
pub mod queue;
pub mod registry;

pub use error::{ProviderError, ProviderResult};
pub use mapper::{EventMapper, ServerEvent, ToolLedger, ToolPhase, ToolTransition};
pub use message::{AgentMessage, ErrorCode, ResultSubtype, Usage};
pub use provider::{
    AgentProvider, DataListener, ExitInfo, ExitListener, HeadlessProvider, HeadlessSession,
    InteractiveProvider, InteractiveSession, MessageStream, Provider, SessionMode, SpawnOptions,
    TerminalSize,
};
pub use queue::AsyncQueue;
pub use registry::{ProviderFactory, ProviderRegistry};
