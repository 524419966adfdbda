// ABOUTME: Orchestration engine for AI coding agents
// ABOUTME: Agent registry, capability matching, sessions, task assignment and dispatch

pub mod agents;
pub mod assignment;
pub mod capability;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod paths;
pub mod sessions;
pub mod store;
pub mod types;

pub use agents::{AgentRegistry, RegisterAgent};
pub use assignment::{AgentWorkload, TaskAssignmentService};
pub use capability::{
    match_capabilities, AgentMatch, CapabilityMatchResult, MatchOptions,
    TaskCapabilityRequirements,
};
pub use config::Config;
pub use dispatch::{DispatchOptions, DispatchResult, DispatchService};
pub use engine::{Engine, EngineParts};
pub use error::{DroverError, DroverResult};
pub use sessions::{SessionFilter, SessionInfo, SessionManager, SessionOptions, SessionStatus};
pub use store::{SqliteStore, Store};
pub use types::*;

// Re-export provider types hosts need alongside the engine
pub use drover_agent::{AgentMessage, ProviderRegistry, SessionMode};
