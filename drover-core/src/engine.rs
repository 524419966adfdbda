// ABOUTME: Engine facade wiring the store, agent registry, sessions, assignment and dispatch.
// ABOUTME: The single entry point the CLI and embedding hosts talk to.

use crate::agents::{AgentRegistry, RegisterAgent};
use crate::assignment::{AgentWorkload, TaskAssignmentService};
use crate::capability::{find_agents_for_task, AgentMatch, MatchOptions};
use crate::config::Config;
use crate::dispatch::{DispatchOptions, DispatchResult, DispatchService};
use crate::error::{DroverError, DroverResult};
use crate::sessions::{SessionFilter, SessionInfo, SessionManager, SessionOptions};
use crate::store::{SqliteStore, Store};
use crate::types::{
    AgentCapabilities, AgentEntity, AgentRole, ChannelMessage, NewTask, SessionMessage, Task,
    TaskFilter,
};
use anyhow::Context;
use drover_agent::{MessageStream, ProviderRegistry};
use std::path::PathBuf;
use std::sync::Arc;

pub struct Engine {
    store: Arc<dyn Store>,
    agents: AgentRegistry,
    assignment: TaskAssignmentService,
    sessions: Arc<SessionManager>,
    dispatch: DispatchService,
    providers: Arc<ProviderRegistry>,
}

/// Pieces an engine is assembled from
pub struct EngineParts {
    pub store: Arc<dyn Store>,
    pub providers: ProviderRegistry,
    pub default_provider: String,
    pub default_dispatcher: String,
    pub working_directory: PathBuf,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Self {
        let providers = Arc::new(parts.providers);
        let agents = AgentRegistry::new(Arc::clone(&parts.store), parts.default_provider);
        let assignment = TaskAssignmentService::new(Arc::clone(&parts.store));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&parts.store),
            agents.clone(),
            Arc::clone(&providers),
            parts.working_directory,
        ));
        let dispatch = DispatchService::new(
            Arc::clone(&parts.store),
            agents.clone(),
            assignment.clone(),
            parts.default_dispatcher,
        )
        .with_sessions(Arc::clone(&sessions));

        Self {
            store: parts.store,
            agents,
            assignment,
            sessions,
            dispatch,
            providers,
        }
    }

    /// Open the workspace database and build every configured provider
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        let store = SqliteStore::open(&config.database_path())
            .with_context(|| format!("Failed to open {}", config.database_path().display()))?;
        let mut providers = ProviderRegistry::default();
        providers.load(&config.providers)?;
        let working_directory =
            std::env::current_dir().context("Failed to read current directory")?;

        Ok(Self::new(EngineParts {
            store: Arc::new(store),
            providers,
            default_provider: config.workspace.default_provider.clone(),
            default_dispatcher: config.dispatch.default_dispatcher.clone(),
            working_directory,
        }))
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    // Agents

    pub async fn register_agent(&self, request: RegisterAgent) -> DroverResult<AgentEntity> {
        self.agents.register_agent(request).await
    }

    pub async fn get_agent(&self, id: &str) -> DroverResult<Option<AgentEntity>> {
        self.agents.get_agent(id).await
    }

    pub async fn get_agent_by_name(&self, name: &str) -> DroverResult<Option<AgentEntity>> {
        self.agents.get_agent_by_name(name).await
    }

    /// Id or name
    pub async fn resolve_agent(&self, id_or_name: &str) -> DroverResult<AgentEntity> {
        self.agents.require_agent(id_or_name).await
    }

    pub async fn get_agents_by_role(&self, role: AgentRole) -> DroverResult<Vec<AgentEntity>> {
        self.agents.get_agents_by_role(role).await
    }

    pub async fn list_agents(&self) -> DroverResult<Vec<AgentEntity>> {
        self.agents.list_agents().await
    }

    pub async fn update_agent_capabilities(
        &self,
        id: &str,
        capabilities: AgentCapabilities,
    ) -> DroverResult<AgentEntity> {
        self.agents.update_agent_capabilities(id, capabilities).await
    }

    // Tasks

    pub async fn create_task(&self, task: NewTask) -> DroverResult<Task> {
        let task = self.store.create_task(task).await?;
        tracing::info!(task_id = %task.id, title = %task.title, "Task created");
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> DroverResult<Option<Task>> {
        self.store.get_task(id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> DroverResult<Vec<Task>> {
        self.store.list_tasks(filter).await
    }

    pub async fn channel_messages(&self, channel_id: &str) -> DroverResult<Vec<ChannelMessage>> {
        self.store.list_messages(channel_id).await
    }

    // Sessions

    /// Resume when a session id is given, otherwise spawn (or reuse the live session)
    pub async fn spawn_or_resume_session(
        &self,
        agent_id: &str,
        options: SessionOptions,
    ) -> DroverResult<SessionInfo> {
        if options.resume_session_id.is_some() {
            self.sessions.resume(agent_id, options).await
        } else {
            self.sessions.spawn(agent_id, options).await
        }
    }

    /// Resume the agent's last backend session
    pub async fn resume_session(
        &self,
        agent_id: &str,
        options: SessionOptions,
    ) -> DroverResult<SessionInfo> {
        self.sessions.resume(agent_id, options).await
    }

    pub async fn send_message(&self, agent_id: &str, text: &str) -> DroverResult<()> {
        self.sessions.send_message(agent_id, text).await
    }

    pub async fn interrupt(&self, agent_id: &str) -> DroverResult<()> {
        self.sessions.interrupt(agent_id).await
    }

    pub async fn close_session(&self, agent_id: &str) -> DroverResult<()> {
        self.sessions.close(agent_id).await
    }

    pub fn session_messages(&self, agent_id: &str) -> Option<MessageStream> {
        self.sessions.messages(agent_id)
    }

    pub fn get_active_session(&self, agent_id: &str) -> Option<SessionInfo> {
        self.sessions.get_active_session(agent_id)
    }

    pub fn list_sessions(&self, filter: &SessionFilter) -> Vec<SessionInfo> {
        self.sessions.list_sessions(filter)
    }

    pub async fn get_session_history(
        &self,
        agent_id: &str,
        limit: Option<usize>,
    ) -> DroverResult<Vec<SessionMessage>> {
        self.sessions.get_session_history(agent_id, limit).await
    }

    // Matching and assignment

    pub async fn find_agents_for_task(
        &self,
        task_id: &str,
        options: &MatchOptions,
    ) -> DroverResult<Vec<AgentMatch>> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| DroverError::TaskNotFound(task_id.to_string()))?;
        let agents = self.agents.list_agents().await?;
        Ok(find_agents_for_task(&agents, &task, options))
    }

    pub async fn assign_to_agent(&self, task_id: &str, agent_id: &str) -> DroverResult<Task> {
        self.assignment.assign_to_agent(task_id, agent_id).await
    }

    pub async fn unassign_task(&self, task_id: &str) -> DroverResult<Task> {
        self.assignment.unassign_task(task_id).await
    }

    pub async fn get_agent_tasks(&self, agent_id: &str) -> DroverResult<Vec<Task>> {
        self.assignment.get_agent_tasks(agent_id).await
    }

    pub async fn get_agent_workload(&self, agent_id: &str) -> DroverResult<AgentWorkload> {
        self.assignment.get_agent_workload(agent_id).await
    }

    pub async fn agent_has_capacity(&self, agent_id: &str) -> DroverResult<bool> {
        let agent = self
            .agents
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| DroverError::AgentNotFound(agent_id.to_string()))?;
        self.assignment.agent_has_capacity(&agent).await
    }

    pub async fn get_unassigned_tasks(&self) -> DroverResult<Vec<Task>> {
        self.assignment.get_unassigned_tasks().await
    }

    // Dispatch

    pub async fn dispatch(
        &self,
        task_id: &str,
        agent_id: &str,
        options: DispatchOptions,
    ) -> DroverResult<DispatchResult> {
        self.dispatch.dispatch(task_id, agent_id, options).await
    }

    pub async fn smart_dispatch(
        &self,
        task_id: &str,
        options: DispatchOptions,
    ) -> DroverResult<DispatchResult> {
        self.dispatch.smart_dispatch(task_id, options).await
    }

    pub async fn get_candidates(&self, task_id: &str) -> DroverResult<Vec<AgentMatch>> {
        self.dispatch.get_candidates(task_id).await
    }

    /// Close every live session
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }
}
