// ABOUTME: Agent registry - registers agents with a direct channel and answers lookups.
// ABOUTME: All reads go straight to the store; nothing is cached here.

use crate::capability::validate_capabilities;
use crate::error::{DroverError, DroverResult};
use crate::store::Store;
use crate::types::{AgentCapabilities, AgentEntity, AgentRole, Channel, WorkerMode};
use chrono::Utc;
use std::sync::Arc;

/// Fields for registering an agent
#[derive(Debug, Clone)]
pub struct RegisterAgent {
    pub name: String,
    pub role: AgentRole,
    pub worker_mode: Option<WorkerMode>,
    pub capabilities: AgentCapabilities,
    /// Provider name; the registry default when unset
    pub provider: Option<String>,
    pub created_by: String,
}

impl RegisterAgent {
    pub fn new(name: impl Into<String>, role: AgentRole) -> Self {
        Self {
            name: name.into(),
            role,
            worker_mode: None,
            capabilities: AgentCapabilities::default(),
            provider: None,
            created_by: "system".to_string(),
        }
    }

    pub fn worker(name: impl Into<String>, mode: WorkerMode) -> Self {
        let mut request = Self::new(name, AgentRole::Worker);
        request.worker_mode = Some(mode);
        request
    }

    pub fn with_capabilities(mut self, capabilities: AgentCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn created_by(mut self, creator: impl Into<String>) -> Self {
        self.created_by = creator.into();
        self
    }
}

#[derive(Clone)]
pub struct AgentRegistry {
    store: Arc<dyn Store>,
    default_provider: String,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn Store>, default_provider: impl Into<String>) -> Self {
        Self {
            store,
            default_provider: default_provider.into(),
        }
    }

    pub async fn register_agent(&self, request: RegisterAgent) -> DroverResult<AgentEntity> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(DroverError::InvalidAgent("name must not be empty".to_string()));
        }
        validate_capabilities(&request.capabilities)?;
        if self.store.get_agent_by_name(&name).await?.is_some() {
            return Err(DroverError::InvalidAgent(format!(
                "an agent named '{}' already exists",
                name
            )));
        }

        // Worker mode only means something for workers
        let worker_mode = match request.role {
            AgentRole::Worker => Some(request.worker_mode.unwrap_or(WorkerMode::Ephemeral)),
            AgentRole::Director | AgentRole::Steward => None,
        };

        let id = uuid::Uuid::new_v4().to_string();
        let channel = self
            .store
            .create_channel(Channel::direct(
                format!("agent-{}", name),
                vec![id.clone(), request.created_by.clone()],
            ))
            .await?;

        let now = Utc::now();
        let agent = AgentEntity {
            id,
            name,
            role: request.role,
            worker_mode,
            capabilities: request.capabilities,
            channel_id: channel.id,
            provider: request
                .provider
                .unwrap_or_else(|| self.default_provider.clone()),
            last_session_id: None,
            created_by: request.created_by,
            created_at: now,
            updated_at: now,
        };
        self.store.put_agent(&agent).await?;

        tracing::info!(
            agent_id = %agent.id,
            name = %agent.name,
            role = %agent.role,
            provider = %agent.provider,
            "Agent registered"
        );
        Ok(agent)
    }

    pub async fn get_agent(&self, id: &str) -> DroverResult<Option<AgentEntity>> {
        self.store.get_agent(id).await
    }

    pub async fn get_agent_by_name(&self, name: &str) -> DroverResult<Option<AgentEntity>> {
        self.store.get_agent_by_name(name).await
    }

    /// Look an agent up by id, falling back to its name
    pub async fn require_agent(&self, id_or_name: &str) -> DroverResult<AgentEntity> {
        if let Some(agent) = self.store.get_agent(id_or_name).await? {
            return Ok(agent);
        }
        self.store
            .get_agent_by_name(id_or_name)
            .await?
            .ok_or_else(|| DroverError::AgentNotFound(id_or_name.to_string()))
    }

    pub async fn list_agents(&self) -> DroverResult<Vec<AgentEntity>> {
        self.store.list_agents().await
    }

    pub async fn get_agents_by_role(&self, role: AgentRole) -> DroverResult<Vec<AgentEntity>> {
        Ok(self
            .store
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.role == role)
            .collect())
    }

    pub async fn update_agent_capabilities(
        &self,
        id: &str,
        capabilities: AgentCapabilities,
    ) -> DroverResult<AgentEntity> {
        validate_capabilities(&capabilities)?;
        let mut agent = self
            .store
            .get_agent(id)
            .await?
            .ok_or_else(|| DroverError::AgentNotFound(id.to_string()))?;
        agent.capabilities = capabilities;
        agent.updated_at = Utc::now();
        self.store.put_agent(&agent).await?;
        tracing::debug!(agent_id = %id, "Agent capabilities updated");
        Ok(agent)
    }

    /// Remember the backend session id so a later resume can pick it up
    pub async fn record_session_id(&self, id: &str, session_id: &str) -> DroverResult<()> {
        let mut agent = self
            .store
            .get_agent(id)
            .await?
            .ok_or_else(|| DroverError::AgentNotFound(id.to_string()))?;
        if agent.last_session_id.as_deref() == Some(session_id) {
            return Ok(());
        }
        agent.last_session_id = Some(session_id.to_string());
        agent.updated_at = Utc::now();
        self.store.put_agent(&agent).await
    }

    /// Point an agent at a new direct channel
    pub async fn record_channel(&self, id: &str, channel_id: &str) -> DroverResult<AgentEntity> {
        let mut agent = self
            .store
            .get_agent(id)
            .await?
            .ok_or_else(|| DroverError::AgentNotFound(id.to_string()))?;
        agent.channel_id = channel_id.to_string();
        agent.updated_at = Utc::now();
        self.store.put_agent(&agent).await?;
        Ok(agent)
    }
}
