// ABOUTME: Dispatch service - assigns a task to an agent and notifies it on its direct channel.
// ABOUTME: Smart dispatch picks the best-matching worker that still has capacity.

use crate::agents::AgentRegistry;
use crate::assignment::TaskAssignmentService;
use crate::capability::{find_agents_for_task, AgentMatch, MatchOptions};
use crate::error::{DroverError, DroverResult};
use crate::metrics;
use crate::sessions::{SessionInfo, SessionManager, SessionOptions};
use crate::store::Store;
use crate::types::{AgentEntity, AgentRole, Channel, ChannelMessage, Task};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

/// Metadata `type` of dispatch notifications
pub const DISPATCH_MESSAGE_TYPE: &str = "task_dispatch";

#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Priority announced in the notification; the task's own when unset
    pub priority: Option<u8>,
    /// Sender of the notification; the configured dispatcher when unset
    pub dispatched_by: Option<String>,
    /// Start (or reuse) the agent's session with the task as its prompt
    pub start_session: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResult {
    pub task: Task,
    pub agent: AgentEntity,
    pub is_new_assignment: bool,
    pub notification: ChannelMessage,
    pub channel: Channel,
    pub session: Option<SessionInfo>,
}

pub struct DispatchService {
    store: Arc<dyn Store>,
    agents: AgentRegistry,
    assignment: TaskAssignmentService,
    sessions: Option<Arc<SessionManager>>,
    default_dispatcher: String,
}

impl DispatchService {
    pub fn new(
        store: Arc<dyn Store>,
        agents: AgentRegistry,
        assignment: TaskAssignmentService,
        default_dispatcher: impl Into<String>,
    ) -> Self {
        Self {
            store,
            agents,
            assignment,
            sessions: None,
            default_dispatcher: default_dispatcher.into(),
        }
    }

    /// Enable `start_session` dispatches
    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub async fn dispatch(
        &self,
        task_id: &str,
        agent_id: &str,
        options: DispatchOptions,
    ) -> DroverResult<DispatchResult> {
        let agent = self
            .agents
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| DroverError::AgentNotFound(agent_id.to_string()))?;
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| DroverError::TaskNotFound(task_id.to_string()))?;

        let is_new_assignment = task.assignee.as_deref() != Some(agent.id.as_str());
        let task = if is_new_assignment {
            self.assignment.assign_to_agent(&task.id, &agent.id).await?
        } else {
            task
        };

        let (agent, channel) = self.agent_channel(agent).await?;

        let priority = options.priority.unwrap_or(task.priority);
        let dispatched_by = options
            .dispatched_by
            .unwrap_or_else(|| self.default_dispatcher.clone());
        let notification = ChannelMessage::new(
            &channel.id,
            &dispatched_by,
            format!(
                "Task dispatched: {} ({})\nPriority: {}",
                task.title, task.id, priority
            ),
            json!({
                "type": DISPATCH_MESSAGE_TYPE,
                "taskId": task.id,
                "priority": priority,
                "isNewAssignment": is_new_assignment,
                "dispatchedBy": dispatched_by,
            }),
        );
        self.store.post_message(&notification).await?;

        let session = if options.start_session {
            self.start_session(&agent, &task).await
        } else {
            None
        };

        metrics::record_dispatch(&agent.id, is_new_assignment);
        tracing::info!(
            task_id = %task.id,
            agent_id = %agent.id,
            is_new_assignment,
            priority,
            "Task dispatched"
        );

        Ok(DispatchResult {
            task,
            agent,
            is_new_assignment,
            notification,
            channel,
            session,
        })
    }

    /// The agent's direct channel; created and recorded only when missing
    async fn agent_channel(&self, agent: AgentEntity) -> DroverResult<(AgentEntity, Channel)> {
        if let Some(channel) = self.store.get_channel(&agent.channel_id).await? {
            return Ok((agent, channel));
        }
        tracing::warn!(
            agent_id = %agent.id,
            channel_id = %agent.channel_id,
            "Agent channel missing, recreating"
        );
        let channel = self
            .store
            .create_channel(Channel::direct(
                format!("agent-{}", agent.name),
                vec![agent.id.clone(), self.default_dispatcher.clone()],
            ))
            .await?;
        let agent = self.agents.record_channel(&agent.id, &channel.id).await?;
        Ok((agent, channel))
    }

    /// Session failures are logged; the assignment and notification stand
    async fn start_session(&self, agent: &AgentEntity, task: &Task) -> Option<SessionInfo> {
        let sessions = self.sessions.as_ref()?;
        let prompt = format!("You have been assigned task {}: {}", task.id, task.title);
        let live = sessions.get_active_session(&agent.id);
        let result = match live {
            Some(_) => sessions
                .send_message(&agent.id, &prompt)
                .await
                .map(|_| sessions.get_active_session(&agent.id)),
            None => sessions
                .spawn(&agent.id, SessionOptions::default().with_prompt(prompt))
                .await
                .map(Some),
        };
        match result {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(
                    agent_id = %agent.id,
                    task_id = %task.id,
                    error = %e,
                    "Failed to start session for dispatched task"
                );
                None
            }
        }
    }

    /// Workers with spare capacity ranked by capability match
    pub async fn get_candidates(&self, task_id: &str) -> DroverResult<Vec<AgentMatch>> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| DroverError::TaskNotFound(task_id.to_string()))?;

        let mut available = Vec::new();
        for agent in self.agents.get_agents_by_role(AgentRole::Worker).await? {
            if self.assignment.agent_has_capacity(&agent).await? {
                available.push(agent);
            }
        }
        Ok(find_agents_for_task(
            &available,
            &task,
            &MatchOptions::default(),
        ))
    }

    pub async fn smart_dispatch(
        &self,
        task_id: &str,
        options: DispatchOptions,
    ) -> DroverResult<DispatchResult> {
        let best = self
            .get_candidates(task_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DroverError::NoEligibleAgent(task_id.to_string()))?;
        tracing::debug!(
            task_id = %task_id,
            agent_id = %best.agent.id,
            score = best.result.score,
            "Smart dispatch selected agent"
        );
        self.dispatch(task_id, &best.agent.id, options).await
    }
}
