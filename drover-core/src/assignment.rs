// ABOUTME: Task assignment service - assigns tasks to agents and reports workload and capacity.
// ABOUTME: Assignment is not capacity-gated; callers check capacity when they care.

use crate::error::{DroverError, DroverResult};
use crate::store::Store;
use crate::types::{AgentEntity, Task, TaskFilter, TaskStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Non-terminal tasks held by one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentWorkload {
    pub agent_id: String,
    pub total_tasks: usize,
    pub by_status: BTreeMap<TaskStatus, usize>,
}

#[derive(Clone)]
pub struct TaskAssignmentService {
    store: Arc<dyn Store>,
}

impl TaskAssignmentService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    async fn require_task(&self, task_id: &str) -> DroverResult<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| DroverError::TaskNotFound(task_id.to_string()))
    }

    pub async fn assign_to_agent(&self, task_id: &str, agent_id: &str) -> DroverResult<Task> {
        let mut task = self.require_task(task_id).await?;
        if self.store.get_agent(agent_id).await?.is_none() {
            return Err(DroverError::AgentNotFound(agent_id.to_string()));
        }
        if task.status.is_terminal() {
            return Err(DroverError::Assignment(format!(
                "task {} is {}",
                task_id, task.status
            )));
        }
        if task.assignee.as_deref() == Some(agent_id) {
            return Ok(task);
        }

        task.assignee = Some(agent_id.to_string());
        let task = self.store.update_task(&task).await?;
        tracing::info!(task_id = %task_id, agent_id = %agent_id, "Task assigned");
        Ok(task)
    }

    pub async fn unassign_task(&self, task_id: &str) -> DroverResult<Task> {
        let mut task = self.require_task(task_id).await?;
        let Some(previous) = task.assignee.take() else {
            return Ok(task);
        };
        let task = self.store.update_task(&task).await?;
        tracing::info!(task_id = %task_id, agent_id = %previous, "Task unassigned");
        Ok(task)
    }

    /// Every task assigned to the agent, terminal ones included
    pub async fn get_agent_tasks(&self, agent_id: &str) -> DroverResult<Vec<Task>> {
        self.store.list_tasks(&TaskFilter::assigned_to(agent_id)).await
    }

    pub async fn get_agent_workload(&self, agent_id: &str) -> DroverResult<AgentWorkload> {
        let tasks = self
            .store
            .list_tasks(&TaskFilter::assigned_to(agent_id).active())
            .await?;

        let mut by_status = BTreeMap::new();
        for task in &tasks {
            *by_status.entry(task.status).or_insert(0) += 1;
        }

        Ok(AgentWorkload {
            agent_id: agent_id.to_string(),
            total_tasks: tasks.len(),
            by_status,
        })
    }

    pub async fn agent_has_capacity(&self, agent: &AgentEntity) -> DroverResult<bool> {
        let workload = self.get_agent_workload(&agent.id).await?;
        Ok(workload.total_tasks < agent.capabilities.max_concurrent_tasks as usize)
    }

    /// Unassigned tasks that still need doing, highest priority first
    pub async fn get_unassigned_tasks(&self) -> DroverResult<Vec<Task>> {
        self.store
            .list_tasks(&TaskFilter::unassigned().active())
            .await
    }
}
