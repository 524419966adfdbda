// ABOUTME: Store interface the engine reads and writes through, plus its SQLite implementation.
// ABOUTME: Single-record reads and writes only; the engine keeps no cached copies of records.

use crate::error::{DroverError, DroverResult};
use crate::types::{
    AgentEntity, Channel, ChannelMessage, NewTask, SessionMessage, Task, TaskFilter, TaskStatus,
    WorkerMode,
};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Records the engine depends on
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_task(&self, id: &str) -> DroverResult<Option<Task>>;

    async fn create_task(&self, task: NewTask) -> DroverResult<Task>;

    /// Replace a task record, bumping `updated_at`. Fails for unknown ids.
    async fn update_task(&self, task: &Task) -> DroverResult<Task>;

    async fn list_tasks(&self, filter: &TaskFilter) -> DroverResult<Vec<Task>>;

    async fn get_agent(&self, id: &str) -> DroverResult<Option<AgentEntity>>;

    async fn get_agent_by_name(&self, name: &str) -> DroverResult<Option<AgentEntity>>;

    /// Insert or replace an agent record
    async fn put_agent(&self, agent: &AgentEntity) -> DroverResult<()>;

    async fn list_agents(&self) -> DroverResult<Vec<AgentEntity>>;

    async fn create_channel(&self, channel: Channel) -> DroverResult<Channel>;

    async fn get_channel(&self, id: &str) -> DroverResult<Option<Channel>>;

    async fn post_message(&self, message: &ChannelMessage) -> DroverResult<()>;

    async fn list_messages(&self, channel_id: &str) -> DroverResult<Vec<ChannelMessage>>;

    /// Insert or replace by message id
    async fn save_session_message(&self, message: &SessionMessage) -> DroverResult<()>;

    /// An agent's transcript ordered by creation time; `limit` keeps the most recent
    async fn list_session_messages(
        &self,
        agent_id: &str,
        limit: Option<usize>,
    ) -> DroverResult<Vec<SessionMessage>>;
}

#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    role TEXT NOT NULL,
    worker_mode TEXT,
    capabilities TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    last_session_id TEXT,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    status TEXT NOT NULL,
    assignee TEXT,
    priority INTEGER NOT NULL,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON tasks(assignee);
CREATE TABLE IF NOT EXISTS channels (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    members TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS channel_messages (
    id TEXT PRIMARY KEY,
    channel_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_channel_messages_channel ON channel_messages(channel_id);
CREATE TABLE IF NOT EXISTS session_messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    type TEXT NOT NULL,
    content TEXT,
    tool_name TEXT,
    tool_input TEXT,
    tool_output TEXT,
    is_error INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_session_messages_agent ON session_messages(agent_id, created_at);
";

const AGENT_COLUMNS: &str = "id, name, role, worker_mode, capabilities, channel_id, provider, \
     last_session_id, created_by, created_at, updated_at";
const TASK_COLUMNS: &str = "id, title, status, assignee, priority, metadata, created_at, updated_at";
const SESSION_MESSAGE_COLUMNS: &str = "id, session_id, agent_id, type, content, tool_name, \
     tool_input, tool_output, is_error, created_at";

impl SqliteStore {
    /// Open (or create) the database file, creating parent directories
    pub fn open<P: AsRef<Path>>(db_path: P) -> DroverResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DroverError::Store(format!(
                    "Failed to create workspace directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        let conn = Connection::open(db_path)?;
        let store = Self::init(conn)?;
        tracing::info!(db = %db_path.display(), "Store initialized");
        Ok(store)
    }

    pub fn in_memory() -> DroverResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> DroverResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> DroverResult<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| DroverError::Store(format!("Database mutex poisoned: {}", e)))
    }
}

fn parse_col<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

fn json_col<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn agent_from_row(row: &Row) -> rusqlite::Result<AgentEntity> {
    let worker_mode: Option<String> = row.get(3)?;
    let worker_mode = worker_mode
        .map(|m| m.parse::<WorkerMode>())
        .transpose()
        .map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into())
        })?;
    Ok(AgentEntity {
        id: row.get(0)?,
        name: row.get(1)?,
        role: parse_col(row, 2)?,
        worker_mode,
        capabilities: json_col(row, 4)?,
        channel_id: row.get(5)?,
        provider: row.get(6)?,
        last_session_id: row.get(7)?,
        created_by: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        status: parse_col(row, 2)?,
        assignee: row.get(3)?,
        priority: row.get(4)?,
        metadata: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn channel_from_row(row: &Row) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: parse_col(row, 2)?,
        members: json_col(row, 3)?,
        created_at: row.get(4)?,
    })
}

fn channel_message_from_row(row: &Row) -> rusqlite::Result<ChannelMessage> {
    Ok(ChannelMessage {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        sender: row.get(2)?,
        content: row.get(3)?,
        metadata: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn session_message_from_row(row: &Row) -> rusqlite::Result<SessionMessage> {
    Ok(SessionMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        agent_id: row.get(2)?,
        message_type: parse_col(row, 3)?,
        content: row.get(4)?,
        tool_name: row.get(5)?,
        tool_input: row.get(6)?,
        tool_output: row.get(7)?,
        is_error: row.get::<_, i32>(8)? != 0,
        created_at: row.get(9)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_task(&self, id: &str) -> DroverResult<Option<Task>> {
        let db = self.conn()?;
        let task = db
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    async fn create_task(&self, new: NewTask) -> DroverResult<Task> {
        let now = Utc::now();
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            title: new.title,
            status: TaskStatus::Open,
            assignee: None,
            priority: new.priority,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };
        let db = self.conn()?;
        db.execute(
            &format!(
                "INSERT INTO tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                TASK_COLUMNS
            ),
            params![
                task.id,
                task.title,
                task.status.as_str(),
                task.assignee,
                task.priority,
                task.metadata,
                task.created_at,
                task.updated_at
            ],
        )?;
        Ok(task)
    }

    async fn update_task(&self, task: &Task) -> DroverResult<Task> {
        let mut updated = task.clone();
        updated.updated_at = Utc::now();
        let db = self.conn()?;
        let changed = db.execute(
            "UPDATE tasks SET title = ?2, status = ?3, assignee = ?4, priority = ?5, metadata = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                updated.id,
                updated.title,
                updated.status.as_str(),
                updated.assignee,
                updated.priority,
                updated.metadata,
                updated.updated_at
            ],
        )?;
        if changed == 0 {
            return Err(DroverError::TaskNotFound(task.id.clone()));
        }
        Ok(updated)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> DroverResult<Vec<Task>> {
        let mut sql = format!("SELECT {} FROM tasks WHERE 1 = 1", TASK_COLUMNS);
        let mut values: Vec<String> = Vec::new();

        if let Some(ref assignee) = filter.assignee {
            values.push(assignee.clone());
            sql.push_str(&format!(" AND assignee = ?{}", values.len()));
        }
        if filter.unassigned {
            sql.push_str(" AND assignee IS NULL");
        }
        if !filter.statuses.is_empty() {
            let placeholders: Vec<String> = filter
                .statuses
                .iter()
                .map(|status| {
                    values.push(status.as_str().to_string());
                    format!("?{}", values.len())
                })
                .collect();
            sql.push_str(&format!(" AND status IN ({})", placeholders.join(", ")));
        }
        sql.push_str(" ORDER BY priority ASC, created_at ASC");

        let db = self.conn()?;
        let mut stmt = db.prepare(&sql)?;
        let tasks = stmt
            .query_map(params_from_iter(values.iter()), task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    async fn get_agent(&self, id: &str) -> DroverResult<Option<AgentEntity>> {
        let db = self.conn()?;
        let agent = db
            .query_row(
                &format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS),
                params![id],
                agent_from_row,
            )
            .optional()?;
        Ok(agent)
    }

    async fn get_agent_by_name(&self, name: &str) -> DroverResult<Option<AgentEntity>> {
        let db = self.conn()?;
        let agent = db
            .query_row(
                &format!("SELECT {} FROM agents WHERE name = ?1", AGENT_COLUMNS),
                params![name],
                agent_from_row,
            )
            .optional()?;
        Ok(agent)
    }

    async fn put_agent(&self, agent: &AgentEntity) -> DroverResult<()> {
        let capabilities = serde_json::to_string(&agent.capabilities)?;
        let db = self.conn()?;
        db.execute(
            &format!(
                "INSERT OR REPLACE INTO agents ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                AGENT_COLUMNS
            ),
            params![
                agent.id,
                agent.name,
                agent.role.to_string(),
                agent.worker_mode.map(|m| m.to_string()),
                capabilities,
                agent.channel_id,
                agent.provider,
                agent.last_session_id,
                agent.created_by,
                agent.created_at,
                agent.updated_at
            ],
        )?;
        Ok(())
    }

    async fn list_agents(&self) -> DroverResult<Vec<AgentEntity>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM agents ORDER BY created_at ASC, name ASC",
            AGENT_COLUMNS
        ))?;
        let agents = stmt
            .query_map([], agent_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    async fn create_channel(&self, channel: Channel) -> DroverResult<Channel> {
        let members = serde_json::to_string(&channel.members)?;
        let db = self.conn()?;
        db.execute(
            "INSERT INTO channels (id, name, kind, members, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                channel.id,
                channel.name,
                channel.kind.to_string(),
                members,
                channel.created_at
            ],
        )?;
        Ok(channel)
    }

    async fn get_channel(&self, id: &str) -> DroverResult<Option<Channel>> {
        let db = self.conn()?;
        let channel = db
            .query_row(
                "SELECT id, name, kind, members, created_at FROM channels WHERE id = ?1",
                params![id],
                channel_from_row,
            )
            .optional()?;
        Ok(channel)
    }

    async fn post_message(&self, message: &ChannelMessage) -> DroverResult<()> {
        let db = self.conn()?;
        let exists: bool = db
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM channels WHERE id = ?1)",
                params![message.channel_id],
                |row| row.get(0),
            )?;
        if !exists {
            return Err(DroverError::ChannelNotFound(message.channel_id.clone()));
        }
        db.execute(
            "INSERT INTO channel_messages (id, channel_id, sender, content, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id,
                message.channel_id,
                message.sender,
                message.content,
                message.metadata,
                message.created_at
            ],
        )?;
        Ok(())
    }

    async fn list_messages(&self, channel_id: &str) -> DroverResult<Vec<ChannelMessage>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, channel_id, sender, content, metadata, created_at
             FROM channel_messages WHERE channel_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let messages = stmt
            .query_map(params![channel_id], channel_message_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    async fn save_session_message(&self, message: &SessionMessage) -> DroverResult<()> {
        let db = self.conn()?;
        db.execute(
            &format!(
                "INSERT OR REPLACE INTO session_messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                SESSION_MESSAGE_COLUMNS
            ),
            params![
                message.id,
                message.session_id,
                message.agent_id,
                message.message_type.as_str(),
                message.content,
                message.tool_name,
                message.tool_input,
                message.tool_output,
                message.is_error as i32,
                message.created_at
            ],
        )?;
        Ok(())
    }

    async fn list_session_messages(
        &self,
        agent_id: &str,
        limit: Option<usize>,
    ) -> DroverResult<Vec<SessionMessage>> {
        let db = self.conn()?;
        let messages = match limit {
            Some(limit) => {
                let mut stmt = db.prepare(&format!(
                    "SELECT {} FROM session_messages WHERE agent_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                    SESSION_MESSAGE_COLUMNS
                ))?;
                let mut newest = stmt
                    .query_map(params![agent_id, limit as i64], session_message_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                newest.reverse();
                newest
            }
            None => {
                let mut stmt = db.prepare(&format!(
                    "SELECT {} FROM session_messages WHERE agent_id = ?1
                     ORDER BY created_at ASC, rowid ASC",
                    SESSION_MESSAGE_COLUMNS
                ))?;
                let all = stmt
                    .query_map(params![agent_id], session_message_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                all
            }
        };
        Ok(messages)
    }
}
