// ABOUTME: Session manager - one live provider session per agent, spawned, resumed and closed here.
// ABOUTME: Headless messages are persisted to the store before being handed to consumers.

use crate::agents::AgentRegistry;
use crate::error::{DroverError, DroverResult};
use crate::metrics;
use crate::store::Store;
use crate::types::{AgentEntity, SessionMessage};
use chrono::{DateTime, Utc};
use drover_agent::{
    AgentMessage, AsyncQueue, DataListener, ErrorCode, HeadlessSession, InteractiveSession,
    MessageStream, ProviderError, ProviderRegistry, SessionMode, SpawnOptions, TerminalSize,
};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Poll interval while waiting for an interactive session to reveal its backend id
const SESSION_ID_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Spawning,
    Running,
    Closed,
    Errored,
}

impl SessionStatus {
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Spawning | Self::Running)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawning => write!(f, "spawning"),
            Self::Running => write!(f, "running"),
            Self::Closed => write!(f, "closed"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Per-call spawn settings; unset fields fall back to the agent and manager defaults
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub working_directory: Option<PathBuf>,
    pub initial_prompt: Option<String>,
    pub resume_session_id: Option<String>,
    /// Overrides the mode derived from the agent's role
    pub mode: Option<SessionMode>,
    pub env: HashMap<String, String>,
    pub size: TerminalSize,
}

impl SessionOptions {
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_prompt = Some(prompt.into());
        self
    }

    pub fn with_mode(mut self, mode: SessionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_resume(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(session_id.into());
        self
    }

    pub fn in_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

#[derive(Clone)]
pub enum SessionHandle {
    Headless(Arc<dyn HeadlessSession>),
    Interactive(Arc<dyn InteractiveSession>),
}

impl SessionHandle {
    fn backend_session_id(&self) -> Option<String> {
        match self {
            Self::Headless(h) => h.session_id(),
            Self::Interactive(i) => i.session_id(),
        }
    }
}

/// Snapshot of a managed session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub agent_id: String,
    pub provider: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub provider_session_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub agent_id: Option<String>,
    pub status: Option<SessionStatus>,
}

struct ManagedSession {
    id: String,
    agent_id: String,
    provider: String,
    mode: SessionMode,
    handle: SessionHandle,
    status: Mutex<SessionStatus>,
    provider_session_id: Mutex<Option<String>>,
    /// Persisted messages, re-published to consumers
    outbound: AsyncQueue<AgentMessage>,
    ended: AtomicBool,
    started_at: DateTime<Utc>,
}

impl ManagedSession {
    fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_alive(&self) -> bool {
        self.status().is_alive()
    }

    fn mark_running(&self) {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *status == SessionStatus::Spawning {
            *status = SessionStatus::Running;
        }
    }

    /// Move to a terminal status once; later calls are ignored
    fn finish(&self, status: SessionStatus) -> bool {
        if self.ended.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
        self.outbound.close();
        metrics::record_session_ended();
        tracing::info!(
            session_id = %self.id,
            agent_id = %self.agent_id,
            status = %status,
            "Session ended"
        );
        true
    }

    fn provider_session_id(&self) -> Option<String> {
        self.provider_session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .or_else(|| self.handle.backend_session_id())
    }

    fn set_provider_session_id(&self, id: &str) {
        *self
            .provider_session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
    }

    /// Transcript key: backend id when known so resumed sessions share one transcript
    fn transcript_id(&self) -> String {
        self.provider_session_id().unwrap_or_else(|| self.id.clone())
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            agent_id: self.agent_id.clone(),
            provider: self.provider.clone(),
            mode: self.mode,
            status: self.status(),
            provider_session_id: self.provider_session_id(),
            started_at: self.started_at,
        }
    }
}

pub struct SessionManager {
    store: Arc<dyn Store>,
    agents: AgentRegistry,
    providers: Arc<ProviderRegistry>,
    default_working_directory: PathBuf,
    /// Live session per agent id
    active: Mutex<HashMap<String, Arc<ManagedSession>>>,
    /// Latest session of each agent, by session id
    sessions: Mutex<HashMap<String, Arc<ManagedSession>>>,
    /// Serializes spawns per agent id
    spawn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn Store>,
        agents: AgentRegistry,
        providers: Arc<ProviderRegistry>,
        default_working_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            agents,
            providers,
            default_working_directory: default_working_directory.into(),
            active: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            spawn_locks: Mutex::new(HashMap::new()),
        }
    }

    fn active_session(&self, agent_id: &str) -> Option<Arc<ManagedSession>> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
    }

    fn require_active(&self, agent_id: &str) -> DroverResult<Arc<ManagedSession>> {
        self.active_session(agent_id)
            .filter(|s| s.is_alive())
            .ok_or_else(|| DroverError::NoActiveSession(agent_id.to_string()))
    }

    fn spawn_lock(&self, agent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.spawn_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(agent_id.to_string()).or_default())
    }

    /// Return the agent's live session, or start one
    pub async fn spawn(
        &self,
        agent_id: &str,
        options: SessionOptions,
    ) -> DroverResult<SessionInfo> {
        let lock = self.spawn_lock(agent_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.active_session(agent_id) {
            if existing.is_alive() {
                tracing::debug!(
                    agent_id = %agent_id,
                    session_id = %existing.id,
                    "Reusing live session"
                );
                return Ok(existing.info());
            }
            // Ended on its own; release whatever the provider still holds
            if let Err(e) = close_managed(&existing).await {
                tracing::warn!(agent_id = %agent_id, error = %e, "Failed to close ended session");
            }
            self.active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(agent_id);
        }

        let agent = self
            .agents
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| DroverError::AgentNotFound(agent_id.to_string()))?;
        let managed = self.start(&agent, options).await?;
        let info = managed.info();

        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent.id.clone(), Arc::clone(&managed));
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        // Only the newest session of an agent stays listed
        sessions.retain(|_, s| s.agent_id != agent.id || s.is_alive());
        sessions.insert(managed.id.clone(), managed);
        Ok(info)
    }

    /// Continue a previous backend session, defaulting to the agent's last one
    pub async fn resume(
        &self,
        agent_id: &str,
        mut options: SessionOptions,
    ) -> DroverResult<SessionInfo> {
        if options.resume_session_id.is_none() {
            let agent = self
                .agents
                .get_agent(agent_id)
                .await?
                .ok_or_else(|| DroverError::AgentNotFound(agent_id.to_string()))?;
            options.resume_session_id = Some(
                agent
                    .last_session_id
                    .ok_or_else(|| DroverError::NoResumableSession(agent_id.to_string()))?,
            );
        }
        self.spawn(agent_id, options).await
    }

    async fn start(
        &self,
        agent: &AgentEntity,
        options: SessionOptions,
    ) -> DroverResult<Arc<ManagedSession>> {
        let provider = self
            .providers
            .get(&agent.provider)
            .ok_or_else(|| ProviderError::Unavailable(agent.provider.clone()))?;
        let mode = options.mode.unwrap_or_else(|| agent.session_mode());
        if !provider.supports(mode) {
            return Err(ProviderError::Unavailable(format!(
                "{} has no {} mode",
                agent.provider, mode
            ))
            .into());
        }
        if !provider.is_available(mode).await {
            return Err(ProviderError::Unavailable(agent.provider.clone()).into());
        }

        let spawn_options = SpawnOptions {
            working_directory: options
                .working_directory
                .unwrap_or_else(|| self.default_working_directory.clone()),
            initial_prompt: options.initial_prompt,
            resume_session_id: options.resume_session_id,
            env: options.env,
        };
        tracing::info!(
            agent_id = %agent.id,
            provider = %agent.provider,
            mode = %mode,
            resume = ?spawn_options.resume_session_id,
            "Spawning session"
        );

        let spawned = match mode {
            SessionMode::Headless => match provider.headless() {
                Some(p) => p
                    .spawn(spawn_options)
                    .await
                    .map(|s| SessionHandle::Headless(Arc::from(s))),
                None => Err(ProviderError::Unavailable(agent.provider.clone())),
            },
            SessionMode::Interactive => match provider.interactive() {
                Some(p) => p
                    .spawn(spawn_options, options.size)
                    .await
                    .map(|s| SessionHandle::Interactive(Arc::from(s))),
                None => Err(ProviderError::Unavailable(agent.provider.clone())),
            },
        };
        let handle = spawned.inspect_err(|e| {
            metrics::record_spawn_failure(&agent.provider);
            tracing::warn!(agent_id = %agent.id, error = %e, "Session spawn failed");
        })?;

        let managed = Arc::new(ManagedSession {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent.id.clone(),
            provider: agent.provider.clone(),
            mode,
            handle: handle.clone(),
            status: Mutex::new(SessionStatus::Spawning),
            provider_session_id: Mutex::new(None),
            outbound: AsyncQueue::new(),
            ended: AtomicBool::new(false),
            started_at: Utc::now(),
        });
        metrics::record_session_spawned(&agent.provider, &mode.to_string());

        match handle {
            SessionHandle::Headless(session) => {
                tokio::spawn(pump_headless(
                    Arc::clone(&managed),
                    session.messages(),
                    Arc::clone(&self.store),
                    self.agents.clone(),
                ));
            }
            SessionHandle::Interactive(session) => {
                managed.mark_running();
                let weak = Arc::downgrade(&managed);
                session.on_exit(Box::new(move |exit| {
                    if let Some(managed) = weak.upgrade() {
                        let status = if exit.success {
                            SessionStatus::Closed
                        } else {
                            SessionStatus::Errored
                        };
                        managed.finish(status);
                    }
                }));
                tokio::spawn(watch_interactive_session_id(
                    Arc::clone(&managed),
                    self.agents.clone(),
                ));
            }
        }

        Ok(managed)
    }

    pub async fn send_message(&self, agent_id: &str, text: &str) -> DroverResult<()> {
        let session = self.require_active(agent_id)?;

        // Recorded first so the transcript shows the input ahead of its replies
        let record = SessionMessage::user(&session.transcript_id(), agent_id, text);
        if let Err(e) = self.store.save_session_message(&record).await {
            metrics::record_persist_failure();
            tracing::warn!(agent_id = %agent_id, error = %e, "Failed to persist user message");
        }

        match &session.handle {
            SessionHandle::Headless(h) => h.send_message(text).await?,
            SessionHandle::Interactive(i) => i.write(format!("{}\r", text).as_bytes()).await?,
        }
        Ok(())
    }

    /// Best effort; interactive sessions get an escape keypress
    pub async fn interrupt(&self, agent_id: &str) -> DroverResult<()> {
        let session = self.require_active(agent_id)?;
        match &session.handle {
            SessionHandle::Headless(h) => h.interrupt().await?,
            SessionHandle::Interactive(i) => i.write(b"\x1b").await?,
        }
        tracing::debug!(agent_id = %agent_id, "Session interrupted");
        Ok(())
    }

    pub async fn resize(&self, agent_id: &str, size: TerminalSize) -> DroverResult<()> {
        let session = self.require_active(agent_id)?;
        match &session.handle {
            SessionHandle::Interactive(i) => Ok(i.resize(size).await?),
            SessionHandle::Headless(_) => Ok(()),
        }
    }

    /// Raw terminal output of an interactive session
    pub fn on_data(&self, agent_id: &str, listener: DataListener) -> DroverResult<()> {
        let session = self.require_active(agent_id)?;
        match &session.handle {
            SessionHandle::Interactive(i) => {
                i.on_data(listener);
                Ok(())
            }
            SessionHandle::Headless(_) => Err(DroverError::NoActiveSession(format!(
                "{} (headless session has no terminal)",
                agent_id
            ))),
        }
    }

    /// Persisted messages of the agent's live headless session, as they arrive.
    /// Consumers share one queue, so each message reaches one of them.
    pub fn messages(&self, agent_id: &str) -> Option<MessageStream> {
        self.active_session(agent_id)
            .filter(|s| s.mode == SessionMode::Headless)
            .map(|s| s.outbound.stream())
    }

    /// Close the agent's session. Closing an agent without one is a no-op.
    pub async fn close(&self, agent_id: &str) -> DroverResult<()> {
        let removed = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(agent_id);
        let Some(session) = removed else {
            return Ok(());
        };
        close_managed(&session).await
    }

    pub fn get_active_session(&self, agent_id: &str) -> Option<SessionInfo> {
        self.active_session(agent_id)
            .filter(|s| s.is_alive())
            .map(|s| s.info())
    }

    /// Latest session of each agent, oldest first
    pub fn list_sessions(&self, filter: &SessionFilter) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|s| s.info())
            .filter(|s| filter.agent_id.as_deref().map_or(true, |a| a == s.agent_id))
            .filter(|s| filter.status.map_or(true, |st| st == s.status))
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    pub async fn get_session_history(
        &self,
        agent_id: &str,
        limit: Option<usize>,
    ) -> DroverResult<Vec<SessionMessage>> {
        self.store.list_session_messages(agent_id, limit).await
    }

    /// Close every live session
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<ManagedSession>> = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, s)| s)
            .collect();
        tracing::info!(count = sessions.len(), "Shutting down sessions");
        for session in sessions {
            if let Err(e) = close_managed(&session).await {
                tracing::warn!(agent_id = %session.agent_id, error = %e, "Failed to close session");
            }
        }
    }
}

async fn close_managed(session: &ManagedSession) -> DroverResult<()> {
    let first = session.finish(SessionStatus::Closed);
    let result = match &session.handle {
        SessionHandle::Headless(h) => h.close().await,
        SessionHandle::Interactive(i) => i.kill().await,
    };
    if first {
        tracing::debug!(agent_id = %session.agent_id, "Session closed");
    }
    Ok(result?)
}

/// Persist each message, then hand it on. Persistence failures never stop the stream.
async fn pump_headless(
    managed: Arc<ManagedSession>,
    mut stream: MessageStream,
    store: Arc<dyn Store>,
    agents: AgentRegistry,
) {
    let mut fatal = false;
    while let Some(msg) = stream.next().await {
        if let Some(backend_id) = msg.init_session_id() {
            managed.set_provider_session_id(backend_id);
            if let Err(e) = agents.record_session_id(&managed.agent_id, backend_id).await {
                tracing::warn!(
                    agent_id = %managed.agent_id,
                    error = %e,
                    "Failed to record session id"
                );
            }
        }
        managed.mark_running();

        if let AgentMessage::Error { code, message } = &msg {
            tracing::warn!(
                agent_id = %managed.agent_id,
                code = ?code,
                message = %message,
                "Session error"
            );
            fatal |= matches!(code, ErrorCode::ProcessExited | ErrorCode::StreamError);
        }

        let record =
            SessionMessage::from_agent_message(&managed.transcript_id(), &managed.agent_id, &msg);
        match store.save_session_message(&record).await {
            Ok(()) => metrics::record_message_persisted(msg.kind()),
            Err(e) => {
                metrics::record_persist_failure();
                tracing::warn!(
                    agent_id = %managed.agent_id,
                    kind = msg.kind(),
                    error = %e,
                    "Failed to persist session message"
                );
            }
        }

        managed.outbound.push(msg);
    }

    let status = if fatal {
        if let SessionHandle::Headless(h) = &managed.handle {
            if let Err(e) = h.close().await {
                tracing::warn!(
                    agent_id = %managed.agent_id,
                    error = %e,
                    "Failed to close failed session"
                );
            }
        }
        SessionStatus::Errored
    } else {
        SessionStatus::Closed
    };
    managed.finish(status);
}

/// Interactive backends reveal their id in terminal output; record it once seen
async fn watch_interactive_session_id(managed: Arc<ManagedSession>, agents: AgentRegistry) {
    let mut ticker = tokio::time::interval(SESSION_ID_POLL);
    while managed.is_alive() {
        ticker.tick().await;
        if let Some(backend_id) = managed.handle.backend_session_id() {
            managed.set_provider_session_id(&backend_id);
            if let Err(e) = agents.record_session_id(&managed.agent_id, &backend_id).await {
                tracing::warn!(
                    agent_id = %managed.agent_id,
                    error = %e,
                    "Failed to record session id"
                );
            }
            return;
        }
    }
}
