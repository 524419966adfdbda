// ABOUTME: Headless provider backed by one shared session server per provider instance.
// ABOUTME: Sessions acquire/release a refcounted server and map its pushed events to AgentMessages.

use super::binary_available;
use super::http::HttpServerClient;
use crate::error::{ProviderError, ProviderResult};
use crate::mapper::{EventMapper, ServerEvent};
use crate::message::{AgentMessage, ErrorCode};
use crate::provider::{
    AgentProvider, HeadlessProvider, HeadlessSession, MessageStream, Provider, SpawnOptions,
};
use crate::queue::AsyncQueue;
use crate::registry::ProviderFactory;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Server-pushed events for every session on one server
pub type EventStream = BoxStream<'static, ProviderResult<ServerEvent>>;

/// Configuration for a server-backed provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server binary launched on first use
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Externally managed server; nothing is launched when set
    #[serde(default)]
    pub url: Option<String>,
    /// How long to wait for the launched server to print its URL
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

fn default_binary() -> String {
    "opencode".to_string()
}

fn default_args() -> Vec<String> {
    vec!["serve".to_string(), "--port".to_string(), "0".to_string()]
}

fn default_startup_timeout() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            args: default_args(),
            url: None,
            startup_timeout_secs: default_startup_timeout(),
        }
    }
}

/// A running (or externally managed) server
pub struct LaunchedServer {
    base_url: String,
    child: Option<Child>,
}

impl LaunchedServer {
    /// A server this process does not own
    pub fn external(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            child: None,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn shutdown(mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!(url = %self.base_url, error = %e, "Failed to stop session server");
            }
        }
    }
}

/// Starts the server on first acquisition
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self) -> ProviderResult<LaunchedServer>;

    async fn is_available(&self) -> bool;
}

/// Launches the server binary and waits for it to print its listen URL
pub struct ProcessLauncher {
    name: String,
    binary: String,
    args: Vec<String>,
    startup_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(name: &str, config: &ServerConfig) -> Self {
        Self {
            name: name.to_string(),
            binary: config.binary.clone(),
            args: config.args.clone(),
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
        }
    }
}

#[async_trait]
impl ServerLauncher for ProcessLauncher {
    async fn launch(&self) -> ProviderResult<LaunchedServer> {
        let url_pattern =
            Regex::new(r"https?://[^\s]+").map_err(|e| ProviderError::spawn(&self.name, e))?;

        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::spawn(&self.name, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::spawn(&self.name, "failed to capture stdout"))?;
        let mut lines = BufReader::new(stdout).lines();

        let found = tokio::time::timeout(self.startup_timeout, async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(m) = url_pattern.find(&line) {
                    return Some(m.as_str().trim_end_matches('/').to_string());
                }
            }
            None
        })
        .await;

        let base_url = match found {
            Ok(Some(url)) => url,
            Ok(None) => {
                return Err(ProviderError::spawn(
                    &self.name,
                    "server exited before printing its URL",
                ))
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(ProviderError::spawn(
                    &self.name,
                    format!("server did not start within {:?}", self.startup_timeout),
                ));
            }
        };

        // Keep draining so the server never blocks on a full pipe
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(output = %line, "Session server output");
            }
        });

        tracing::info!(provider = %self.name, url = %base_url, "Session server started");
        Ok(LaunchedServer {
            base_url,
            child: Some(child),
        })
    }

    async fn is_available(&self) -> bool {
        binary_available(&self.binary)
    }
}

/// Points at an already running server
pub struct ExternalLauncher {
    url: String,
}

impl ExternalLauncher {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl ServerLauncher for ExternalLauncher {
    async fn launch(&self) -> ProviderResult<LaunchedServer> {
        Ok(LaunchedServer::external(self.url.trim_end_matches('/')))
    }

    async fn is_available(&self) -> bool {
        true
    }
}

struct ServerState {
    refs: usize,
    server: Option<LaunchedServer>,
}

/// Reference-counted server shared by every session of one provider
pub struct SharedServer {
    launcher: Arc<dyn ServerLauncher>,
    state: tokio::sync::Mutex<ServerState>,
}

impl SharedServer {
    pub fn new(launcher: Arc<dyn ServerLauncher>) -> Self {
        Self {
            launcher,
            state: tokio::sync::Mutex::new(ServerState {
                refs: 0,
                server: None,
            }),
        }
    }

    /// Take a reference, launching the server if none is running. Returns its base URL.
    pub async fn acquire(&self) -> ProviderResult<String> {
        let mut state = self.state.lock().await;
        if state.server.is_none() {
            state.server = Some(self.launcher.launch().await?);
        }
        state.refs += 1;
        let url = state
            .server
            .as_ref()
            .map(|s| s.base_url().to_string())
            .unwrap_or_default();
        tracing::debug!(refs = state.refs, url = %url, "Session server acquired");
        Ok(url)
    }

    /// Drop a reference; the last one stops the server
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        if state.refs == 0 {
            tracing::warn!("Session server released more times than acquired");
            return;
        }
        state.refs -= 1;
        tracing::debug!(refs = state.refs, "Session server released");
        if state.refs == 0 {
            if let Some(server) = state.server.take() {
                tracing::info!(url = %server.base_url(), "Stopping idle session server");
                server.shutdown().await;
            }
        }
    }

    pub async fn ref_count(&self) -> usize {
        self.state.lock().await.refs
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.server.is_some()
    }

    async fn launcher_available(&self) -> bool {
        self.launcher.is_available().await
    }
}

/// Transport to a running session server
#[async_trait]
pub trait ServerClient: Send + Sync {
    async fn create_session(&self, base_url: &str, directory: &Path) -> ProviderResult<String>;

    /// Fails with [`ProviderError::SessionNotFound`] for unknown ids
    async fn get_session(&self, base_url: &str, session_id: &str) -> ProviderResult<()>;

    /// Start a turn without waiting for it to finish
    async fn prompt(&self, base_url: &str, session_id: &str, text: &str) -> ProviderResult<()>;

    async fn abort(&self, base_url: &str, session_id: &str) -> ProviderResult<()>;

    async fn subscribe(&self, base_url: &str) -> ProviderResult<EventStream>;
}

pub struct ServerProvider {
    name: String,
    server: Arc<SharedServer>,
    client: Arc<dyn ServerClient>,
}

impl ServerProvider {
    pub fn new(name: &str, config: ServerConfig) -> Self {
        let launcher: Arc<dyn ServerLauncher> = match config.url {
            Some(ref url) => Arc::new(ExternalLauncher::new(url.clone())),
            None => Arc::new(ProcessLauncher::new(name, &config)),
        };
        Self::with_parts(name, launcher, Arc::new(HttpServerClient::new()))
    }

    pub fn with_parts(
        name: &str,
        launcher: Arc<dyn ServerLauncher>,
        client: Arc<dyn ServerClient>,
    ) -> Self {
        Self {
            name: name.to_string(),
            server: Arc::new(SharedServer::new(launcher)),
            client,
        }
    }

    pub fn shared_server(&self) -> Arc<SharedServer> {
        Arc::clone(&self.server)
    }

    async fn open(
        &self,
        base_url: &str,
        options: &SpawnOptions,
    ) -> ProviderResult<(String, EventStream)> {
        let session_id = match options.resume_session_id {
            Some(ref id) => {
                self.client.get_session(base_url, id).await?;
                id.clone()
            }
            None => {
                self.client
                    .create_session(base_url, &options.working_directory)
                    .await?
            }
        };
        let events = self.client.subscribe(base_url).await?;
        Ok((session_id, events))
    }
}

#[async_trait]
impl Provider for ServerProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        self.server.launcher_available().await
    }
}

#[async_trait]
impl HeadlessProvider for ServerProvider {
    async fn spawn(&self, options: SpawnOptions) -> ProviderResult<Box<dyn HeadlessSession>> {
        let base_url = self.server.acquire().await?;

        let (session_id, events) = match self.open(&base_url, &options).await {
            Ok(opened) => opened,
            Err(e) => {
                self.server.release().await;
                return Err(e);
            }
        };

        let session = ServerSession::start(
            &self.name,
            session_id,
            base_url,
            Arc::clone(&self.client),
            Arc::clone(&self.server),
            events,
            options.resume_session_id.is_some(),
        );

        if let Some(ref prompt) = options.initial_prompt {
            if let Err(e) = session.send_message(prompt).await {
                // close() releases the server reference
                let _ = session.close().await;
                return Err(e);
            }
        }

        tracing::info!(
            provider = %self.name,
            session_id = %session.session_id,
            resumed = options.resume_session_id.is_some(),
            "Server session started"
        );
        Ok(Box::new(session))
    }
}

pub struct ServerSession {
    session_id: String,
    base_url: String,
    client: Arc<dyn ServerClient>,
    server: Arc<SharedServer>,
    queue: AsyncQueue<AgentMessage>,
    mapper: Arc<Mutex<EventMapper>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ServerSession {
    fn start(
        provider: &str,
        session_id: String,
        base_url: String,
        client: Arc<dyn ServerClient>,
        server: Arc<SharedServer>,
        mut events: EventStream,
        resumed: bool,
    ) -> Self {
        let queue = AsyncQueue::new();
        queue.push(AgentMessage::init(
            session_id.clone(),
            json!({ "provider": provider, "resumed": resumed }),
        ));

        let mapper = Arc::new(Mutex::new(EventMapper::new(session_id.clone())));
        let pump_queue = queue.clone();
        let pump_mapper = Arc::clone(&mapper);
        let pump = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        let messages = pump_mapper
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .map(&event);
                        for msg in messages {
                            pump_queue.push(msg);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Server event stream failed");
                        pump_queue.push(AgentMessage::error(ErrorCode::StreamError, e.to_string()));
                        break;
                    }
                }
            }
            pump_queue.close();
        });

        Self {
            session_id,
            base_url,
            client,
            server,
            queue,
            mapper,
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        }
    }

    fn stop_pump(&self) {
        if let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
        self.queue.close();
    }
}

#[async_trait]
impl HeadlessSession for ServerSession {
    fn messages(&self) -> MessageStream {
        self.queue.stream()
    }

    fn session_id(&self) -> Option<String> {
        Some(self.session_id.clone())
    }

    async fn send_message(&self, text: &str) -> ProviderResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProviderError::Closed);
        }
        {
            let mut mapper = self.mapper.lock().unwrap_or_else(|e| e.into_inner());
            if mapper.is_idle() {
                mapper.reset();
            }
        }
        self.client
            .prompt(&self.base_url, &self.session_id, text)
            .await
    }

    async fn interrupt(&self) -> ProviderResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProviderError::Closed);
        }
        self.client.abort(&self.base_url, &self.session_id).await
    }

    async fn close(&self) -> ProviderResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_pump();
        self.server.release().await;
        tracing::debug!(session_id = %self.session_id, "Server session closed");
        Ok(())
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_pump();
        let server = Arc::clone(&self.server);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { server.release().await });
            }
            Err(_) => tracing::warn!(
                session_id = %self.session_id,
                "Server session dropped outside a runtime; reference not released"
            ),
        }
    }
}

/// Factory function for the registry
pub fn factory() -> ProviderFactory {
    Box::new(|name, config| {
        let cfg: ServerConfig = serde_json::from_value(config.clone())?;
        Ok(AgentProvider::new(name).with_headless(Arc::new(ServerProvider::new(name, cfg))))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg: ServerConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(cfg.binary, "opencode");
        assert_eq!(cfg.args, vec!["serve", "--port", "0"]);
        assert_eq!(cfg.startup_timeout_secs, 30);
        assert!(cfg.url.is_none());
    }

    #[test]
    fn test_factory_builds_headless_only() {
        let provider = factory()("opencode", &json!({"url": "http://127.0.0.1:4096"})).unwrap();
        assert_eq!(provider.modes(), vec![crate::provider::SessionMode::Headless]);
    }

    #[tokio::test]
    async fn test_external_server_is_shared_and_released() {
        let server = SharedServer::new(Arc::new(ExternalLauncher::new("http://localhost:4096/")));
        assert_eq!(server.acquire().await.unwrap(), "http://localhost:4096");
        assert_eq!(server.acquire().await.unwrap(), "http://localhost:4096");
        assert_eq!(server.ref_count().await, 2);

        server.release().await;
        assert!(server.is_running().await);
        server.release().await;
        assert!(!server.is_running().await);

        // Extra release is ignored
        server.release().await;
        assert_eq!(server.ref_count().await, 0);
    }
}
