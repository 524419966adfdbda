// ABOUTME: Mock provider for testing - replays pre-configured messages per prompt.
// ABOUTME: Allows deterministic tests without spawning real agent processes or servers.
//!
//! # Example
//!
//! ```no_run
//! use drover_agent::providers::mock::MockProvider;
//! use drover_agent::{AgentMessage, SpawnOptions};
//! use futures::StreamExt;
//!
//! # async fn example() {
//! let mock = MockProvider::new("mock")
//!     .on_prompt("hello").respond_text("Hi there!");
//!
//! let provider = mock.clone().into_provider();
//! let headless = provider.headless().unwrap();
//! let session = headless
//!     .spawn(SpawnOptions::new("/tmp").with_prompt("hello"))
//!     .await
//!     .unwrap();
//!
//! let mut messages = session.messages();
//! while let Some(msg) = messages.next().await {
//!     if msg.is_result() {
//!         break;
//!     }
//! }
//! assert_eq!(mock.prompts(), vec!["hello".to_string()]);
//! # }
//! ```

use crate::error::{ProviderError, ProviderResult};
use crate::message::{AgentMessage, ErrorCode, ResultSubtype};
use crate::provider::{
    AgentProvider, DataListener, ExitInfo, ExitListener, HeadlessProvider, HeadlessSession,
    InteractiveProvider, InteractiveSession, MessageStream, Provider, SpawnOptions, TerminalSize,
};
use crate::queue::AsyncQueue;
use crate::registry::ProviderFactory;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct Expectation {
    pattern: String,
    messages: Vec<AgentMessage>,
}

#[derive(Default)]
struct MockState {
    expectations: Mutex<VecDeque<Expectation>>,
    known_sessions: Mutex<HashSet<String>>,
    prompts: Mutex<Vec<String>>,
    terminal_input: Mutex<Vec<u8>>,
    unavailable: AtomicBool,
    fail_spawn: AtomicBool,
    session_counter: AtomicU64,
    spawns: AtomicUsize,
    closes: AtomicUsize,
}

impl MockState {
    /// Match expectations with FIFO preference, falling back to the first match anywhere
    fn take_response(&self, text: &str) -> Vec<AgentMessage> {
        let found = {
            let mut exp = self.expectations.lock().unwrap_or_else(|e| e.into_inner());
            exp.iter()
                .position(|e| text.contains(&e.pattern))
                .and_then(|i| exp.remove(i))
                .map(|e| e.messages)
        };
        found.unwrap_or_else(|| {
            vec![AgentMessage::Result {
                subtype: ResultSubtype::Success,
                text: Some(format!("Mock: no expectation for '{}'", text)),
                usage: None,
            }]
        })
    }

    fn next_session_id(&self) -> String {
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("mock-session-{}", n);
        self.known_sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone());
        id
    }

    fn check_spawn(&self, name: &str, options: &SpawnOptions) -> ProviderResult<String> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(ProviderError::spawn(name, "mock configured to fail"));
        }
        let session_id = match options.resume_session_id {
            Some(ref id) => {
                let known = self
                    .known_sessions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .contains(id);
                if !known {
                    return Err(ProviderError::SessionNotFound(id.clone()));
                }
                id.clone()
            }
            None => self.next_session_id(),
        };
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(session_id)
    }
}

/// Mock provider with both facets. Clones share expectations and counters.
#[derive(Clone)]
pub struct MockProvider {
    name: String,
    state: Arc<MockState>,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(MockState::default()),
        }
    }

    /// Set up an expectation for a prompt containing `pattern`
    pub fn on_prompt(self, pattern: &str) -> ExpectationBuilder {
        ExpectationBuilder {
            provider: self,
            pattern: pattern.to_string(),
        }
    }

    /// Make a backend session id resumable
    pub fn with_session(self, session_id: &str) -> Self {
        self.state
            .known_sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.to_string());
        self
    }

    pub fn unavailable(self) -> Self {
        self.state.unavailable.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_fail_spawn(&self, fail: bool) {
        self.state.fail_spawn.store(fail, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        self.state.spawns.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Every prompt sent to headless sessions, in order
    pub fn prompts(&self) -> Vec<String> {
        self.state
            .prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Bytes written to interactive sessions
    pub fn terminal_input(&self) -> Vec<u8> {
        self.state
            .terminal_input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wrap as a provider carrying both facets
    pub fn into_provider(self) -> AgentProvider {
        let name = self.name.clone();
        let shared = Arc::new(self);
        AgentProvider::new(name)
            .with_headless(shared.clone())
            .with_interactive(shared)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        !self.state.unavailable.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HeadlessProvider for MockProvider {
    async fn spawn(&self, options: SpawnOptions) -> ProviderResult<Box<dyn HeadlessSession>> {
        let session_id = self.state.check_spawn(&self.name, &options)?;
        let queue = AsyncQueue::new();
        queue.push(AgentMessage::init(
            session_id.clone(),
            json!({ "provider": self.name, "resumed": options.resume_session_id.is_some() }),
        ));

        let session = MockSession {
            session_id,
            state: Arc::clone(&self.state),
            queue,
            closed: AtomicBool::new(false),
        };
        if let Some(ref prompt) = options.initial_prompt {
            session.send_message(prompt).await?;
        }
        Ok(Box::new(session))
    }
}

pub struct MockSession {
    session_id: String,
    state: Arc<MockState>,
    queue: AsyncQueue<AgentMessage>,
    closed: AtomicBool,
}

#[async_trait]
impl HeadlessSession for MockSession {
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
        self.state
            .prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());
        for msg in self.state.take_response(text) {
            self.queue.push(msg);
        }
        Ok(())
    }

    async fn interrupt(&self) -> ProviderResult<()> {
        self.queue.push(AgentMessage::result(ResultSubtype::Interrupted));
        Ok(())
    }

    async fn close(&self) -> ProviderResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.queue.close();
        Ok(())
    }
}

#[async_trait]
impl InteractiveProvider for MockProvider {
    async fn spawn(
        &self,
        options: SpawnOptions,
        _size: TerminalSize,
    ) -> ProviderResult<Box<dyn InteractiveSession>> {
        let session_id = self.state.check_spawn(&self.name, &options)?;
        Ok(Box::new(MockTerminal {
            session_id,
            state: Arc::clone(&self.state),
            data_listeners: Mutex::new(Vec::new()),
            exit: Mutex::new((None, Vec::new())),
            killed: AtomicBool::new(false),
        }))
    }
}

/// Terminal that echoes writes back to its data listeners
pub struct MockTerminal {
    session_id: String,
    state: Arc<MockState>,
    data_listeners: Mutex<Vec<DataListener>>,
    exit: Mutex<(Option<ExitInfo>, Vec<ExitListener>)>,
    killed: AtomicBool,
}

#[async_trait]
impl InteractiveSession for MockTerminal {
    fn session_id(&self) -> Option<String> {
        Some(self.session_id.clone())
    }

    async fn write(&self, data: &[u8]) -> ProviderResult<()> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(ProviderError::Closed);
        }
        self.state
            .terminal_input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);
        for listener in self
            .data_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            listener(data);
        }
        Ok(())
    }

    async fn resize(&self, _size: TerminalSize) -> ProviderResult<()> {
        Ok(())
    }

    async fn kill(&self) -> ProviderResult<()> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        let info = ExitInfo {
            code: None,
            success: false,
        };
        let listeners = {
            let mut exit = self.exit.lock().unwrap_or_else(|e| e.into_inner());
            exit.0 = Some(info);
            std::mem::take(&mut exit.1)
        };
        for listener in listeners {
            listener(info);
        }
        Ok(())
    }

    fn on_data(&self, listener: DataListener) {
        self.data_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    fn on_exit(&self, listener: ExitListener) {
        let mut exit = self.exit.lock().unwrap_or_else(|e| e.into_inner());
        match exit.0 {
            Some(info) => {
                drop(exit);
                listener(info);
            }
            None => exit.1.push(listener),
        }
    }
}

/// Builder for setting up mock expectations with a fluent API
pub struct ExpectationBuilder {
    provider: MockProvider,
    pattern: String,
}

impl ExpectationBuilder {
    /// Respond with a list of messages
    pub fn respond_with(self, messages: Vec<AgentMessage>) -> MockProvider {
        self.provider
            .state
            .expectations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Expectation {
                pattern: self.pattern,
                messages,
            });
        self.provider
    }

    /// Respond with assistant text and a successful result
    pub fn respond_text(self, text: &str) -> MockProvider {
        self.respond_with(vec![
            AgentMessage::assistant(text),
            AgentMessage::Result {
                subtype: ResultSubtype::Success,
                text: Some(text.to_string()),
                usage: None,
            },
        ])
    }

    /// Respond with an error and a failed result
    pub fn respond_error(self, code: ErrorCode, message: &str) -> MockProvider {
        self.respond_with(vec![
            AgentMessage::error(code, message),
            AgentMessage::result(ResultSubtype::Error),
        ])
    }
}

/// Factory function for the registry
pub fn factory() -> ProviderFactory {
    Box::new(|name, config| {
        let mut mock = MockProvider::new(name);
        if config.get("available").and_then(|v| v.as_bool()) == Some(false) {
            mock = mock.unavailable();
        }
        Ok(mock.into_provider())
    })
}
