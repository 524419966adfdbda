// ABOUTME: Tests for the shared-server provider using an in-process fake server.
// ABOUTME: Covers refcounting, release on failed spawn, resume errors and event streaming.

use async_trait::async_trait;
use drover_agent::providers::server::{
    EventStream, LaunchedServer, ServerClient, ServerLauncher, ServerProvider,
};
use drover_agent::{
    AgentMessage, ErrorCode, HeadlessProvider, ProviderError, ProviderResult, ResultSubtype,
    ServerEvent, SpawnOptions,
};
use futures::{stream, StreamExt};
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct FakeLauncher {
    launches: AtomicUsize,
}

#[async_trait]
impl ServerLauncher for FakeLauncher {
    async fn launch(&self) -> ProviderResult<LaunchedServer> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(LaunchedServer::external("http://fake"))
    }

    async fn is_available(&self) -> bool {
        true
    }
}

type Subscriber = mpsc::UnboundedSender<ProviderResult<ServerEvent>>;

#[derive(Default)]
struct FakeClient {
    sessions: Mutex<HashSet<String>>,
    subscribers: Mutex<Vec<Subscriber>>,
    prompts: Mutex<Vec<(String, String)>>,
    aborts: AtomicUsize,
    created: AtomicUsize,
    fail_create: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_prompt: AtomicBool,
}

impl FakeClient {
    fn emit(&self, kind: &str, properties: serde_json::Value) {
        for tx in self.subscribers.lock().unwrap().iter() {
            let _ = tx.send(Ok(ServerEvent::new(kind, properties.clone())));
        }
    }

    fn break_streams(&self) {
        for tx in self.subscribers.lock().unwrap().drain(..) {
            let _ = tx.send(Err(ProviderError::Stream("connection reset".to_string())));
        }
    }
}

#[async_trait]
impl ServerClient for FakeClient {
    async fn create_session(&self, _base_url: &str, _directory: &Path) -> ProviderResult<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ProviderError::Request("500 Internal Server Error".to_string()));
        }
        let id = format!("ses_{}", self.created.fetch_add(1, Ordering::SeqCst) + 1);
        self.sessions.lock().unwrap().insert(id.clone());
        Ok(id)
    }

    async fn get_session(&self, _base_url: &str, session_id: &str) -> ProviderResult<()> {
        if self.sessions.lock().unwrap().contains(session_id) {
            Ok(())
        } else {
            Err(ProviderError::SessionNotFound(session_id.to_string()))
        }
    }

    async fn prompt(&self, _base_url: &str, session_id: &str, text: &str) -> ProviderResult<()> {
        if self.fail_prompt.load(Ordering::SeqCst) {
            return Err(ProviderError::Request("prompt rejected".to_string()));
        }
        self.prompts
            .lock()
            .unwrap()
            .push((session_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn abort(&self, _base_url: &str, _session_id: &str) -> ProviderResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, _base_url: &str) -> ProviderResult<EventStream> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(ProviderError::Stream("refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|e| (e, rx)) }).boxed())
    }
}

fn provider() -> (ServerProvider, Arc<FakeLauncher>, Arc<FakeClient>) {
    let launcher = Arc::new(FakeLauncher::default());
    let client = Arc::new(FakeClient::default());
    let provider = ServerProvider::with_parts("opencode", launcher.clone(), client.clone());
    (provider, launcher, client)
}

#[tokio::test]
async fn test_sessions_share_one_server() {
    let (provider, launcher, _client) = provider();
    let server = provider.shared_server();

    let a = provider.spawn(SpawnOptions::new("/tmp")).await.unwrap();
    let b = provider.spawn(SpawnOptions::new("/tmp")).await.unwrap();
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    assert_eq!(server.ref_count().await, 2);
    assert_ne!(a.session_id(), b.session_id());

    a.close().await.unwrap();
    assert_eq!(server.ref_count().await, 1);
    assert!(server.is_running().await);

    b.close().await.unwrap();
    assert_eq!(server.ref_count().await, 0);
    assert!(!server.is_running().await);
}

#[tokio::test]
async fn test_double_close_releases_once() {
    let (provider, _launcher, _client) = provider();
    let server = provider.shared_server();

    let keep = provider.spawn(SpawnOptions::new("/tmp")).await.unwrap();
    let session = provider.spawn(SpawnOptions::new("/tmp")).await.unwrap();

    session.close().await.unwrap();
    session.close().await.unwrap();
    assert_eq!(server.ref_count().await, 1);

    keep.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_create_releases_server() {
    let (provider, _launcher, client) = provider();
    client.fail_create.store(true, Ordering::SeqCst);

    let result = provider.spawn(SpawnOptions::new("/tmp")).await;
    assert!(matches!(result, Err(ProviderError::Request(_))));
    assert_eq!(provider.shared_server().ref_count().await, 0);
    assert!(!provider.shared_server().is_running().await);
}

#[tokio::test]
async fn test_failed_subscribe_releases_server() {
    let (provider, _launcher, client) = provider();
    client.fail_subscribe.store(true, Ordering::SeqCst);

    assert!(provider.spawn(SpawnOptions::new("/tmp")).await.is_err());
    assert_eq!(provider.shared_server().ref_count().await, 0);
}

#[tokio::test]
async fn test_failed_initial_prompt_releases_once() {
    let (provider, _launcher, client) = provider();
    let server = provider.shared_server();
    let keep = provider.spawn(SpawnOptions::new("/tmp")).await.unwrap();

    client.fail_prompt.store(true, Ordering::SeqCst);
    let result = provider
        .spawn(SpawnOptions::new("/tmp").with_prompt("hello"))
        .await;
    assert!(result.is_err());
    assert_eq!(server.ref_count().await, 1);

    keep.close().await.unwrap();
}

#[tokio::test]
async fn test_resume_unknown_session_is_not_found() {
    let (provider, _launcher, _client) = provider();
    let result = provider
        .spawn(SpawnOptions::new("/tmp").with_resume("ses_missing"))
        .await;
    assert!(matches!(result, Err(ProviderError::SessionNotFound(id)) if id == "ses_missing"));
    assert_eq!(provider.shared_server().ref_count().await, 0);
}

#[tokio::test]
async fn test_resume_known_session_keeps_id() {
    let (provider, _launcher, client) = provider();
    client.sessions.lock().unwrap().insert("ses_old".to_string());

    let session = provider
        .spawn(SpawnOptions::new("/tmp").with_resume("ses_old"))
        .await
        .unwrap();
    assert_eq!(session.session_id().as_deref(), Some("ses_old"));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_events_become_messages() {
    let (provider, _launcher, client) = provider();
    let session = provider
        .spawn(SpawnOptions::new("/tmp").with_prompt("list files"))
        .await
        .unwrap();
    let sid = session.session_id().unwrap();
    assert_eq!(
        client.prompts.lock().unwrap().clone(),
        vec![(sid.clone(), "list files".to_string())]
    );

    let part = |status: &str| {
        json!({"part": {"sessionID": sid, "messageID": "m1", "type": "tool", "callID": "c1",
            "tool": "bash", "state": {"status": status, "output": "a.txt"}}})
    };
    client.emit("message.part.updated", part("running"));
    client.emit("message.part.updated", part("completed"));
    client.emit("message.part.updated", part("completed"));
    client.emit("session.idle", json!({"sessionID": "ses_unrelated"}));
    client.emit("session.idle", json!({"sessionID": sid}));

    let mut messages = session.messages();
    let mut seen = Vec::new();
    while let Some(msg) = messages.next().await {
        let done = msg.is_result();
        seen.push(msg);
        if done {
            break;
        }
    }

    assert_eq!(seen[0].init_session_id(), Some(sid.as_str()));
    let kinds: Vec<_> = seen.iter().map(|m| m.kind()).collect();
    assert_eq!(kinds, vec!["system", "tool_use", "tool_result", "result"]);
    assert_eq!(
        seen.last(),
        Some(&AgentMessage::result(ResultSubtype::Success))
    );
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_stream_failure_surfaces_error_and_ends() {
    let (provider, _launcher, client) = provider();
    let session = provider.spawn(SpawnOptions::new("/tmp")).await.unwrap();

    client.break_streams();
    let messages: Vec<_> = session.messages().collect().await;
    assert_eq!(messages.len(), 2);
    assert!(matches!(
        &messages[1],
        AgentMessage::Error { code: ErrorCode::StreamError, .. }
    ));

    session.close().await.unwrap();
    assert_eq!(provider.shared_server().ref_count().await, 0);
}

#[tokio::test]
async fn test_interrupt_aborts_server_turn() {
    let (provider, _launcher, client) = provider();
    let session = provider.spawn(SpawnOptions::new("/tmp")).await.unwrap();
    session.interrupt().await.unwrap();
    assert_eq!(client.aborts.load(Ordering::SeqCst), 1);

    session.close().await.unwrap();
    assert!(matches!(session.interrupt().await, Err(ProviderError::Closed)));
}
