// ABOUTME: Headless agent CLI provider - one long-lived process speaking stream-json.
// ABOUTME: User turns go to stdin as JSON lines; JSONL stdout is parsed into AgentMessages.

use super::binary_available;
use super::cli::{CliConfig, SAFETY_FLAG};
use crate::error::{ProviderError, ProviderResult};
use crate::mapper::{ToolLedger, ToolTransition};
use crate::message::{AgentMessage, ErrorCode, ResultSubtype, Usage};
use crate::provider::{HeadlessProvider, HeadlessSession, MessageStream, Provider, SpawnOptions};
use crate::queue::AsyncQueue;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// stderr marker printed when --resume names an unknown conversation
const SESSION_NOT_FOUND_MARKER: &str = "No conversation found with session ID";

/// First sign of life from a freshly spawned CLI
#[derive(Debug)]
enum Startup {
    Ready,
    NotFound(String),
}

type StartupSignal = Arc<Mutex<Option<oneshot::Sender<Startup>>>>;

fn signal_startup(signal: &StartupSignal, startup: Startup) {
    if let Some(tx) = signal.lock().unwrap_or_else(|e| e.into_inner()).take() {
        let _ = tx.send(startup);
    }
}

pub struct StreamJsonProvider {
    name: String,
    config: CliConfig,
}

impl StreamJsonProvider {
    pub fn new(name: &str, config: CliConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }
}

/// Arguments for a stream-json session
pub fn build_args(config: &CliConfig, resume_session_id: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = [
        "--print",
        "--input-format",
        "stream-json",
        "--output-format",
        "stream-json",
        "--verbose",
        SAFETY_FLAG,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if let Some(ref model) = config.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }

    if let Some(id) = resume_session_id {
        args.push("--resume".to_string());
        args.push(id.to_string());
    }

    args.extend(config.extra_args.iter().cloned());
    args
}

#[async_trait]
impl Provider for StreamJsonProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        binary_available(&self.config.binary)
    }
}

#[async_trait]
impl HeadlessProvider for StreamJsonProvider {
    async fn spawn(&self, options: SpawnOptions) -> ProviderResult<Box<dyn HeadlessSession>> {
        let args = build_args(&self.config, options.resume_session_id.as_deref());
        tracing::debug!(provider = %self.name, ?args, "Spawning agent CLI");

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .current_dir(&options.working_directory)
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProviderError::spawn(&self.name, e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::spawn(&self.name, "failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::spawn(&self.name, "failed to capture stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProviderError::spawn(&self.name, "failed to capture stderr"))?;

        let (session, startup) = StreamJsonSession::start(
            child,
            stdin,
            stdout,
            stderr,
            options.resume_session_id.clone(),
        );

        let prompted = match options.initial_prompt {
            Some(ref prompt) => session.send_message(prompt).await,
            None => Ok(()),
        };

        // An unknown --resume id is reported on stderr right before the CLI exits
        if let Some(ref resume_id) = options.resume_session_id {
            let window = Duration::from_millis(self.config.resume_check_ms);
            let outcome = tokio::time::timeout(window, startup).await;
            if let Ok(Ok(Startup::NotFound(line))) = outcome {
                tracing::warn!(
                    provider = %self.name,
                    session_id = %resume_id,
                    stderr = %line,
                    "Resume rejected"
                );
                let _ = session.close().await;
                return Err(ProviderError::SessionNotFound(resume_id.clone()));
            }
        }

        if let Err(e) = prompted {
            let _ = session.close().await;
            return Err(ProviderError::spawn(&self.name, e));
        }

        tracing::info!(
            provider = %self.name,
            cwd = %options.working_directory.display(),
            resumed = options.resume_session_id.is_some(),
            "Agent CLI session started"
        );
        Ok(Box::new(session))
    }
}

pub struct StreamJsonSession {
    queue: AsyncQueue<AgentMessage>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    session_id: Arc<Mutex<Option<String>>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    closed: AtomicBool,
}

impl StreamJsonSession {
    fn start(
        child: Child,
        stdin: ChildStdin,
        stdout: ChildStdout,
        stderr: ChildStderr,
        resume_session_id: Option<String>,
    ) -> (Self, oneshot::Receiver<Startup>) {
        let queue = AsyncQueue::new();
        let session_id = Arc::new(Mutex::new(resume_session_id));
        let (kill_tx, kill_rx) = oneshot::channel();
        let (startup_tx, startup_rx) = oneshot::channel();
        let startup: StartupSignal = Arc::new(Mutex::new(Some(startup_tx)));

        let stderr_task = tokio::spawn(watch_stderr(stderr, queue.clone(), Arc::clone(&startup)));
        tokio::spawn(read_stdout(
            child,
            stdout,
            kill_rx,
            queue.clone(),
            Arc::clone(&session_id),
            stderr_task,
            startup,
        ));

        let session = Self {
            queue,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            session_id,
            kill_tx: Mutex::new(Some(kill_tx)),
            closed: AtomicBool::new(false),
        };
        (session, startup_rx)
    }

    async fn write_line(&self, value: Value) -> ProviderResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProviderError::Closed);
        }
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or(ProviderError::Closed)?;
        let mut line = value.to_string();
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl HeadlessSession for StreamJsonSession {
    fn messages(&self) -> MessageStream {
        self.queue.stream()
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn send_message(&self, text: &str) -> ProviderResult<()> {
        self.write_line(json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{"type": "text", "text": text}]
            }
        }))
        .await
    }

    async fn interrupt(&self) -> ProviderResult<()> {
        self.write_line(json!({
            "type": "control_request",
            "request_id": uuid::Uuid::new_v4().to_string(),
            "request": {"subtype": "interrupt"}
        }))
        .await
    }

    async fn close(&self) -> ProviderResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Closing stdin ends the conversation; the kill signal covers a hung process
        self.stdin.lock().await.take();
        if let Some(tx) = self
            .kill_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(());
        }
        self.queue.close();
        tracing::debug!(session_id = ?self.session_id(), "Agent CLI session closed");
        Ok(())
    }
}

async fn watch_stderr(
    stderr: ChildStderr,
    queue: AsyncQueue<AgentMessage>,
    startup: StartupSignal,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        tracing::warn!(stderr = %line, "Agent CLI stderr");
        if line.contains(SESSION_NOT_FOUND_MARKER) {
            signal_startup(&startup, Startup::NotFound(line.clone()));
            queue.push(AgentMessage::error(ErrorCode::SessionNotFound, line));
        }
    }
}

async fn read_stdout(
    mut child: Child,
    stdout: ChildStdout,
    mut kill_rx: oneshot::Receiver<()>,
    queue: AsyncQueue<AgentMessage>,
    session_id: Arc<Mutex<Option<String>>>,
    stderr_task: JoinHandle<()>,
    startup: StartupSignal,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut parser = StreamJsonParser::new();
    let mut killed = false;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&line) {
                        Ok(json) => {
                            for msg in parser.parse(&json) {
                                if let Some(id) = msg.init_session_id() {
                                    *session_id.lock().unwrap_or_else(|e| e.into_inner()) =
                                        Some(id.to_string());
                                    signal_startup(&startup, Startup::Ready);
                                }
                                queue.push(msg);
                            }
                        }
                        Err(_) => tracing::debug!(line = %line, "Skipping non-JSON output"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    queue.push(AgentMessage::error(
                        ErrorCode::StreamError,
                        format!("failed to read agent output: {}", e),
                    ));
                    break;
                }
            },
            // Fires on close() and when the session is dropped without closing
            _ = &mut kill_rx => {
                killed = true;
                break;
            }
        }
    }

    if killed {
        if let Err(e) = child.kill().await {
            tracing::warn!(error = %e, "Failed to kill agent CLI");
        }
    }

    match child.wait().await {
        Ok(status) if !status.success() && !killed => {
            queue.push(AgentMessage::error(
                ErrorCode::ProcessExited,
                format!("agent CLI exited with status: {:?}", status.code()),
            ));
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Failed to reap agent CLI"),
    }

    // Ensures we don't leak the stderr reader
    if let Err(e) = stderr_task.await {
        tracing::warn!(error = %e, "stderr reader task failed to complete");
    }
    queue.close();
}

/// Parses stream-json lines into AgentMessages with per-tool dedup
#[derive(Debug, Default)]
pub struct StreamJsonParser {
    tools: ToolLedger,
    tool_names: HashMap<String, String>,
}

impl StreamJsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, json: &Value) -> Vec<AgentMessage> {
        let Some(event_type) = json.get("type").and_then(|t| t.as_str()) else {
            return Vec::new();
        };

        match event_type {
            "system" => {
                let subtype = json
                    .get("subtype")
                    .and_then(|s| s.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let session_id = json
                    .get("session_id")
                    .and_then(|s| s.as_str())
                    .map(str::to_string);
                let metadata = json!({
                    "model": json.get("model").cloned().unwrap_or(Value::Null),
                    "cwd": json.get("cwd").cloned().unwrap_or(Value::Null),
                });
                vec![AgentMessage::System {
                    subtype,
                    session_id,
                    metadata,
                }]
            }
            "assistant" => self.parse_assistant(json),
            "user" => self.parse_tool_results(json),
            "result" => vec![parse_result(json)],
            _ => Vec::new(),
        }
    }

    fn parse_assistant(&mut self, json: &Value) -> Vec<AgentMessage> {
        let mut messages = Vec::new();
        for item in content_blocks(json) {
            match item.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                        if !text.is_empty() {
                            messages.push(AgentMessage::assistant(text));
                        }
                    }
                }
                Some("tool_use") => {
                    let Some(id) = item.get("id").and_then(|i| i.as_str()) else {
                        continue;
                    };
                    let name = item
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    self.tool_names.insert(id.to_string(), name.clone());
                    if self.tools.on_started(id) {
                        tracing::debug!(tool = %name, id = %id, "Tool use detected");
                        messages.push(AgentMessage::ToolUse {
                            id: id.to_string(),
                            name,
                            input: item.get("input").cloned().unwrap_or(Value::Null),
                        });
                    }
                }
                _ => {}
            }
        }
        messages
    }

    fn parse_tool_results(&mut self, json: &Value) -> Vec<AgentMessage> {
        let mut messages = Vec::new();
        for item in content_blocks(json) {
            if item.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
                continue;
            }
            let Some(id) = item.get("tool_use_id").and_then(|i| i.as_str()) else {
                continue;
            };
            let result = AgentMessage::ToolResult {
                id: id.to_string(),
                content: tool_result_text(item.get("content")),
                is_error: item
                    .get("is_error")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            };
            match self.tools.on_finished(id) {
                ToolTransition::Nothing => {}
                ToolTransition::ResultOnly => messages.push(result),
                ToolTransition::UseAndResult => {
                    messages.push(AgentMessage::ToolUse {
                        id: id.to_string(),
                        name: self
                            .tool_names
                            .get(id)
                            .cloned()
                            .unwrap_or_else(|| "unknown".to_string()),
                        input: Value::Null,
                    });
                    messages.push(result);
                }
            }
        }
        messages
    }
}

fn content_blocks(json: &Value) -> &[Value] {
    json.get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
        .map(|a| a.as_slice())
        .unwrap_or(&[])
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn parse_result(json: &Value) -> AgentMessage {
    let subtype = json.get("subtype").and_then(|s| s.as_str()).unwrap_or("");
    let is_error = json
        .get("is_error")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
        || subtype.starts_with("error");

    let text = json
        .get("result")
        .or_else(|| json.get("error"))
        .and_then(|r| r.as_str())
        .map(str::to_string);

    AgentMessage::Result {
        subtype: if is_error {
            ResultSubtype::Error
        } else {
            ResultSubtype::Success
        },
        text,
        usage: extract_usage(json),
    }
}

fn extract_usage(json: &Value) -> Option<Usage> {
    let mut usage = Usage::default();
    let mut found_usage = false;

    if let Some(cost) = json.get("total_cost_usd").and_then(|v| v.as_f64()) {
        usage.cost_usd = Some(cost);
        found_usage = true;
    }

    if let Some(usage_obj) = json.get("usage") {
        usage.input_tokens = usage_obj
            .get("input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        usage.output_tokens = usage_obj
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        usage.cache_read_tokens = usage_obj
            .get("cache_read_input_tokens")
            .and_then(|v| v.as_u64());
        usage.cache_write_tokens = usage_obj
            .get("cache_creation_input_tokens")
            .and_then(|v| v.as_u64());
        found_usage = true;
    }

    found_usage.then_some(usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args_with_resume_and_model() {
        let config = CliConfig {
            model: Some("opus".to_string()),
            extra_args: vec!["--add-dir".to_string(), "/src".to_string()],
            ..Default::default()
        };
        let args = build_args(&config, Some("abc-123"));
        assert!(args.contains(&SAFETY_FLAG.to_string()));
        let resume = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume + 1], "abc-123");
        let model = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[model + 1], "opus");
        assert_eq!(args.last().unwrap(), "/src");
    }

    #[test]
    fn test_parse_init_carries_session_id() {
        let mut parser = StreamJsonParser::new();
        let msgs = parser.parse(&json!({
            "type": "system",
            "subtype": "init",
            "session_id": "0b5e-1",
            "model": "sonnet"
        }));
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].init_session_id(), Some("0b5e-1"));
    }

    #[test]
    fn test_parse_tool_lifecycle_dedups_replays() {
        let mut parser = StreamJsonParser::new();
        let tool_use = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "Reading"},
                {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {"file_path": "a.rs"}}
            ]}
        });
        let first = parser.parse(&tool_use);
        assert_eq!(first.len(), 2);
        assert!(matches!(&first[1], AgentMessage::ToolUse { name, .. } if name == "Read"));

        // Replayed assistant message repeats the text but not the tool_use
        let replay = parser.parse(&tool_use);
        assert_eq!(replay, vec![AgentMessage::assistant("Reading")]);

        let tool_result = json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "toolu_1", "content": [{"type": "text", "text": "fn main() {}"}]}
            ]}
        });
        let results = parser.parse(&tool_result);
        assert_eq!(
            results,
            vec![AgentMessage::ToolResult {
                id: "toolu_1".to_string(),
                content: "fn main() {}".to_string(),
                is_error: false,
            }]
        );
        assert!(parser.parse(&tool_result).is_empty());
    }

    #[test]
    fn test_parse_orphan_tool_result_synthesizes_use() {
        let mut parser = StreamJsonParser::new();
        let msgs = parser.parse(&json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "toolu_9", "content": "denied", "is_error": true}
            ]}
        }));
        assert_eq!(msgs.len(), 2);
        assert!(matches!(&msgs[0], AgentMessage::ToolUse { id, .. } if id == "toolu_9"));
        assert!(matches!(&msgs[1], AgentMessage::ToolResult { is_error: true, .. }));
    }

    #[test]
    fn test_parse_result_with_usage() {
        let mut parser = StreamJsonParser::new();
        let msgs = parser.parse(&json!({
            "type": "result",
            "subtype": "success",
            "result": "All done",
            "total_cost_usd": 0.25,
            "usage": {"input_tokens": 100, "output_tokens": 20, "cache_read_input_tokens": 5}
        }));
        match &msgs[0] {
            AgentMessage::Result {
                subtype,
                text,
                usage: Some(usage),
            } => {
                assert_eq!(*subtype, ResultSubtype::Success);
                assert_eq!(text.as_deref(), Some("All done"));
                assert_eq!(usage.input_tokens, 100);
                assert_eq!(usage.cache_read_tokens, Some(5));
                assert_eq!(usage.cost_usd, Some(0.25));
            }
            other => panic!("Expected Result, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_result() {
        let mut parser = StreamJsonParser::new();
        let msgs = parser.parse(&json!({
            "type": "result",
            "subtype": "error_max_turns",
            "is_error": true
        }));
        assert!(matches!(
            &msgs[0],
            AgentMessage::Result {
                subtype: ResultSubtype::Error,
                usage: None,
                ..
            }
        ));
    }
}
