// ABOUTME: Interactive agent CLI provider - runs the CLI inside a shell on a pseudo-terminal.
// ABOUTME: Types the quoted command line after a settle delay and scans output for the session id.

use super::binary_available;
use super::cli::{CliConfig, SAFETY_FLAG};
use crate::error::{ProviderError, ProviderResult};
use crate::provider::{
    DataListener, ExitInfo, ExitListener, InteractiveProvider, InteractiveSession, Provider,
    SpawnOptions, TerminalSize,
};
use anyhow::Context;
use async_trait::async_trait;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use regex::Regex;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Matches a UUID anywhere in terminal output
pub const DEFAULT_SESSION_ID_PATTERN: &str =
    r"([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})";

/// CSI, OSC and two-byte escape sequences
const ANSI_PATTERN: &str = r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]";

/// Bytes of recent output kept for matching
const SCAN_WINDOW: usize = 4096;

/// Quote one shell word with single quotes; plain words pass through
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Join a program and its arguments into one shell command line
pub fn build_command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Arguments for an interactive session; the initial prompt goes last
pub fn interactive_args(config: &CliConfig, options: &SpawnOptions) -> Vec<String> {
    let mut args = vec![SAFETY_FLAG.to_string()];
    if let Some(ref model) = config.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(ref id) = options.resume_session_id {
        args.push("--resume".to_string());
        args.push(id.clone());
    }
    args.extend(config.extra_args.iter().cloned());
    if let Some(ref prompt) = options.initial_prompt {
        args.push(prompt.clone());
    }
    args
}

/// Finds a session id in a terminal byte stream split into arbitrary chunks.
/// The first id found is kept; ids the shell echoes back from the typed command never count.
#[derive(Debug, Clone)]
pub struct SessionIdScanner {
    pattern: Regex,
    ansi: Regex,
    window: String,
    ignored: Vec<String>,
    found: Option<String>,
}

impl SessionIdScanner {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            ansi: Regex::new(ANSI_PATTERN)?,
            window: String::new(),
            ignored: Vec::new(),
            found: None,
        })
    }

    /// Never report ids that appear in `text`, such as the command line typed into the shell
    pub fn ignoring(mut self, text: &str) -> Self {
        let ids: Vec<String> = self.matches(text).collect();
        self.ignored.extend(ids);
        self
    }

    fn matches<'a>(&'a self, text: &'a str) -> impl Iterator<Item = String> + 'a {
        self.pattern.captures_iter(text).filter_map(|caps| {
            caps.get(1)
                .or_else(|| caps.get(0))
                .map(|m| m.as_str().to_string())
        })
    }

    /// Feed a chunk of output; returns the session id once one has been seen
    pub fn feed(&mut self, chunk: &[u8]) -> Option<String> {
        if self.found.is_some() {
            return self.found.clone();
        }

        self.window.push_str(&String::from_utf8_lossy(chunk));
        if self.window.len() > SCAN_WINDOW {
            let mut cut = self.window.len() - SCAN_WINDOW;
            while !self.window.is_char_boundary(cut) {
                cut += 1;
            }
            self.window.drain(..cut);
        }

        let clean = self.ansi.replace_all(&self.window, "").into_owned();
        let found = self
            .matches(&clean)
            .find(|id| !self.ignored.contains(id));
        if found.is_some() {
            self.window.clear();
            self.found = found;
        }
        self.found.clone()
    }
}

pub struct PtyProvider {
    name: String,
    config: CliConfig,
    scanner: SessionIdScanner,
}

impl PtyProvider {
    pub fn new(name: &str, config: CliConfig) -> anyhow::Result<Self> {
        let pattern = config
            .session_id_pattern
            .as_deref()
            .unwrap_or(DEFAULT_SESSION_ID_PATTERN);
        let scanner = SessionIdScanner::new(pattern)
            .with_context(|| format!("Invalid session_id_pattern: {}", pattern))?;
        Ok(Self {
            name: name.to_string(),
            config,
            scanner,
        })
    }

    fn shell(&self) -> String {
        self.config
            .shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "bash".to_string())
    }
}

#[async_trait]
impl Provider for PtyProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        binary_available(&self.config.binary)
    }
}

#[async_trait]
impl InteractiveProvider for PtyProvider {
    async fn spawn(
        &self,
        options: SpawnOptions,
        size: TerminalSize,
    ) -> ProviderResult<Box<dyn InteractiveSession>> {
        let spawn_err = |e: anyhow::Error| ProviderError::spawn(&self.name, e);

        let pair = native_pty_system()
            .openpty(pty_size(size))
            .context("Failed to open PTY")
            .map_err(spawn_err)?;

        let mut cmd = CommandBuilder::new(self.shell());
        cmd.cwd(&options.working_directory);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .context("Failed to spawn shell")
            .map_err(spawn_err)?;
        let killer = child.clone_killer();
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")
            .map_err(spawn_err)?;
        let writer = pair
            .master
            .take_writer()
            .context("Failed to take PTY writer")
            .map_err(spawn_err)?;

        let shared = Arc::new(Shared {
            session_id: Mutex::new(options.resume_session_id.clone()),
            data_listeners: Mutex::new(Vec::new()),
            exit: Mutex::new(ExitState::default()),
        });

        let command_line =
            build_command_line(&self.config.binary, &interactive_args(&self.config, &options));

        // Reader
        let reader_shared = Arc::clone(&shared);
        let mut scanner = self.scanner.clone().ignoring(&command_line);
        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buffer = [0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => reader_shared.on_output(&buffer[..n], &mut scanner),
                    Err(e) => {
                        tracing::debug!(error = %e, "PTY read ended");
                        break;
                    }
                }
            }
            tracing::debug!("PTY reader stopped");
        });

        // Waiter
        let waiter_shared = Arc::clone(&shared);
        tokio::task::spawn_blocking(move || {
            let info = match child.wait() {
                Ok(status) => ExitInfo {
                    code: Some(status.exit_code()),
                    success: status.success(),
                },
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to wait for PTY child");
                    ExitInfo {
                        code: None,
                        success: false,
                    }
                }
            };
            waiter_shared.on_exit(info);
        });

        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        let settle = Duration::from_millis(self.config.settle_delay_ms);
        let typing_writer = Arc::clone(&writer);
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let mut writer = typing_writer.lock().await;
            let typed = writer
                .write_all(format!("{}\r", command_line).as_bytes())
                .and_then(|_| writer.flush());
            match typed {
                Ok(()) => {
                    tracing::debug!(command = %command_line, "Agent command typed into PTY")
                }
                Err(e) => tracing::warn!(error = %e, "Failed to type agent command"),
            }
        });

        tracing::info!(
            provider = %self.name,
            cwd = %options.working_directory.display(),
            cols = size.cols,
            rows = size.rows,
            "Interactive session started"
        );

        Ok(Box::new(PtySession {
            master: Mutex::new(pair.master),
            writer,
            killer: Mutex::new(killer),
            killed: AtomicBool::new(false),
            shared,
        }))
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

#[derive(Default)]
struct ExitState {
    info: Option<ExitInfo>,
    listeners: Vec<ExitListener>,
}

struct Shared {
    session_id: Mutex<Option<String>>,
    data_listeners: Mutex<Vec<DataListener>>,
    exit: Mutex<ExitState>,
}

impl Shared {
    fn on_output(&self, data: &[u8], scanner: &mut SessionIdScanner) {
        {
            // Set once; a resumed session starts with its id already known
            let mut current = self.session_id.lock().unwrap_or_else(|e| e.into_inner());
            if current.is_none() {
                if let Some(id) = scanner.feed(data) {
                    tracing::debug!(session_id = %id, "Session id observed in terminal output");
                    *current = Some(id);
                }
            }
        }
        for listener in self
            .data_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            listener(data);
        }
    }

    fn on_exit(&self, info: ExitInfo) {
        let listeners = {
            let mut state = self.exit.lock().unwrap_or_else(|e| e.into_inner());
            state.info = Some(info);
            std::mem::take(&mut state.listeners)
        };
        tracing::info!(code = ?info.code, success = info.success, "PTY process exited");
        for listener in listeners {
            listener(info);
        }
    }
}

pub struct PtySession {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Arc<tokio::sync::Mutex<Box<dyn Write + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    killed: AtomicBool,
    shared: Arc<Shared>,
}

#[async_trait]
impl InteractiveSession for PtySession {
    fn session_id(&self) -> Option<String> {
        self.shared
            .session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn write(&self, data: &[u8]) -> ProviderResult<()> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(ProviderError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    async fn resize(&self, size: TerminalSize) -> ProviderResult<()> {
        self.master
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .resize(pty_size(size))
            .map_err(|e| ProviderError::Io(std::io::Error::other(e.to_string())))
    }

    async fn kill(&self) -> ProviderResult<()> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self
            .killer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .kill();
        if let Err(e) = result {
            // Already exited
            tracing::debug!(error = %e, "PTY kill failed");
        }
        Ok(())
    }

    fn on_data(&self, listener: DataListener) {
        self.shared
            .data_listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    fn on_exit(&self, listener: ExitListener) {
        let mut state = self.shared.exit.lock().unwrap_or_else(|e| e.into_inner());
        match state.info {
            Some(info) => {
                drop(state);
                listener(info);
            }
            None => state.listeners.push(listener),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_plain_words_untouched() {
        assert_eq!(shell_quote("--resume"), "--resume");
        assert_eq!(shell_quote("/usr/local/bin/claude"), "/usr/local/bin/claude");
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's done"), r"'it'\''s done'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_command_line_with_resume_and_prompt() {
        let options = SpawnOptions::new("/tmp")
            .with_resume("abc")
            .with_prompt("fix the bug, don't stop");
        let line =
            build_command_line("claude", &interactive_args(&CliConfig::default(), &options));
        assert_eq!(
            line,
            r"claude --dangerously-skip-permissions --resume abc 'fix the bug, don'\''t stop'"
        );
    }

    #[test]
    fn test_scanner_finds_id_across_chunks() {
        let mut scanner = SessionIdScanner::new(DEFAULT_SESSION_ID_PATTERN).unwrap();
        assert_eq!(scanner.feed(b"session: 3f2a9c1e-77b0-4d"), None);
        assert_eq!(
            scanner.feed(b"1a-9e3c-0a1b2c3d4e5f\r\n"),
            Some("3f2a9c1e-77b0-4d1a-9e3c-0a1b2c3d4e5f".to_string())
        );
    }

    #[test]
    fn test_scanner_strips_ansi_inside_id() {
        let mut scanner = SessionIdScanner::new(DEFAULT_SESSION_ID_PATTERN).unwrap();
        let found = scanner.feed(b"\x1b[1m3f2a9c1e\x1b[0m-77b0-4d1a-9e3c-0a1b2c3d4e5f");
        assert_eq!(found.as_deref(), Some("3f2a9c1e-77b0-4d1a-9e3c-0a1b2c3d4e5f"));
    }

    #[test]
    fn test_scanner_window_forgets_old_output() {
        let mut scanner = SessionIdScanner::new(DEFAULT_SESSION_ID_PATTERN).unwrap();
        assert_eq!(scanner.feed(b"3f2a9c1e-77b0-4d1a-"), None);
        let noise = vec![b'x'; SCAN_WINDOW + 10];
        assert_eq!(scanner.feed(&noise), None);
        assert_eq!(scanner.feed(b"9e3c-0a1b2c3d4e5f"), None);
    }

    #[test]
    fn test_scanner_skips_ids_echoed_from_typed_command() {
        let task_id = "11111111-2222-3333-4444-555555555555";
        let options = SpawnOptions::new("/tmp")
            .with_prompt(format!("You have been assigned task {}. Please start.", task_id));
        let line = build_command_line("claude", &interactive_args(&CliConfig::default(), &options));

        let mut scanner = SessionIdScanner::new(DEFAULT_SESSION_ID_PATTERN)
            .unwrap()
            .ignoring(&line);
        let echoed = format!("$ {}\r\n", line);
        assert_eq!(scanner.feed(echoed.as_bytes()), None);
        assert_eq!(
            scanner.feed(b"session aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee\r\n").as_deref(),
            Some("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee")
        );
    }

    #[test]
    fn test_scanner_keeps_first_id() {
        let mut scanner = SessionIdScanner::new(DEFAULT_SESSION_ID_PATTERN).unwrap();
        scanner.feed(b"aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee\r\n");
        let later = scanner.feed(b"reading 99999999-8888-7777-6666-555555555555.json");
        assert_eq!(later.as_deref(), Some("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee"));
    }

    #[test]
    fn test_scanner_custom_pattern_capture_group() {
        let mut scanner = SessionIdScanner::new(r"session=(\w+)").unwrap();
        assert_eq!(scanner.feed(b"ready session=abc123 ok").as_deref(), Some("abc123"));
    }
}
