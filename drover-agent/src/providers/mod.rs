// ABOUTME: Provider implementations (agent CLI over pipes and pty, session server, mock).
// ABOUTME: Each provider implements the headless and/or interactive facet traits.

pub mod cli;
pub mod http;
pub mod mock;
pub mod pty;
pub mod server;
pub mod stream_json;

/// Whether `binary` resolves to an executable (absolute path or on PATH)
pub(crate) fn binary_available(binary: &str) -> bool {
    which::which(binary).is_ok()
}
