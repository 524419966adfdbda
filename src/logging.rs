// ABOUTME: Tracing setup: human-readable stderr output plus a daily JSON log in the workspace.
// ABOUTME: RUST_LOG controls both layers; the default is info.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. Keep the guard alive so buffered log lines are flushed.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let Some(dir) = log_dir.filter(|d| std::fs::create_dir_all(d).is_ok()) else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return None;
    };

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
        dir,
        "drover.log",
    ));
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(fmt::layer().json().with_writer(writer))
        .init();
    Some(guard)
}
