// ABOUTME: Main entry point for the drover command-line tool
// ABOUTME: Loads config, opens the workspace engine and runs one command

use anyhow::Result;
use clap::Parser;
use drover::cli::{self, Cli, Output};
use drover::{logging, Config, Engine};
use drover_core::paths;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Cli::parse();

    let config = match args.config {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let _log_guard = logging::init(Some(&paths::log_dir(&config.workspace_dir())));

    tracing::debug!(
        workspace = %config.workspace.path,
        providers = config.providers.len(),
        "Configuration loaded"
    );

    let engine = Engine::open(&config)?;
    let mut out = Output::new(std::io::stdout().lock(), args.json);
    let result = cli::run(&engine, args.command, &mut out).await;
    engine.shutdown().await;
    result
}
