// ABOUTME: End-to-end tests for the drover CLI against an in-memory engine and the mock provider.
// ABOUTME: Parses real argument vectors and checks the text and JSON output.

use clap::Parser;
use drover::agent::providers::mock::MockProvider;
use drover::agent::ProviderRegistry;
use drover::cli::{self, Cli, Commands, Output};
use drover::core::{EngineParts, SqliteStore};
use drover::{Config, Engine};
use serde_json::Value;
use std::sync::Arc;

fn engine(mock: &MockProvider) -> Engine {
    let mut providers = ProviderRegistry::new();
    providers.insert(mock.clone().into_provider());
    Engine::new(EngineParts {
        store: Arc::new(SqliteStore::in_memory().unwrap()),
        providers,
        default_provider: "mock".to_string(),
        default_dispatcher: "system".to_string(),
        working_directory: std::env::temp_dir(),
    })
}

async fn exec(engine: &Engine, argv: &[&str]) -> String {
    let args = Cli::try_parse_from(std::iter::once("drover").chain(argv.iter().copied())).unwrap();
    let mut out = Output::new(Vec::new(), args.json);
    cli::run(engine, args.command, &mut out).await.unwrap();
    String::from_utf8(out.into_inner()).unwrap()
}

async fn exec_json(engine: &Engine, argv: &[&str]) -> Value {
    let mut full = vec!["--json"];
    full.extend_from_slice(argv);
    serde_json::from_str(&exec(engine, &full).await).unwrap()
}

#[test]
fn test_parse_dispatch_without_agent() {
    let args = Cli::try_parse_from(["drover", "dispatch", "t1", "--priority", "1"]).unwrap();
    match args.command {
        Commands::Dispatch {
            task,
            agent,
            priority,
            ..
        } => {
            assert_eq!(task, "t1");
            assert!(agent.is_none());
            assert_eq!(priority, Some(1));
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn test_parse_rejects_unknown_role() {
    assert!(Cli::try_parse_from(["drover", "agent", "register", "x", "--role", "boss"]).is_err());
}

#[tokio::test]
async fn test_register_create_and_smart_dispatch() {
    let engine = engine(&MockProvider::new("mock"));

    let agent = exec_json(
        &engine,
        &["agent", "register", "W1", "--skills", "python,go", "--max-tasks", "2"],
    )
    .await;
    assert_eq!(agent["role"], "worker");
    assert_eq!(agent["workerMode"], "ephemeral");
    assert_eq!(agent["capabilities"]["maxConcurrentTasks"], 2);

    exec(&engine, &["agent", "register", "W2", "--skills", "rust"]).await;

    let task = exec_json(
        &engine,
        &["task", "create", "Port the scraper", "--require", "python", "--prefer", "go,rust"],
    )
    .await;
    let task_id = task["id"].as_str().unwrap().to_string();
    assert_eq!(
        task["metadata"]["capabilityRequirements"]["requiredSkills"][0],
        "python"
    );

    let ranked = exec(&engine, &["match", task_id.as_str()]).await;
    assert!(ranked.starts_with(" 88  W1"), "{}", ranked);

    let dispatched = exec_json(&engine, &["dispatch", task_id.as_str()]).await;
    assert_eq!(dispatched["agent"]["name"], "W1");
    assert_eq!(dispatched["isNewAssignment"], true);

    let again = exec(&engine, &["dispatch", task_id.as_str(), "W1"]).await;
    assert!(again.contains("(already assigned)"));

    let listed = exec(&engine, &["task", "list", "--assignee", "W1"]).await;
    assert!(listed.contains("Port the scraper"));
    let unassigned = exec_json(&engine, &["task", "list", "--unassigned"]).await;
    assert_eq!(unassigned.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_session_run_and_history() {
    let mock = MockProvider::new("mock")
        .on_prompt("status")
        .respond_text("all green");
    let engine = engine(&mock);
    exec(&engine, &["agent", "register", "helper"]).await;

    let output = exec(&engine, &["session", "run", "helper", "status report"]).await;
    assert_eq!(output.trim(), "all green");
    assert_eq!(mock.close_count(), 1);

    let history = exec_json(&engine, &["session", "history", "helper"]).await;
    let types: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["messageType"].as_str().unwrap())
        .collect();
    assert_eq!(types, vec!["system", "assistant", "result"]);
}

#[tokio::test]
async fn test_providers_listing() {
    let engine = engine(&MockProvider::new("mock"));
    let providers = exec_json(&engine, &["providers"]).await;
    assert_eq!(providers[0]["name"], "mock");
    assert_eq!(
        providers[0]["modes"],
        serde_json::json!(["headless", "interactive"])
    );
}

#[tokio::test]
async fn test_engine_opens_workspace_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = dir.path().join("ws");
    let config_path = dir.path().join("drover.toml");
    std::fs::write(
        &config_path,
        format!(
            "[workspace]\npath = \"{}\"\ndefault_provider = \"bench\"\n\n[providers.bench]\ntype = \"mock\"\n",
            workspace.display()
        ),
    )
    .unwrap();

    let config = Config::load_from(&config_path).unwrap();
    let engine = Engine::open(&config).unwrap();
    assert!(workspace.join("drover.db").exists());

    let agent = exec_json(&engine, &["agent", "register", "opener"]).await;
    assert_eq!(agent["provider"], "bench");
    let providers = exec_json(&engine, &["providers"]).await;
    assert_eq!(providers.as_array().unwrap().len(), 1);
}
