// ABOUTME: Tests for dispatch and smart dispatch through the engine.
// ABOUTME: One notification per dispatch on the agent's direct channel; assignment only when new.

use drover_agent::providers::mock::MockProvider;
use drover_agent::ProviderRegistry;
use drover_core::capability::REQUIREMENTS_KEY;
use drover_core::{
    AgentCapabilities, AgentEntity, DispatchOptions, DroverError, Engine, EngineParts, NewTask,
    RegisterAgent, SqliteStore, Store, WorkerMode,
};
use serde_json::json;
use std::sync::Arc;

fn build(mock: &MockProvider) -> (Engine, Arc<dyn Store>) {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
    let mut providers = ProviderRegistry::new();
    providers.insert(mock.clone().into_provider());
    let engine = Engine::new(EngineParts {
        store: Arc::clone(&store),
        providers,
        default_provider: "mock".to_string(),
        default_dispatcher: "director-bot".to_string(),
        working_directory: std::env::temp_dir(),
    });
    (engine, store)
}

async fn worker(engine: &Engine, name: &str, skills: &[&str], max: u32) -> AgentEntity {
    engine
        .register_agent(
            RegisterAgent::worker(name, WorkerMode::Ephemeral).with_capabilities(
                AgentCapabilities::new(skills.iter().copied(), ["en"], max),
            ),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_dispatch_twice_is_new_then_not_new() {
    let (engine, store) = build(&MockProvider::new("mock"));
    let w1 = worker(&engine, "W1", &["python"], 2).await;
    let t1 = engine
        .create_task(NewTask::new("Fix the flaky test").with_priority(2))
        .await
        .unwrap();

    let first = engine
        .dispatch(&t1.id, &w1.id, DispatchOptions::default())
        .await
        .unwrap();
    assert!(first.is_new_assignment);
    assert_eq!(first.task.assignee.as_deref(), Some(w1.id.as_str()));
    assert_eq!(first.channel.id, w1.channel_id);
    assert_eq!(
        first.notification.content,
        format!("Task dispatched: Fix the flaky test ({})\nPriority: 2", t1.id)
    );
    assert_eq!(first.notification.sender, "director-bot");
    assert_eq!(first.notification.metadata["type"], "task_dispatch");
    assert_eq!(first.notification.metadata["taskId"], t1.id.as_str());
    assert_eq!(first.notification.metadata["isNewAssignment"], true);
    assert!(first.session.is_none());

    let second = engine
        .dispatch(
            &t1.id,
            &w1.id,
            DispatchOptions {
                priority: Some(1),
                dispatched_by: Some("alice".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!second.is_new_assignment);
    assert_eq!(second.notification.metadata["isNewAssignment"], false);
    assert_eq!(second.notification.metadata["priority"], 1);
    assert_eq!(second.notification.metadata["dispatchedBy"], "alice");
    assert_eq!(second.channel.id, first.channel.id);

    let messages = store.list_messages(&w1.channel_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(engine.get_agent_workload(&w1.id).await.unwrap().total_tasks, 1);
}

#[tokio::test]
async fn test_dispatch_reassigns_from_another_agent() {
    let (engine, _) = build(&MockProvider::new("mock"));
    let a = worker(&engine, "a", &[], 1).await;
    let b = worker(&engine, "b", &[], 1).await;
    let task = engine.create_task(NewTask::new("move me")).await.unwrap();

    engine.assign_to_agent(&task.id, &a.id).await.unwrap();
    let result = engine
        .dispatch(&task.id, &b.id, DispatchOptions::default())
        .await
        .unwrap();
    assert!(result.is_new_assignment);
    assert_eq!(result.task.assignee.as_deref(), Some(b.id.as_str()));
    assert_eq!(engine.get_agent_workload(&a.id).await.unwrap().total_tasks, 0);
}

#[tokio::test]
async fn test_dispatch_unknown_ids() {
    let (engine, _) = build(&MockProvider::new("mock"));
    let w = worker(&engine, "w", &[], 1).await;
    let task = engine.create_task(NewTask::new("t")).await.unwrap();

    assert!(matches!(
        engine
            .dispatch("nope", &w.id, DispatchOptions::default())
            .await,
        Err(DroverError::TaskNotFound(_))
    ));
    assert!(matches!(
        engine
            .dispatch(&task.id, "nope", DispatchOptions::default())
            .await,
        Err(DroverError::AgentNotFound(_))
    ));
}

#[tokio::test]
async fn test_dispatch_can_start_a_session() {
    let mock = MockProvider::new("mock")
        .on_prompt("assigned task")
        .respond_text("on it");
    let (engine, _) = build(&mock);
    let w = worker(&engine, "w", &[], 1).await;
    let task = engine.create_task(NewTask::new("ship it")).await.unwrap();

    let result = engine
        .dispatch(
            &task.id,
            &w.id,
            DispatchOptions {
                start_session: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let session = result.session.expect("session started");
    assert_eq!(session.agent_id, w.id);
    assert_eq!(mock.spawn_count(), 1);
    assert!(mock.prompts()[0].contains(&task.id));
}

#[tokio::test]
async fn test_session_failure_does_not_undo_dispatch() {
    let mock = MockProvider::new("mock");
    mock.set_fail_spawn(true);
    let (engine, store) = build(&mock);
    let w = worker(&engine, "w", &[], 1).await;
    let task = engine.create_task(NewTask::new("t")).await.unwrap();

    let result = engine
        .dispatch(
            &task.id,
            &w.id,
            DispatchOptions {
                start_session: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(result.session.is_none());
    assert!(result.is_new_assignment);
    assert_eq!(store.list_messages(&w.channel_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_smart_dispatch_picks_best_worker_with_capacity() {
    let (engine, _) = build(&MockProvider::new("mock"));
    let generalist = worker(&engine, "generalist", &["python"], 1).await;
    let specialist = worker(&engine, "specialist", &["python", "pandas"], 1).await;
    worker(&engine, "gopher", &["go"], 5).await;

    let metadata = json!({
        REQUIREMENTS_KEY: { "requiredSkills": ["python"], "preferredSkills": ["pandas"] }
    });
    let first = engine
        .create_task(NewTask::new("analysis").with_metadata(metadata.clone()))
        .await
        .unwrap();
    let second = engine
        .create_task(NewTask::new("more analysis").with_metadata(metadata.clone()))
        .await
        .unwrap();
    let third = engine
        .create_task(NewTask::new("even more").with_metadata(metadata))
        .await
        .unwrap();

    let candidates = engine.get_candidates(&first.id).await.unwrap();
    let names: Vec<&str> = candidates.iter().map(|m| m.agent.name.as_str()).collect();
    assert_eq!(names, vec!["specialist", "generalist"]);

    let result = engine
        .smart_dispatch(&first.id, DispatchOptions::default())
        .await
        .unwrap();
    assert_eq!(result.agent.id, specialist.id);

    // Specialist is now full
    let result = engine
        .smart_dispatch(&second.id, DispatchOptions::default())
        .await
        .unwrap();
    assert_eq!(result.agent.id, generalist.id);

    assert!(matches!(
        engine
            .smart_dispatch(&third.id, DispatchOptions::default())
            .await,
        Err(DroverError::NoEligibleAgent(_))
    ));
}

#[tokio::test]
async fn test_missing_channel_is_recreated_once() {
    let (engine, store) = build(&MockProvider::new("mock"));
    let mut w = worker(&engine, "w", &[], 1).await;
    w.channel_id = "gone".to_string();
    store.put_agent(&w).await.unwrap();
    let task = engine.create_task(NewTask::new("t")).await.unwrap();

    let first = engine
        .dispatch(&task.id, &w.id, DispatchOptions::default())
        .await
        .unwrap();
    assert_ne!(first.channel.id, "gone");
    assert_eq!(first.agent.channel_id, first.channel.id);

    let second = engine
        .dispatch(&task.id, &w.id, DispatchOptions::default())
        .await
        .unwrap();
    assert_eq!(second.channel.id, first.channel.id);
}
