// ABOUTME: Metric helpers over the `metrics` facade.
// ABOUTME: Installing an exporter is left to the host process.

use metrics::{counter, gauge};

pub fn record_dispatch(agent_id: &str, is_new_assignment: bool) {
    counter!(
        "drover_dispatches_total",
        "agent" => agent_id.to_string(),
        "new_assignment" => is_new_assignment.to_string()
    )
    .increment(1);
}

pub fn record_session_spawned(provider: &str, mode: &str) {
    counter!(
        "drover_sessions_spawned_total",
        "provider" => provider.to_string(),
        "mode" => mode.to_string()
    )
    .increment(1);
    gauge!("drover_active_sessions").increment(1.0);
}

pub fn record_session_ended() {
    gauge!("drover_active_sessions").decrement(1.0);
}

pub fn record_message_persisted(kind: &str) {
    counter!("drover_session_messages_persisted_total", "type" => kind.to_string()).increment(1);
}

pub fn record_persist_failure() {
    counter!("drover_session_message_persist_failures_total").increment(1);
}

pub fn record_spawn_failure(provider: &str) {
    counter!("drover_session_spawn_failures_total", "provider" => provider.to_string())
        .increment(1);
}
