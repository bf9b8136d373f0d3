use std::sync::Arc;
use std::time::Duration;

use agentrpc::budget::{InMemoryBudgetStore, SlidingWindowRateLimiter, UsageTracker};
use agentrpc::sampling::{SampleRequest, SampleResponse, SamplingAdapter};
use agentrpc::skills::PermissiveResolver;
use agentrpc::{build_server, AgentRegistry, AppState, ServerConfig, SkillsService};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

/// A deterministic stand-in for the host's sampling facility, used the
/// same way the teacher's tests swap in mock transports: it never makes a
/// network call, just echoes a fixed shape back with plausible usage.
struct ScenarioAdapter;

#[async_trait]
impl SamplingAdapter for ScenarioAdapter {
    async fn sample(&self, request: SampleRequest) -> Result<SampleResponse, agentrpc::AgentError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, agentrpc::sampling::SampleRole::User))
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let prompt_tokens = (request.max_tokens as f32 * 0.4) as u32;
        let completion_tokens = (request.max_tokens as f32 * 0.6) as u32;
        Ok(SampleResponse {
            content: format!("Summary of: {}", last_user),
            model: request.model.unwrap_or_else(|| "scenario-model".to_string()),
            usage: agentrpc::sampling::Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
            finish_reason: "stop".to_string(),
            structured_data: None,
        })
    }
}

async fn build_test_server() -> agentrpc::ToolServer {
    let tmp = tempfile::tempdir().unwrap();
    let state = Arc::new(AppState::new(
        Arc::new(AgentRegistry::new()),
        Arc::new(SkillsService::new(tmp.into_path(), Box::new(PermissiveResolver))),
        Arc::new(ScenarioAdapter),
        Arc::new(InMemoryBudgetStore::new()),
        Arc::new(SlidingWindowRateLimiter::new(1000, Duration::from_secs(60))),
        Arc::new(UsageTracker::new()),
        ServerConfig::default(),
    ));
    build_server(state).await
}

fn body(envelope: &agentrpc::ToolEnvelope) -> JsonValue {
    serde_json::from_str(&envelope.content[0].text).unwrap()
}

// S1 — configure then execute.
#[tokio::test]
async fn configure_and_execute_agent() {
    let server = build_test_server().await;

    let configured = server
        .dispatch(
            "configure_agent",
            json!({
                "agentId": "r1",
                "name": "Researcher",
                "model": "M",
                "temperature": 0.5,
                "maxTokens": 500,
                "topP": 1.0,
                "systemPrompt": "You summarize."
            }),
        )
        .await;
    assert_eq!(configured.is_error, None);

    let executed = server
        .dispatch("execute_agent", json!({"agentId": "r1", "prompt": "Summarize X", "verbose": true}))
        .await;
    assert_eq!(executed.is_error, None);
    let result = body(&executed);
    assert!(result["response"].as_str().unwrap().contains("Summarize X"));
    assert_eq!(result["skillsUsed"].as_array().unwrap().len(), 0);
    assert_eq!(result["toolsAvailable"], 0);
}

// S2 — budget refusal.
#[tokio::test]
async fn execute_agent_respects_token_budget() {
    let tmp = tempfile::tempdir().unwrap();
    let budget = InMemoryBudgetStore::new().with_limit(
        "r1",
        agentrpc::budget::BudgetLimit {
            dimension: agentrpc::budget::BudgetDimension::Tokens,
            window: agentrpc::budget::BudgetWindow::Total,
            limit: 100.0,
        },
    );
    let state = Arc::new(AppState::new(
        Arc::new(AgentRegistry::new()),
        Arc::new(SkillsService::new(tmp.into_path(), Box::new(PermissiveResolver))),
        Arc::new(ScenarioAdapter),
        Arc::new(budget),
        Arc::new(SlidingWindowRateLimiter::new(1000, Duration::from_secs(60))),
        Arc::new(UsageTracker::new()),
        ServerConfig::default(),
    ));
    let server = build_server(state).await;
    server
        .dispatch("configure_agent", json!({"agentId": "r1", "name": "Researcher"}))
        .await;

    let executed = server
        .dispatch(
            "execute_agent",
            json!({"agentId": "r1", "prompt": "go", "maxTokens": 1000, "verbose": true}),
        )
        .await;
    assert_eq!(executed.is_error, Some(true));
    assert!(executed.content[0].text.to_lowercase().contains("budget"));
}

// S3 — skill composition conflict resolution.
#[tokio::test]
async fn compose_skills_resolves_rule_conflicts() {
    let server = build_test_server().await;
    server
        .dispatch(
            "create_skill",
            json!({
                "skillId": "s1",
                "name": "S1",
                "config": {"toolkits": [], "rules": [{"id": "r", "description": "A", "priority": 10}]},
            }),
        )
        .await;
    server
        .dispatch(
            "create_skill",
            json!({
                "skillId": "s2",
                "name": "S2",
                "config": {"toolkits": [], "rules": [{"id": "r", "description": "B", "priority": 20}]},
            }),
        )
        .await;

    let composed = server
        .dispatch("compose_skills", json!({"skillIds": ["s1", "s2"]}))
        .await;
    assert_eq!(composed.is_error, None);
    let result = body(&composed);
    assert_eq!(result["rules"][0]["description"], "B");
    assert_eq!(result["conflicts"].as_array().unwrap().len(), 1);
}

// S4 — parallel ordering.
#[tokio::test]
async fn agent_teams_parallel_preserves_resolved_order() {
    let server = build_test_server().await;
    let result = server
        .dispatch(
            "agent_teams",
            json!({
                "agents": [{"id": "a"}, {"id": "b"}, {"id": "c"}],
                "task": "T",
                "mode": "parallel",
                "verbose": true,
            }),
        )
        .await;
    assert_eq!(result.is_error, None);
    let parsed = body(&result);
    let ids: Vec<String> = parsed["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["agentId"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
}

// S5 — async team with a timeout that fires before completion; the handle
// still completes (not fails) with partial results once the deadline
// passes, because the task is continuable by default.
#[tokio::test]
async fn agent_teams_async_completes_on_timeout_with_partial_results() {
    let server = build_test_server().await;
    let started = server
        .dispatch(
            "agent_teams_async",
            json!({
                "agents": [{"id": "a"}, {"id": "b"}],
                "task": "T",
                "mode": "linear",
                "maxRounds": 3,
                "timeoutMs": 5,
                "continuable": true,
                "verbose": true,
            }),
        )
        .await;
    let started_body = body(&started);
    let handle_id = started_body["handleId"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let waited = server
        .dispatch("wait_for", json!({"handleId": handle_id, "timeoutMs": 2000}))
        .await;
    let handle = body(&waited);
    assert_eq!(handle["status"], "completed");
}

// Skill attach/detach/delete lifecycle invariant (I4).
#[tokio::test]
async fn delete_skill_is_refused_while_attached_then_succeeds_after_detach() {
    let server = build_test_server().await;
    server
        .dispatch("create_skill", json!({"skillId": "s1", "name": "S1", "config": {"toolkits": []}}))
        .await;
    server
        .dispatch("attach_skill", json!({"skillId": "s1", "entityType": "agent", "entityId": "a1"}))
        .await;

    let refused = server.dispatch("delete_skill", json!({"skillId": "s1"})).await;
    assert_eq!(refused.is_error, Some(true));

    server
        .dispatch("detach_skill", json!({"skillId": "s1", "entityType": "agent", "entityId": "a1"}))
        .await;
    let deleted = server.dispatch("delete_skill", json!({"skillId": "s1"})).await;
    assert_eq!(deleted.is_error, None);
}
