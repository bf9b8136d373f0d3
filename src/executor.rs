use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::agent_registry::AgentRegistry;
use crate::budget::{cost, estimate_tokens, BudgetDimension, BudgetStore, RateLimiter, UsageEvent, UsageTracker};
use crate::error::{AgentError, AgentResult};
use crate::sampling::{SampleMessage, SampleRequest, SamplingAdapter};
use crate::skills::SkillsService;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteAgentInput {
    pub agent_id: String,
    pub prompt: String,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub context: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub toolkits: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub documents: Vec<String>,
    pub output_fields: Option<Vec<String>>,
    #[serde(default)]
    pub verbose: bool,
}

/// Runs the single-agent 8-step algorithm from SPEC_FULL.md §4.7: skill
/// assembly, message assembly, tool-set merge, budget gate, rate-limit
/// check, sample, usage accounting, output shaping. Grounded in `Agent`'s
/// message-send pattern (`agent.rs`), generalized to compose skills and
/// enforce budgets the teacher's `Agent::send` never had to.
pub struct AgentExecutor {
    registry: Arc<AgentRegistry>,
    skills: Arc<SkillsService>,
    sampler: Arc<dyn SamplingAdapter>,
    budget: Arc<dyn BudgetStore>,
    rate_limiter: Arc<dyn RateLimiter>,
    usage: Arc<UsageTracker>,
}

impl AgentExecutor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        skills: Arc<SkillsService>,
        sampler: Arc<dyn SamplingAdapter>,
        budget: Arc<dyn BudgetStore>,
        rate_limiter: Arc<dyn RateLimiter>,
        usage: Arc<UsageTracker>,
    ) -> Self {
        AgentExecutor {
            registry,
            skills,
            sampler,
            budget,
            rate_limiter,
            usage,
        }
    }

    pub async fn execute(&self, input: ExecuteAgentInput) -> AgentResult<JsonValue> {
        let execution_id = Uuid::new_v4().to_string();
        let cfg = self.registry.get(&input.agent_id).await;

        let model = input
            .model
            .clone()
            .or_else(|| cfg.as_ref().and_then(|c| c.model.clone()));
        let temperature = input
            .temperature
            .unwrap_or_else(|| cfg.as_ref().map(|c| c.temperature).unwrap_or(0.7));
        let max_tokens = input
            .max_tokens
            .unwrap_or_else(|| cfg.as_ref().map(|c| c.max_tokens).unwrap_or(4096));
        let top_p = input
            .top_p
            .unwrap_or_else(|| cfg.as_ref().map(|c| c.top_p).unwrap_or(1.0));

        // Step 1: skill assembly.
        let skill_ids: Vec<String> = if !input.skills.is_empty() {
            input.skills.clone()
        } else {
            cfg.as_ref().map(|c| c.skills.clone()).unwrap_or_default()
        };
        let (skill_instructions, skill_rules_text, skill_system_prompt, composed_tools) =
            if !skill_ids.is_empty() {
                let composition = self.skills.compose(&skill_ids).await?;
                let mut rules = composition.rules.clone();
                rules.sort_by(|a, b| b.priority.cmp(&a.priority));
                let rules_text = rules
                    .iter()
                    .filter(|r| r.enabled)
                    .map(|r| format!("[Rule {}] {}", r.id, r.description))
                    .collect::<Vec<_>>()
                    .join("\n");
                (
                    composition.instructions,
                    rules_text,
                    composition.system_prompt,
                    composition.tools,
                )
            } else {
                (String::new(), String::new(), String::new(), Vec::new())
            };

        // Step 2: message assembly.
        let mut messages = Vec::new();
        if !skill_instructions.is_empty() {
            messages.push(SampleMessage::system(skill_instructions));
        }
        if !skill_rules_text.is_empty() {
            messages.push(SampleMessage::system(skill_rules_text));
        }
        let explicit_system = input
            .system_prompt
            .clone()
            .or_else(|| cfg.as_ref().and_then(|c| c.system_prompt.clone()))
            .or_else(|| {
                if skill_system_prompt.is_empty() {
                    None
                } else {
                    Some(skill_system_prompt.clone())
                }
            });
        if let Some(sp) = explicit_system {
            messages.push(SampleMessage::system(sp));
        }
        for ctx in &input.context {
            messages.push(SampleMessage::user(ctx.clone()));
        }
        if !input.documents.is_empty() {
            let joined = input
                .documents
                .iter()
                .enumerate()
                .map(|(i, d)| format!("[Document {}]\n{}", i + 1, d))
                .collect::<Vec<_>>()
                .join("\n\n");
            messages.push(SampleMessage::system(joined));
        }
        messages.push(SampleMessage::user(input.prompt.clone()));

        // Step 3: tool-set merge.
        let mut tool_set: HashSet<String> = input.tools.iter().cloned().collect();
        if let Some(c) = &cfg {
            tool_set.extend(c.enabled_tools.iter().cloned());
        }
        tool_set.extend(composed_tools.into_iter());

        // Step 4: budget gate.
        let (est_prompt, est_completion) = estimate_tokens(max_tokens);
        let est_total = est_prompt + est_completion;
        for (dim, amount) in [
            (BudgetDimension::Tokens, est_total as f64),
            (BudgetDimension::Cost, cost(model.as_deref().unwrap_or("default"), est_prompt, est_completion)),
            (BudgetDimension::Calls, 1.0),
        ] {
            let check = self.budget.check(&input.agent_id, dim, amount).await;
            if !check.allowed {
                let failure = UsageEvent {
                    execution_id: execution_id.clone(),
                    agent_id: input.agent_id.clone(),
                    model: model.clone().unwrap_or_default(),
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    total_tokens: 0,
                    cost: 0.0,
                    duration_ms: 0,
                    success: false,
                    error: check.reason.clone(),
                    timestamp: Utc::now(),
                };
                self.usage.record(failure).await;
                return Err(AgentError::BudgetExceeded {
                    dimension: capitalize(dim.label()),
                    reason: check.reason.unwrap_or_default(),
                });
            }
        }

        // Step 5: rate-limit check and call record.
        if let Err(e) = self.rate_limiter.check(&input.agent_id).await {
            return Err(e);
        }
        self.rate_limiter.record(&input.agent_id).await;

        // Step 6: sample.
        let started = Instant::now();
        let sample_result = self
            .sampler
            .sample(SampleRequest {
                messages,
                model: model.clone(),
                temperature,
                max_tokens,
                top_p,
                enabled_tools: tool_set.iter().cloned().collect(),
                include_context: !tool_set.is_empty(),
                structured_output: None,
            })
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let response = match sample_result {
            Ok(r) => r,
            Err(e) => {
                let failure = UsageEvent {
                    execution_id: execution_id.clone(),
                    agent_id: input.agent_id.clone(),
                    model: model.clone().unwrap_or_default(),
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    total_tokens: 0,
                    cost: 0.0,
                    duration_ms,
                    success: false,
                    error: Some(e.to_string()),
                    timestamp: Utc::now(),
                };
                self.usage.record(failure).await;
                return Err(e);
            }
        };

        // Step 7: usage accounting.
        let actual_cost = cost(&response.model, response.usage.prompt_tokens, response.usage.completion_tokens);
        self.budget
            .consume(&input.agent_id, BudgetDimension::Tokens, response.usage.total_tokens as f64)
            .await;
        self.budget
            .consume(&input.agent_id, BudgetDimension::Cost, actual_cost)
            .await;
        self.budget
            .consume(&input.agent_id, BudgetDimension::Calls, 1.0)
            .await;
        self.usage
            .record(UsageEvent {
                execution_id: execution_id.clone(),
                agent_id: input.agent_id.clone(),
                model: response.model.clone(),
                prompt_tokens: response.usage.prompt_tokens,
                completion_tokens: response.usage.completion_tokens,
                total_tokens: response.usage.total_tokens,
                cost: actual_cost,
                duration_ms,
                success: true,
                error: None,
                timestamp: Utc::now(),
            })
            .await;
        for skill_id in &skill_ids {
            self.skills.record_usage(skill_id).await;
        }

        // Step 8: output shaping.
        let full = json!({
            "agentId": input.agent_id,
            "response": response.content,
            "model": response.model,
            "usage": {
                "promptTokens": response.usage.prompt_tokens,
                "completionTokens": response.usage.completion_tokens,
                "totalTokens": response.usage.total_tokens,
            },
            "finishReason": response.finish_reason,
            "skillsUsed": skill_ids,
            "toolsAvailable": tool_set.len(),
            "timestamp": Utc::now(),
        });

        Ok(project_output(full, input.output_fields.as_deref(), input.verbose))
    }
}

/// Capitalizes a dimension label (e.g. "token" → "Token") so error messages
/// read "Token budget exceeded" per SPEC_FULL.md's S2 scenario.
fn capitalize(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        None => String::new(),
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
    }
}

/// Applies `output_fields` filtering if set; otherwise, for non-verbose
/// calls (as team-orchestrator contributions are), projects down to
/// `{agentId, contribution}`. Idempotent under repeated application (P9).
pub fn project_output(full: JsonValue, output_fields: Option<&[String]>, verbose: bool) -> JsonValue {
    if let Some(fields) = output_fields {
        let obj = full.as_object().cloned().unwrap_or_default();
        let mut out = serde_json::Map::new();
        for f in fields {
            if let Some(v) = obj.get(f) {
                out.insert(f.clone(), v.clone());
            }
        }
        return JsonValue::Object(out);
    }
    if !verbose {
        let obj = full.as_object().cloned().unwrap_or_default();
        let mut out = serde_json::Map::new();
        if let Some(v) = obj.get("agentId") {
            out.insert("agentId".to_string(), v.clone());
        }
        let contribution = obj.get("response").cloned().unwrap_or(JsonValue::Null);
        out.insert("contribution".to_string(), contribution);
        return JsonValue::Object(out);
    }
    full
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::InMemoryBudgetStore;
    use crate::budget::{BudgetLimit, BudgetWindow};
    use crate::sampling::test_support::StubAdapter;
    use crate::skills::{PermissiveResolver, SkillsService};

    fn executor(budget: Arc<dyn BudgetStore>) -> AgentExecutor {
        let tmp = tempfile::tempdir().unwrap();
        AgentExecutor::new(
            Arc::new(AgentRegistry::new()),
            Arc::new(SkillsService::new(tmp.into_path(), Box::new(PermissiveResolver))),
            Arc::new(StubAdapter::new("answer")),
            budget,
            Arc::new(crate::budget::SlidingWindowRateLimiter::new(1000, std::time::Duration::from_secs(60))),
            Arc::new(UsageTracker::new()),
        )
    }

    #[tokio::test]
    async fn execute_returns_full_record_when_verbose() {
        let exec = executor(Arc::new(InMemoryBudgetStore::new()));
        let result = exec
            .execute(ExecuteAgentInput {
                agent_id: "a1".to_string(),
                prompt: "hello".to_string(),
                model: None,
                temperature: None,
                max_tokens: None,
                top_p: None,
                system_prompt: None,
                context: vec![],
                tools: vec![],
                toolkits: vec![],
                skills: vec![],
                documents: vec![],
                output_fields: None,
                verbose: true,
            })
            .await
            .unwrap();
        assert!(result["response"].as_str().unwrap().contains("hello"));
        assert_eq!(result["agentId"], "a1");
    }

    #[tokio::test]
    async fn execute_projects_to_contribution_when_not_verbose() {
        let exec = executor(Arc::new(InMemoryBudgetStore::new()));
        let result = exec
            .execute(ExecuteAgentInput {
                agent_id: "a1".to_string(),
                prompt: "hi".to_string(),
                model: None,
                temperature: None,
                max_tokens: None,
                top_p: None,
                system_prompt: None,
                context: vec![],
                tools: vec![],
                toolkits: vec![],
                skills: vec![],
                documents: vec![],
                output_fields: None,
                verbose: false,
            })
            .await
            .unwrap();
        assert!(result.get("contribution").is_some());
        assert!(result.get("usage").is_none());
    }

    #[tokio::test]
    async fn execute_fails_closed_on_budget_exceeded() {
        let store = InMemoryBudgetStore::new().with_limit(
            "a1",
            BudgetLimit {
                dimension: BudgetDimension::Tokens,
                window: BudgetWindow::Total,
                limit: 1.0,
            },
        );
        let exec = executor(Arc::new(store));
        let err = exec
            .execute(ExecuteAgentInput {
                agent_id: "a1".to_string(),
                prompt: "hi".to_string(),
                model: None,
                temperature: None,
                max_tokens: Some(1000),
                top_p: None,
                system_prompt: None,
                context: vec![],
                tools: vec![],
                toolkits: vec![],
                skills: vec![],
                documents: vec![],
                output_fields: None,
                verbose: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::BudgetExceeded { .. }));
    }
}
