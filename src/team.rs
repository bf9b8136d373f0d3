use chrono::Utc;
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::agent_registry::{AgentRegistry, InlineAgentSpec, ResolvedAgent};
use crate::error::{AgentError, AgentResult};
use crate::executor::project_output;
use crate::sampling::{SampleMessage, SampleRequest, SamplingAdapter};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TeamMode {
    Linear,
    Parallel,
    Rounds,
    Intelligent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntelligentSelection {
    pub pool_size: usize,
    pub criteria: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConditionAction {
    Stop,
    Branch,
    Repeat,
    Continue,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamCondition {
    pub check: String,
    pub action: ConditionAction,
    pub branch_to: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTeamsInput {
    pub agents: Vec<InlineAgentSpec>,
    pub task: String,
    pub mode: TeamMode,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    pub intelligent_selection: Option<IntelligentSelection>,
    #[serde(default)]
    pub conditions: Vec<TeamCondition>,
    pub output_fields: Option<Vec<String>>,
    #[serde(default)]
    pub verbose: bool,
    pub model: Option<String>,
    #[serde(default)]
    pub force_model: bool,
}

fn default_max_rounds() -> u32 {
    1
}

struct Contribution {
    round: u32,
    agent_id: String,
    role: String,
    contribution: String,
    model: String,
    total_tokens: u32,
}

impl Contribution {
    fn to_json(&self, output_fields: Option<&[String]>, verbose: bool) -> JsonValue {
        let full = json!({
            "round": self.round,
            "agentId": self.agent_id,
            "role": self.role,
            "response": self.contribution,
            "model": self.model,
            "usage": { "totalTokens": self.total_tokens },
        });
        project_output(full, output_fields, verbose)
    }
}

/// A distinguished sentinel, not a user-facing error: the signal an
/// in-flight agent call raises when a deadline timer has flipped the
/// continuable-timeout flag, caught once at the orchestrator's outer loop
/// per SPEC_FULL.md §4.8/§9.
struct TimeoutContinueSignal;

/// Runs the four collaboration modes over a resolved agent pool. Grounded
/// in `Orchestration::execute_parallel`/`execute_round_robin`/
/// `execute_debate` (`orchestration.rs`): the `tokio::spawn` fan-out for
/// PARALLEL and the cursor-style sequential context growth for
/// LINEAR/ROUNDS both generalize the teacher's patterns; condition
/// evaluation's substring/case-insensitive matching mirrors
/// `parse_ralph_completions`'s plain-string marker search.
pub struct TeamOrchestrator {
    registry: Arc<AgentRegistry>,
    sampler: Arc<dyn SamplingAdapter>,
}

impl TeamOrchestrator {
    pub fn new(registry: Arc<AgentRegistry>, sampler: Arc<dyn SamplingAdapter>) -> Self {
        TeamOrchestrator { registry, sampler }
    }

    async fn resolve_agents(&self, input: &AgentTeamsInput) -> AgentResult<Vec<ResolvedAgent>> {
        let mut resolved = Vec::with_capacity(input.agents.len());
        for spec in &input.agents {
            resolved.push(
                self.registry
                    .resolve(spec, input.model.as_deref(), 0.7, 4096, 1.0)
                    .await,
            );
        }
        if resolved.is_empty() {
            return Err(AgentError::validation("agent_teams requires at least one agent"));
        }
        Ok(resolved)
    }

    async fn call_agent(
        &self,
        agent: &ResolvedAgent,
        context: &str,
        round: u32,
        timed_out: Option<&Arc<AtomicBool>>,
        force_model: bool,
    ) -> Result<Contribution, TimeoutContinueSignal> {
        if let Some(flag) = timed_out {
            if flag.load(Ordering::SeqCst) {
                return Err(TimeoutContinueSignal);
            }
        }
        let mut messages = Vec::new();
        if let Some(sp) = &agent.system_prompt {
            messages.push(SampleMessage::system(sp.clone()));
        }
        messages.push(SampleMessage::user(format!(
            "Role: {}\nTask: {}\nProvide your contribution:",
            agent.role, context
        )));

        // Omitting the model defers agent selection to the host's default,
        // per SPEC_FULL.md §4.8's `forceModel` flag.
        let model = if force_model { None } else { agent.model.clone() };
        let response = self
            .sampler
            .sample(SampleRequest {
                messages,
                model,
                temperature: agent.temperature,
                max_tokens: agent.max_tokens,
                top_p: agent.top_p,
                enabled_tools: Vec::new(),
                include_context: false,
                structured_output: None,
            })
            .await;

        match response {
            Ok(r) => Ok(Contribution {
                round,
                agent_id: agent.id.clone(),
                role: agent.role.clone(),
                contribution: r.content,
                model: r.model,
                total_tokens: r.usage.total_tokens,
            }),
            Err(_) => Ok(Contribution {
                round,
                agent_id: agent.id.clone(),
                role: agent.role.clone(),
                contribution: String::new(),
                model: agent.model.clone().unwrap_or_default(),
                total_tokens: 0,
            }),
        }
    }

    fn evaluate_conditions(
        &self,
        conditions: &[TeamCondition],
        context: &str,
        latest: &Contribution,
    ) -> Option<(ConditionAction, Option<String>)> {
        let haystack = format!("{} {}", context, latest.contribution).to_lowercase();
        for condition in conditions {
            let check = condition.check.to_lowercase();
            let matched = match check.as_str() {
                "error" => haystack.contains("error"),
                "threshold" => latest.total_tokens > 2000,
                "empty" | "no response" => latest.contribution.trim().is_empty(),
                "success" => !haystack.contains("error") && !haystack.contains("fail"),
                _ => haystack.contains(&check),
            };
            if matched {
                return Some((condition.action, condition.branch_to.clone()));
            }
        }
        None
    }

    pub async fn run(&self, input: AgentTeamsInput) -> AgentResult<JsonValue> {
        self.run_with_timeout(input, None).await
    }

    /// `timed_out` is set by the async entry point when a deadline timer has
    /// fired; `run` (the sync entry point) always passes `None`.
    pub async fn run_with_timeout(
        &self,
        input: AgentTeamsInput,
        timed_out: Option<Arc<AtomicBool>>,
    ) -> AgentResult<JsonValue> {
        let agents = self.resolve_agents(&input).await?;
        let mut context = input.task.clone();
        let mut results: Vec<Contribution> = Vec::new();
        let mut should_stop = false;
        let mut interrupted = false;
        let mut completed_rounds = 0u32;

        match input.mode {
            TeamMode::Parallel => {
                let force_model = input.force_model;
                let futures = agents.iter().map(|agent| self.call_agent(agent, &context, 1, None, force_model));
                let outcomes = join_all(futures).await;
                for outcome in outcomes {
                    if let Ok(contribution) = outcome {
                        context.push_str(&format!("\n\n{} says: {}", contribution.role, contribution.contribution));
                        results.push(contribution);
                    }
                }
                completed_rounds = 1;
            }
            TeamMode::Linear => {
                'rounds: for round in 1..=input.max_rounds {
                    for agent in &agents {
                        match self.call_agent(agent, &context, round, timed_out.as_ref(), input.force_model).await {
                            Err(TimeoutContinueSignal) => {
                                interrupted = true;
                                break 'rounds;
                            }
                            Ok(contribution) => {
                                context.push_str(&format!(
                                    "\n\n{} says: {}",
                                    contribution.role, contribution.contribution
                                ));
                                if let Some((action, branch_to)) =
                                    self.evaluate_conditions(&input.conditions, &context, &contribution)
                                {
                                    results.push(contribution);
                                    match action {
                                        ConditionAction::Stop => {
                                            should_stop = true;
                                        }
                                        ConditionAction::Branch => {
                                            if let Some(target_id) = &branch_to {
                                                if let Some(target) =
                                                    agents.iter().find(|a| &a.id == target_id)
                                                {
                                                    if let Ok(extra) = self
                                                        .call_agent(target, &context, round, timed_out.as_ref(), input.force_model)
                                                        .await
                                                    {
                                                        context.push_str(&format!(
                                                            "\n\n{} says: {}",
                                                            extra.role, extra.contribution
                                                        ));
                                                        results.push(extra);
                                                    }
                                                }
                                            }
                                        }
                                        ConditionAction::Repeat => {
                                            if let Ok(again) = self
                                                .call_agent(agent, &context, round, timed_out.as_ref(), input.force_model)
                                                .await
                                            {
                                                context.push_str(&format!(
                                                    "\n\n{} says: {}",
                                                    again.role, again.contribution
                                                ));
                                                results.push(again);
                                            }
                                        }
                                        ConditionAction::Continue => {}
                                    }
                                } else {
                                    results.push(contribution);
                                }
                            }
                        }
                        if should_stop {
                            break 'rounds;
                        }
                    }
                    completed_rounds = round;
                    if should_stop {
                        break;
                    }
                }
            }
            TeamMode::Rounds => {
                'rounds2: for round in 1..=input.max_rounds {
                    for agent in &agents {
                        match self.call_agent(agent, &context, round, timed_out.as_ref(), input.force_model).await {
                            Err(TimeoutContinueSignal) => {
                                interrupted = true;
                                break 'rounds2;
                            }
                            Ok(mut contribution) => {
                                contribution.contribution =
                                    format!("[Round {}] {}: {}", round, contribution.role, contribution.contribution);
                                context.push_str(&format!("\n\n{}", contribution.contribution));
                                if let Some((ConditionAction::Stop, _)) =
                                    self.evaluate_conditions(&input.conditions, &context, &contribution)
                                {
                                    should_stop = true;
                                }
                                results.push(contribution);
                            }
                        }
                        if should_stop {
                            break 'rounds2;
                        }
                    }
                    completed_rounds = round;
                    if should_stop {
                        break;
                    }
                }
            }
            TeamMode::Intelligent => {
                let selection = input.intelligent_selection.clone().unwrap_or(IntelligentSelection {
                    pool_size: agents.len().min(3),
                    criteria: "pick the most relevant agents".to_string(),
                });
                'rounds3: for round in 1..=input.max_rounds {
                    if let Some(flag) = &timed_out {
                        if flag.load(Ordering::SeqCst) {
                            interrupted = true;
                            break 'rounds3;
                        }
                    }
                    let roster = agents
                        .iter()
                        .enumerate()
                        .map(|(i, a)| format!("{}: {} ({})", i, a.id, a.role))
                        .collect::<Vec<_>>()
                        .join("\n");
                    let selection_prompt = format!(
                        "Task: {}\nAgents:\n{}\nSelect {} agents by index. Criteria: {}\nRespond with the indices.",
                        context, roster, selection.pool_size, selection.criteria
                    );
                    let selection_response = self
                        .sampler
                        .sample(SampleRequest {
                            messages: vec![SampleMessage::user(selection_prompt)],
                            model: input.model.clone(),
                            temperature: 0.0,
                            max_tokens: 256,
                            top_p: 1.0,
                            enabled_tools: Vec::new(),
                            include_context: false,
                            structured_output: None,
                        })
                        .await;

                    let chosen_indices: Vec<usize> = match &selection_response {
                        Ok(r) => parse_indices(&r.content, agents.len(), selection.pool_size),
                        Err(_) => Vec::new(),
                    };

                    for idx in chosen_indices {
                        let agent = &agents[idx];
                        match self.call_agent(agent, &context, round, timed_out.as_ref(), input.force_model).await {
                            Err(TimeoutContinueSignal) => {
                                interrupted = true;
                                break 'rounds3;
                            }
                            Ok(contribution) => {
                                context.push_str(&format!(
                                    "\n\n{} says: {}",
                                    contribution.role, contribution.contribution
                                ));
                                if let Some((ConditionAction::Stop, _)) =
                                    self.evaluate_conditions(&input.conditions, &context, &contribution)
                                {
                                    should_stop = true;
                                }
                                results.push(contribution);
                            }
                        }
                    }
                    completed_rounds = round;
                    if should_stop {
                        break;
                    }
                }
            }
        }

        let participants: Vec<String> = agents.iter().map(|a| a.id.clone()).collect();
        let total_contributions = results.len();
        let result_json: Vec<JsonValue> = results
            .iter()
            .map(|c| c.to_json(input.output_fields.as_deref(), input.verbose))
            .collect();

        Ok(json!({
            "task": input.task,
            "mode": format!("{:?}", input.mode).to_lowercase(),
            "rounds": input.max_rounds,
            "completedRounds": completed_rounds,
            "participants": participants,
            "totalContributions": total_contributions,
            "results": result_json,
            "stoppedEarly": should_stop,
            "interrupted": interrupted,
            "continuable": timed_out.is_some(),
            "timestamp": Utc::now(),
        }))
    }
}

/// Parses integer indices out of free-form selection output, filtering to
/// `[0, agent_count)` and truncating to `pool_size`. No retry on an empty
/// or fully out-of-range parse, per SPEC_FULL.md §9.1's decision — the
/// round simply proceeds with zero selected contributions.
fn parse_indices(text: &str, agent_count: usize, pool_size: usize) -> Vec<usize> {
    let mut found = Vec::new();
    let mut current = String::new();
    for ch in text.chars().chain(std::iter::once(' ')) {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if !current.is_empty() {
            if let Ok(n) = current.parse::<usize>() {
                if n < agent_count && !found.contains(&n) {
                    found.push(n);
                }
            }
            current.clear();
        }
    }
    found.truncate(pool_size);
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_registry::InlineAgentSpec;
    use crate::sampling::test_support::StubAdapter;

    fn orchestrator() -> TeamOrchestrator {
        TeamOrchestrator::new(Arc::new(AgentRegistry::new()), Arc::new(StubAdapter::new("said")))
    }

    fn spec(id: &str) -> InlineAgentSpec {
        InlineAgentSpec {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn parallel_mode_preserves_resolved_order() {
        let orch = orchestrator();
        let result = orch
            .run(AgentTeamsInput {
                agents: vec![spec("a"), spec("b"), spec("c")],
                task: "T".to_string(),
                mode: TeamMode::Parallel,
                max_rounds: 1,
                intelligent_selection: None,
                conditions: vec![],
                output_fields: None,
                verbose: true,
                model: None,
                force_model: false,
            })
            .await
            .unwrap();
        let ids: Vec<String> = result["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["agentId"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn linear_mode_runs_max_rounds_and_accumulates_context() {
        let orch = orchestrator();
        let result = orch
            .run(AgentTeamsInput {
                agents: vec![spec("a"), spec("b")],
                task: "T".to_string(),
                mode: TeamMode::Linear,
                max_rounds: 2,
                intelligent_selection: None,
                conditions: vec![],
                output_fields: None,
                verbose: true,
                model: None,
                force_model: false,
            })
            .await
            .unwrap();
        assert_eq!(result["completedRounds"], 2);
        assert_eq!(result["totalContributions"], 4);
    }

    #[tokio::test]
    async fn stop_condition_ends_linear_run_early() {
        let orch = orchestrator();
        let result = orch
            .run(AgentTeamsInput {
                agents: vec![spec("a"), spec("b")],
                task: "please trigger error now".to_string(),
                mode: TeamMode::Linear,
                max_rounds: 5,
                intelligent_selection: None,
                conditions: vec![TeamCondition {
                    check: "error".to_string(),
                    action: ConditionAction::Stop,
                    branch_to: None,
                }],
                output_fields: None,
                verbose: true,
                model: None,
                force_model: false,
            })
            .await
            .unwrap();
        assert_eq!(result["stoppedEarly"], true);
    }

    #[tokio::test]
    async fn rejects_empty_agent_list() {
        let orch = orchestrator();
        let err = orch
            .run(AgentTeamsInput {
                agents: vec![],
                task: "T".to_string(),
                mode: TeamMode::Parallel,
                max_rounds: 1,
                intelligent_selection: None,
                conditions: vec![],
                output_fields: None,
                verbose: true,
                model: None,
                force_model: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[test]
    fn parse_indices_filters_out_of_range_and_truncates() {
        let found = parse_indices("I'd pick 0, 4, and 1", 3, 2);
        assert_eq!(found, vec![0, 1]);
    }

    #[tokio::test]
    async fn timeout_continue_preserves_partial_results() {
        let orch = orchestrator();
        let flag = Arc::new(AtomicBool::new(false));
        flag.store(true, Ordering::SeqCst);
        let result = orch
            .run_with_timeout(
                AgentTeamsInput {
                    agents: vec![spec("a"), spec("b")],
                    task: "T".to_string(),
                    mode: TeamMode::Linear,
                    max_rounds: 3,
                    intelligent_selection: None,
                    conditions: vec![],
                    output_fields: None,
                    verbose: true,
                    model: None,
                    force_model: false,
                },
                Some(flag),
            )
            .await
            .unwrap();
        assert_eq!(result["interrupted"], true);
        assert_eq!(result["completedRounds"], 0);
    }
}
