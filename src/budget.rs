use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetDimension {
    Tokens,
    Cost,
    Calls,
}

impl BudgetDimension {
    pub fn label(&self) -> &'static str {
        match self {
            BudgetDimension::Tokens => "token",
            BudgetDimension::Cost => "cost",
            BudgetDimension::Calls => "call",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum BudgetWindow {
    Total,
    Day,
    Hour,
    Minute,
}

#[derive(Debug, Clone)]
pub struct BudgetLimit {
    pub dimension: BudgetDimension,
    pub window: BudgetWindow,
    pub limit: f64,
}

#[derive(Debug, Default)]
struct AgentBudgetState {
    tokens_used: f64,
    cost_used: f64,
    calls_used: f64,
}

/// Per-agent budget enforcement across three dimensions, checked in order
/// before a sampler call and consumed with actual usage after. Grounded in
/// SPEC_FULL.md §4.4's explicit algorithm — the teacher has no direct
/// analog for budget enforcement, so this module's shape is new, but the
/// counter-map-behind-a-lock idiom mirrors `ToolRegistry`'s map fields.
#[async_trait]
pub trait BudgetStore: Send + Sync {
    async fn check(&self, agent_id: &str, dimension: BudgetDimension, amount: f64) -> BudgetCheck;
    async fn consume(&self, agent_id: &str, dimension: BudgetDimension, amount: f64);
}

#[derive(Debug, Clone)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl BudgetCheck {
    fn allow() -> Self {
        BudgetCheck {
            allowed: true,
            reason: None,
        }
    }

    fn deny<S: Into<String>>(reason: S) -> Self {
        BudgetCheck {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// An in-process budget manager keyed by agent id. Limits absent from
/// `limits` are treated as unbounded for that agent.
pub struct InMemoryBudgetStore {
    limits: HashMap<String, Vec<BudgetLimit>>,
    state: Mutex<HashMap<String, AgentBudgetState>>,
}

impl InMemoryBudgetStore {
    pub fn new() -> Self {
        InMemoryBudgetStore {
            limits: HashMap::new(),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_limit(mut self, agent_id: &str, limit: BudgetLimit) -> Self {
        self.limits
            .entry(agent_id.to_string())
            .or_default()
            .push(limit);
        self
    }
}

impl Default for InMemoryBudgetStore {
    fn default() -> Self {
        InMemoryBudgetStore::new()
    }
}

#[async_trait]
impl BudgetStore for InMemoryBudgetStore {
    async fn check(&self, agent_id: &str, dimension: BudgetDimension, amount: f64) -> BudgetCheck {
        let Some(limits) = self.limits.get(agent_id) else {
            return BudgetCheck::allow();
        };
        let state = self.state.lock().await;
        let used = state.get(agent_id).map(|s| match dimension {
            BudgetDimension::Tokens => s.tokens_used,
            BudgetDimension::Cost => s.cost_used,
            BudgetDimension::Calls => s.calls_used,
        });
        let used = used.unwrap_or(0.0);
        for limit in limits.iter().filter(|l| matches_dimension(l.dimension, dimension)) {
            if used + amount > limit.limit {
                return BudgetCheck::deny(format!("{} + {} > {}", used, amount, limit.limit));
            }
        }
        BudgetCheck::allow()
    }

    async fn consume(&self, agent_id: &str, dimension: BudgetDimension, amount: f64) {
        let mut state = self.state.lock().await;
        let entry = state.entry(agent_id.to_string()).or_default();
        match dimension {
            BudgetDimension::Tokens => entry.tokens_used += amount,
            BudgetDimension::Cost => entry.cost_used += amount,
            BudgetDimension::Calls => entry.calls_used += amount,
        }
    }
}

fn matches_dimension(a: BudgetDimension, b: BudgetDimension) -> bool {
    std::mem::discriminant(&a) == std::mem::discriminant(&b)
}

/// Sliding-window call rate limiting, pluggable per SPEC_FULL.md §9's
/// "Non-goals: implementing rate-limit storage (pluggable)" decision.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, agent_id: &str) -> Result<(), AgentError>;
    async fn record(&self, agent_id: &str);
}

pub struct SlidingWindowRateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl SlidingWindowRateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        SlidingWindowRateLimiter {
            max_calls,
            window,
            calls: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn check(&self, agent_id: &str) -> Result<(), AgentError> {
        let calls = self.calls.lock().await;
        let Some(history) = calls.get(agent_id) else {
            return Ok(());
        };
        let cutoff = Utc::now() - chrono::Duration::from_std(self.window).unwrap_or_default();
        let recent = history.iter().filter(|t| **t >= cutoff).count();
        if recent >= self.max_calls {
            let oldest_in_window = history.iter().filter(|t| **t >= cutoff).min().copied();
            let retry_after_secs = oldest_in_window
                .map(|t| {
                    let elapsed = Utc::now() - t;
                    let remaining = self.window - elapsed.to_std().unwrap_or(Duration::ZERO);
                    remaining.as_secs().max(1)
                })
                .unwrap_or(1);
            return Err(AgentError::RateLimitExceeded { retry_after_secs });
        }
        Ok(())
    }

    async fn record(&self, agent_id: &str) {
        let mut calls = self.calls.lock().await;
        let cutoff = Utc::now() - chrono::Duration::from_std(self.window).unwrap_or_default();
        let history = calls.entry(agent_id.to_string()).or_default();
        history.retain(|t| *t >= cutoff);
        history.push(Utc::now());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageEvent {
    pub execution_id: String,
    pub agent_id: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub cost: f64,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Per-model-prefix pricing table with a flat fallback, matching
/// SPEC_FULL.md §9.1's "pluggable, replaceable cost function" decision.
pub fn cost(model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
    let (prompt_rate, completion_rate) = rates_for(model);
    (prompt_tokens as f64 * prompt_rate + completion_tokens as f64 * completion_rate) / 1000.0
}

fn rates_for(model: &str) -> (f64, f64) {
    let m = model.to_lowercase();
    if m.starts_with("gpt-4") {
        (0.03, 0.06)
    } else if m.starts_with("gpt-3.5") {
        (0.0015, 0.002)
    } else if m.starts_with("claude") {
        (0.008, 0.024)
    } else {
        (0.001, 0.002)
    }
}

/// Estimates prompt/completion token counts from a requested `max_tokens`
/// using the literal 40%/60% split from SPEC_FULL.md §4.4, used to gate the
/// budget check before the actual sampler call is made.
pub fn estimate_tokens(max_tokens: u32) -> (u32, u32) {
    let prompt = (max_tokens as f64 * 0.4) as u32;
    let completion = (max_tokens as f64 * 0.6) as u32;
    (prompt, completion)
}

/// Records usage events; failing to record must never fail the tool call,
/// so `record` never returns an error and simply logs on internal failure.
pub struct UsageTracker {
    events: Mutex<Vec<UsageEvent>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        UsageTracker {
            events: Mutex::new(Vec::new()),
        }
    }

    pub async fn record(&self, event: UsageEvent) {
        self.events.lock().await.push(event);
    }

    pub async fn for_agent(&self, agent_id: &str) -> Vec<UsageEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub async fn total_cost(&self, agent_id: &str) -> f64 {
        self.for_agent(agent_id).await.iter().map(|e| e.cost).sum()
    }
}

impl Default for UsageTracker {
    fn default() -> Self {
        UsageTracker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn budget_check_denies_over_limit() {
        let store = InMemoryBudgetStore::new().with_limit(
            "a1",
            BudgetLimit {
                dimension: BudgetDimension::Tokens,
                window: BudgetWindow::Total,
                limit: 100.0,
            },
        );
        let check = store.check("a1", BudgetDimension::Tokens, 150.0).await;
        assert!(!check.allowed);
        assert!(check.reason.unwrap().contains("150 > 100"));
    }

    #[tokio::test]
    async fn budget_check_allows_under_limit_and_consumes() {
        let store = InMemoryBudgetStore::new().with_limit(
            "a1",
            BudgetLimit {
                dimension: BudgetDimension::Tokens,
                window: BudgetWindow::Total,
                limit: 100.0,
            },
        );
        assert!(store.check("a1", BudgetDimension::Tokens, 50.0).await.allowed);
        store.consume("a1", BudgetDimension::Tokens, 50.0).await;
        assert!(!store.check("a1", BudgetDimension::Tokens, 60.0).await.allowed);
    }

    #[tokio::test]
    async fn unbounded_agent_always_allowed() {
        let store = InMemoryBudgetStore::new();
        assert!(store.check("anyone", BudgetDimension::Cost, 1_000_000.0).await.allowed);
    }

    #[tokio::test]
    async fn rate_limiter_blocks_after_threshold() {
        let limiter = SlidingWindowRateLimiter::new(2, Duration::from_secs(60));
        limiter.record("a1").await;
        limiter.record("a1").await;
        let result = limiter.check("a1").await;
        assert!(matches!(result, Err(AgentError::RateLimitExceeded { .. })));
    }

    #[test]
    fn estimate_tokens_uses_forty_sixty_split() {
        let (p, c) = estimate_tokens(1000);
        assert_eq!(p, 400);
        assert_eq!(c, 600);
    }

    #[test]
    fn cost_is_nonzero_for_known_and_unknown_models() {
        assert!(cost("gpt-4", 100, 100) > 0.0);
        assert!(cost("some-unlisted-model", 100, 100) > 0.0);
    }
}
