use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::error::AgentError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub enabled_tools: HashSet<String>,
    #[serde(default)]
    pub toolkits: HashSet<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentConfig {
    pub fn new<S: Into<String>, N: Into<String>>(id: S, name: N) -> Self {
        let now = Utc::now();
        AgentConfig {
            id: id.into(),
            name: name.into(),
            model: None,
            temperature: 0.7,
            max_tokens: 4096,
            top_p: 1.0,
            system_prompt: None,
            enabled_tools: HashSet::new(),
            toolkits: HashSet::new(),
            skills: Vec::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// An inline agent reference as it arrives on the wire for
/// `execute_agent`/`agent_teams`: any field left unset falls back to the
/// matching registered preset, then to the server default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineAgentSpec {
    pub id: String,
    pub role: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
}

/// The fully resolved agent a team member or `execute_agent` call actually
/// runs with, after merging an inline spec against the registry.
#[derive(Debug, Clone)]
pub struct ResolvedAgent {
    pub id: String,
    pub role: String,
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub system_prompt: Option<String>,
    pub skills: Vec<String>,
}

/// In-memory store of configured agent presets, keyed by id. No durability
/// beyond process lifetime, per SPEC_FULL.md §3/§4.2.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentConfig>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        AgentRegistry {
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Upserts a preset. On update, `created_at` is preserved from the
    /// existing record and `updated_at` is refreshed.
    pub async fn register(&self, mut cfg: AgentConfig) -> AgentConfig {
        let mut agents = self.agents.write().await;
        if let Some(existing) = agents.get(&cfg.id) {
            cfg.created_at = existing.created_at;
        }
        cfg.updated_at = Utc::now();
        agents.insert(cfg.id.clone(), cfg.clone());
        cfg
    }

    pub async fn get(&self, id: &str) -> Option<AgentConfig> {
        self.agents.read().await.get(id).cloned()
    }

    pub async fn has(&self, id: &str) -> bool {
        self.agents.read().await.contains_key(id)
    }

    pub async fn list(&self) -> Vec<AgentConfig> {
        self.agents.read().await.values().cloned().collect()
    }

    pub async fn delete(&self, id: &str) -> AgentResultEmpty {
        let mut agents = self.agents.write().await;
        if agents.remove(id).is_none() {
            return Err(AgentError::not_found(format!("agent '{}'", id)));
        }
        Ok(())
    }

    /// Merges an inline spec with a registered preset (if the id matches):
    /// inline fields win, missing fields fall back to the registered
    /// config, and `default_model`/`default_temperature`/... are the final
    /// fallback for an entirely unregistered inline id (P10).
    pub async fn resolve(
        &self,
        spec: &InlineAgentSpec,
        default_model: Option<&str>,
        default_temperature: f32,
        default_max_tokens: u32,
        default_top_p: f32,
    ) -> ResolvedAgent {
        let registered = self.get(&spec.id).await;
        match registered {
            Some(cfg) => ResolvedAgent {
                id: cfg.id.clone(),
                role: spec
                    .role
                    .clone()
                    .unwrap_or_else(|| cfg.name.clone()),
                model: spec.model.clone().or(cfg.model.clone()).or(default_model.map(|s| s.to_string())),
                temperature: spec.temperature.unwrap_or(cfg.temperature),
                max_tokens: spec.max_tokens.unwrap_or(cfg.max_tokens),
                top_p: cfg.top_p,
                system_prompt: spec.system_prompt.clone().or(cfg.system_prompt.clone()),
                skills: cfg.skills.clone(),
            },
            None => ResolvedAgent {
                id: spec.id.clone(),
                role: spec.role.clone().unwrap_or_else(|| spec.id.clone()),
                model: spec.model.clone().or(default_model.map(|s| s.to_string())),
                temperature: spec.temperature.unwrap_or(default_temperature),
                max_tokens: spec.max_tokens.unwrap_or(default_max_tokens),
                top_p: default_top_p,
                system_prompt: spec.system_prompt.clone(),
                skills: Vec::new(),
            },
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        AgentRegistry::new()
    }
}

type AgentResultEmpty = Result<(), AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_preserves_created_at_on_update() {
        let registry = AgentRegistry::new();
        let cfg = registry.register(AgentConfig::new("a1", "Alpha")).await;
        let created_at = cfg.created_at;
        let mut updated = cfg.clone();
        updated.name = "Alpha Prime".to_string();
        let result = registry.register(updated).await;
        assert_eq!(result.created_at, created_at);
        assert_eq!(result.name, "Alpha Prime");
    }

    #[tokio::test]
    async fn resolve_inline_overrides_registered() {
        let registry = AgentRegistry::new();
        let mut cfg = AgentConfig::new("a1", "Alpha");
        cfg.temperature = 0.2;
        registry.register(cfg).await;

        let spec = InlineAgentSpec {
            id: "a1".to_string(),
            temperature: Some(0.9),
            ..Default::default()
        };
        let resolved = registry.resolve(&spec, None, 0.5, 1000, 1.0).await;
        assert_eq!(resolved.temperature, 0.9);
        assert_eq!(resolved.role, "Alpha");
    }

    #[tokio::test]
    async fn resolve_unregistered_uses_defaults() {
        let registry = AgentRegistry::new();
        let spec = InlineAgentSpec {
            id: "ghost".to_string(),
            ..Default::default()
        };
        let resolved = registry.resolve(&spec, Some("m1"), 0.3, 777, 0.9).await;
        assert_eq!(resolved.model.as_deref(), Some("m1"));
        assert_eq!(resolved.temperature, 0.3);
        assert_eq!(resolved.max_tokens, 777);
    }

    #[tokio::test]
    async fn delete_missing_agent_is_not_found() {
        let registry = AgentRegistry::new();
        let err = registry.delete("nope").await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }
}
