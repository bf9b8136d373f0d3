use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::RwLock;

use crate::error::AgentError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillInstructions {
    pub overview: String,
    #[serde(default)]
    pub usage: String,
    #[serde(default)]
    pub examples: Option<String>,
    #[serde(default)]
    pub best_practices: Option<String>,
    #[serde(default)]
    pub warnings: Option<String>,
    #[serde(default)]
    pub prerequisites: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillRule {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub condition: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillConfig {
    pub toolkits: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub instructions: SkillInstructions,
    #[serde(default)]
    pub rules: Vec<SkillRule>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub conflicting_skills: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillMetadata {
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub rating: Option<f32>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub loaded: bool,
    #[serde(default)]
    pub validated: bool,
    pub config: SkillConfig,
    #[serde(default)]
    pub metadata: SkillMetadata,
    #[serde(default)]
    pub loaded_toolkits: Vec<String>,
    #[serde(default)]
    pub loaded_tools: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Skill {
    pub fn new<S: Into<String>, N: Into<String>>(id: S, name: N, config: SkillConfig) -> Self {
        let now = Utc::now();
        Skill {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            enabled: true,
            loaded: false,
            validated: false,
            config,
            metadata: SkillMetadata::default(),
            loaded_toolkits: Vec::new(),
            loaded_tools: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleConflict {
    pub rule_id: String,
    pub affected: Vec<String>,
    pub winner_skill: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SkillComposition {
    pub composed_id: String,
    pub toolkits: Vec<String>,
    pub tools: Vec<String>,
    pub rules: Vec<SkillRule>,
    pub instructions: String,
    pub system_prompt: String,
    pub conflicts: Vec<RuleConflict>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillAttachmentTarget {
    pub entity_type: String,
    pub entity_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillAttachment {
    pub attachment_id: String,
    pub skill_id: String,
    pub attached_to: SkillAttachmentTarget,
    pub attached_at: DateTime<Utc>,
    #[serde(default)]
    pub attached_by: Option<String>,
    #[serde(default)]
    pub overrides: Option<serde_json::Value>,
    pub active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillUsageStats {
    pub skill_id: String,
    pub invocation_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Toolkit references are resolved through this trait rather than a
/// concrete implementation — the toolkit registry is an external
/// collaborator per SPEC_FULL.md §6.2, opaque to this crate.
pub trait ToolkitResolver: Send + Sync {
    fn resolve(&self, toolkit_id: &str) -> bool;
    fn list_tools(&self, toolkit_id: &str) -> Vec<String>;
}

/// A resolver that treats every toolkit id as valid and contributes no
/// tools; useful for tests and for hosts that haven't wired a real
/// toolkit registry yet.
pub struct PermissiveResolver;
impl ToolkitResolver for PermissiveResolver {
    fn resolve(&self, _toolkit_id: &str) -> bool {
        true
    }
    fn list_tools(&self, _toolkit_id: &str) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Name,
    Created,
    Updated,
    Usage,
    Rating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl Default for SortDirection {
    fn default() -> Self {
        SortDirection::Asc
    }
}

#[derive(Default)]
pub struct ListFilter {
    pub search: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub author: Option<String>,
    pub enabled: Option<bool>,
    pub loaded: Option<bool>,
    pub has_toolkit: Option<String>,
    pub sort_by: Option<SortField>,
    pub direction: SortDirection,
    pub limit: Option<usize>,
    pub offset: usize,
}

struct SkillsState {
    skills: HashMap<String, Skill>,
    attachments: Vec<SkillAttachment>,
    usage_stats: HashMap<String, SkillUsageStats>,
}

/// Skill lifecycle, composition, attachment, and JSON-file persistence.
/// Persistence mirrors the teacher's `ThoughtChain` in using plain
/// synchronous `std::fs`, but swaps its append-only hash-chained log for a
/// one-file-per-skill write-temp-then-rename, per SPEC_FULL.md §4.3/§6.3.
pub struct SkillsService {
    state: RwLock<SkillsState>,
    storage_dir: PathBuf,
    resolver: Box<dyn ToolkitResolver>,
}

impl SkillsService {
    pub fn new<P: Into<PathBuf>>(storage_dir: P, resolver: Box<dyn ToolkitResolver>) -> Self {
        SkillsService {
            state: RwLock::new(SkillsState {
                skills: HashMap::new(),
                attachments: Vec::new(),
                usage_stats: HashMap::new(),
            }),
            storage_dir: storage_dir.into(),
            resolver,
        }
    }

    /// Scans `storage_dir` for `*.json` files and loads each into the
    /// in-memory cache. Unparseable files are logged and skipped, not
    /// deleted, per SPEC_FULL.md §9's persistence-atomicity note.
    pub async fn rehydrate(&self) -> Result<(), AgentError> {
        if !self.storage_dir.exists() {
            return Ok(());
        }
        let entries = std::fs::read_dir(&self.storage_dir)
            .map_err(|e| AgentError::Conflict(format!("cannot read skills dir: {}", e)))?;
        let mut loaded = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some("usage-stats.json") {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(contents) => match serde_json::from_str::<Skill>(&contents) {
                    Ok(skill) => loaded.push(skill),
                    Err(e) => log::warn!("skipping unparseable skill file {:?}: {}", path, e),
                },
                Err(e) => log::warn!("skipping unreadable skill file {:?}: {}", path, e),
            }
        }
        let mut state = self.state.write().await;
        for skill in loaded {
            state.skills.insert(skill.id.clone(), skill);
        }
        Ok(())
    }

    fn persist_skill(&self, skill: &Skill) -> Result<(), AgentError> {
        std::fs::create_dir_all(&self.storage_dir)
            .map_err(|e| AgentError::Conflict(format!("cannot create skills dir: {}", e)))?;
        let final_path = self.storage_dir.join(format!("{}.json", skill.id));
        let tmp_path = self.storage_dir.join(format!("{}.json.tmp", skill.id));
        let contents = serde_json::to_string_pretty(skill)
            .map_err(|e| AgentError::Conflict(format!("cannot serialize skill: {}", e)))?;
        std::fs::write(&tmp_path, contents)
            .map_err(|e| AgentError::Conflict(format!("cannot write skill file: {}", e)))?;
        std::fs::rename(&tmp_path, &final_path)
            .map_err(|e| AgentError::Conflict(format!("cannot rename skill file: {}", e)))?;
        Ok(())
    }

    /// Detects a cycle in `required_skills` reachable from `start`,
    /// including through `candidate_edges` not yet committed to the store
    /// (used when validating a skill being created or updated).
    fn has_cycle(
        &self,
        skills: &HashMap<String, Skill>,
        start: &str,
        candidate_edges: &HashMap<String, Vec<String>>,
    ) -> bool {
        let mut visiting: HashSet<String> = HashSet::new();
        let mut path = Vec::new();

        fn dfs(
            node: &str,
            skills: &HashMap<String, Skill>,
            candidate_edges: &HashMap<String, Vec<String>>,
            visiting: &mut HashSet<String>,
            path: &mut Vec<String>,
        ) -> bool {
            if path.contains(&node.to_string()) {
                return true;
            }
            if visiting.contains(node) {
                return false;
            }
            path.push(node.to_string());
            let edges = candidate_edges
                .get(node)
                .cloned()
                .or_else(|| skills.get(node).map(|s| s.config.required_skills.clone()))
                .unwrap_or_default();
            for next in edges {
                if dfs(&next, skills, candidate_edges, visiting, path) {
                    return true;
                }
            }
            path.pop();
            visiting.insert(node.to_string());
            false
        }

        dfs(start, skills, candidate_edges, &mut visiting, &mut path)
    }

    /// Validates invariants I1-I3, I6 against the proposed config, then
    /// persists and caches the new skill.
    pub async fn create(&self, mut skill: Skill) -> Result<Skill, AgentError> {
        {
            let state = self.state.read().await;
            if state.skills.contains_key(&skill.id) {
                return Err(AgentError::conflict(format!(
                    "skill '{}' already exists",
                    skill.id
                )));
            }
            for toolkit in &skill.config.toolkits {
                if !self.resolver.resolve(toolkit) {
                    return Err(AgentError::MissingDependency(format!(
                        "toolkit '{}' does not resolve",
                        toolkit
                    )));
                }
            }
            for required in &skill.config.required_skills {
                if !state.skills.contains_key(required) {
                    return Err(AgentError::MissingDependency(format!(
                        "required skill '{}' does not exist",
                        required
                    )));
                }
            }
            let mut rule_ids = HashSet::new();
            for rule in &skill.config.rules {
                if !rule_ids.insert(rule.id.clone()) {
                    return Err(AgentError::validation(format!(
                        "duplicate rule id '{}'",
                        rule.id
                    )));
                }
            }
            let mut candidate_edges = HashMap::new();
            candidate_edges.insert(skill.id.clone(), skill.config.required_skills.clone());
            if self.has_cycle(&state.skills, &skill.id, &candidate_edges) {
                return Err(AgentError::conflict(format!(
                    "skill '{}' would introduce a dependency cycle",
                    skill.id
                )));
            }
        }

        skill.validated = true;
        skill.updated_at = Utc::now();
        self.persist_skill(&skill)?;
        let mut state = self.state.write().await;
        state.skills.insert(skill.id.clone(), skill.clone());
        state.usage_stats.insert(
            skill.id.clone(),
            SkillUsageStats {
                skill_id: skill.id.clone(),
                ..Default::default()
            },
        );
        Ok(skill)
    }

    pub async fn update(&self, id: &str, config: SkillConfig, description: Option<String>) -> Result<Skill, AgentError> {
        let mut skill = self.get(id).await?;
        skill.config = config;
        if let Some(d) = description {
            skill.description = d;
        }
        skill.updated_at = Utc::now();
        {
            let mut state = self.state.write().await;
            state.skills.remove(id);
        }
        self.create(skill).await
    }

    pub async fn get(&self, id: &str) -> Result<Skill, AgentError> {
        self.state
            .read()
            .await
            .skills
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::not_found(format!("skill '{}'", id)))
    }

    pub async fn list(&self, filter: &ListFilter) -> Vec<Skill> {
        let state = self.state.read().await;
        let mut matched: Vec<Skill> = state
            .skills
            .values()
            .filter(|s| {
                filter
                    .search
                    .as_ref()
                    .map(|q| {
                        s.name.to_lowercase().contains(&q.to_lowercase())
                            || s.description.to_lowercase().contains(&q.to_lowercase())
                    })
                    .unwrap_or(true)
                    && filter
                        .category
                        .as_ref()
                        .map(|c| s.metadata.category.as_deref() == Some(c.as_str()))
                        .unwrap_or(true)
                    && (filter.tags.is_empty()
                        || filter.tags.iter().all(|t| s.metadata.tags.contains(t)))
                    && filter
                        .author
                        .as_ref()
                        .map(|a| s.metadata.author.as_deref() == Some(a.as_str()))
                        .unwrap_or(true)
                    && filter.enabled.map(|e| s.enabled == e).unwrap_or(true)
                    && filter.loaded.map(|l| s.loaded == l).unwrap_or(true)
                    && filter
                        .has_toolkit
                        .as_ref()
                        .map(|t| s.config.toolkits.contains(t))
                        .unwrap_or(true)
            })
            .cloned()
            .collect();

        if let Some(sort_by) = filter.sort_by {
            matched.sort_by(|a, b| {
                let ordering = match sort_by {
                    SortField::Name => a.name.cmp(&b.name),
                    SortField::Created => a.created_at.cmp(&b.created_at),
                    SortField::Updated => a.updated_at.cmp(&b.updated_at),
                    SortField::Usage => {
                        let ua = state.usage_stats.get(&a.id).map(|u| u.invocation_count).unwrap_or(0);
                        let ub = state.usage_stats.get(&b.id).map(|u| u.invocation_count).unwrap_or(0);
                        ua.cmp(&ub)
                    }
                    SortField::Rating => a
                        .metadata
                        .rating
                        .unwrap_or(0.0)
                        .partial_cmp(&b.metadata.rating.unwrap_or(0.0))
                        .unwrap_or(std::cmp::Ordering::Equal),
                };
                match filter.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                }
            });
        }

        let start = filter.offset.min(matched.len());
        match filter.limit {
            Some(limit) => matched.into_iter().skip(start).take(limit).collect(),
            None => matched.into_iter().skip(start).collect(),
        }
    }

    /// Loads a skill and, recursively, everything it requires. Idempotent.
    pub async fn load(&self, id: &str) -> Result<Skill, AgentError> {
        let required = {
            let state = self.state.read().await;
            let skill = state
                .skills
                .get(id)
                .ok_or_else(|| AgentError::not_found(format!("skill '{}'", id)))?;
            if skill.loaded {
                return Ok(skill.clone());
            }
            skill.config.required_skills.clone()
        };
        for dep in required {
            Box::pin(self.load(&dep)).await?;
        }

        let mut state = self.state.write().await;
        let skill = state
            .skills
            .get_mut(id)
            .ok_or_else(|| AgentError::not_found(format!("skill '{}'", id)))?;
        skill.loaded = true;
        skill.loaded_toolkits = skill.config.toolkits.clone();
        skill.loaded_tools = skill
            .config
            .toolkits
            .iter()
            .flat_map(|t| self.resolver.list_tools(t))
            .chain(skill.config.tools.iter().cloned())
            .collect();
        Ok(skill.clone())
    }

    /// Refuses if another loaded skill still requires this one (I5).
    pub async fn unload(&self, id: &str) -> Result<Skill, AgentError> {
        let mut state = self.state.write().await;
        let dependents: Vec<String> = state
            .skills
            .values()
            .filter(|s| s.loaded && s.id != id && s.config.required_skills.contains(&id.to_string()))
            .map(|s| s.id.clone())
            .collect();
        if !dependents.is_empty() {
            return Err(AgentError::conflict(format!(
                "skill '{}' is still required by: {}",
                id,
                dependents.join(", ")
            )));
        }
        let skill = state
            .skills
            .get_mut(id)
            .ok_or_else(|| AgentError::not_found(format!("skill '{}'", id)))?;
        skill.loaded = false;
        skill.loaded_toolkits.clear();
        skill.loaded_tools.clear();
        Ok(skill.clone())
    }

    /// Refuses delete while the skill has an active attachment (I4).
    pub async fn delete(&self, id: &str) -> Result<(), AgentError> {
        {
            let state = self.state.read().await;
            if state
                .attachments
                .iter()
                .any(|a| a.skill_id == id && a.active)
            {
                return Err(AgentError::conflict(format!(
                    "skill '{}' is still attached",
                    id
                )));
            }
        }
        let mut state = self.state.write().await;
        if state.skills.remove(id).is_none() {
            return Err(AgentError::not_found(format!("skill '{}'", id)));
        }
        let path = self.storage_dir.join(format!("{}.json", id));
        let _ = std::fs::remove_file(path);
        Ok(())
    }

    pub async fn attach(
        &self,
        skill_id: &str,
        target: SkillAttachmentTarget,
        attached_by: Option<String>,
        overrides: Option<serde_json::Value>,
    ) -> Result<SkillAttachment, AgentError> {
        self.get(skill_id).await?;
        self.load(skill_id).await?;
        let attachment = SkillAttachment {
            attachment_id: uuid::Uuid::new_v4().to_string(),
            skill_id: skill_id.to_string(),
            attached_to: target,
            attached_at: Utc::now(),
            attached_by,
            overrides,
            active: true,
        };
        let mut state = self.state.write().await;
        state.attachments.push(attachment.clone());
        Ok(attachment)
    }

    pub async fn detach(&self, skill_id: &str, entity_type: &str, entity_id: &str) -> Result<(), AgentError> {
        let mut state = self.state.write().await;
        let before = state.attachments.len();
        state.attachments.retain(|a| {
            !(a.skill_id == skill_id
                && a.attached_to.entity_type == entity_type
                && a.attached_to.entity_id == entity_id)
        });
        if state.attachments.len() == before {
            return Err(AgentError::not_found("attachment"));
        }
        Ok(())
    }

    pub async fn get_attached(&self, entity_type: &str, entity_id: &str) -> Vec<SkillAttachment> {
        self.state
            .read()
            .await
            .attachments
            .iter()
            .filter(|a| {
                a.attached_to.entity_type == entity_type && a.attached_to.entity_id == entity_id && a.active
            })
            .cloned()
            .collect()
    }

    /// Merges skill IDs in list order: set-union toolkits/tools, priority-
    /// ranked rule conflict resolution, structured instruction
    /// concatenation, system prompt concatenation. Grounded in SPEC_FULL.md
    /// §4.3/§9's rule-sorting-stability note.
    pub async fn compose(&self, skill_ids: &[String]) -> Result<SkillComposition, AgentError> {
        let state = self.state.read().await;
        let mut skills = Vec::with_capacity(skill_ids.len());
        for id in skill_ids {
            skills.push(
                state
                    .skills
                    .get(id)
                    .cloned()
                    .ok_or_else(|| AgentError::not_found(format!("skill '{}'", id)))?,
            );
        }
        drop(state);

        let mut toolkits: Vec<String> = Vec::new();
        let mut tools: Vec<String> = Vec::new();
        for s in &skills {
            for t in &s.config.toolkits {
                if !toolkits.contains(t) {
                    toolkits.push(t.clone());
                }
            }
            for t in &s.config.tools {
                if !tools.contains(t) {
                    tools.push(t.clone());
                }
            }
        }

        // Collect (skill_index, original_index_within_skill, rule) so the
        // stable sort can break priority ties by first-seen order.
        let mut candidates: Vec<(usize, usize, SkillRule)> = Vec::new();
        for (skill_idx, s) in skills.iter().enumerate() {
            for (rule_idx, rule) in s.config.rules.iter().enumerate() {
                if rule.enabled {
                    candidates.push((skill_idx, rule_idx, rule.clone()));
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.2.priority
                .cmp(&a.2.priority)
                .then(a.0.cmp(&b.0))
                .then(a.1.cmp(&b.1))
        });

        let mut winners: HashMap<String, (usize, usize, SkillRule)> = HashMap::new();
        let mut conflicts: Vec<RuleConflict> = Vec::new();
        for (skill_idx, rule_idx, rule) in candidates {
            match winners.get(&rule.id) {
                None => {
                    winners.insert(rule.id.clone(), (skill_idx, rule_idx, rule.clone()));
                }
                Some((winner_skill_idx, _, _)) => {
                    conflicts.push(RuleConflict {
                        rule_id: rule.id.clone(),
                        affected: vec![rule.id.clone()],
                        winner_skill: skills[*winner_skill_idx].id.clone(),
                    });
                }
            }
        }
        // Tie-break equal-priority rules by (skillIndex, originalIndex), the
        // order they were first seen in, not alphabetically by rule id.
        let mut rules: Vec<(usize, usize, SkillRule)> = winners.into_values().collect();
        rules.sort_by(|a, b| b.2.priority.cmp(&a.2.priority).then(a.0.cmp(&b.0)).then(a.1.cmp(&b.1)));
        let rules: Vec<SkillRule> = rules.into_iter().map(|(_, _, r)| r).collect();

        let mut instruction_sections = Vec::new();
        for s in &skills {
            let ins = &s.config.instructions;
            if !ins.overview.is_empty() {
                instruction_sections.push(ins.overview.clone());
            }
            if !ins.usage.is_empty() {
                instruction_sections.push(ins.usage.clone());
            }
            for extra in [&ins.examples, &ins.best_practices, &ins.warnings, &ins.prerequisites] {
                if let Some(text) = extra {
                    instruction_sections.push(text.clone());
                }
            }
        }

        let system_prompt = skills
            .iter()
            .filter_map(|s| s.config.system_prompt.clone())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(SkillComposition {
            composed_id: skill_ids.join("+"),
            toolkits,
            tools,
            rules,
            instructions: instruction_sections.join("\n\n"),
            system_prompt,
            conflicts,
        })
    }

    pub async fn export(&self, id: &str, include_dependencies: bool) -> Result<serde_json::Value, AgentError> {
        let skill = self.get(id).await?;
        let mut bundle = vec![skill.clone()];
        if include_dependencies {
            for dep in &skill.config.required_skills {
                bundle.push(self.get(dep).await?);
            }
        }
        Ok(serde_json::json!({
            "version": 1,
            "exported_at": Utc::now(),
            "skills": bundle,
        }))
    }

    /// Imports dependencies first, then the skill itself; refuses (reports
    /// skipped, does not overwrite) a duplicate id.
    pub async fn import(&self, bundle: serde_json::Value) -> Result<Vec<String>, AgentError> {
        let skills: Vec<Skill> = serde_json::from_value(
            bundle
                .get("skills")
                .cloned()
                .ok_or_else(|| AgentError::validation("bundle missing 'skills'"))?,
        )
        .map_err(|e| AgentError::validation(format!("malformed bundle: {}", e)))?;

        let mut imported = Vec::new();
        for skill in skills {
            let exists = self.state.read().await.skills.contains_key(&skill.id);
            if exists {
                continue;
            }
            self.create(skill.clone()).await?;
            imported.push(skill.id);
        }
        Ok(imported)
    }

    pub async fn record_usage(&self, id: &str) {
        let mut state = self.state.write().await;
        let entry = state
            .usage_stats
            .entry(id.to_string())
            .or_insert_with(|| SkillUsageStats {
                skill_id: id.to_string(),
                ..Default::default()
            });
        entry.invocation_count += 1;
        entry.last_used_at = Some(Utc::now());
    }

    pub async fn usage_stats(&self, id: &str) -> Option<SkillUsageStats> {
        self.state.read().await.usage_stats.get(id).cloned()
    }
}
