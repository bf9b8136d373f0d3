use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

use crate::agent_registry::{AgentConfig, AgentRegistry};
use crate::budget::{BudgetStore, RateLimiter, UsageTracker};
use crate::config::ServerConfig;
use crate::error::{AgentError, AgentResult};
use crate::executor::{AgentExecutor, ExecuteAgentInput};
use crate::protocol::{ParamType, ToolHandler, ToolMetadata, ToolParameter, ToolServer};
use crate::sampling::{SampleMessage, SampleRequest, SamplingAdapter};
use crate::skills::{ListFilter, Skill, SkillAttachmentTarget, SkillConfig, SkillsService, SortDirection, SortField};
use crate::team::{AgentTeamsInput, TeamOrchestrator};
use crate::wait_handles::{WaitHandleRegistry, WaitKind};

/// The shared collaborators every tool handler closes over. Grounded in
/// `MCPServerBuilder`'s wiring of a server around its adapters/auth/event
/// handler (`mcp_server_builder.rs`): this struct is the non-HTTP
/// equivalent — a bag of injected collaborators rather than transport
/// configuration.
pub struct AppState {
    pub registry: Arc<AgentRegistry>,
    pub skills: Arc<SkillsService>,
    pub sampler: Arc<dyn SamplingAdapter>,
    pub budget: Arc<dyn BudgetStore>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub usage: Arc<UsageTracker>,
    pub wait_handles: Arc<WaitHandleRegistry>,
    pub executor: Arc<AgentExecutor>,
    pub team: Arc<TeamOrchestrator>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(
        registry: Arc<AgentRegistry>,
        skills: Arc<SkillsService>,
        sampler: Arc<dyn SamplingAdapter>,
        budget: Arc<dyn BudgetStore>,
        rate_limiter: Arc<dyn RateLimiter>,
        usage: Arc<UsageTracker>,
        config: ServerConfig,
    ) -> Self {
        let executor = Arc::new(AgentExecutor::new(
            registry.clone(),
            skills.clone(),
            sampler.clone(),
            budget.clone(),
            rate_limiter.clone(),
            usage.clone(),
        ));
        let team = Arc::new(TeamOrchestrator::new(registry.clone(), sampler.clone()));
        AppState {
            registry,
            skills,
            sampler,
            budget,
            rate_limiter,
            usage,
            wait_handles: Arc::new(WaitHandleRegistry::new()),
            executor,
            team,
            config,
        }
    }
}

fn obj_param(name: &str, desc: &str, required: bool) -> ToolParameter {
    ToolParameter::new(name, ParamType::Object, desc, required)
}

fn str_param(name: &str, desc: &str, required: bool) -> ToolParameter {
    ToolParameter::new(name, ParamType::String, desc, required)
}

fn bool_param(name: &str, desc: &str) -> ToolParameter {
    ToolParameter::new(name, ParamType::Boolean, desc, false)
}

fn num_param(name: &str, desc: &str) -> ToolParameter {
    ToolParameter::new(name, ParamType::Number, desc, false)
}

fn ranged_num_param(name: &str, desc: &str, min: Option<f64>, max: Option<f64>) -> ToolParameter {
    ToolParameter::new(name, ParamType::Number, desc, false).with_range(min, max)
}

fn arr_param(name: &str, desc: &str, item: ParamType, required: bool) -> ToolParameter {
    ToolParameter::new(name, ParamType::Array, desc, required).with_items(item)
}

// -- Agent lifecycle ---------------------------------------------------

struct ConfigureAgentHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for ConfigureAgentHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "configure_agent",
            "Create or update an agent preset.",
            vec![
                str_param("agentId", "unique agent id", true),
                str_param("name", "display name", true),
                str_param("model", "model name", false),
                ranged_num_param("temperature", "sampling temperature", Some(0.0), Some(2.0)),
                ranged_num_param("maxTokens", "max output tokens", Some(1.0), None),
                ranged_num_param("topP", "nucleus sampling top_p", Some(0.0), Some(1.0)),
                str_param("systemPrompt", "system prompt", false),
                arr_param("skills", "skill ids", ParamType::String, false),
                arr_param("toolkits", "toolkit ids", ParamType::String, false),
                arr_param("enabledTools", "enabled tool names", ParamType::String, false),
                obj_param("metadata", "arbitrary metadata", false),
            ],
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let agent_id = require_str(&args, "agentId")?;
        let name = require_str(&args, "name")?;
        let mut cfg = AgentConfig::new(agent_id, name);
        if let Some(m) = args.get("model").and_then(|v| v.as_str()) {
            cfg.model = Some(m.to_string());
        }
        if let Some(t) = args.get("temperature").and_then(|v| v.as_f64()) {
            cfg.temperature = t as f32;
        }
        if let Some(mt) = args.get("maxTokens").and_then(|v| v.as_u64()) {
            cfg.max_tokens = mt as u32;
        }
        if let Some(tp) = args.get("topP").and_then(|v| v.as_f64()) {
            cfg.top_p = tp as f32;
        }
        if let Some(sp) = args.get("systemPrompt").and_then(|v| v.as_str()) {
            cfg.system_prompt = Some(sp.to_string());
        }
        if let Some(skills) = args.get("skills").and_then(|v| v.as_array()) {
            cfg.skills = skills
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect();
        }
        if let Some(toolkits) = args.get("toolkits").and_then(|v| v.as_array()) {
            cfg.toolkits = toolkits
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect();
        }
        if let Some(tools) = args.get("enabledTools").and_then(|v| v.as_array()) {
            cfg.enabled_tools = tools
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect();
        }
        if let Some(metadata) = args.get("metadata").and_then(|v| v.as_object()) {
            cfg.metadata = metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str().map(String::from).unwrap_or_else(|| v.to_string())))
                .collect();
        }
        let saved = self.state.registry.register(cfg).await;
        Ok(serde_json::to_value(saved).unwrap())
    }
}

struct ListAgentsHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for ListAgentsHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new("list_agents", "List configured agents.", vec![])
    }

    async fn call(&self, _args: JsonValue) -> AgentResult<JsonValue> {
        let agents = self.state.registry.list().await;
        Ok(serde_json::to_value(agents).unwrap())
    }
}

struct GetAgentHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for GetAgentHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "get_agent",
            "Fetch an agent's full configuration.",
            vec![str_param("agentId", "agent id", true)],
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let id = require_str(&args, "agentId")?;
        let cfg = self
            .state
            .registry
            .get(&id)
            .await
            .ok_or_else(|| AgentError::not_found(format!("agent '{}'", id)))?;
        Ok(serde_json::to_value(cfg).unwrap())
    }
}

struct DeleteAgentHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for DeleteAgentHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "delete_agent",
            "Remove an agent preset.",
            vec![str_param("agentId", "agent id", true)],
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let id = require_str(&args, "agentId")?;
        self.state.registry.delete(&id).await?;
        Ok(json!({ "deleted": id }))
    }
}

// -- Agent execution ----------------------------------------------------

struct ExecuteAgentHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for ExecuteAgentHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "execute_agent",
            "Run an agent once against the sampling facility.",
            execute_agent_params(),
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let input: ExecuteAgentInput = serde_json::from_value(args)
            .map_err(|e| AgentError::validation(format!("invalid execute_agent arguments: {}", e)))?;
        self.state.executor.execute(input).await
    }
}

struct ExecuteAgentAsyncHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for ExecuteAgentAsyncHandler {
    fn metadata(&self) -> ToolMetadata {
        let mut params = execute_agent_params();
        params.push(num_param("timeoutMs", "optional deadline in milliseconds"));
        ToolMetadata::new(
            "execute_agent_async",
            "Run an agent asynchronously; returns a wait handle.",
            params,
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let timeout_ms = args.get("timeoutMs").and_then(|v| v.as_u64());
        let input: ExecuteAgentInput = serde_json::from_value(args)
            .map_err(|e| AgentError::validation(format!("invalid execute_agent_async arguments: {}", e)))?;
        let agent_id = input.agent_id.clone();
        let (handle_id, _flag) = self
            .state
            .wait_handles
            .register(WaitKind::Agent, json!({ "agentId": agent_id }), timeout_ms)
            .await;

        let executor = self.state.executor.clone();
        let wait_handles = self.state.wait_handles.clone();
        let handle_id_spawned = handle_id.clone();
        tokio::spawn(async move {
            match executor.execute(input).await {
                Ok(value) => {
                    let _ = wait_handles.complete(&handle_id_spawned, value).await;
                }
                Err(e) => {
                    let _ = wait_handles.fail(&handle_id_spawned, e.to_string()).await;
                }
            }
        });

        Ok(json!({
            "async": true,
            "handleId": handle_id,
            "agentId": agent_id,
            "status": "pending",
        }))
    }
}

struct ChatWithAgentHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for ChatWithAgentHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "chat_with_agent",
            "Send a single chat message to an agent.",
            vec![
                str_param("agentId", "agent id", true),
                str_param("message", "message text", true),
                str_param("conversationId", "optional conversation id", false),
            ],
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let agent_id = require_str(&args, "agentId")?;
        let message = require_str(&args, "message")?;
        let cfg = self.state.registry.get(&agent_id).await;
        let response = self
            .state
            .sampler
            .sample(SampleRequest {
                messages: vec![SampleMessage::user(message)],
                model: cfg.as_ref().and_then(|c| c.model.clone()),
                temperature: cfg.as_ref().map(|c| c.temperature).unwrap_or(0.7),
                max_tokens: cfg.as_ref().map(|c| c.max_tokens).unwrap_or(4096),
                top_p: cfg.as_ref().map(|c| c.top_p).unwrap_or(1.0),
                enabled_tools: vec![],
                include_context: false,
                structured_output: None,
            })
            .await
            .map_err(|e| AgentError::SamplerError(e.to_string()))?;
        Ok(json!({
            "agentId": agent_id,
            "response": response.content,
            "conversationId": args.get("conversationId").cloned().unwrap_or(JsonValue::Null),
        }))
    }
}

fn execute_agent_params() -> Vec<ToolParameter> {
    vec![
        str_param("agentId", "agent id (registered or ad hoc)", true),
        str_param("prompt", "the user prompt", true),
        str_param("model", "model override", false),
        ranged_num_param("temperature", "sampling temperature", Some(0.0), Some(2.0)),
        ranged_num_param("maxTokens", "max output tokens", Some(1.0), None),
        ranged_num_param("topP", "nucleus sampling top_p", Some(0.0), Some(1.0)),
        str_param("systemPrompt", "system prompt override", false),
        arr_param("context", "prior turns to include", ParamType::String, false),
        arr_param("tools", "tool names to enable", ParamType::String, false),
        arr_param("skills", "skill ids to compose", ParamType::String, false),
        arr_param("documents", "reference documents", ParamType::String, false),
        arr_param("outputFields", "projection field names", ParamType::String, false),
        bool_param("verbose", "return the full record instead of a projection"),
    ]
}

// -- Teams ----------------------------------------------------------------

struct AgentTeamsHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for AgentTeamsHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "agent_teams",
            "Run a multi-agent collaboration synchronously.",
            agent_teams_params(),
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let input: AgentTeamsInput = serde_json::from_value(args)
            .map_err(|e| AgentError::validation(format!("invalid agent_teams arguments: {}", e)))?;
        self.state.team.run(input).await
    }
}

struct AgentTeamsAsyncHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for AgentTeamsAsyncHandler {
    fn metadata(&self) -> ToolMetadata {
        let mut params = agent_teams_params();
        params.push(num_param("timeoutMs", "optional deadline in milliseconds"));
        params.push(bool_param("continuable", "preserve partial results on timeout (default true)"));
        ToolMetadata::new(
            "agent_teams_async",
            "Run a multi-agent collaboration asynchronously; returns a wait handle.",
            params,
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let timeout_ms = args.get("timeoutMs").and_then(|v| v.as_u64());
        let continuable = args.get("continuable").and_then(|v| v.as_bool()).unwrap_or(true);
        let input: AgentTeamsInput = serde_json::from_value(args)
            .map_err(|e| AgentError::validation(format!("invalid agent_teams_async arguments: {}", e)))?;

        let (handle_id, timed_out_flag) = self
            .state
            .wait_handles
            .register(WaitKind::Team, json!({ "task": input.task, "mode": format!("{:?}", input.mode) }), timeout_ms)
            .await;

        let team = self.state.team.clone();
        let wait_handles = self.state.wait_handles.clone();
        let handle_id_spawned = handle_id.clone();
        let flag_for_run = if continuable { Some(timed_out_flag) } else { None };
        tokio::spawn(async move {
            match team.run_with_timeout(input, flag_for_run).await {
                Ok(value) => {
                    let _ = wait_handles.complete(&handle_id_spawned, value).await;
                }
                Err(e) => {
                    let _ = wait_handles.fail(&handle_id_spawned, e.to_string()).await;
                }
            }
        });

        Ok(json!({
            "async": true,
            "handleId": handle_id,
            "status": "pending",
        }))
    }
}

fn agent_teams_params() -> Vec<ToolParameter> {
    vec![
        arr_param("agents", "agent specs", ParamType::Object, true),
        str_param("task", "the shared task description", true),
        str_param("mode", "linear | parallel | rounds | intelligent", true),
        num_param("maxRounds", "round cap"),
        obj_param("intelligentSelection", "pool size and criteria for intelligent mode", false),
        arr_param("conditions", "flow-control conditions", ParamType::Object, false),
        arr_param("outputFields", "projection field names", ParamType::String, false),
        bool_param("verbose", "return full records instead of projections"),
        str_param("model", "default model for agents without one", false),
        bool_param("forceModel", "defer model selection to the host default"),
    ]
}

// -- Async wait ------------------------------------------------------------

struct WaitForHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for WaitForHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "wait_for",
            "Block until an async operation reaches a terminal state or a timeout elapses.",
            vec![
                str_param("handleId", "the handle id returned by an _async tool", true),
                num_param("timeoutMs", "how long to block"),
            ],
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let handle_id = require_str(&args, "handleId")?;
        let timeout_ms = args.get("timeoutMs").and_then(|v| v.as_u64());
        let handle = self.state.wait_handles.wait_for(&handle_id, timeout_ms).await?;
        Ok(serde_json::to_value(handle).unwrap())
    }
}

// -- Skills -----------------------------------------------------------------

struct CreateSkillHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for CreateSkillHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "create_skill",
            "Create a new skill.",
            vec![
                str_param("skillId", "unique skill id", true),
                str_param("name", "display name", true),
                str_param("description", "description", false),
                obj_param("config", "skill config (toolkits, rules, instructions, ...)", true),
            ],
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let id = require_str(&args, "skillId")?;
        let name = require_str(&args, "name")?;
        let config: SkillConfig = args
            .get("config")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| AgentError::validation(format!("invalid config: {}", e)))?
            .unwrap_or_default();
        let mut skill = Skill::new(id, name, config);
        if let Some(d) = args.get("description").and_then(|v| v.as_str()) {
            skill.description = d.to_string();
        }
        let saved = self.state.skills.create(skill).await?;
        Ok(serde_json::to_value(saved).unwrap())
    }
}

struct UpdateSkillHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for UpdateSkillHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "update_skill",
            "Update a skill's config.",
            vec![
                str_param("skillId", "skill id", true),
                obj_param("config", "replacement skill config", true),
                str_param("description", "updated description", false),
            ],
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let id = require_str(&args, "skillId")?;
        let config: SkillConfig = serde_json::from_value(
            args.get("config")
                .cloned()
                .ok_or_else(|| AgentError::validation("missing 'config'"))?,
        )
        .map_err(|e| AgentError::validation(format!("invalid config: {}", e)))?;
        let description = args.get("description").and_then(|v| v.as_str()).map(String::from);
        let saved = self.state.skills.update(&id, config, description).await?;
        Ok(serde_json::to_value(saved).unwrap())
    }
}

struct GetSkillHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for GetSkillHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "get_skill",
            "Fetch a skill by id.",
            vec![str_param("skillId", "skill id", true)],
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let id = require_str(&args, "skillId")?;
        Ok(serde_json::to_value(self.state.skills.get(&id).await?).unwrap())
    }
}

struct ListSkillsHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for ListSkillsHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "list_skills",
            "List skills with optional filters.",
            vec![
                str_param("search", "free-text search", false),
                str_param("category", "category filter", false),
                arr_param("tags", "tag filter (all must match)", ParamType::String, false),
                str_param("author", "author filter", false),
                bool_param("enabled", "filter by enabled flag"),
                bool_param("loaded", "filter by loaded flag"),
                str_param("hasToolkit", "require a specific toolkit", false),
                str_param("sortBy", "name | created | updated | usage | rating", false),
                str_param("direction", "asc | desc (default asc)", false),
                num_param("limit", "maximum number of results"),
                num_param("offset", "number of results to skip"),
            ],
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let sort_by = args
            .get("sortBy")
            .and_then(|v| v.as_str())
            .map(|s| match s.to_lowercase().as_str() {
                "name" => Ok(SortField::Name),
                "created" => Ok(SortField::Created),
                "updated" => Ok(SortField::Updated),
                "usage" => Ok(SortField::Usage),
                "rating" => Ok(SortField::Rating),
                other => Err(AgentError::validation(format!("unknown sortBy '{}'", other))),
            })
            .transpose()?;
        let direction = match args.get("direction").and_then(|v| v.as_str()) {
            Some(d) if d.eq_ignore_ascii_case("desc") => SortDirection::Desc,
            _ => SortDirection::Asc,
        };
        let filter = ListFilter {
            search: args.get("search").and_then(|v| v.as_str()).map(String::from),
            category: args.get("category").and_then(|v| v.as_str()).map(String::from),
            tags: args
                .get("tags")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                .unwrap_or_default(),
            author: args.get("author").and_then(|v| v.as_str()).map(String::from),
            enabled: args.get("enabled").and_then(|v| v.as_bool()),
            loaded: args.get("loaded").and_then(|v| v.as_bool()),
            has_toolkit: args.get("hasToolkit").and_then(|v| v.as_str()).map(String::from),
            sort_by,
            direction,
            limit: args.get("limit").and_then(|v| v.as_u64()).map(|n| n as usize),
            offset: args.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
        };
        let skills = self.state.skills.list(&filter).await;
        Ok(serde_json::to_value(skills).unwrap())
    }
}

struct LoadSkillHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for LoadSkillHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new("load_skill", "Load a skill and its dependencies.", vec![str_param("skillId", "skill id", true)])
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let id = require_str(&args, "skillId")?;
        Ok(serde_json::to_value(self.state.skills.load(&id).await?).unwrap())
    }
}

struct UnloadSkillHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for UnloadSkillHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new("unload_skill", "Unload a skill.", vec![str_param("skillId", "skill id", true)])
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let id = require_str(&args, "skillId")?;
        Ok(serde_json::to_value(self.state.skills.unload(&id).await?).unwrap())
    }
}

struct DeleteSkillHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for DeleteSkillHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new("delete_skill", "Delete a skill.", vec![str_param("skillId", "skill id", true)])
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let id = require_str(&args, "skillId")?;
        self.state.skills.delete(&id).await?;
        Ok(json!({ "deleted": id }))
    }
}

struct AttachSkillHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for AttachSkillHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "attach_skill",
            "Attach a skill to an agent, team, or other entity.",
            vec![
                str_param("skillId", "skill id", true),
                str_param("entityType", "attachment target type", true),
                str_param("entityId", "attachment target id", true),
                str_param("attachedBy", "who performed the attach", false),
                obj_param("overrides", "rule/tool/system-prompt overrides", false),
            ],
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let skill_id = require_str(&args, "skillId")?;
        let entity_type = require_str(&args, "entityType")?;
        let entity_id = require_str(&args, "entityId")?;
        let attached_by = args.get("attachedBy").and_then(|v| v.as_str()).map(String::from);
        let overrides = args.get("overrides").cloned();
        let attachment = self
            .state
            .skills
            .attach(
                &skill_id,
                SkillAttachmentTarget { entity_type, entity_id },
                attached_by,
                overrides,
            )
            .await?;
        Ok(serde_json::to_value(attachment).unwrap())
    }
}

struct DetachSkillHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for DetachSkillHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "detach_skill",
            "Detach a skill from an entity.",
            vec![
                str_param("skillId", "skill id", true),
                str_param("entityType", "attachment target type", true),
                str_param("entityId", "attachment target id", true),
            ],
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let skill_id = require_str(&args, "skillId")?;
        let entity_type = require_str(&args, "entityType")?;
        let entity_id = require_str(&args, "entityId")?;
        self.state.skills.detach(&skill_id, &entity_type, &entity_id).await?;
        Ok(json!({ "detached": skill_id }))
    }
}

struct GetAttachedSkillsHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for GetAttachedSkillsHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "get_attached_skills",
            "List skills attached to an entity.",
            vec![
                str_param("entityType", "attachment target type", true),
                str_param("entityId", "attachment target id", true),
            ],
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let entity_type = require_str(&args, "entityType")?;
        let entity_id = require_str(&args, "entityId")?;
        let attached = self.state.skills.get_attached(&entity_type, &entity_id).await;
        Ok(serde_json::to_value(attached).unwrap())
    }
}

struct ComposeSkillsHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for ComposeSkillsHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "compose_skills",
            "Compose an ordered list of skills into a merged configuration.",
            vec![arr_param("skillIds", "skill ids in precedence order", ParamType::String, true)],
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let ids: Vec<String> = args
            .get("skillIds")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .ok_or_else(|| AgentError::validation("missing 'skillIds'"))?;
        let composition = self.state.skills.compose(&ids).await?;
        Ok(serde_json::to_value(composition).unwrap())
    }
}

struct ExportSkillHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for ExportSkillHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "export_skill",
            "Export a skill as a portable bundle.",
            vec![
                str_param("skillId", "skill id", true),
                bool_param("includeDependencies", "include the required-skills closure"),
            ],
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let id = require_str(&args, "skillId")?;
        let include_deps = args.get("includeDependencies").and_then(|v| v.as_bool()).unwrap_or(false);
        self.state.skills.export(&id, include_deps).await
    }
}

struct ImportSkillHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for ImportSkillHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "import_skill",
            "Import a previously exported skill bundle.",
            vec![obj_param("bundle", "the exported bundle", true)],
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let bundle = args
            .get("bundle")
            .cloned()
            .ok_or_else(|| AgentError::validation("missing 'bundle'"))?;
        let imported = self.state.skills.import(bundle).await?;
        Ok(json!({ "imported": imported }))
    }
}

struct GetSkillUsageStatsHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl ToolHandler for GetSkillUsageStatsHandler {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::new(
            "get_skill_usage_stats",
            "Fetch usage statistics for a skill.",
            vec![str_param("skillId", "skill id", true)],
        )
    }

    async fn call(&self, args: JsonValue) -> AgentResult<JsonValue> {
        let id = require_str(&args, "skillId")?;
        let stats = self.state.skills.usage_stats(&id).await;
        Ok(serde_json::to_value(stats).unwrap())
    }
}

fn require_str(args: &JsonValue, field: &str) -> AgentResult<String> {
    args.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| AgentError::validation(format!("missing required field '{}'", field)))
}

/// Builds a `ToolServer` with every tool in SPEC_FULL.md §6.1 registered
/// against `state`. Grounded in `MCPServerBuilder::new`'s pattern of
/// eagerly wiring a fixed tool set onto a server instance
/// (`mcp_server_builder.rs`), generalized from a fluent `with_*` builder
/// to a single registration pass since this crate's tool surface is fixed
/// rather than opt-in per deployment.
pub async fn build_server(state: Arc<AppState>) -> ToolServer {
    let server = ToolServer::new();
    macro_rules! register {
        ($handler:expr) => {
            server.register(Arc::new($handler)).await;
        };
    }

    register!(ConfigureAgentHandler { state: state.clone() });
    register!(ListAgentsHandler { state: state.clone() });
    register!(GetAgentHandler { state: state.clone() });
    register!(DeleteAgentHandler { state: state.clone() });

    register!(ExecuteAgentHandler { state: state.clone() });
    register!(ExecuteAgentAsyncHandler { state: state.clone() });
    register!(ChatWithAgentHandler { state: state.clone() });

    register!(AgentTeamsHandler { state: state.clone() });
    register!(AgentTeamsAsyncHandler { state: state.clone() });

    register!(WaitForHandler { state: state.clone() });

    register!(CreateSkillHandler { state: state.clone() });
    register!(UpdateSkillHandler { state: state.clone() });
    register!(GetSkillHandler { state: state.clone() });
    register!(ListSkillsHandler { state: state.clone() });
    register!(LoadSkillHandler { state: state.clone() });
    register!(UnloadSkillHandler { state: state.clone() });
    register!(DeleteSkillHandler { state: state.clone() });
    register!(AttachSkillHandler { state: state.clone() });
    register!(DetachSkillHandler { state: state.clone() });
    register!(GetAttachedSkillsHandler { state: state.clone() });
    register!(ComposeSkillsHandler { state: state.clone() });
    register!(ExportSkillHandler { state: state.clone() });
    register!(ImportSkillHandler { state: state.clone() });
    register!(GetSkillUsageStatsHandler { state: state.clone() });

    server
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::InMemoryBudgetStore;
    use crate::sampling::test_support::StubAdapter;
    use std::time::Duration;

    async fn test_state() -> Arc<AppState> {
        let tmp = tempfile::tempdir().unwrap();
        Arc::new(AppState::new(
            Arc::new(AgentRegistry::new()),
            Arc::new(SkillsService::new(tmp.into_path(), Box::new(crate::skills::PermissiveResolver))),
            Arc::new(StubAdapter::new("resp")),
            Arc::new(InMemoryBudgetStore::new()),
            Arc::new(crate::budget::SlidingWindowRateLimiter::new(1000, Duration::from_secs(60))),
            Arc::new(UsageTracker::new()),
            ServerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn configure_then_execute_agent_via_tool_server() {
        let state = test_state().await;
        let server = build_server(state).await;

        let configured = server
            .dispatch(
                "configure_agent",
                json!({"agentId": "a1", "name": "Alpha", "systemPrompt": "You help."}),
            )
            .await;
        assert_eq!(configured.is_error, None);

        let executed = server
            .dispatch("execute_agent", json!({"agentId": "a1", "prompt": "hello", "verbose": true}))
            .await;
        assert_eq!(executed.is_error, None);
        assert!(executed.content[0].text.contains("hello"));
    }

    #[tokio::test]
    async fn execute_agent_async_then_wait_for() {
        let state = test_state().await;
        let server = build_server(state).await;

        let started = server
            .dispatch("execute_agent_async", json!({"agentId": "a1", "prompt": "hi"}))
            .await;
        let body: JsonValue = serde_json::from_str(&started.content[0].text).unwrap();
        let handle_id = body["handleId"].as_str().unwrap().to_string();

        let waited = server
            .dispatch("wait_for", json!({"handleId": handle_id, "timeoutMs": 2000}))
            .await;
        let handle: JsonValue = serde_json::from_str(&waited.content[0].text).unwrap();
        assert_eq!(handle["status"], "completed");
    }

    #[tokio::test]
    async fn skill_lifecycle_through_tool_server() {
        let state = test_state().await;
        let server = build_server(state).await;

        let created = server
            .dispatch(
                "create_skill",
                json!({"skillId": "s1", "name": "Summarizer", "config": {"toolkits": []}}),
            )
            .await;
        assert_eq!(created.is_error, None);

        let attached = server
            .dispatch(
                "attach_skill",
                json!({"skillId": "s1", "entityType": "agent", "entityId": "a1"}),
            )
            .await;
        assert_eq!(attached.is_error, None);

        let delete_attempt = server.dispatch("delete_skill", json!({"skillId": "s1"})).await;
        assert_eq!(delete_attempt.is_error, Some(true));
    }
}
