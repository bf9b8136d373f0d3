use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::error::AgentError;

/// One piece of tool output. The protocol only ever emits `text` content
/// blocks; the text is a UTF-8 JSON serialization of the handler's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

impl ContentBlock {
    pub fn text<S: Into<String>>(text: S) -> Self {
        ContentBlock {
            content_type: "text".to_string(),
            text: text.into(),
        }
    }
}

/// The uniform result envelope returned by every tool invocation. Handlers
/// never throw out of process: any `AgentError` is folded into
/// `is_error: true` here instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEnvelope {
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolEnvelope {
    pub fn ok(value: &JsonValue) -> Self {
        ToolEnvelope {
            content: vec![ContentBlock::text(value.to_string())],
            is_error: None,
        }
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        ToolEnvelope {
            content: vec![ContentBlock::text(message.into())],
            is_error: Some(true),
        }
    }

    pub fn from_result(result: AgentResult) -> Self {
        match result {
            Ok(value) => ToolEnvelope::ok(&value),
            Err(e) => ToolEnvelope::error(e.to_string()),
        }
    }
}

type AgentResult = Result<JsonValue, AgentError>;

/// Parameter type tags for a tool's JSON-schema-ish argument description.
/// Kept deliberately small: the frontend only needs enough structure to
/// reject malformed calls early, not a full JSON Schema implementation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub param_type: ParamType,
    pub description: String,
    #[serde(default)]
    pub required: bool,
    /// For `Array` parameters, the schema of each item. Strict clients
    /// reject array parameters with no declared item type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ParamType>>,
    /// Inclusive lower/upper bounds for `Number`/`Integer` parameters, e.g.
    /// `temperature ∈ [0,2]`. `None` means unbounded on that side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl ToolParameter {
    pub fn new<S: Into<String>, D: Into<String>>(
        name: S,
        param_type: ParamType,
        description: D,
        required: bool,
    ) -> Self {
        ToolParameter {
            name: name.into(),
            param_type,
            description: description.into(),
            required,
            items: None,
            min: None,
            max: None,
        }
    }

    pub fn with_items(mut self, item_type: ParamType) -> Self {
        self.items = Some(Box::new(item_type));
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolMetadata {
    pub fn new<S: Into<String>, D: Into<String>>(
        name: S,
        description: D,
        parameters: Vec<ToolParameter>,
    ) -> Self {
        ToolMetadata {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Checks every declared required parameter is present in `args` and
    /// that present values carry a plausible JSON type for their tag.
    pub fn validate(&self, args: &JsonValue) -> Result<(), AgentError> {
        let obj = args.as_object().ok_or_else(|| {
            AgentError::validation(format!("{}: arguments must be a JSON object", self.name))
        })?;
        for param in &self.parameters {
            match obj.get(&param.name) {
                None if param.required => {
                    return Err(AgentError::validation(format!(
                        "{}: missing required parameter '{}'",
                        self.name, param.name
                    )));
                }
                None => continue,
                Some(value) => {
                    if !type_matches(&param.param_type, value) {
                        return Err(AgentError::validation(format!(
                            "{}: parameter '{}' has the wrong type",
                            self.name, param.name
                        )));
                    }
                    if let Some(n) = value.as_f64() {
                        if let Some(min) = param.min {
                            if n < min {
                                return Err(AgentError::validation(format!(
                                    "{}: parameter '{}' must be >= {} (got {})",
                                    self.name, param.name, min, n
                                )));
                            }
                        }
                        if let Some(max) = param.max {
                            if n > max {
                                return Err(AgentError::validation(format!(
                                    "{}: parameter '{}' must be <= {} (got {})",
                                    self.name, param.name, max, n
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn type_matches(expected: &ParamType, value: &JsonValue) -> bool {
    match expected {
        ParamType::String => value.is_string(),
        ParamType::Number => value.is_number(),
        ParamType::Integer => value.is_i64() || value.is_u64(),
        ParamType::Boolean => value.is_boolean(),
        ParamType::Array => value.is_array(),
        ParamType::Object => value.is_object(),
    }
}

/// Observability hook invoked before and after every tool dispatch. The
/// default implementation logs at `debug`/`info`; a caller may install a
/// custom sink (e.g. to forward to a metrics collector) without touching
/// dispatch logic.
#[async_trait]
pub trait ToolObserver: Send + Sync {
    async fn before_call(&self, tool_name: &str, args: &JsonValue) {
        let _ = args;
        log::debug!("tool call started: {}", tool_name);
    }

    async fn after_call(&self, tool_name: &str, envelope: &ToolEnvelope, duration_ms: u64) {
        let ok = envelope.is_error != Some(true);
        log::info!(
            "tool call finished: {} ok={} duration_ms={}",
            tool_name,
            ok,
            duration_ms
        );
    }
}

pub struct DefaultObserver;
impl ToolObserver for DefaultObserver {}

/// A single registered tool handler.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn metadata(&self) -> ToolMetadata;
    async fn call(&self, args: JsonValue) -> AgentResult;
}

/// Routes named tool invocations to registered handlers, validating
/// arguments against each handler's declared schema first and wrapping
/// every call with the observability hook. Grounded in `UnifiedMcpServer`'s
/// routing-by-name dispatcher: handlers are looked up under a read lock
/// which is dropped before the handler itself runs, so concurrent tool
/// calls never block on each other through this registry.
pub struct ToolServer {
    handlers: RwLock<HashMap<String, Arc<dyn ToolHandler>>>,
    observer: Arc<dyn ToolObserver>,
}

impl ToolServer {
    pub fn new() -> Self {
        ToolServer {
            handlers: RwLock::new(HashMap::new()),
            observer: Arc::new(DefaultObserver),
        }
    }

    pub fn with_observer(observer: Arc<dyn ToolObserver>) -> Self {
        ToolServer {
            handlers: RwLock::new(HashMap::new()),
            observer,
        }
    }

    pub async fn register(&self, handler: Arc<dyn ToolHandler>) {
        let name = handler.metadata().name.clone();
        self.handlers.write().await.insert(name, handler);
    }

    pub async fn list_tools(&self) -> Vec<ToolMetadata> {
        self.handlers
            .read()
            .await
            .values()
            .map(|h| h.metadata())
            .collect()
    }

    pub async fn dispatch(&self, tool_name: &str, args: JsonValue) -> ToolEnvelope {
        self.observer.before_call(tool_name, &args).await;
        let started = Instant::now();

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(tool_name).cloned()
        };

        let envelope = match handler {
            None => ToolEnvelope::error(format!("unknown tool: {}", tool_name)),
            Some(h) => match h.metadata().validate(&args) {
                Err(e) => ToolEnvelope::error(e.to_string()),
                Ok(()) => ToolEnvelope::from_result(h.call(args).await),
            },
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        self.observer
            .after_call(tool_name, &envelope, duration_ms)
            .await;
        envelope
    }
}

impl Default for ToolServer {
    fn default() -> Self {
        ToolServer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        fn metadata(&self) -> ToolMetadata {
            ToolMetadata::new(
                "echo",
                "echoes the message",
                vec![ToolParameter::new(
                    "message",
                    ParamType::String,
                    "text to echo",
                    true,
                )],
            )
        }

        async fn call(&self, args: JsonValue) -> AgentResult {
            Ok(json!({ "echoed": args["message"] }))
        }
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_handler() {
        let server = ToolServer::new();
        server.register(Arc::new(EchoHandler)).await;
        let envelope = server.dispatch("echo", json!({"message": "hi"})).await;
        assert_eq!(envelope.is_error, None);
        assert!(envelope.content[0].text.contains("hi"));
    }

    #[tokio::test]
    async fn dispatch_rejects_missing_required_param() {
        let server = ToolServer::new();
        server.register(Arc::new(EchoHandler)).await;
        let envelope = server.dispatch("echo", json!({})).await;
        assert_eq!(envelope.is_error, Some(true));
    }

    #[tokio::test]
    async fn dispatch_unknown_tool_is_an_error_envelope_not_a_panic() {
        let server = ToolServer::new();
        let envelope = server.dispatch("nonexistent", json!({})).await;
        assert_eq!(envelope.is_error, Some(true));
        assert!(envelope.content[0].text.contains("unknown tool"));
    }

    #[test]
    fn validate_rejects_out_of_range_number() {
        let metadata = ToolMetadata::new(
            "configure",
            "configures something",
            vec![ToolParameter::new("temperature", ParamType::Number, "sampling temperature", true)
                .with_range(Some(0.0), Some(2.0))],
        );
        assert!(metadata.validate(&json!({"temperature": 1.0})).is_ok());
        assert!(metadata.validate(&json!({"temperature": 3.5})).is_err());
        assert!(metadata.validate(&json!({"temperature": -0.1})).is_err());
    }
}
