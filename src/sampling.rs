use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::AgentError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SampleRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleMessage {
    pub role: SampleRole,
    pub content: String,
}

impl SampleMessage {
    pub fn system<S: Into<String>>(content: S) -> Self {
        SampleMessage {
            role: SampleRole::System,
            content: content.into(),
        }
    }

    pub fn user<S: Into<String>>(content: S) -> Self {
        SampleMessage {
            role: SampleRole::User,
            content: content.into(),
        }
    }
}

/// Token accounting reported back by the sampling facility. Mirrors the
/// teacher's `TokenUsage` shape exactly.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct SampleRequest {
    pub messages: Vec<SampleMessage>,
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub enabled_tools: Vec<String>,
    pub include_context: bool,
    pub structured_output: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct SampleResponse {
    pub content: String,
    pub model: String,
    pub usage: Usage,
    pub finish_reason: String,
    pub structured_data: Option<JsonValue>,
}

/// The host's sampling facility, out of scope for this crate's internals
/// but depended on through this single trait — the same seam the teacher
/// cuts with `ClientWrapper` between an `Agent`/`Orchestration` and the
/// concrete LLM transport. Retry/backoff against transport failures is the
/// adapter's responsibility; this trait does not enforce budgets.
#[async_trait]
pub trait SamplingAdapter: Send + Sync {
    async fn sample(&self, request: SampleRequest) -> Result<SampleResponse, AgentError>;
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// A deterministic stub adapter for executor/team tests: returns a
    /// canned response built from the request's final user message, with
    /// usage derived from `max_tokens` using the same 40/60 split the
    /// executor uses to estimate cost before the real call.
    pub struct StubAdapter {
        pub response_prefix: String,
    }

    impl StubAdapter {
        pub fn new<S: Into<String>>(prefix: S) -> Self {
            StubAdapter {
                response_prefix: prefix.into(),
            }
        }
    }

    #[async_trait]
    impl SamplingAdapter for StubAdapter {
        async fn sample(&self, request: SampleRequest) -> Result<SampleResponse, AgentError> {
            let last_user = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == SampleRole::User)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let prompt_tokens = (request.max_tokens as f32 * 0.4) as u32;
            let completion_tokens = (request.max_tokens as f32 * 0.6) as u32;
            Ok(SampleResponse {
                content: format!("{}: {}", self.response_prefix, last_user),
                model: request.model.unwrap_or_else(|| "stub-model".to_string()),
                usage: Usage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: prompt_tokens + completion_tokens,
                },
                finish_reason: "stop".to_string(),
                structured_data: None,
            })
        }
    }
}
