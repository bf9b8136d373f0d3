use std::error::Error;
use std::fmt;

/// The error surface for every tool handler. Never unwinds past the
/// protocol frontend: handlers catch these and fold them into an
/// `isError: true` envelope instead of propagating a panic or a bare
/// `Result::Err` to the host.
#[derive(Debug, Clone)]
pub enum AgentError {
    Validation(String),
    NotFound(String),
    Conflict(String),
    BudgetExceeded { dimension: String, reason: String },
    RateLimitExceeded { retry_after_secs: u64 },
    MissingDependency(String),
    SamplerError(String),
    Timeout(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Validation(msg) => write!(f, "validation error: {}", msg),
            AgentError::NotFound(what) => write!(f, "not found: {}", what),
            AgentError::Conflict(msg) => write!(f, "conflict: {}", msg),
            AgentError::BudgetExceeded { dimension, reason } => {
                write!(f, "{} budget exceeded: {}", dimension, reason)
            }
            AgentError::RateLimitExceeded { retry_after_secs } => {
                write!(f, "rate limit exceeded, retry after {}s", retry_after_secs)
            }
            AgentError::MissingDependency(what) => write!(f, "missing dependency: {}", what),
            AgentError::SamplerError(msg) => write!(f, "sampler error: {}", msg),
            AgentError::Timeout(msg) => write!(f, "timeout: {}", msg),
        }
    }
}

impl Error for AgentError {}

impl AgentError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        AgentError::Validation(msg.into())
    }

    pub fn not_found<S: Into<String>>(what: S) -> Self {
        AgentError::NotFound(what.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        AgentError::Conflict(msg.into())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
