//! A JSON-RPC style tool protocol server for multi-agent orchestration:
//! agent presets, skill composition, budgets, and async wait handles.

pub mod agent_registry;
pub mod budget;
pub mod config;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod sampling;
pub mod server;
pub mod skills;
pub mod team;
pub mod wait_handles;

pub use agent_registry::{AgentConfig, AgentRegistry};
pub use config::ServerConfig;
pub use error::{AgentError, AgentResult};
pub use executor::AgentExecutor;
pub use protocol::{ToolEnvelope, ToolServer};
pub use sampling::SamplingAdapter;
pub use server::{build_server, AppState};
pub use skills::SkillsService;
pub use team::TeamOrchestrator;
pub use wait_handles::WaitHandleRegistry;
