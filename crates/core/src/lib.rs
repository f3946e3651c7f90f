pub mod audit;
pub mod config;
pub mod context;
pub mod domain;
pub mod errors;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions};
pub use context::ContextVariables;
pub use domain::agent::{Agent, AgentBuilder, AgentRegistry};
pub use domain::guardrail::{
    Direction, GuardrailResult, PipelineDecision, Severity, Verdict, Violation,
};
pub use domain::handoff::{HandoffRecord, HandoffRequest};
pub use domain::message::{Conversation, Message, MessageContent, Role};
pub use domain::run::{RunId, RunOutcome, RunResult, RunUsage, TokenUsage};
pub use domain::tool::{
    FnTool, ParameterKind, ParameterSchema, Tool, ToolCallRequest, ToolError, ToolFailure,
    ToolFailureKind, ToolResult, ToolSchema,
};
pub use errors::{
    AgentDefinitionError, ProviderError, ProviderErrorKind, RegistryError, RoutingError, RunError,
};
