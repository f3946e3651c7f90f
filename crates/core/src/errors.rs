use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("handoff target `{target}` is not a registered agent")]
    UnknownAgent { target: String },
    #[error("agent `{from}` is not permitted to hand off to `{target}`")]
    TargetNotPermitted { from: String, target: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Timeout,
    RateLimited,
    /// Server-side failure (5xx-equivalent).
    Unavailable,
    Auth,
    InvalidRequest,
    Other,
}

impl ProviderErrorKind {
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited | Self::Unavailable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Auth => "auth",
            Self::InvalidRequest => "invalid_request",
            Self::Other => "other",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub kind: ProviderErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// `attempts` holds the transient failures of this call that preceded the rejection.
    #[error("circuit open for model `{model}`; call rejected without contacting the backend")]
    CircuitOpen { model: String, attempts: Vec<AttemptRecord> },
    #[error("provider call for model `{model}` failed ({}): {message}", kind.as_str())]
    Fatal { model: String, kind: ProviderErrorKind, message: String },
    #[error("provider call for model `{model}` failed after {} attempts", attempts.len())]
    RetriesExhausted { model: String, attempts: Vec<AttemptRecord> },
    #[error("no provider adapter configured for model `{model}`")]
    NoAdapter { model: String },
}

impl ProviderError {
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::RetriesExhausted { attempts, .. } | Self::CircuitOpen { attempts, .. } => {
                attempts
            }
            _ => &[],
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("agent `{agent}` reached its limit of {max_turns} turns")]
    MaxTurnsExceeded { agent: String, max_turns: u32 },
    #[error("agent `{agent}` produced an empty response")]
    EmptyResponse { agent: String },
}

impl RunError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Routing(_) => "routing",
            Self::Provider(_) => "provider",
            Self::MaxTurnsExceeded { .. } => "max_turns_exceeded",
            Self::EmptyResponse { .. } => "empty_response",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AgentDefinitionError {
    #[error("agent name must not be empty")]
    EmptyName,
    #[error("agent `{agent}` has no model configured")]
    EmptyModel { agent: String },
    #[error("agent `{agent}` must allow at least one turn")]
    ZeroMaxTurns { agent: String },
    #[error("agent `{agent}` declares tool `{tool}` more than once")]
    DuplicateTool { agent: String, tool: String },
    #[error("agent `{agent}` declares tool `{tool}` using the reserved `transfer_to_` prefix")]
    ReservedToolName { agent: String, tool: String },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("agent `{0}` is registered more than once")]
    DuplicateAgent(String),
    #[error("agent `{agent}` lists unregistered handoff target `{target}`")]
    UnknownHandoffTarget { agent: String, target: String },
}
