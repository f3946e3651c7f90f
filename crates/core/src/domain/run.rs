use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::Agent;
use crate::domain::guardrail::{Direction, PipelineDecision, Violation};
use crate::domain::handoff::HandoffRecord;
use crate::domain::message::{Conversation, Message};
use crate::errors::RunError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        Self(format!("run-{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunUsage {
    pub turns: u32,
    pub model_calls: u32,
    pub retries: u32,
    pub tool_calls: u32,
    pub tool_failures: u32,
    pub handoffs: u32,
    pub tokens: TokenUsage,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Completed,
    Blocked { direction: Direction, violations: Vec<Violation> },
    Failed(RunError),
}

#[derive(Clone, Debug)]
pub struct RunResult {
    pub run_id: RunId,
    pub conversation: Conversation,
    pub outcome: RunOutcome,
    pub last_agent: Arc<Agent>,
    /// Pipeline decisions other than a plain allow, in evaluation order.
    pub guardrail_decisions: Vec<PipelineDecision>,
    pub handoffs: Vec<HandoffRecord>,
    pub usage: RunUsage,
}

impl RunResult {
    /// True only for a completed run; a blocked run is reported as not successful.
    pub fn success(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed)
    }

    pub fn error(&self) -> Option<&RunError> {
        match &self.outcome {
            RunOutcome::Failed(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.outcome, RunOutcome::Blocked { .. })
    }

    pub fn final_output(&self) -> Option<&Message> {
        match self.outcome {
            RunOutcome::Completed => self.conversation.last_assistant(),
            _ => None,
        }
    }
}
