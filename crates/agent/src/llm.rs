use std::time::Duration;

use async_trait::async_trait;
use baton_core::context::ContextVariables;
use baton_core::domain::agent::Agent;
use baton_core::domain::handoff::transfer_tool_schemas;
use baton_core::domain::message::{Conversation, Message, MessageContent, Role};
use baton_core::domain::run::TokenUsage;
use baton_core::domain::tool::{ToolCallRequest, ToolSchema};
use baton_core::errors::ProviderErrorKind;
use thiserror::Error;

/// Everything a backend needs for one completion.
#[derive(Clone, Debug)]
pub struct ModelRequest {
    pub model: String,
    /// The agent's instructions come first as a system message, followed by the transcript.
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub parallel_tool_calls: bool,
    pub context: ContextVariables,
}

impl ModelRequest {
    pub fn for_agent(
        agent: &Agent,
        conversation: &Conversation,
        context: &ContextVariables,
    ) -> Self {
        let mut messages = Vec::with_capacity(conversation.len() + 1);
        if !agent.instructions().trim().is_empty() {
            messages.push(Message::system(agent.instructions()));
        }
        messages.extend(conversation.iter().cloned());

        let mut tools = agent.tool_schemas();
        tools.extend(transfer_tool_schemas(agent.handoff_targets().iter().map(String::as_str)));

        Self {
            model: agent.model().to_owned(),
            messages,
            tools,
            parallel_tool_calls: agent.parallel_tool_calls(),
            context: context.clone(),
        }
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|message| message.role == Role::System)
            .and_then(|message| message.content.as_text())
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|tool| tool.name == name)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelResponse {
    pub content: MessageContent,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: TokenUsage,
    /// Backend attempts spent producing this response; set by the provider adapter.
    pub attempts: u32,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: MessageContent::Text(content.into()), ..Self::default() }
    }

    pub fn tool_calls(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self { tool_calls, ..Self::default() }
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = TokenUsage { prompt_tokens, completion_tokens };
        self
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.tool_calls.is_empty()
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("backend error ({}): {message}", kind.as_str())]
pub struct BackendError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// Server-provided hint for when to retry, e.g. from a rate-limit response.
    pub retry_after: Option<Duration>,
}

impl BackendError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retry_after: None }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unavailable, message)
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self { retry_after, ..Self::new(ProviderErrorKind::RateLimited, "rate limited") }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Auth, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidRequest, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, BackendError>;
}
