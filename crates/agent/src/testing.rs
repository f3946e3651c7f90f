//! Test doubles for driving the runner without a real model backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use baton_core::domain::tool::ToolCallRequest;
use serde_json::Value;

use crate::llm::{BackendError, LlmClient, ModelRequest, ModelResponse};

type Step = Result<ModelResponse, BackendError>;

/// An [`LlmClient`] that replays a scripted sequence of responses and records every request.
///
/// Once the script is exhausted the client answers with an `invalid_request` error, unless
/// [`ScriptedClient::repeat_last`] was set, in which case the final step is replayed forever.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    repeat_last: bool,
    delay: Option<Duration>,
    requests: Mutex<Vec<ModelRequest>>,
    calls: AtomicU32,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, response: ModelResponse) -> Self {
        self.push(Ok(response))
    }

    pub fn respond_text(self, text: impl Into<String>) -> Self {
        self.respond(ModelResponse::text(text))
    }

    pub fn call_tool(self, id: &str, tool_name: &str, arguments: Value) -> Self {
        let call = ToolCallRequest::new(id, tool_name, arguments);
        self.respond(ModelResponse::tool_calls(vec![call]))
    }

    pub fn fail(self, error: BackendError) -> Self {
        self.push(Err(error))
    }

    pub fn repeat_last(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    /// Every call sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.requests).clone()
    }

    fn push(self, step: Step) -> Self {
        lock(&self.script).push_back(step);
        self
    }

    fn next_step(&self) -> Step {
        if let Some(step) = lock(&self.script).pop_front() {
            *lock(&self.last) = Some(step.clone());
            return step;
        }
        match lock(&self.last).as_ref() {
            Some(step) if self.repeat_last => step.clone(),
            _ => Err(BackendError::invalid_request("scripted client has no responses left")),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_step()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
