//! Agent Runtime - the orchestration loop behind baton
//!
//! This crate turns the definitions in `baton-core` into running conversations:
//! - Calls model backends through retrying, circuit-broken provider adapters
//! - Dispatches tool calls, concurrently when the agent allows it
//! - Routes structured `transfer_to_*` handoffs between registered agents
//! - Screens input and output through a guardrail pipeline
//!
//! # Architecture
//!
//! Each run follows a bounded loop:
//! 1. **Input screening** (`guardrails`) - block, redact or flag the incoming message
//! 2. **Model call** (`provider`) - retry transient failures, fail fast while the breaker is open
//! 3. **Dispatch** (`tools`, `handoff`) - execute tool calls or switch the active agent
//! 4. **Output screening** (`guardrails`) - vet the final answer before it is recorded
//!
//! # Key Types
//!
//! - `Runner` - Main orchestrator (see `runtime` module)
//! - `LlmClient` - Pluggable trait for model backends
//! - `GuardrailPipeline` - Ordered guardrails with verdict aggregation

pub mod breaker;
pub mod guardrails;
pub mod handoff;
pub mod hooks;
pub mod llm;
pub mod provider;
pub mod runtime;
pub mod testing;
pub mod tools;
mod unwind;

pub use breaker::{BreakerConfig, BreakerPermit, BreakerState, CircuitBreaker};
pub use guardrails::{Guardrail, GuardrailError, GuardrailPipeline};
pub use handoff::{HandoffRouter, RoutedAgent};
pub use hooks::{AuditHooks, NoopHooks, RunHooks};
pub use llm::{BackendError, LlmClient, ModelRequest, ModelResponse};
pub use provider::{AdapterSet, ProviderAdapter, RetryPolicy};
pub use runtime::{RunState, Runner, RunnerConfig};
pub use testing::ScriptedClient;
pub use tools::{ToolInvoker, ToolRegistry};
