use std::sync::Arc;
use std::time::Duration;

use baton_core::config::AppConfig;
use baton_core::context::ContextVariables;
use baton_core::domain::agent::{Agent, AgentRegistry};
use baton_core::domain::guardrail::{Direction, PipelineDecision, Verdict};
use baton_core::domain::handoff::{is_transfer_call, HandoffRecord, HandoffRequest};
use baton_core::domain::message::{Conversation, Message, MessageContent};
use baton_core::domain::run::{RunId, RunOutcome, RunResult, RunUsage};
use baton_core::errors::{RoutingError, RunError};
use serde_json::json;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::guardrails::{GuardrailPipeline, RuleError};
use crate::handoff::{first_transfer, HandoffRouter, RoutedAgent};
use crate::hooks::{NoopHooks, RunHooks};
use crate::llm::ModelResponse;
use crate::provider::AdapterSet;
use crate::tools::ToolInvoker;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Start,
    AwaitingModel,
    ProcessingResponse,
    DispatchingTools,
    HandoffPending,
    Terminal,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::AwaitingModel => "awaiting_model",
            Self::ProcessingResponse => "processing_response",
            Self::DispatchingTools => "dispatching_tools",
            Self::HandoffPending => "handoff_pending",
            Self::Terminal => "terminal",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Upper bound applied on top of each agent's own `max_turns`.
    pub max_turns_cap: u32,
    pub tool_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { max_turns_cap: 25, tool_timeout: Duration::from_secs(30) }
    }
}

impl From<&AppConfig> for RunnerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_turns_cap: config.runner.max_turns_cap,
            tool_timeout: config.runner.tool_timeout(),
        }
    }
}

/// Drives one conversation through model calls, tool dispatch, handoffs and guardrails.
///
/// A runner holds no per-run state; the same instance may serve any number of concurrent runs.
pub struct Runner {
    registry: AgentRegistry,
    router: HandoffRouter,
    adapters: AdapterSet,
    pipeline: GuardrailPipeline,
    hooks: Arc<dyn RunHooks>,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(registry: AgentRegistry, adapters: AdapterSet) -> Self {
        Self {
            router: HandoffRouter::new(registry.clone()),
            registry,
            adapters,
            pipeline: GuardrailPipeline::default(),
            hooks: Arc::new(NoopHooks),
            config: RunnerConfig::default(),
        }
    }

    pub fn from_config(
        registry: AgentRegistry,
        adapters: AdapterSet,
        config: &AppConfig,
    ) -> Result<Self, RuleError> {
        Ok(Self::new(registry, adapters)
            .with_pipeline(GuardrailPipeline::from_config(config)?)
            .with_config(RunnerConfig::from(config)))
    }

    pub fn with_pipeline(mut self, pipeline: GuardrailPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_hooks(self, hooks: impl RunHooks + 'static) -> Self {
        self.with_hooks_arc(Arc::new(hooks))
    }

    pub fn with_hooks_arc(mut self, hooks: Arc<dyn RunHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub async fn run(
        &self,
        agent: Arc<Agent>,
        input: Message,
        context: ContextVariables,
    ) -> RunResult {
        self.run_conversation(agent, Conversation::new(), input, context).await
    }

    /// Continues `history` with `input`. The run always ends in a [`RunResult`]; failures are
    /// reported through its outcome.
    pub async fn run_conversation(
        &self,
        agent: Arc<Agent>,
        history: Conversation,
        input: Message,
        context: ContextVariables,
    ) -> RunResult {
        let run_id = RunId::generate();
        let span = info_span!("run", run_id = %run_id, agent = %agent.name());
        let mut run = ActiveRun::new(run_id, agent, history, Arc::clone(&self.hooks));

        let outcome = self.drive(&mut run, input, &context).instrument(span.clone()).await;
        span.in_scope(|| run.finish(outcome))
    }

    fn turn_limit(&self, agent: &Agent) -> u32 {
        agent.max_turns().min(self.config.max_turns_cap)
    }

    async fn drive(
        &self,
        run: &mut ActiveRun,
        input: Message,
        context: &ContextVariables,
    ) -> RunOutcome {
        info!(
            event_name = "runner.run.started",
            history = run.conversation.len(),
            "run started"
        );

        let decision =
            self.pipeline.evaluate(&input.content.to_text(), Direction::Input, context).await;
        run.record_decision(&decision);
        if decision.is_blocked() {
            warn!(
                event_name = "runner.input.blocked",
                violations = decision.violations().len(),
                "input blocked by guardrails"
            );
            return RunOutcome::Blocked {
                direction: Direction::Input,
                violations: decision.violations(),
            };
        }
        let input = match decision.filtered_content {
            Some(filtered) if decision.verdict == Verdict::Redact => {
                let content = input.content.redacted(filtered);
                input.with_content(content)
            }
            _ => input,
        };
        run.append(input);

        // Consecutive handoffs without a counted turn in between.
        let mut hops: u32 = 0;
        loop {
            let limit = self.turn_limit(&run.agent);
            if run.usage.turns >= limit {
                warn!(
                    event_name = "runner.turns.exceeded",
                    agent = %run.agent.name(),
                    max_turns = limit,
                    "turn limit reached"
                );
                return RunOutcome::Failed(RunError::MaxTurnsExceeded {
                    agent: run.agent.name().to_owned(),
                    max_turns: limit,
                });
            }

            run.transition(RunState::AwaitingModel);
            let response = match self.call_model(run, context).await {
                Ok(response) => response,
                Err(error) => return RunOutcome::Failed(error),
            };

            run.transition(RunState::ProcessingResponse);
            if response.is_empty() {
                warn!(
                    event_name = "runner.response.empty",
                    agent = %run.agent.name(),
                    "empty model response"
                );
                return RunOutcome::Failed(RunError::EmptyResponse {
                    agent: run.agent.name().to_owned(),
                });
            }

            if let Some((index, request)) = first_transfer(&response.tool_calls) {
                hops += 1;
                if hops > limit {
                    warn!(
                        event_name = "runner.handoffs.exceeded",
                        agent = %run.agent.name(),
                        max_turns = limit,
                        "too many consecutive handoffs"
                    );
                    return RunOutcome::Failed(RunError::MaxTurnsExceeded {
                        agent: run.agent.name().to_owned(),
                        max_turns: limit,
                    });
                }
                if let Err(error) = self.hand_off(run, response, index, request) {
                    return RunOutcome::Failed(error.into());
                }
                continue;
            }

            run.usage.turns += 1;
            hops = 0;

            if !response.tool_calls.is_empty() {
                self.dispatch_tools(run, response, context).await;
                continue;
            }

            return self.finalize(run, response.content, context).await;
        }
    }

    async fn call_model(
        &self,
        run: &mut ActiveRun,
        context: &ContextVariables,
    ) -> Result<ModelResponse, RunError> {
        let adapter = self.adapters.resolve(run.agent.model())?;
        info!(
            event_name = "runner.turn.started",
            agent = %run.agent.name(),
            model = %run.agent.model(),
            provider = %adapter.name(),
            turn = run.usage.turns + 1,
            "requesting model response"
        );

        let response = adapter.call(&run.agent, &run.conversation, context).await?;
        run.usage.model_calls += 1;
        run.usage.retries += response.attempts.saturating_sub(1);
        run.usage.tokens.add(response.usage);
        Ok(response)
    }

    /// Appends the transfer response and one acknowledgement per tool call, then switches the
    /// active agent. Calls other than the honoured transfer are acknowledged as skipped.
    fn hand_off(
        &self,
        run: &mut ActiveRun,
        response: ModelResponse,
        index: usize,
        request: HandoffRequest,
    ) -> Result<(), RoutingError> {
        run.transition(RunState::HandoffPending);
        let from = run.agent.name().to_owned();
        let calls = response.tool_calls;
        run.append(
            Message::assistant_with_tool_calls(response.content, calls.clone()).with_agent(&from),
        );

        let routed = self.router.route(&run.agent, &request);
        for (position, call) in calls.iter().enumerate() {
            let ack = if position == index {
                match &routed {
                    Ok(RoutedAgent::Switched(agent)) => json!({ "transferred_to": agent.name() }),
                    Ok(RoutedAgent::Unchanged) => json!({ "transferred_to": from }),
                    Err(error) => json!({ "error": error.to_string() }),
                }
            } else if is_transfer_call(call) {
                json!({ "skipped": "only the first transfer in a response is honoured" })
            } else {
                json!({ "skipped": "control was transferred before this call ran" })
            };
            run.append(Message::tool(call.id.clone(), ack).with_agent(&from));
        }

        let next = match routed {
            Ok(RoutedAgent::Switched(agent)) => agent,
            Ok(RoutedAgent::Unchanged) => {
                debug!(
                    event_name = "runner.handoff.noop",
                    agent = %from,
                    "handoff to the active agent"
                );
                return Ok(());
            }
            Err(error) => {
                warn!(
                    event_name = "runner.handoff.rejected",
                    from = %from,
                    target = %request.target_agent_name,
                    error = %error,
                    "handoff rejected"
                );
                return Err(error);
            }
        };

        let record = HandoffRecord {
            from,
            to: next.name().to_owned(),
            reason: request.reason,
            turn: run.usage.turns,
        };
        info!(
            event_name = "runner.handoff.accepted",
            from = %record.from,
            to = %record.to,
            reason = record.reason.as_deref().unwrap_or(""),
            "handoff accepted"
        );
        run.hooks.on_handoff(&run.run_id, &record);
        run.handoffs.push(record);
        run.usage.handoffs += 1;
        run.agent = next;
        Ok(())
    }

    async fn dispatch_tools(
        &self,
        run: &mut ActiveRun,
        response: ModelResponse,
        context: &ContextVariables,
    ) {
        run.transition(RunState::DispatchingTools);
        let agent_name = run.agent.name().to_owned();
        let calls = response.tool_calls;
        run.append(
            Message::assistant_with_tool_calls(response.content, calls.clone())
                .with_agent(&agent_name),
        );

        let invoker = ToolInvoker::for_agent(&run.agent, self.config.tool_timeout);
        let results = invoker.invoke(calls, context).await;

        run.usage.tool_calls += results.len() as u32;
        run.usage.tool_failures += results.iter().filter(|result| !result.success).count() as u32;
        for result in &results {
            run.append(Message::tool_result(result).with_agent(&agent_name));
        }
    }

    async fn finalize(
        &self,
        run: &mut ActiveRun,
        content: MessageContent,
        context: &ContextVariables,
    ) -> RunOutcome {
        let decision =
            self.pipeline.evaluate(&content.to_text(), Direction::Output, context).await;
        run.record_decision(&decision);
        if decision.is_blocked() {
            warn!(
                event_name = "runner.output.blocked",
                agent = %run.agent.name(),
                violations = decision.violations().len(),
                "output blocked by guardrails"
            );
            return RunOutcome::Blocked {
                direction: Direction::Output,
                violations: decision.violations(),
            };
        }

        let content = match decision.filtered_content {
            Some(filtered) if decision.verdict == Verdict::Redact => content.redacted(filtered),
            _ => content,
        };
        let agent_name = run.agent.name().to_owned();
        run.append(Message::assistant(content).with_agent(agent_name));
        RunOutcome::Completed
    }
}

struct ActiveRun {
    run_id: RunId,
    agent: Arc<Agent>,
    conversation: Conversation,
    decisions: Vec<PipelineDecision>,
    handoffs: Vec<HandoffRecord>,
    usage: RunUsage,
    state: RunState,
    hooks: Arc<dyn RunHooks>,
}

impl ActiveRun {
    fn new(
        run_id: RunId,
        agent: Arc<Agent>,
        conversation: Conversation,
        hooks: Arc<dyn RunHooks>,
    ) -> Self {
        Self {
            run_id,
            agent,
            conversation,
            decisions: Vec::new(),
            handoffs: Vec::new(),
            usage: RunUsage::default(),
            state: RunState::Start,
            hooks,
        }
    }

    fn transition(&mut self, next: RunState) {
        debug!(
            event_name = "runner.state.transition",
            from = self.state.as_str(),
            to = next.as_str(),
            "run state changed"
        );
        self.state = next;
    }

    fn append(&mut self, message: Message) {
        self.hooks.on_message_appended(&self.run_id, &message);
        self.conversation.push(message);
    }

    fn record_decision(&mut self, decision: &PipelineDecision) {
        if decision.verdict == Verdict::Allow {
            return;
        }
        self.hooks.on_guardrail_violation(&self.run_id, self.agent.name(), decision);
        self.decisions.push(decision.clone());
    }

    fn finish(mut self, outcome: RunOutcome) -> RunResult {
        self.transition(RunState::Terminal);
        match &outcome {
            RunOutcome::Completed => info!(
                event_name = "runner.run.finished",
                outcome = "completed",
                agent = %self.agent.name(),
                turns = self.usage.turns,
                handoffs = self.usage.handoffs,
                "run finished"
            ),
            RunOutcome::Blocked { direction, .. } => info!(
                event_name = "runner.run.finished",
                outcome = "blocked",
                direction = direction.as_str(),
                turns = self.usage.turns,
                "run finished"
            ),
            RunOutcome::Failed(error) => warn!(
                event_name = "runner.run.finished",
                outcome = "failed",
                error_kind = error.kind(),
                error = %error,
                turns = self.usage.turns,
                "run finished"
            ),
        }

        let result = RunResult {
            run_id: self.run_id,
            conversation: self.conversation,
            outcome,
            last_agent: self.agent,
            guardrail_decisions: self.decisions,
            handoffs: self.handoffs,
            usage: self.usage,
        };
        self.hooks.on_run_finished(&result);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use baton_core::context::ContextVariables;
    use baton_core::domain::agent::{Agent, AgentRegistry};
    use baton_core::domain::guardrail::Verdict;
    use baton_core::domain::message::{Message, Role};
    use baton_core::domain::run::{RunId, RunOutcome, RunResult};
    use baton_core::errors::RunError;
    use serde_json::json;

    use super::{Runner, RunnerConfig};
    use crate::guardrails::{GuardrailPipeline, PatternGuardrail};
    use crate::hooks::RunHooks;
    use crate::provider::{AdapterSet, ProviderAdapter};
    use crate::testing::ScriptedClient;

    #[derive(Default)]
    struct Recorder {
        appended: Mutex<Vec<Role>>,
        finished: Mutex<Vec<bool>>,
    }

    impl RunHooks for Recorder {
        fn on_message_appended(&self, _run_id: &RunId, message: &Message) {
            self.appended.lock().expect("lock").push(message.role);
        }

        fn on_run_finished(&self, result: &RunResult) {
            self.finished.lock().expect("lock").push(result.success());
        }
    }

    fn solo(max_turns: u32) -> (Arc<Agent>, AgentRegistry) {
        let registry = AgentRegistry::builder()
            .register(
                Agent::builder("Solo")
                    .model("gpt-4o")
                    .instructions("Answer briefly.")
                    .max_turns(max_turns)
                    .build()
                    .expect("agent builds"),
            )
            .build()
            .expect("registry builds");
        (registry.get("Solo").expect("registered"), registry)
    }

    fn runner(registry: AgentRegistry, client: Arc<ScriptedClient>) -> Runner {
        Runner::new(registry, AdapterSet::single(ProviderAdapter::new("scripted", client)))
    }

    #[tokio::test]
    async fn hooks_see_every_appended_message() {
        let (agent, registry) = solo(5);
        let client = Arc::new(
            ScriptedClient::new().call_tool("c1", "missing", json!({})).respond_text("done"),
        );
        let recorder = Arc::new(Recorder::default());
        let runner = runner(registry, client).with_hooks_arc(recorder.clone());

        let result = runner.run(agent, Message::user("hi"), ContextVariables::new()).await;

        assert!(result.success());
        assert_eq!(
            *recorder.appended.lock().expect("lock"),
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert_eq!(*recorder.finished.lock().expect("lock"), vec![true]);
        assert_eq!(result.usage.turns, 2);
        assert_eq!(result.usage.tool_failures, 1);
    }

    #[tokio::test]
    async fn runner_cap_tightens_agent_limit() {
        let (agent, registry) = solo(10);
        let client =
            Arc::new(ScriptedClient::new().call_tool("c1", "missing", json!({})).repeat_last());
        let runner = runner(registry, Arc::clone(&client))
            .with_config(RunnerConfig { max_turns_cap: 2, ..RunnerConfig::default() });

        let result = runner.run(agent, Message::user("loop"), ContextVariables::new()).await;

        assert_eq!(
            result.error(),
            Some(&RunError::MaxTurnsExceeded { agent: "Solo".to_owned(), max_turns: 2 })
        );
        assert_eq!(result.usage.turns, 2);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn self_handoff_continues_with_the_same_agent() {
        let (agent, registry) = solo(3);
        let client = Arc::new(
            ScriptedClient::new()
                .call_tool("h1", "transfer_to_Solo", json!({}))
                .respond_text("still here"),
        );
        let runner = runner(registry, client);

        let result = runner.run(agent, Message::user("hi"), ContextVariables::new()).await;

        assert!(result.success());
        assert!(result.handoffs.is_empty());
        assert_eq!(result.usage.turns, 1);
        assert_eq!(result.last_agent.name(), "Solo");
    }

    #[tokio::test]
    async fn redacted_input_is_what_the_model_sees() {
        let (agent, registry) = solo(3);
        let client = Arc::new(ScriptedClient::new().respond_text("noted"));
        let pipeline = GuardrailPipeline::new()
            .with_guardrail(PatternGuardrail::pii(Verdict::Redact, "[REDACTED]").expect("preset"));
        let runner = runner(registry, Arc::clone(&client)).with_pipeline(pipeline);

        let result = runner
            .run(agent, Message::user("reach me at ana@example.com"), ContextVariables::new())
            .await;

        assert!(result.success());
        let requests = client.requests();
        let sent = requests[0].messages.last().expect("user message").content.to_text();
        assert_eq!(sent, "reach me at [REDACTED]");
        assert_eq!(result.guardrail_decisions.len(), 1);
        assert_eq!(result.guardrail_decisions[0].verdict, Verdict::Redact);
    }

    #[tokio::test]
    async fn blocked_output_is_not_appended() {
        let (agent, registry) = solo(3);
        let client = Arc::new(ScriptedClient::new().respond_text("SSN is 123-45-6789"));
        let pipeline = GuardrailPipeline::new()
            .with_guardrail(PatternGuardrail::pii(Verdict::Block, "[REDACTED]").expect("preset"));
        let runner = runner(registry, client).with_pipeline(pipeline);

        let result = runner.run(agent, Message::user("what is it?"), ContextVariables::new()).await;

        assert!(!result.success());
        assert!(matches!(result.outcome, RunOutcome::Blocked { .. }));
        assert_eq!(result.conversation.len(), 1);
        assert!(result.final_output().is_none());
    }
}
