use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use baton_core::context::ContextVariables;
use baton_core::domain::agent::Agent;
use baton_core::domain::tool::{Tool, ToolCallRequest, ToolError, ToolFailureKind, ToolResult};
use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, info_span, warn, Instrument};

use crate::unwind::panic_message;

/// Tools addressable by name. Immutable once handed to a [`ToolInvoker`].
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn for_agent(agent: &Agent) -> Self {
        let mut registry = Self::default();
        for tool in agent.tools() {
            registry.register_arc(Arc::clone(tool));
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Executes a batch of tool calls. Every call yields a [`ToolResult`]; failures never propagate.
pub struct ToolInvoker {
    registry: ToolRegistry,
    parallel: bool,
    timeout: Duration,
}

impl ToolInvoker {
    pub fn new(registry: ToolRegistry, parallel: bool, timeout: Duration) -> Self {
        Self { registry, parallel, timeout }
    }

    pub fn for_agent(agent: &Agent, timeout: Duration) -> Self {
        Self::new(ToolRegistry::for_agent(agent), agent.parallel_tool_calls(), timeout)
    }

    /// Results come back in request order whether calls ran concurrently or one by one.
    pub async fn invoke(
        &self,
        tool_calls: Vec<ToolCallRequest>,
        context: &ContextVariables,
    ) -> Vec<ToolResult> {
        if self.parallel && tool_calls.len() > 1 {
            let tasks = tool_calls.into_iter().map(|request| self.execute(request, context));
            return join_all(tasks).await;
        }

        let mut results = Vec::with_capacity(tool_calls.len());
        for request in tool_calls {
            results.push(self.execute(request, context).await);
        }
        results
    }

    async fn execute(&self, request: ToolCallRequest, context: &ContextVariables) -> ToolResult {
        let span = info_span!("tool", tool = %request.tool_name, call_id = %request.id);
        let started = Instant::now();
        let result = async {
            let Some(tool) = self.registry.get(&request.tool_name) else {
                return ToolResult::failed(
                    &request,
                    ToolFailureKind::NotFound,
                    format!("unknown tool `{}`", request.tool_name),
                    started.elapsed(),
                );
            };

            if let Err(error) = tool.schema().validate(&request.arguments) {
                return ToolResult::failed(
                    &request,
                    ToolFailureKind::InvalidArguments,
                    error.to_string(),
                    started.elapsed(),
                );
            }

            let arguments = request.arguments.clone();
            let call = AssertUnwindSafe(async { tool.invoke(arguments, context).await });
            match tokio::time::timeout(self.timeout, call.catch_unwind()).await {
                Ok(Ok(Ok(value))) => ToolResult::succeeded(&request, value, started.elapsed()),
                Ok(Ok(Err(ToolError::InvalidArguments(message)))) => ToolResult::failed(
                    &request,
                    ToolFailureKind::InvalidArguments,
                    message,
                    started.elapsed(),
                ),
                Ok(Ok(Err(error))) => ToolResult::failed(
                    &request,
                    ToolFailureKind::Execution,
                    error.to_string(),
                    started.elapsed(),
                ),
                Ok(Err(payload)) => ToolResult::failed(
                    &request,
                    ToolFailureKind::Execution,
                    format!("tool panicked: {}", panic_message(payload)),
                    started.elapsed(),
                ),
                Err(_) => ToolResult::failed(
                    &request,
                    ToolFailureKind::Timeout,
                    format!("tool exceeded {}ms", self.timeout.as_millis()),
                    started.elapsed(),
                ),
            }
        }
        .instrument(span)
        .await;

        match &result.error {
            Some(failure) => warn!(
                event_name = "tool.failed",
                tool = %result.tool_name,
                call_id = %result.call_id,
                kind = ?failure.kind,
                error = %failure.message,
                "tool call failed"
            ),
            None => debug!(
                event_name = "tool.completed",
                tool = %result.tool_name,
                call_id = %result.call_id,
                elapsed_ms = result.elapsed.as_millis() as u64,
                "tool call completed"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use baton_core::context::ContextVariables;
    use baton_core::domain::agent::Agent;
    use baton_core::domain::tool::{
        FnTool, ParameterKind, ParameterSchema, ToolCallRequest, ToolError, ToolFailureKind,
    };
    use serde_json::json;

    use super::ToolInvoker;

    fn sleeper(name: &str, delay_ms: u64) -> FnTool {
        FnTool::new(name, ParameterSchema::new(), move |_, _| async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok(json!(delay_ms))
        })
    }

    fn agent(parallel: bool) -> Agent {
        Agent::builder("Worker")
            .model("gpt-4o")
            .parallel_tool_calls(parallel)
            .tool(sleeper("slow", 300))
            .tool(sleeper("fast", 10))
            .tool(FnTool::new(
                "lookup",
                ParameterSchema::new().required("id", ParameterKind::Integer, "record id"),
                |arguments, _| async move { Ok(json!({ "id": arguments["id"] })) },
            ))
            .tool(FnTool::new("broken", ParameterSchema::new(), |_, _| async {
                Err(ToolError::Execution("database offline".to_owned()))
            }))
            .build()
            .expect("agent builds")
    }

    fn call(id: &str, name: &str) -> ToolCallRequest {
        ToolCallRequest::new(id, name, json!({}))
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_results_keep_request_order() {
        let invoker = ToolInvoker::for_agent(&agent(true), Duration::from_secs(5));
        let started = tokio::time::Instant::now();

        let results = invoker
            .invoke(vec![call("1", "slow"), call("2", "fast")], &ContextVariables::new())
            .await;

        assert_eq!(results.iter().map(|r| r.call_id.as_str()).collect::<Vec<_>>(), ["1", "2"]);
        assert!(results.iter().all(|result| result.success));
        assert!(started.elapsed() < Duration::from_millis(310), "calls overlapped");
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_mode_runs_one_call_at_a_time() {
        let invoker = ToolInvoker::for_agent(&agent(false), Duration::from_secs(5));
        let started = tokio::time::Instant::now();

        let results = invoker
            .invoke(vec![call("1", "slow"), call("2", "fast")], &ContextVariables::new())
            .await;

        assert_eq!(results[0].value, Some(json!(300)));
        assert_eq!(results[1].value, Some(json!(10)));
        assert!(started.elapsed() >= Duration::from_millis(310));
    }

    #[tokio::test]
    async fn failures_become_results_instead_of_errors() {
        let invoker = ToolInvoker::for_agent(&agent(true), Duration::from_secs(5));

        let results = invoker
            .invoke(
                vec![
                    call("1", "missing"),
                    ToolCallRequest::new("2", "lookup", json!({ "id": "seven" })),
                    call("3", "broken"),
                    ToolCallRequest::new("4", "lookup", json!({ "id": 7 })),
                ],
                &ContextVariables::new(),
            )
            .await;

        let kinds = results
            .iter()
            .map(|result| result.error.as_ref().map(|failure| failure.kind))
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                Some(ToolFailureKind::NotFound),
                Some(ToolFailureKind::InvalidArguments),
                Some(ToolFailureKind::Execution),
                None,
            ]
        );
        assert_eq!(
            results[2].error.as_ref().map(|failure| failure.message.as_str()),
            Some("database offline")
        );
        assert_eq!(results[3].value, Some(json!({ "id": 7 })));
    }

    #[tokio::test]
    async fn panicking_tool_becomes_failure_and_siblings_still_run() {
        let agent = Agent::builder("Worker")
            .model("gpt-4o")
            .tool(FnTool::new("boom", ParameterSchema::new(), |_, _| async {
                let rows: Vec<serde_json::Value> = Vec::new();
                Ok(rows[3].clone())
            }))
            .tool(sleeper("fast", 10))
            .build()
            .expect("agent builds");
        let invoker = ToolInvoker::for_agent(&agent, Duration::from_secs(5));

        let results = invoker
            .invoke(vec![call("1", "boom"), call("2", "fast")], &ContextVariables::new())
            .await;

        let failure = results[0].error.as_ref().expect("panic is reported");
        assert_eq!(failure.kind, ToolFailureKind::Execution);
        assert!(failure.message.contains("index out of bounds"));
        assert!(results[1].success);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tool_times_out() {
        let invoker = ToolInvoker::for_agent(&agent(true), Duration::from_millis(50));

        let results = invoker.invoke(vec![call("1", "slow")], &ContextVariables::new()).await;

        assert!(!results[0].success);
        assert_eq!(results[0].error.as_ref().map(|f| f.kind), Some(ToolFailureKind::Timeout));
    }

    #[tokio::test]
    async fn tools_read_the_context_snapshot() {
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let tool = FnTool::new("tier", ParameterSchema::new(), move |_, context| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(context.get("tier").cloned().unwrap_or_default())
            }
        });
        let agent = Agent::builder("A").model("m").tool(tool).build().expect("agent builds");
        let invoker = ToolInvoker::for_agent(&agent, Duration::from_secs(1));

        let results = invoker
            .invoke(vec![call("1", "tier")], &ContextVariables::new().set("tier", "gold"))
            .await;

        assert_eq!(results[0].value, Some(json!("gold")));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
