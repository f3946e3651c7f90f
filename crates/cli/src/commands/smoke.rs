use std::sync::Arc;
use std::time::Instant;

use baton_agent::llm::BackendError;
use baton_agent::provider::{AdapterSet, ProviderAdapter, RetryPolicy};
use baton_agent::runtime::Runner;
use baton_agent::testing::ScriptedClient;
use baton_core::config::{AppConfig, LoadOptions};
use baton_core::context::ContextVariables;
use baton_core::domain::agent::{Agent, AgentRegistry};
use baton_core::domain::guardrail::Verdict;
use baton_core::domain::message::Message;
use baton_core::domain::run::{RunOutcome, RunResult};
use baton_core::errors::{ProviderError, RunError};
use serde::Serialize;
use serde_json::json;

use crate::commands::{serialize_json, CommandResult};

const PII_SAMPLE: &str = "jane.doe@example.com";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum SmokeStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: SmokeStatus,
    elapsed_ms: u64,
    message: String,
}

#[derive(Debug, Serialize)]
struct SmokeReport {
    command: &'static str,
    status: SmokeStatus,
    summary: String,
    total_elapsed_ms: u64,
    checks: Vec<SmokeCheck>,
}

/// Exercises the runner end to end against scripted backends built from the effective config.
pub fn run() -> CommandResult {
    let started = Instant::now();
    let mut checks = Vec::new();

    let config = match timed_check(|| AppConfig::load(LoadOptions::default())) {
        Ok((elapsed_ms, config)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Pass,
                elapsed_ms,
                message: "configuration loaded and validated".to_string(),
            });
            config
        }
        Err((elapsed_ms, error)) => {
            checks.push(SmokeCheck {
                name: "config_validation",
                status: SmokeStatus::Fail,
                elapsed_ms,
                message: error.to_string(),
            });
            checks.push(skipped("scripted_handoff"));
            checks.push(skipped("output_guardrails"));
            checks.push(skipped("breaker_fail_fast"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            checks.push(SmokeCheck {
                name: "scripted_handoff",
                status: SmokeStatus::Fail,
                elapsed_ms: 0,
                message: format!("failed to initialize async runtime: {error}"),
            });
            checks.push(skipped("output_guardrails"));
            checks.push(skipped("breaker_fail_fast"));
            return finalize_report(checks, started.elapsed().as_millis() as u64);
        }
    };

    checks.push(timed("scripted_handoff", || runtime.block_on(scripted_handoff(&config))));
    checks.push(timed("output_guardrails", || runtime.block_on(output_guardrails(&config))));
    checks.push(timed("breaker_fail_fast", || runtime.block_on(breaker_fail_fast(&config))));

    finalize_report(checks, started.elapsed().as_millis() as u64)
}

fn newsroom(model: &str) -> Result<AgentRegistry, String> {
    let researcher = Agent::builder("Researcher")
        .model(model)
        .instructions("Research the request, then transfer to the Writer.")
        .handoff_to("Writer")
        .build()
        .map_err(|error| error.to_string())?;
    let writer = Agent::builder("Writer")
        .model(model)
        .instructions("Write the final answer.")
        .build()
        .map_err(|error| error.to_string())?;

    AgentRegistry::builder()
        .register(researcher)
        .register(writer)
        .build()
        .map_err(|error| error.to_string())
}

async fn run_researcher(
    config: &AppConfig,
    adapter: ProviderAdapter,
    prompt: &str,
) -> Result<RunResult, String> {
    let registry = newsroom(&config.provider.default_model)?;
    let researcher =
        registry.get("Researcher").ok_or_else(|| "Researcher is not registered".to_string())?;
    let runner = Runner::from_config(registry, AdapterSet::single(adapter), config)
        .map_err(|error| format!("guardrail preset rejected: {error}"))?;
    Ok(runner.run(researcher, Message::user(prompt), ContextVariables::new()).await)
}

async fn scripted_handoff(config: &AppConfig) -> Result<String, String> {
    let client = Arc::new(
        ScriptedClient::new()
            .call_tool("smoke-h1", "transfer_to_Writer", json!({ "reason": "research done" }))
            .respond_text("Status note drafted."),
    );
    let adapter = ProviderAdapter::from_config("smoke", Arc::clone(&client) as _, config);
    let result = run_researcher(config, adapter, "draft a status note").await?;

    match (&result.outcome, result.last_agent.name()) {
        (RunOutcome::Completed, "Writer") => Ok(format!(
            "handed off to Writer; {} turn(s) over {} model call(s)",
            result.usage.turns, result.usage.model_calls
        )),
        (RunOutcome::Failed(error), _) => Err(format!("run failed: {error}")),
        (outcome, agent) => {
            Err(format!("unexpected outcome {outcome:?} with active agent {agent}"))
        }
    }
}

async fn output_guardrails(config: &AppConfig) -> Result<String, String> {
    let client = Arc::new(
        ScriptedClient::new()
            .call_tool("smoke-h1", "transfer_to_Writer", json!({}))
            .respond_text(format!("Contact {PII_SAMPLE} for access.")),
    );
    let adapter = ProviderAdapter::from_config("smoke", Arc::clone(&client) as _, config);
    let result = run_researcher(config, adapter, "who grants access?").await?;
    let action = config.guardrails.pii_action;

    let output = result.final_output().map(|message| message.content.to_text());
    let satisfied = match action {
        Verdict::Block => result.is_blocked(),
        Verdict::Redact => output.as_deref().is_some_and(|text| {
            text.contains(&config.guardrails.redaction_token) && !text.contains(PII_SAMPLE)
        }),
        other => {
            result.success()
                && result.guardrail_decisions.iter().any(|decision| decision.verdict == other)
        }
    };

    if satisfied {
        Ok(format!("pii in output handled with `{}`", action.as_str()))
    } else {
        Err(format!(
            "pii action `{}` was not applied (outcome {:?})",
            action.as_str(),
            result.outcome
        ))
    }
}

async fn breaker_fail_fast(config: &AppConfig) -> Result<String, String> {
    let client = Arc::new(
        ScriptedClient::new().fail(BackendError::unavailable("smoke outage")).repeat_last(),
    );
    let adapter = ProviderAdapter::from_config("smoke-outage", Arc::clone(&client) as _, config)
        .with_retry(RetryPolicy::none());
    let threshold = adapter.breaker().config().failure_threshold;
    let registry = newsroom(&config.provider.default_model)?;
    let researcher =
        registry.get("Researcher").ok_or_else(|| "Researcher is not registered".to_string())?;
    let runner = Runner::from_config(registry, AdapterSet::single(adapter), config)
        .map_err(|error| format!("guardrail preset rejected: {error}"))?;

    for _ in 0..threshold {
        runner.run(Arc::clone(&researcher), Message::user("ping"), ContextVariables::new()).await;
    }
    let rejected = runner.run(researcher, Message::user("ping"), ContextVariables::new()).await;

    match rejected.error() {
        Some(RunError::Provider(ProviderError::CircuitOpen { .. }))
            if client.calls() == threshold =>
        {
            Ok(format!("breaker opened after {threshold} failures and failed fast"))
        }
        other => Err(format!(
            "expected a fail-fast rejection after {threshold} failures, got {other:?} with {} \
             backend call(s)",
            client.calls()
        )),
    }
}

fn timed_check<T, E>(check: impl FnOnce() -> Result<T, E>) -> Result<(u64, T), (u64, E)> {
    let started = Instant::now();
    match check() {
        Ok(value) => Ok((started.elapsed().as_millis() as u64, value)),
        Err(error) => Err((started.elapsed().as_millis() as u64, error)),
    }
}

fn timed(name: &'static str, check: impl FnOnce() -> Result<String, String>) -> SmokeCheck {
    match timed_check(check) {
        Ok((elapsed_ms, message)) => {
            SmokeCheck { name, status: SmokeStatus::Pass, elapsed_ms, message }
        }
        Err((elapsed_ms, message)) => {
            SmokeCheck { name, status: SmokeStatus::Fail, elapsed_ms, message }
        }
    }
}

fn skipped(name: &'static str) -> SmokeCheck {
    SmokeCheck {
        name,
        status: SmokeStatus::Skipped,
        elapsed_ms: 0,
        message: "skipped due previous failure".to_string(),
    }
}

fn finalize_report(checks: Vec<SmokeCheck>, total_elapsed_ms: u64) -> CommandResult {
    let passed = checks.iter().filter(|check| check.status == SmokeStatus::Pass).count();
    let total = checks.len();
    let failed = checks.iter().any(|check| check.status == SmokeStatus::Fail);

    let report = SmokeReport {
        command: "smoke",
        status: if failed { SmokeStatus::Fail } else { SmokeStatus::Pass },
        summary: format!("smoke: {passed}/{total} checks passed in {total_elapsed_ms}ms"),
        total_elapsed_ms,
        checks,
    };

    let human = report.summary.clone();
    let machine = serialize_json(&report, "smoke");

    CommandResult { exit_code: if failed { 6 } else { 0 }, output: format!("{human}\n{machine}") }
}
