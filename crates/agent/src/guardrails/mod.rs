//! Input/output safety filtering.
//!
//! Every guardrail applicable to a direction runs concurrently against the same content and
//! context snapshot. Results are aggregated in strict priority (block, redact, flag, log/allow),
//! independent of completion order. A guardrail that errors or exceeds its deadline is recorded
//! as a `GuardrailError` violation and never aborts the pipeline.

pub mod rules;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use baton_core::config::{AppConfig, GuardrailFailMode};
use baton_core::context::ContextVariables;
use baton_core::domain::guardrail::{
    Direction, GuardrailResult, PipelineDecision, Severity, Verdict, Violation,
};
use futures::future::join_all;
use futures::FutureExt;
use thiserror::Error;
use tracing::{info, warn};

use crate::unwind::panic_message;

pub use rules::{
    KeywordGuardrail, LengthGuardrail, PatternGuardrail, PatternRule, RuleError,
    UNSTABLE_REDACTION_RULE,
};

pub const GUARDRAIL_ERROR_RULE: &str = "GuardrailError";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GuardrailError {
    #[error("guardrail check failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Guardrail: Send + Sync {
    fn name(&self) -> &str;

    fn applies_to(&self, _direction: Direction) -> bool {
        true
    }

    async fn check(
        &self,
        content: &str,
        direction: Direction,
        context: &ContextVariables,
    ) -> Result<GuardrailResult, GuardrailError>;

    /// Transformation applied when this guardrail votes `Redact`. The pipeline chains these
    /// calls across guardrails; a result's own `filtered_content` is not consulted.
    fn redact(&self, content: &str) -> String;
}

#[derive(Clone)]
pub struct GuardrailPipeline {
    guardrails: Vec<Arc<dyn Guardrail>>,
    fail_mode: GuardrailFailMode,
    timeout: Duration,
}

impl Default for GuardrailPipeline {
    fn default() -> Self {
        Self {
            guardrails: Vec::new(),
            fail_mode: GuardrailFailMode::Flag,
            timeout: Duration::from_secs(5),
        }
    }
}

impl GuardrailPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pipeline with the PII preset, fail mode and timeout taken from configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, RuleError> {
        let pii = PatternGuardrail::pii(
            config.guardrails.pii_action,
            &config.guardrails.redaction_token,
        )?;
        Ok(Self::new()
            .with_fail_mode(config.guardrails.fail_mode)
            .with_timeout(config.runner.guardrail_timeout())
            .with_guardrail(pii))
    }

    pub fn with_guardrail(self, guardrail: impl Guardrail + 'static) -> Self {
        self.with_guardrail_arc(Arc::new(guardrail))
    }

    pub fn with_guardrail_arc(mut self, guardrail: Arc<dyn Guardrail>) -> Self {
        self.guardrails.push(guardrail);
        self
    }

    pub fn with_fail_mode(mut self, fail_mode: GuardrailFailMode) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn len(&self) -> usize {
        self.guardrails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guardrails.is_empty()
    }

    pub async fn evaluate(
        &self,
        content: &str,
        direction: Direction,
        context: &ContextVariables,
    ) -> PipelineDecision {
        evaluate_with(content, direction, context, &self.guardrails, self.fail_mode, self.timeout)
            .await
    }
}

pub async fn evaluate_with(
    content: &str,
    direction: Direction,
    context: &ContextVariables,
    guardrails: &[Arc<dyn Guardrail>],
    fail_mode: GuardrailFailMode,
    timeout: Duration,
) -> PipelineDecision {
    let applicable =
        guardrails.iter().filter(|guardrail| guardrail.applies_to(direction)).collect::<Vec<_>>();
    if applicable.is_empty() {
        return PipelineDecision::allow(direction);
    }

    // join_all yields results in registration order regardless of completion order.
    let checks = applicable.iter().map(|guardrail| async move {
        let check = AssertUnwindSafe(async { guardrail.check(content, direction, context).await });
        match tokio::time::timeout(timeout, check.catch_unwind()).await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(error))) => failure_result(guardrail.name(), fail_mode, error.to_string()),
            Ok(Err(payload)) => failure_result(
                guardrail.name(),
                fail_mode,
                format!("guardrail panicked: {}", panic_message(payload)),
            ),
            Err(_) => failure_result(
                guardrail.name(),
                fail_mode,
                format!("guardrail timed out after {}ms", timeout.as_millis()),
            ),
        }
    });
    let results = join_all(checks).await;

    let decision = aggregate(content, direction, &applicable, results);
    record(&decision);
    decision
}

fn failure_result(name: &str, fail_mode: GuardrailFailMode, detail: String) -> GuardrailResult {
    warn!(
        event_name = "guardrail.failed",
        guardrail = name,
        fail_mode = ?fail_mode,
        error = %detail,
        "guardrail did not produce a verdict"
    );
    let violations = vec![Violation::new(GUARDRAIL_ERROR_RULE, Severity::High, detail)];
    match fail_mode {
        GuardrailFailMode::Flag => GuardrailResult::flag(name, violations),
        GuardrailFailMode::Block => GuardrailResult::block(name, violations),
    }
}

fn aggregate(
    content: &str,
    direction: Direction,
    guardrails: &[&Arc<dyn Guardrail>],
    mut results: Vec<GuardrailResult>,
) -> PipelineDecision {
    let mut verdict = strongest(&results);
    let mut filtered_content = None;

    if verdict == Verdict::Redact {
        let mut current = content.to_owned();
        for (guardrail, result) in guardrails.iter().zip(results.iter_mut()) {
            if result.verdict != Verdict::Redact {
                continue;
            }
            // A redaction that cannot be produced must not let the original text through.
            match panic::catch_unwind(AssertUnwindSafe(|| guardrail.redact(&current))) {
                Ok(redacted) => current = redacted,
                Err(payload) => {
                    *result = failure_result(
                        guardrail.name(),
                        GuardrailFailMode::Block,
                        format!("redaction panicked: {}", panic_message(payload)),
                    );
                }
            }
        }
        verdict = strongest(&results);
        filtered_content = (verdict == Verdict::Redact).then_some(current);
    }

    PipelineDecision { direction, verdict, filtered_content, results }
}

fn strongest(results: &[GuardrailResult]) -> Verdict {
    results
        .iter()
        .map(|result| result.verdict)
        .max_by_key(|verdict| verdict.rank())
        .unwrap_or(Verdict::Allow)
}

fn record(decision: &PipelineDecision) {
    if decision.verdict == Verdict::Allow {
        return;
    }
    for result in decision.results.iter().filter(|result| result.verdict != Verdict::Allow) {
        for violation in &result.violations {
            info!(
                event_name = "guardrail.violation",
                direction = decision.direction.as_str(),
                guardrail = %result.guardrail,
                verdict = result.verdict.as_str(),
                rule = %violation.rule,
                severity = ?violation.severity,
                "guardrail violation recorded"
            );
        }
    }
}
