use baton_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use baton_core::domain::guardrail::{PipelineDecision, Verdict};
use baton_core::domain::handoff::HandoffRecord;
use baton_core::domain::message::Message;
use baton_core::domain::run::{RunId, RunOutcome, RunResult};

/// Observation points for persistence and auditing. Every method defaults to a no-op.
pub trait RunHooks: Send + Sync {
    fn on_message_appended(&self, _run_id: &RunId, _message: &Message) {}

    fn on_guardrail_violation(&self, _run_id: &RunId, _agent: &str, _decision: &PipelineDecision) {
    }

    fn on_handoff(&self, _run_id: &RunId, _record: &HandoffRecord) {}

    fn on_run_finished(&self, _result: &RunResult) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHooks;

impl RunHooks for NoopHooks {}

/// Forwards guardrail violations, handoffs and run completion to an [`AuditSink`].
#[derive(Clone, Debug, Default)]
pub struct AuditHooks<S> {
    sink: S,
}

impl<S> AuditHooks<S>
where
    S: AuditSink,
{
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S> RunHooks for AuditHooks<S>
where
    S: AuditSink,
{
    fn on_guardrail_violation(&self, run_id: &RunId, agent: &str, decision: &PipelineDecision) {
        let outcome = match decision.verdict {
            Verdict::Block => AuditOutcome::Rejected,
            Verdict::Allow | Verdict::Log => AuditOutcome::Success,
            Verdict::Flag | Verdict::Redact => AuditOutcome::Flagged,
        };
        let rules = decision
            .violations()
            .into_iter()
            .map(|violation| violation.rule)
            .collect::<Vec<_>>()
            .join(",");
        self.sink.emit(
            AuditEvent::new(
                run_id.clone(),
                Some(agent.to_owned()),
                format!("guardrail.{}", decision.verdict.as_str()),
                AuditCategory::Guardrail,
                "guardrail-pipeline",
                outcome,
            )
            .with_metadata("direction", decision.direction.as_str())
            .with_metadata("rules", rules),
        );
    }

    fn on_handoff(&self, run_id: &RunId, record: &HandoffRecord) {
        let mut event = AuditEvent::new(
            run_id.clone(),
            Some(record.from.clone()),
            "handoff.accepted",
            AuditCategory::Handoff,
            "handoff-router",
            AuditOutcome::Success,
        )
        .with_metadata("from", record.from.clone())
        .with_metadata("to", record.to.clone())
        .with_metadata("turn", record.turn.to_string());
        if let Some(reason) = &record.reason {
            event = event.with_metadata("reason", reason.clone());
        }
        self.sink.emit(event);
    }

    fn on_run_finished(&self, result: &RunResult) {
        let (event_type, outcome) = match &result.outcome {
            RunOutcome::Completed => ("run.completed", AuditOutcome::Success),
            RunOutcome::Blocked { .. } => ("run.blocked", AuditOutcome::Rejected),
            RunOutcome::Failed(_) => ("run.failed", AuditOutcome::Failed),
        };
        let mut event = AuditEvent::new(
            result.run_id.clone(),
            Some(result.last_agent.name().to_owned()),
            event_type,
            AuditCategory::Run,
            "runner",
            outcome,
        )
        .with_metadata("turns", result.usage.turns.to_string())
        .with_metadata("model_calls", result.usage.model_calls.to_string())
        .with_metadata("handoffs", result.usage.handoffs.to_string());
        if let Some(error) = result.error() {
            event = event
                .with_metadata("error_kind", error.kind())
                .with_metadata("error", error.to_string());
        }
        self.sink.emit(event);
    }
}
