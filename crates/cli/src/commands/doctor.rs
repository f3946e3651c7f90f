use baton_agent::breaker::BreakerConfig;
use baton_agent::guardrails::GuardrailPipeline;
use baton_agent::provider::RetryPolicy;
use baton_core::config::{AppConfig, LoadOptions};
use serde::Serialize;

use crate::commands::{escape_json, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const DEPENDENT_CHECKS: [&str; 3] = ["retry_budget", "breaker_thresholds", "guardrail_presets"];

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 4 };

    if json_output {
        let output = serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\
                 \"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
        return CommandResult { exit_code, output };
    }

    CommandResult { exit_code, output: render_human(&report) }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_retry_budget(&config));
            checks.push(check_breaker_thresholds(&config));
            checks.push(check_guardrail_presets(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.extend(DEPENDENT_CHECKS.into_iter().map(|name| DoctorCheck {
                name,
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            }));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

/// Retries must fit inside the breaker window, otherwise spaced-out failures never trip it.
fn check_retry_budget(config: &AppConfig) -> DoctorCheck {
    let policy = RetryPolicy::from(&config.provider);
    let breaker = BreakerConfig::from(&config.breaker);
    let backoff = policy.total_backoff();
    let attempts = policy.max_retries + 1;
    let worst_case = config.provider.request_timeout() * attempts + backoff;

    if backoff >= breaker.window {
        return DoctorCheck {
            name: "retry_budget",
            status: CheckStatus::Fail,
            details: format!(
                "retry backoff of {}ms reaches the {}s breaker window",
                backoff.as_millis(),
                breaker.window.as_secs()
            ),
        };
    }

    DoctorCheck {
        name: "retry_budget",
        status: CheckStatus::Pass,
        details: format!(
            "{attempts} attempts per call, {}ms total backoff, {}s worst case",
            backoff.as_millis(),
            worst_case.as_secs()
        ),
    }
}

fn check_breaker_thresholds(config: &AppConfig) -> DoctorCheck {
    let breaker = BreakerConfig::from(&config.breaker);
    let attempts = config.provider.max_retries + 1;

    if breaker.failure_threshold < attempts {
        return DoctorCheck {
            name: "breaker_thresholds",
            status: CheckStatus::Fail,
            details: format!(
                "failure_threshold {} is below the {attempts} attempts of a single call; one \
                 request can open the breaker",
                breaker.failure_threshold
            ),
        };
    }

    DoctorCheck {
        name: "breaker_thresholds",
        status: CheckStatus::Pass,
        details: format!(
            "opens after {} failures in {}s, admits trial calls after {}s",
            breaker.failure_threshold,
            breaker.window.as_secs(),
            breaker.cooldown.as_secs()
        ),
    }
}

fn check_guardrail_presets(config: &AppConfig) -> DoctorCheck {
    match GuardrailPipeline::from_config(config) {
        Ok(pipeline) => DoctorCheck {
            name: "guardrail_presets",
            status: CheckStatus::Pass,
            details: format!(
                "{} guardrail(s) loaded; pii action `{}`, fail mode `{:?}`",
                pipeline.len(),
                config.guardrails.pii_action.as_str(),
                config.guardrails.fail_mode
            ),
        },
        Err(error) => DoctorCheck {
            name: "guardrail_presets",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
