use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use baton_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

use crate::commands::CommandResult;

struct Field {
    key: &'static str,
    env_keys: &'static [&'static str],
    value: String,
}

impl Field {
    fn new(key: &'static str, env_keys: &'static [&'static str], value: impl ToString) -> Self {
        Self { key, env_keys, value: value.to_string() }
    }
}

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            )
        }
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in effective_fields(&config) {
        let source = field_source(
            field.key,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }

    CommandResult { exit_code: 0, output: lines.join("\n") }
}

fn effective_fields(config: &AppConfig) -> Vec<Field> {
    let runner = &config.runner;
    let provider = &config.provider;
    let breaker = &config.breaker;
    let guardrails = &config.guardrails;

    let api_key = match &provider.api_key {
        Some(key) => redact_key(key.expose_secret()),
        None => "<unset>".to_string(),
    };

    vec![
        Field::new("runner.max_turns_cap", &["BATON_RUNNER_MAX_TURNS_CAP"], runner.max_turns_cap),
        Field::new(
            "runner.tool_timeout_ms",
            &["BATON_RUNNER_TOOL_TIMEOUT_MS"],
            runner.tool_timeout_ms,
        ),
        Field::new(
            "runner.guardrail_timeout_ms",
            &["BATON_RUNNER_GUARDRAIL_TIMEOUT_MS"],
            runner.guardrail_timeout_ms,
        ),
        Field::new("provider.api_key", &["BATON_PROVIDER_API_KEY"], api_key),
        Field::new(
            "provider.base_url",
            &["BATON_PROVIDER_BASE_URL"],
            provider.base_url.as_deref().unwrap_or("<unset>"),
        ),
        Field::new(
            "provider.default_model",
            &["BATON_PROVIDER_DEFAULT_MODEL"],
            &provider.default_model,
        ),
        Field::new(
            "provider.timeout_secs",
            &["BATON_PROVIDER_TIMEOUT_SECS"],
            provider.timeout_secs,
        ),
        Field::new("provider.max_retries", &["BATON_PROVIDER_MAX_RETRIES"], provider.max_retries),
        Field::new(
            "provider.base_delay_ms",
            &["BATON_PROVIDER_BASE_DELAY_MS"],
            provider.base_delay_ms,
        ),
        Field::new(
            "provider.max_delay_ms",
            &["BATON_PROVIDER_MAX_DELAY_MS"],
            provider.max_delay_ms,
        ),
        Field::new(
            "provider.backoff_multiplier",
            &["BATON_PROVIDER_BACKOFF_MULTIPLIER"],
            provider.backoff_multiplier,
        ),
        Field::new("provider.jitter", &["BATON_PROVIDER_JITTER"], provider.jitter),
        Field::new(
            "breaker.failure_threshold",
            &["BATON_BREAKER_FAILURE_THRESHOLD"],
            breaker.failure_threshold,
        ),
        Field::new("breaker.window_secs", &["BATON_BREAKER_WINDOW_SECS"], breaker.window_secs),
        Field::new(
            "breaker.cooldown_secs",
            &["BATON_BREAKER_COOLDOWN_SECS"],
            breaker.cooldown_secs,
        ),
        Field::new(
            "breaker.half_open_max_calls",
            &["BATON_BREAKER_HALF_OPEN_MAX_CALLS"],
            breaker.half_open_max_calls,
        ),
        Field::new(
            "guardrails.fail_mode",
            &["BATON_GUARDRAILS_FAIL_MODE"],
            format!("{:?}", guardrails.fail_mode),
        ),
        Field::new(
            "guardrails.redaction_token",
            &["BATON_GUARDRAILS_REDACTION_TOKEN"],
            &guardrails.redaction_token,
        ),
        Field::new(
            "guardrails.pii_action",
            &["BATON_GUARDRAILS_PII_ACTION"],
            guardrails.pii_action.as_str(),
        ),
        Field::new(
            "logging.level",
            &["BATON_LOGGING_LEVEL", "BATON_LOG_LEVEL"],
            &config.logging.level,
        ),
        Field::new(
            "logging.format",
            &["BATON_LOGGING_FORMAT", "BATON_LOG_FORMAT"],
            format!("{:?}", config.logging.format),
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("baton.toml"), PathBuf::from("config/baton.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a vendor prefix such as `sk-` visible and hides the rest.
fn redact_key(key: &str) -> String {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
