use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::guardrail::Verdict;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub runner: RunnerSettings,
    pub provider: ProviderSettings,
    pub breaker: BreakerSettings,
    pub guardrails: GuardrailSettings,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct RunnerSettings {
    pub max_turns_cap: u32,
    pub tool_timeout_ms: u64,
    pub guardrail_timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ProviderSettings {
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub default_model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

#[derive(Clone, Debug)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub window_secs: u64,
    pub cooldown_secs: u64,
    pub half_open_max_calls: u32,
}

#[derive(Clone, Debug)]
pub struct GuardrailSettings {
    pub fail_mode: GuardrailFailMode,
    pub redaction_token: String,
    pub pii_action: Verdict,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// What the guardrail pipeline records when a guardrail errors or times out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailFailMode {
    #[default]
    Flag,
    Block,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub provider_api_key: Option<String>,
    pub default_model: Option<String>,
    pub max_retries: Option<u32>,
    pub max_turns_cap: Option<u32>,
    pub guardrail_fail_mode: Option<GuardrailFailMode>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runner: RunnerSettings {
                max_turns_cap: 25,
                tool_timeout_ms: 30_000,
                guardrail_timeout_ms: 5_000,
            },
            provider: ProviderSettings {
                api_key: None,
                base_url: None,
                default_model: "gpt-4o-mini".to_string(),
                timeout_secs: 60,
                max_retries: 3,
                base_delay_ms: 500,
                max_delay_ms: 30_000,
                backoff_multiplier: 2.0,
                jitter: true,
            },
            breaker: BreakerSettings {
                failure_threshold: 5,
                window_secs: 60,
                cooldown_secs: 30,
                half_open_max_calls: 1,
            },
            guardrails: GuardrailSettings {
                fail_mode: GuardrailFailMode::Flag,
                redaction_token: "[REDACTED]".to_string(),
                pii_action: Verdict::Redact,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl RunnerSettings {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn guardrail_timeout(&self) -> Duration {
        Duration::from_millis(self.guardrail_timeout_ms)
    }
}

impl ProviderSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl std::str::FromStr for GuardrailFailMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "flag" => Ok(Self::Flag),
            "block" => Ok(Self::Block),
            other => Err(ConfigError::Validation(format!(
                "unsupported guardrail fail mode `{other}` (expected flag|block)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("baton.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(runner) = patch.runner {
            if let Some(max_turns_cap) = runner.max_turns_cap {
                self.runner.max_turns_cap = max_turns_cap;
            }
            if let Some(tool_timeout_ms) = runner.tool_timeout_ms {
                self.runner.tool_timeout_ms = tool_timeout_ms;
            }
            if let Some(guardrail_timeout_ms) = runner.guardrail_timeout_ms {
                self.runner.guardrail_timeout_ms = guardrail_timeout_ms;
            }
        }

        if let Some(provider) = patch.provider {
            if let Some(api_key) = provider.api_key {
                self.provider.api_key = Some(SecretString::from(api_key));
            }
            if let Some(base_url) = provider.base_url {
                self.provider.base_url = Some(base_url);
            }
            if let Some(default_model) = provider.default_model {
                self.provider.default_model = default_model;
            }
            if let Some(timeout_secs) = provider.timeout_secs {
                self.provider.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = provider.max_retries {
                self.provider.max_retries = max_retries;
            }
            if let Some(base_delay_ms) = provider.base_delay_ms {
                self.provider.base_delay_ms = base_delay_ms;
            }
            if let Some(max_delay_ms) = provider.max_delay_ms {
                self.provider.max_delay_ms = max_delay_ms;
            }
            if let Some(backoff_multiplier) = provider.backoff_multiplier {
                self.provider.backoff_multiplier = backoff_multiplier;
            }
            if let Some(jitter) = provider.jitter {
                self.provider.jitter = jitter;
            }
        }

        if let Some(breaker) = patch.breaker {
            if let Some(failure_threshold) = breaker.failure_threshold {
                self.breaker.failure_threshold = failure_threshold;
            }
            if let Some(window_secs) = breaker.window_secs {
                self.breaker.window_secs = window_secs;
            }
            if let Some(cooldown_secs) = breaker.cooldown_secs {
                self.breaker.cooldown_secs = cooldown_secs;
            }
            if let Some(half_open_max_calls) = breaker.half_open_max_calls {
                self.breaker.half_open_max_calls = half_open_max_calls;
            }
        }

        if let Some(guardrails) = patch.guardrails {
            if let Some(fail_mode) = guardrails.fail_mode {
                self.guardrails.fail_mode = fail_mode;
            }
            if let Some(redaction_token) = guardrails.redaction_token {
                self.guardrails.redaction_token = redaction_token;
            }
            if let Some(pii_action) = guardrails.pii_action {
                self.guardrails.pii_action = pii_action;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("BATON_RUNNER_MAX_TURNS_CAP") {
            self.runner.max_turns_cap = parse_u32("BATON_RUNNER_MAX_TURNS_CAP", &value)?;
        }
        if let Some(value) = read_env("BATON_RUNNER_TOOL_TIMEOUT_MS") {
            self.runner.tool_timeout_ms = parse_u64("BATON_RUNNER_TOOL_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("BATON_RUNNER_GUARDRAIL_TIMEOUT_MS") {
            self.runner.guardrail_timeout_ms =
                parse_u64("BATON_RUNNER_GUARDRAIL_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = read_env("BATON_PROVIDER_API_KEY") {
            self.provider.api_key = Some(SecretString::from(value));
        }
        if let Some(value) = read_env("BATON_PROVIDER_BASE_URL") {
            self.provider.base_url = Some(value);
        }
        if let Some(value) = read_env("BATON_PROVIDER_DEFAULT_MODEL") {
            self.provider.default_model = value;
        }
        if let Some(value) = read_env("BATON_PROVIDER_TIMEOUT_SECS") {
            self.provider.timeout_secs = parse_u64("BATON_PROVIDER_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("BATON_PROVIDER_MAX_RETRIES") {
            self.provider.max_retries = parse_u32("BATON_PROVIDER_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("BATON_PROVIDER_BASE_DELAY_MS") {
            self.provider.base_delay_ms = parse_u64("BATON_PROVIDER_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("BATON_PROVIDER_MAX_DELAY_MS") {
            self.provider.max_delay_ms = parse_u64("BATON_PROVIDER_MAX_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("BATON_PROVIDER_BACKOFF_MULTIPLIER") {
            self.provider.backoff_multiplier =
                parse_f64("BATON_PROVIDER_BACKOFF_MULTIPLIER", &value)?;
        }
        if let Some(value) = read_env("BATON_PROVIDER_JITTER") {
            self.provider.jitter = parse_bool("BATON_PROVIDER_JITTER", &value)?;
        }

        if let Some(value) = read_env("BATON_BREAKER_FAILURE_THRESHOLD") {
            self.breaker.failure_threshold = parse_u32("BATON_BREAKER_FAILURE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("BATON_BREAKER_WINDOW_SECS") {
            self.breaker.window_secs = parse_u64("BATON_BREAKER_WINDOW_SECS", &value)?;
        }
        if let Some(value) = read_env("BATON_BREAKER_COOLDOWN_SECS") {
            self.breaker.cooldown_secs = parse_u64("BATON_BREAKER_COOLDOWN_SECS", &value)?;
        }
        if let Some(value) = read_env("BATON_BREAKER_HALF_OPEN_MAX_CALLS") {
            self.breaker.half_open_max_calls =
                parse_u32("BATON_BREAKER_HALF_OPEN_MAX_CALLS", &value)?;
        }

        if let Some(value) = read_env("BATON_GUARDRAILS_FAIL_MODE") {
            self.guardrails.fail_mode = value.parse()?;
        }
        if let Some(value) = read_env("BATON_GUARDRAILS_REDACTION_TOKEN") {
            self.guardrails.redaction_token = value;
        }
        if let Some(value) = read_env("BATON_GUARDRAILS_PII_ACTION") {
            self.guardrails.pii_action = value
                .parse::<Verdict>()
                .map_err(|_| invalid_override("BATON_GUARDRAILS_PII_ACTION", &value))?;
        }

        let log_level = read_env("BATON_LOGGING_LEVEL").or_else(|| read_env("BATON_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format = read_env("BATON_LOGGING_FORMAT").or_else(|| read_env("BATON_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(api_key) = overrides.provider_api_key {
            self.provider.api_key = Some(SecretString::from(api_key));
        }
        if let Some(default_model) = overrides.default_model {
            self.provider.default_model = default_model;
        }
        if let Some(max_retries) = overrides.max_retries {
            self.provider.max_retries = max_retries;
        }
        if let Some(max_turns_cap) = overrides.max_turns_cap {
            self.runner.max_turns_cap = max_turns_cap;
        }
        if let Some(fail_mode) = overrides.guardrail_fail_mode {
            self.guardrails.fail_mode = fail_mode;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_runner(&self.runner)?;
        validate_provider(&self.provider)?;
        validate_breaker(&self.breaker)?;
        validate_guardrails(&self.guardrails)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("baton.toml"), PathBuf::from("config/baton.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_runner(runner: &RunnerSettings) -> Result<(), ConfigError> {
    if runner.max_turns_cap == 0 {
        return Err(ConfigError::Validation(
            "runner.max_turns_cap must be greater than zero".to_string(),
        ));
    }
    if runner.tool_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "runner.tool_timeout_ms must be greater than zero".to_string(),
        ));
    }
    if runner.guardrail_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "runner.guardrail_timeout_ms must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_provider(provider: &ProviderSettings) -> Result<(), ConfigError> {
    if provider.default_model.trim().is_empty() {
        return Err(ConfigError::Validation(
            "provider.default_model must not be empty".to_string(),
        ));
    }

    if provider.timeout_secs == 0 || provider.timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "provider.timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if provider.max_retries > 10 {
        return Err(ConfigError::Validation(
            "provider.max_retries must be at most 10".to_string(),
        ));
    }

    if provider.base_delay_ms == 0 {
        return Err(ConfigError::Validation(
            "provider.base_delay_ms must be greater than zero".to_string(),
        ));
    }

    if provider.max_delay_ms < provider.base_delay_ms {
        return Err(ConfigError::Validation(format!(
            "provider.max_delay_ms ({}) must not be smaller than provider.base_delay_ms ({})",
            provider.max_delay_ms, provider.base_delay_ms
        )));
    }

    if !provider.backoff_multiplier.is_finite() || provider.backoff_multiplier < 1.0 {
        return Err(ConfigError::Validation(
            "provider.backoff_multiplier must be a finite number >= 1.0".to_string(),
        ));
    }

    if let Some(api_key) = &provider.api_key {
        if api_key.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "provider.api_key is set but empty; remove it or provide a key".to_string(),
            ));
        }
    }

    if let Some(base_url) = &provider.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "provider.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_breaker(breaker: &BreakerSettings) -> Result<(), ConfigError> {
    if breaker.failure_threshold == 0 {
        return Err(ConfigError::Validation(
            "breaker.failure_threshold must be greater than zero".to_string(),
        ));
    }
    if breaker.window_secs == 0 {
        return Err(ConfigError::Validation(
            "breaker.window_secs must be greater than zero".to_string(),
        ));
    }
    if breaker.cooldown_secs == 0 {
        return Err(ConfigError::Validation(
            "breaker.cooldown_secs must be greater than zero".to_string(),
        ));
    }
    if breaker.half_open_max_calls == 0 {
        return Err(ConfigError::Validation(
            "breaker.half_open_max_calls must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_guardrails(guardrails: &GuardrailSettings) -> Result<(), ConfigError> {
    if guardrails.redaction_token.is_empty() {
        return Err(ConfigError::Validation(
            "guardrails.redaction_token must not be empty".to_string(),
        ));
    }

    if guardrails.pii_action == Verdict::Allow {
        return Err(ConfigError::Validation(
            "guardrails.pii_action must be one of log|flag|redact|block".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_f64(key: &str, value: &str) -> Result<f64, ConfigError> {
    value.parse::<f64>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    runner: Option<RunnerPatch>,
    provider: Option<ProviderPatch>,
    breaker: Option<BreakerPatch>,
    guardrails: Option<GuardrailsPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct RunnerPatch {
    max_turns_cap: Option<u32>,
    tool_timeout_ms: Option<u64>,
    guardrail_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ProviderPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    default_model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    jitter: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct BreakerPatch {
    failure_threshold: Option<u32>,
    window_secs: Option<u64>,
    cooldown_secs: Option<u64>,
    half_open_max_calls: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct GuardrailsPatch {
    fail_mode: Option<GuardrailFailMode>,
    redaction_token: Option<String>,
    pii_action: Option<Verdict>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, GuardrailFailMode, LoadOptions, LogFormat};
    use crate::domain::guardrail::Verdict;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_are_valid_and_match_documented_values() -> Result<(), String> {
        let config = AppConfig::default();
        config.validate().map_err(|err| format!("defaults should validate: {err}"))?;

        ensure(config.breaker.failure_threshold == 5, "default breaker threshold should be 5")?;
        ensure(config.provider.max_retries == 3, "default retry budget should be 3")?;
        ensure(
            config.guardrails.fail_mode == GuardrailFailMode::Flag,
            "guardrail failures should flag by default",
        )?;
        ensure(config.guardrails.redaction_token == "[REDACTED]", "default redaction token")?;
        ensure(config.provider.api_key.is_none(), "no api key by default")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_BATON_API_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("baton.toml");
            fs::write(
                &path,
                r#"
[provider]
api_key = "${TEST_BATON_API_KEY}"
default_model = "claude-sonnet"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.provider.api_key.as_ref().map(|key| key.expose_secret())
                    == Some("sk-from-env"),
                "api key should be interpolated from environment",
            )?;
            ensure(config.provider.default_model == "claude-sonnet", "model read from file")?;
            Ok(())
        })();

        clear_vars(&["TEST_BATON_API_KEY"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("baton.toml");
        fs::write(&path, "[provider]\napi_key = \"${BATON_TEST_UNSET_VARIABLE}\"\n")
            .map_err(|err| err.to_string())?;

        let error =
            match AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
            {
                Ok(_) => return Err("expected interpolation failure".to_string()),
                Err(error) => error,
            };
        ensure(
            matches!(
                error,
                ConfigError::MissingEnvInterpolation { ref var }
                    if var == "BATON_TEST_UNSET_VARIABLE"
            ),
            "interpolation failure should name the variable",
        )
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("BATON_LOG_LEVEL", "warn");
        env::set_var("BATON_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["BATON_LOG_LEVEL", "BATON_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("BATON_PROVIDER_MAX_RETRIES", "5");
        env::set_var("BATON_BREAKER_FAILURE_THRESHOLD", "7");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("baton.toml");
            fs::write(
                &path,
                r#"
[provider]
max_retries = 1
default_model = "from-file"

[breaker]
failure_threshold = 2
cooldown_secs = 90

[guardrails]
pii_action = "block"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    max_retries: Some(8),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.provider.max_retries == 8, "override retry budget should win")?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.breaker.failure_threshold == 7, "env threshold should beat file")?;
            ensure(config.breaker.cooldown_secs == 90, "file cooldown should beat default")?;
            ensure(config.provider.default_model == "from-file", "file model should be kept")?;
            ensure(config.guardrails.pii_action == Verdict::Block, "file pii action is block")?;
            ensure(config.breaker.window_secs == 60, "untouched values keep defaults")?;
            Ok(())
        })();

        clear_vars(&["BATON_PROVIDER_MAX_RETRIES", "BATON_BREAKER_FAILURE_THRESHOLD"]);
        result
    }

    #[test]
    fn malformed_env_override_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("BATON_BREAKER_WINDOW_SECS", "sixty");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected env override failure".to_string()),
                Err(error) => error,
            };
            ensure(
                matches!(
                    error,
                    ConfigError::InvalidEnvOverride { ref key, .. }
                        if key == "BATON_BREAKER_WINDOW_SECS"
                ),
                "invalid env override should name the key",
            )
        })();

        clear_vars(&["BATON_BREAKER_WINDOW_SECS"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("BATON_PROVIDER_BASE_DELAY_MS", "5000");
        env::set_var("BATON_PROVIDER_MAX_DELAY_MS", "100");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("provider.max_delay_ms")
            );
            ensure(has_message, "validation failure should mention provider.max_delay_ms")
        })();

        clear_vars(&["BATON_PROVIDER_BASE_DELAY_MS", "BATON_PROVIDER_MAX_DELAY_MS"]);
        result
    }

    #[test]
    fn zero_breaker_threshold_is_rejected() -> Result<(), String> {
        let mut config = AppConfig::default();
        config.breaker.failure_threshold = 0;

        let has_message = matches!(
            config.validate(),
            Err(ConfigError::Validation(ref message))
                if message.contains("breaker.failure_threshold")
        );
        ensure(has_message, "validation failure should mention breaker.failure_threshold")
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("BATON_PROVIDER_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["BATON_PROVIDER_API_KEY"]);
        result
    }
}
