use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use baton_core::config::{AppConfig, ProviderSettings};
use baton_core::context::ContextVariables;
use baton_core::domain::agent::Agent;
use baton_core::domain::message::Conversation;
use baton_core::errors::{AttemptRecord, ProviderError};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::llm::{BackendError, LlmClient, ModelRequest, ModelResponse};

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl From<&ProviderSettings> for RetryPolicy {
    fn from(settings: &ProviderSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.backoff_multiplier,
            jitter: settings.jitter,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    /// Capped exponential delay before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16) as i32;
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let delay_ms = (base_ms * self.multiplier.max(1.0).powi(exponent)).min(max_ms);
        Duration::from_millis(delay_ms as u64)
    }

    /// Sum of the un-jittered delays across every retry.
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_retries).map(|attempt| self.backoff(attempt)).sum()
    }

    /// A server `retry_after` hint wins over the computed backoff; both are capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }
        let ceiling = self.backoff(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let ceiling_ms = ceiling.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }
}

/// Resilient wrapper around one backend: per-attempt timeout, retry with backoff, circuit breaker.
pub struct ProviderAdapter {
    name: String,
    client: Arc<dyn LlmClient>,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    request_timeout: Duration,
}

impl ProviderAdapter {
    pub fn new(name: impl Into<String>, client: Arc<dyn LlmClient>) -> Self {
        let name = name.into();
        Self {
            breaker: Arc::new(CircuitBreaker::new(name.clone(), BreakerConfig::default())),
            name,
            client,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn from_config(
        name: impl Into<String>,
        client: Arc<dyn LlmClient>,
        config: &AppConfig,
    ) -> Self {
        Self::new(name, client)
            .with_retry(RetryPolicy::from(&config.provider))
            .with_breaker(BreakerConfig::from(&config.breaker))
            .with_request_timeout(config.provider.request_timeout())
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = Arc::new(CircuitBreaker::new(self.name.clone(), config));
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn call(
        &self,
        agent: &Agent,
        conversation: &Conversation,
        context: &ContextVariables,
    ) -> Result<ModelResponse, ProviderError> {
        self.call_request(ModelRequest::for_agent(agent, conversation, context)).await
    }

    pub async fn call_request(
        &self,
        request: ModelRequest,
    ) -> Result<ModelResponse, ProviderError> {
        let model = request.model.clone();
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            let Some(permit) = self.breaker.try_acquire() else {
                warn!(
                    event_name = "provider.call.rejected",
                    model = %model,
                    attempt = attempt + 1,
                    "circuit open; failing fast"
                );
                return Err(ProviderError::CircuitOpen { model, attempts: history });
            };

            attempt += 1;
            debug!(event_name = "provider.call.started", model = %model, attempt, "calling model");

            let error = match self.attempt(request.clone()).await {
                Ok(mut response) => {
                    permit.record_success();
                    response.attempts = attempt;
                    return Ok(response);
                }
                Err(error) => error,
            };

            if !error.is_transient() {
                // A non-transient answer still means the backend is reachable.
                permit.record_success();
                warn!(
                    event_name = "provider.call.fatal",
                    model = %model,
                    attempt,
                    kind = error.kind.as_str(),
                    error = %error.message,
                    "non-retryable provider error"
                );
                return Err(ProviderError::Fatal {
                    model,
                    kind: error.kind,
                    message: error.message,
                });
            }

            permit.record_failure();
            history.push(AttemptRecord {
                attempt,
                kind: error.kind,
                message: error.message.clone(),
                retry_after: error.retry_after,
            });

            if attempt > self.retry.max_retries {
                warn!(
                    event_name = "provider.retry.exhausted",
                    model = %model,
                    attempts = attempt,
                    "provider retries exhausted"
                );
                return Err(ProviderError::RetriesExhausted { model, attempts: history });
            }

            let delay = self.retry.delay_for(attempt - 1, error.retry_after);
            info!(
                event_name = "provider.retry.scheduled",
                model = %model,
                attempt,
                max_retries = self.retry.max_retries,
                kind = error.kind.as_str(),
                delay_ms = delay.as_millis() as u64,
                "transient provider error; retrying"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn attempt(&self, request: ModelRequest) -> Result<ModelResponse, BackendError> {
        match tokio::time::timeout(self.request_timeout, self.client.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::timeout(format!(
                "no response within {}ms",
                self.request_timeout.as_millis()
            ))),
        }
    }
}

/// Routes an agent's model name to its adapter: exact name, then longest prefix, then default.
#[derive(Clone, Default)]
pub struct AdapterSet {
    exact: BTreeMap<String, Arc<ProviderAdapter>>,
    prefixes: Vec<(String, Arc<ProviderAdapter>)>,
    default: Option<Arc<ProviderAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(adapter: ProviderAdapter) -> Self {
        Self::new().with_default(adapter)
    }

    pub fn with_model(mut self, model: impl Into<String>, adapter: ProviderAdapter) -> Self {
        self.exact.insert(model.into(), Arc::new(adapter));
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>, adapter: ProviderAdapter) -> Self {
        self.prefixes.push((prefix.into(), Arc::new(adapter)));
        self
    }

    pub fn with_default(mut self, adapter: ProviderAdapter) -> Self {
        self.default = Some(Arc::new(adapter));
        self
    }

    pub fn resolve(&self, model: &str) -> Result<&Arc<ProviderAdapter>, ProviderError> {
        if let Some(adapter) = self.exact.get(model) {
            return Ok(adapter);
        }
        self.prefixes
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, adapter)| adapter)
            .or(self.default.as_ref())
            .ok_or_else(|| ProviderError::NoAdapter { model: model.to_owned() })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use baton_core::context::ContextVariables;
    use baton_core::domain::agent::Agent;
    use baton_core::domain::message::{Conversation, Message};
    use baton_core::errors::{ProviderError, ProviderErrorKind};

    use super::{AdapterSet, ProviderAdapter, RetryPolicy};
    use crate::breaker::{BreakerConfig, BreakerState};
    use crate::llm::{BackendError, ModelResponse};
    use crate::testing::ScriptedClient;

    fn agent() -> Agent {
        Agent::builder("Researcher").model("gpt-4o").build().expect("agent builds")
    }

    fn conversation() -> Conversation {
        [Message::user("hello")].into_iter().collect()
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = fast_retry(5);

        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(10), Duration::from_secs(2));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(2));
        // 100 + 200 + 400 + 800 + 1600
        assert_eq!(policy.total_backoff(), Duration::from_millis(3100));
        assert_eq!(RetryPolicy::none().total_backoff(), Duration::ZERO);
    }

    #[test]
    fn jittered_delay_stays_within_backoff_and_hint_is_capped() {
        let policy = RetryPolicy { jitter: true, ..fast_retry(5) };

        for attempt in 0..6 {
            assert!(policy.delay_for(attempt, None) <= policy.backoff(attempt));
        }
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(60))),
            Duration::from_secs(2),
            "retry-after hint is capped at max_delay"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let client = Arc::new(
            ScriptedClient::new()
                .fail(BackendError::unavailable("503"))
                .fail(BackendError::rate_limited(Some(Duration::from_millis(250))))
                .respond(ModelResponse::text("done")),
        );
        let adapter = ProviderAdapter::new("gpt-4o", client.clone()).with_retry(fast_retry(3));

        let response = adapter
            .call(&agent(), &conversation(), &ContextVariables::new())
            .await
            .expect("third attempt succeeds");

        assert_eq!(response.attempts, 3);
        assert_eq!(client.calls(), 3);
        assert_eq!(adapter.breaker().state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_surface_after_one_attempt() {
        let client = Arc::new(ScriptedClient::new().fail(BackendError::auth("bad key")));
        let adapter = ProviderAdapter::new("gpt-4o", client.clone()).with_retry(fast_retry(3));

        let error = adapter
            .call(&agent(), &conversation(), &ContextVariables::new())
            .await
            .expect_err("auth errors are fatal");

        assert!(matches!(error, ProviderError::Fatal { kind: ProviderErrorKind::Auth, .. }));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_attempt_history() {
        let client = Arc::new(
            ScriptedClient::new().fail(BackendError::unavailable("502")).repeat_last(),
        );
        let adapter = ProviderAdapter::new("gpt-4o", client.clone()).with_retry(fast_retry(2));

        let error = adapter
            .call(&agent(), &conversation(), &ContextVariables::new())
            .await
            .expect_err("every attempt fails");

        assert_eq!(client.calls(), 3);
        assert_eq!(error.attempts().len(), 3);
        assert!(error
            .attempts()
            .iter()
            .all(|record| record.kind == ProviderErrorKind::Unavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_attempt_becomes_transient_timeout() {
        let client = Arc::new(
            ScriptedClient::new()
                .respond(ModelResponse::text("late"))
                .repeat_last()
                .with_delay(Duration::from_secs(5)),
        );
        let adapter = ProviderAdapter::new("gpt-4o", client.clone())
            .with_retry(fast_retry(1))
            .with_request_timeout(Duration::from_secs(1));

        let error = adapter
            .call(&agent(), &conversation(), &ContextVariables::new())
            .await
            .expect_err("both attempts time out");

        assert_eq!(client.calls(), 2);
        assert!(error.attempts().iter().all(|record| record.kind == ProviderErrorKind::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_fails_fast_without_backend_call() {
        let client = Arc::new(
            ScriptedClient::new().fail(BackendError::unavailable("down")).repeat_last(),
        );
        let adapter = ProviderAdapter::new("gpt-4o", client.clone())
            .with_retry(RetryPolicy::none())
            .with_breaker(BreakerConfig { failure_threshold: 2, ..BreakerConfig::default() });

        for _ in 0..2 {
            let _ = adapter.call(&agent(), &conversation(), &ContextVariables::new()).await;
        }
        let error = adapter
            .call(&agent(), &conversation(), &ContextVariables::new())
            .await
            .expect_err("breaker is open");

        assert_eq!(
            error,
            ProviderError::CircuitOpen { model: "gpt-4o".to_owned(), attempts: Vec::new() }
        );
        assert_eq!(client.calls(), 2);
    }

    fn quick_cooldown() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 1,
            window: Duration::from_secs(10),
            cooldown: Duration::from_millis(200),
            half_open_max_calls: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opening_mid_call_keeps_attempt_history() {
        let client = Arc::new(
            ScriptedClient::new().fail(BackendError::unavailable("502")).repeat_last(),
        );
        let adapter = ProviderAdapter::new("gpt-4o", client.clone())
            .with_retry(fast_retry(5))
            .with_breaker(BreakerConfig { failure_threshold: 2, ..BreakerConfig::default() });

        let error = adapter
            .call(&agent(), &conversation(), &ContextVariables::new())
            .await
            .expect_err("breaker opens before retries run out");

        assert!(matches!(error, ProviderError::CircuitOpen { .. }));
        assert_eq!(error.attempts().len(), 2);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_through_adapter_closes_breaker() {
        let client = Arc::new(
            ScriptedClient::new()
                .fail(BackendError::unavailable("down"))
                .respond(ModelResponse::text("back")),
        );
        let adapter = ProviderAdapter::new("gpt-4o", client.clone())
            .with_retry(RetryPolicy::none())
            .with_breaker(quick_cooldown());
        let context = ContextVariables::new();

        assert!(adapter.call(&agent(), &conversation(), &context).await.is_err());
        assert_eq!(adapter.breaker().state(), BreakerState::Open);
        let rejected = adapter.call(&agent(), &conversation(), &context).await;
        assert!(matches!(rejected, Err(ProviderError::CircuitOpen { .. })));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(adapter.breaker().state(), BreakerState::HalfOpen);
        let response = adapter
            .call(&agent(), &conversation(), &context)
            .await
            .expect("trial call succeeds");

        assert_eq!(response.content.as_text(), Some("back"));
        assert_eq!(adapter.breaker().state(), BreakerState::Closed);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trial_call_does_not_lock_the_breaker() {
        let client = Arc::new(
            ScriptedClient::new()
                .fail(BackendError::unavailable("down"))
                .respond(ModelResponse::text("back"))
                .with_delay(Duration::from_millis(300)),
        );
        let adapter = ProviderAdapter::new("gpt-4o", client.clone())
            .with_retry(RetryPolicy::none())
            .with_breaker(quick_cooldown());
        let context = ContextVariables::new();

        assert!(adapter.call(&agent(), &conversation(), &context).await.is_err());
        tokio::time::sleep(Duration::from_millis(400)).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            adapter.call(&agent(), &conversation(), &context),
        )
        .await;
        assert!(cancelled.is_err(), "trial call was cancelled");
        assert_eq!(adapter.breaker().state(), BreakerState::HalfOpen);

        let response = adapter
            .call(&agent(), &conversation(), &context)
            .await
            .expect("the cancelled trial released its slot");

        assert_eq!(response.content.as_text(), Some("back"));
        assert_eq!(adapter.breaker().state(), BreakerState::Closed);
        assert_eq!(client.calls(), 3);
    }

    #[test]
    fn adapter_set_prefers_exact_then_longest_prefix_then_default() {
        let adapter = || ProviderAdapter::new("any", Arc::new(ScriptedClient::new()));
        let set = AdapterSet::new()
            .with_model("gpt-4o", adapter())
            .with_prefix("gpt", adapter())
            .with_prefix("gpt-4", adapter())
            .with_default(adapter());

        let exact = set.resolve("gpt-4o").expect("exact");
        let long_prefix = set.resolve("gpt-4-turbo").expect("prefix");
        let short_prefix = set.resolve("gpt-3.5").expect("prefix");
        let fallback = set.resolve("claude").expect("default");

        assert!(!Arc::ptr_eq(exact, long_prefix));
        assert!(!Arc::ptr_eq(long_prefix, short_prefix));
        assert!(!Arc::ptr_eq(short_prefix, fallback));
        assert_eq!(
            AdapterSet::new().resolve("claude").err(),
            Some(ProviderError::NoAdapter { model: "claude".to_owned() })
        );
    }
}
