use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use baton_core::config::BreakerSettings;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            window: Duration::from_secs(settings.window_secs),
            cooldown: Duration::from_secs(settings.cooldown_secs),
            half_open_max_calls: settings.half_open_max_calls.max(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Timestamps of consecutive failures still inside the window.
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    /// Bumped on every transition into half-open so stale permits cannot release new slots.
    half_open_generation: u64,
}

/// Per-model circuit breaker. State lives behind a `std::sync::Mutex` that is never held across
/// an `.await`.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                half_open_in_flight: 0,
                half_open_generation: 0,
            }),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> BreakerState {
        self.state_at(Instant::now())
    }

    /// Observed state at `now`, accounting for an elapsed cooldown.
    pub fn state_at(&self, now: Instant) -> BreakerState {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        inner.state
    }

    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        self.try_acquire_at(Instant::now())
    }

    /// Admits a call. Open breakers reject; half-open breakers admit up to the trial budget.
    ///
    /// A half-open permit dropped without recording an outcome, e.g. because the call was
    /// cancelled, gives its trial slot back.
    pub fn try_acquire_at(&self, now: Instant) -> Option<BreakerPermit<'_>> {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        let trial = match inner.state {
            BreakerState::Closed => None,
            BreakerState::Open => return None,
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_calls {
                    return None;
                }
                inner.half_open_in_flight += 1;
                Some(inner.half_open_generation)
            }
        };
        Some(BreakerPermit { breaker: self, trial, settled: false })
    }

    pub fn record_success(&self) {
        self.record_success_at(Instant::now());
    }

    pub fn record_success_at(&self, now: Instant) {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        if inner.state == BreakerState::HalfOpen {
            info!(
                event_name = "provider.breaker.closed",
                breaker = %self.name,
                "trial call succeeded; circuit closed"
            );
        }
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.half_open_in_flight = 0;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        match inner.state {
            BreakerState::HalfOpen => {
                warn!(
                    event_name = "provider.breaker.reopened",
                    breaker = %self.name,
                    "trial call failed; circuit reopened"
                );
                self.open(&mut inner, now);
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                let window = self.config.window;
                while inner
                    .failures
                    .front()
                    .is_some_and(|first| now.saturating_duration_since(*first) > window)
                {
                    inner.failures.pop_front();
                }
                inner.failures.push_back(now);

                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    warn!(
                        event_name = "provider.breaker.opened",
                        breaker = %self.name,
                        failures = inner.failures.len(),
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "failure threshold reached; circuit opened"
                    );
                    self.open(&mut inner, now);
                }
            }
        }
    }

    fn open(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        inner.failures.clear();
        inner.half_open_in_flight = 0;
    }

    fn refresh(&self, inner: &mut BreakerInner, now: Instant) {
        if inner.state != BreakerState::Open {
            return;
        }
        let cooled_down = inner
            .opened_at
            .map(|opened_at| now.saturating_duration_since(opened_at) >= self.config.cooldown)
            .unwrap_or(true);
        if cooled_down {
            info!(
                event_name = "provider.breaker.half_open",
                breaker = %self.name,
                "cooldown elapsed; admitting trial calls"
            );
            inner.state = BreakerState::HalfOpen;
            inner.half_open_in_flight = 0;
            inner.half_open_generation += 1;
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen
            && inner.half_open_generation == generation
            && inner.half_open_in_flight > 0
        {
            inner.half_open_in_flight -= 1;
            debug!(
                event_name = "provider.breaker.trial_released",
                breaker = %self.name,
                "trial call abandoned; slot released"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`].
#[must_use = "record the call outcome on the permit"]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    /// Half-open generation the trial slot was taken from.
    trial: Option<u64>,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }

    pub fn record_success(self) {
        self.record_success_at(Instant::now());
    }

    pub fn record_success_at(mut self, now: Instant) {
        self.settled = true;
        self.breaker.record_success_at(now);
    }

    pub fn record_failure(self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(mut self, now: Instant) {
        self.settled = true;
        self.breaker.record_failure_at(now);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if let (false, Some(generation)) = (self.settled, self.trial) {
            self.breaker.release_trial(generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{BreakerConfig, BreakerState, CircuitBreaker};

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "gpt-4o",
            BreakerConfig {
                failure_threshold: threshold,
                window: Duration::from_secs(10),
                cooldown: Duration::from_secs(30),
                half_open_max_calls: 1,
            },
        )
    }

    #[test]
    fn opens_after_threshold_and_rejects_until_cooldown() {
        let breaker = breaker(3);
        let start = Instant::now();

        for offset in 0..3 {
            let at = start + Duration::from_secs(offset);
            breaker.try_acquire_at(at).expect("closed breaker admits").record_failure_at(at);
        }

        assert_eq!(breaker.state_at(start + Duration::from_secs(3)), BreakerState::Open);
        assert!(breaker.try_acquire_at(start + Duration::from_secs(20)).is_none());
        assert_eq!(breaker.state_at(start + Duration::from_secs(33)), BreakerState::HalfOpen);
    }

    #[test]
    fn failures_outside_window_do_not_accumulate() {
        let breaker = breaker(3);
        let start = Instant::now();

        breaker.record_failure_at(start);
        breaker.record_failure_at(start + Duration::from_secs(1));
        breaker.record_failure_at(start + Duration::from_secs(15));

        assert_eq!(breaker.state_at(start + Duration::from_secs(15)), BreakerState::Closed);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let breaker = breaker(2);
        let start = Instant::now();

        breaker.record_failure_at(start);
        breaker.record_success_at(start + Duration::from_secs(1));
        breaker.record_failure_at(start + Duration::from_secs(2));

        assert_eq!(breaker.state_at(start + Duration::from_secs(2)), BreakerState::Closed);
    }

    #[test]
    fn half_open_trial_success_closes() {
        let breaker = breaker(1);
        let start = Instant::now();
        breaker.record_failure_at(start);

        let trial_at = start + Duration::from_secs(31);
        let trial = breaker.try_acquire_at(trial_at).expect("trial admitted");
        assert!(trial.is_trial());
        assert!(breaker.try_acquire_at(trial_at).is_none(), "only one trial call is admitted");
        trial.record_success_at(trial_at);

        assert_eq!(breaker.state_at(trial_at), BreakerState::Closed);
        assert!(breaker.try_acquire_at(trial_at).is_some_and(|permit| !permit.is_trial()));
    }

    #[test]
    fn half_open_trial_failure_reopens_for_a_full_cooldown() {
        let breaker = breaker(1);
        let start = Instant::now();
        breaker.record_failure_at(start);

        let trial_at = start + Duration::from_secs(31);
        breaker.try_acquire_at(trial_at).expect("trial admitted").record_failure_at(trial_at);

        assert_eq!(breaker.state_at(trial_at), BreakerState::Open);
        assert!(breaker.try_acquire_at(trial_at + Duration::from_secs(29)).is_none());
        assert!(breaker.try_acquire_at(trial_at + Duration::from_secs(30)).is_some());
    }

    #[test]
    fn abandoned_trial_gives_its_slot_back() {
        let breaker = breaker(1);
        let start = Instant::now();
        breaker.record_failure_at(start);

        let trial_at = start + Duration::from_secs(31);
        let abandoned = breaker.try_acquire_at(trial_at).expect("trial admitted");
        assert!(breaker.try_acquire_at(trial_at).is_none());
        drop(abandoned);

        assert_eq!(breaker.state_at(trial_at), BreakerState::HalfOpen);
        let retry = breaker.try_acquire_at(trial_at).expect("slot released by the dropped permit");
        retry.record_success_at(trial_at);
        assert_eq!(breaker.state_at(trial_at), BreakerState::Closed);
    }

    #[test]
    fn stale_permit_does_not_release_a_later_trial_slot() {
        let breaker = breaker(1);
        let start = Instant::now();
        breaker.record_failure_at(start);

        let first_trial = start + Duration::from_secs(31);
        let stale = breaker.try_acquire_at(first_trial).expect("trial admitted");
        breaker.record_failure_at(first_trial);

        let second_trial = first_trial + Duration::from_secs(30);
        let current = breaker.try_acquire_at(second_trial).expect("new trial admitted");
        drop(stale);

        assert!(breaker.try_acquire_at(second_trial).is_none(), "budget still taken");
        current.record_success_at(second_trial);
    }
}
