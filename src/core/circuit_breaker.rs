//! Per-component circuit breakers.
//!
//! A breaker wraps calls to one fragile component. Consecutive unexpected
//! failures open it; while open, calls are rejected without running. Once
//! `reset_timeout` has elapsed the breaker moves to half-open and lets calls
//! through again: a success closes it, a failure re-opens it.
//!
//! Breakers handed out by a [`CircuitBreakerRegistry`] schedule the open to
//! half-open move on a timer when they open, so subscribers see the
//! `circuit.state_changed` event without anyone touching the breaker. The
//! timer holds only a weak reference and is aborted when the breaker drops.
//! Standalone breakers from [`CircuitBreaker::new`] apply the move lazily on
//! the next `execute`, `state` or `snapshot`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::domain::{CircuitState, EventPayload};

use super::error::CoreError;
use super::event_bus::EventBus;

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive unexpected failures that open a closed breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open breaker rejects calls before turning half-open
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Failures whose message contains one of these do not count
    #[serde(default)]
    pub expected_errors: Vec<String>,

    /// Failures whose message matches one of these regexes do not count
    #[serde(default)]
    pub expected_patterns: Vec<String>,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    60_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            expected_errors: Vec::new(),
            expected_patterns: Vec::new(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    fn compile(&self) -> Result<Vec<ExpectedError>, CoreError> {
        if self.failure_threshold == 0 {
            return Err(CoreError::validation(
                "circuit_breaker.failure_threshold must be at least 1",
            ));
        }

        let mut expected: Vec<ExpectedError> = self
            .expected_errors
            .iter()
            .map(|s| ExpectedError::Contains(s.clone()))
            .collect();

        for pattern in &self.expected_patterns {
            let regex = Regex::new(pattern).map_err(|e| {
                CoreError::validation(format!("Invalid expected error pattern '{}': {}", pattern, e))
            })?;
            expected.push(ExpectedError::Pattern(regex));
        }

        Ok(expected)
    }
}

#[derive(Debug, Clone)]
enum ExpectedError {
    Contains(String),
    Pattern(Regex),
}

impl ExpectedError {
    fn matches(&self, message: &str) -> bool {
        match self {
            Self::Contains(needle) => message.contains(needle.as_str()),
            Self::Pattern(regex) => regex.is_match(message),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub total_requests: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitMetrics {
    pub failure_count: u32,
    pub success_count: u64,
    pub total_requests: u64,
    pub rejected_requests: u64,

    /// Counted failures over executed requests
    pub failure_rate: f64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    total_requests: u64,
    total_failures: u64,
    rejected_requests: u64,
    last_failure_time: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            total_failures: 0,
            rejected_requests: 0,
            last_failure_time: None,
            opened_at: None,
        }
    }
}

type Transition = (CircuitState, CircuitState, u32);

/// Failure-isolation wrapper around one component
pub struct CircuitBreaker {
    component: String,
    config: CircuitBreakerConfig,
    expected: Vec<ExpectedError>,
    inner: Mutex<BreakerInner>,
    events: Option<EventBus>,

    /// Set for shared breakers; lets the half-open timer find its way back
    this: Weak<CircuitBreaker>,
    timer: Mutex<Option<AbortHandle>>,
}

impl CircuitBreaker {
    /// Standalone breaker; the half-open move is applied lazily
    pub fn new(component: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self, CoreError> {
        let expected = config.compile()?;
        Ok(Self::from_parts(component.into(), config, expected, None, Weak::new()))
    }

    /// Shared breaker that turns half-open on a timer and publishes on `events`
    pub fn shared(
        component: impl Into<String>,
        config: CircuitBreakerConfig,
        events: EventBus,
    ) -> Result<Arc<Self>, CoreError> {
        let expected = config.compile()?;
        let component = component.into();
        Ok(Arc::new_cyclic(|this| {
            Self::from_parts(component, config, expected, Some(events), this.clone())
        }))
    }

    fn from_parts(
        component: String,
        config: CircuitBreakerConfig,
        expected: Vec<ExpectedError>,
        events: Option<EventBus>,
        this: Weak<CircuitBreaker>,
    ) -> Self {
        Self {
            component,
            config,
            expected,
            inner: Mutex::new(BreakerInner::new()),
            events,
            this,
            timer: Mutex::new(None),
        }
    }

    /// Publish state transitions on `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Run `operation` through the breaker.
    ///
    /// Fails with [`CoreError::CircuitOpen`] without invoking `operation`
    /// while the breaker is open.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure(&e);
                Err(e)
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.snapshot().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let (snapshot, transition) = {
            let mut inner = self.lock();
            let transition = self.refresh(&mut inner);
            let snapshot = CircuitSnapshot {
                state: inner.state,
                failure_count: inner.failure_count,
                success_count: inner.success_count,
                total_requests: inner.total_requests,
                last_failure_time: inner.last_failure_time,
            };
            (snapshot, transition)
        };
        self.announce(transition);
        snapshot
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let inner = self.lock();
        let failure_rate = if inner.total_requests == 0 {
            0.0
        } else {
            inner.total_failures as f64 / inner.total_requests as f64
        };
        CircuitMetrics {
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_requests: inner.total_requests,
            rejected_requests: inner.rejected_requests,
            failure_rate,
        }
    }

    /// Administrative override of the current state
    pub fn force_state(&self, state: CircuitState) {
        let transition = {
            let mut inner = self.lock();
            let from = inner.state;
            inner.state = state;
            match state {
                CircuitState::Open => inner.opened_at = Some(Instant::now()),
                CircuitState::Closed => {
                    inner.failure_count = 0;
                    inner.opened_at = None;
                }
                CircuitState::HalfOpen => inner.opened_at = None,
            }
            (from != state).then_some((from, state, inner.failure_count))
        };
        warn!(component = %self.component, state = ?state, "Circuit breaker state forced");
        self.announce(transition);
        if state == CircuitState::Open {
            self.schedule_half_open();
        }
    }

    /// Return to closed with all counters cleared
    pub fn reset(&self) -> CircuitSnapshot {
        let transition = {
            let mut inner = self.lock();
            let from = inner.state;
            *inner = BreakerInner::new();
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed, 0))
        };
        info!(component = %self.component, "Circuit breaker reset");
        self.announce(transition);
        self.snapshot()
    }

    fn admit(&self) -> Result<(), CoreError> {
        let (result, transition) = {
            let mut inner = self.lock();
            let transition = self.refresh(&mut inner);
            if inner.state == CircuitState::Open {
                inner.rejected_requests += 1;
                (
                    Err(CoreError::CircuitOpen {
                        component: self.component.clone(),
                    }),
                    transition,
                )
            } else {
                inner.total_requests += 1;
                (Ok(()), transition)
            }
        };
        self.announce(transition);
        result
    }

    fn on_success(&self) {
        let transition = {
            let mut inner = self.lock();
            inner.success_count += 1;
            inner.failure_count = 0;
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                Some((CircuitState::HalfOpen, CircuitState::Closed, 0))
            } else {
                None
            }
        };
        self.announce(transition);
    }

    fn on_failure(&self, error: &anyhow::Error) {
        let message = format!("{:#}", error);
        if self.expected.iter().any(|e| e.matches(&message)) {
            return;
        }

        let transition = {
            let mut inner = self.lock();
            inner.failure_count += 1;
            inner.total_failures += 1;
            inner.last_failure_time = Some(Utc::now());

            let should_open = match inner.state {
                CircuitState::Closed => inner.failure_count >= self.config.failure_threshold,
                CircuitState::HalfOpen => true,
                CircuitState::Open => false,
            };
            if should_open {
                let from = inner.state;
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                Some((from, CircuitState::Open, inner.failure_count))
            } else {
                None
            }
        };
        let opened = transition.is_some();
        self.announce(transition);
        if opened {
            self.schedule_half_open();
        }
    }

    /// Re-check the breaker once the reset timeout has passed. No-op for
    /// standalone breakers and outside a tokio runtime.
    fn schedule_half_open(&self) {
        if self.this.strong_count() == 0 {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let this = self.this.clone();
        let delay = self.config.reset_timeout() + Duration::from_millis(1);
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(breaker) = this.upgrade() {
                let state = breaker.state();
                debug!(component = %breaker.component, state = ?state, "Reset timeout elapsed");
            }
        });

        let previous = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Apply the lazy open to half-open move once the reset timeout elapsed
    fn refresh(&self, inner: &mut BreakerInner) -> Option<Transition> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
        if elapsed < self.config.reset_timeout() {
            return None;
        }
        inner.state = CircuitState::HalfOpen;
        inner.opened_at = None;
        Some((CircuitState::Open, CircuitState::HalfOpen, inner.failure_count))
    }

    fn announce(&self, transition: Option<Transition>) {
        let Some((from, to, failure_count)) = transition else {
            return;
        };
        match to {
            CircuitState::Open => warn!(component = %self.component, failure_count, "Circuit opened"),
            _ => info!(component = %self.component, from = ?from, to = ?to, "Circuit state changed"),
        }
        if let Some(events) = &self.events {
            events.publish(EventPayload::CircuitStateChanged {
                component: self.component.clone(),
                from,
                to,
                failure_count,
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CircuitBreaker {
    fn drop(&mut self) {
        let timer = self.timer.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = timer.take() {
            timer.abort();
        }
    }
}

/// Owns one breaker per component, created on first use
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    expected: Vec<ExpectedError>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    events: EventBus,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, events: EventBus) -> Result<Self, CoreError> {
        let expected = config.compile()?;
        Ok(Self {
            config,
            expected,
            breakers: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Breaker for `component`, created closed if it does not exist yet
    pub fn get(&self, component: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(component.to_string())
            .or_insert_with(|| {
                Arc::new_cyclic(|this| {
                    CircuitBreaker::from_parts(
                        component.to_string(),
                        self.config.clone(),
                        self.expected.clone(),
                        Some(self.events.clone()),
                        this.clone(),
                    )
                })
            })
            .clone()
    }

    pub fn reset(&self, component: &str) -> CircuitSnapshot {
        self.get(component).reset()
    }

    pub fn force_state(&self, component: &str, state: CircuitState) {
        self.get(component).force_state(state);
    }

    /// Snapshot of every breaker created so far
    pub fn snapshot(&self) -> HashMap<String, CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        breakers
            .into_iter()
            .map(|b| (b.component().to_string(), b.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "db",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: reset_ms,
                ..Default::default()
            },
        )
        .unwrap()
    }

    async fn fail(breaker: &CircuitBreaker, message: &str) -> anyhow::Error {
        let message = message.to_string();
        breaker
            .execute(|| async move { Err::<(), _>(anyhow::anyhow!(message)) })
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let breaker = breaker(3, 60_000);

        fail(&breaker, "boom").await;
        fail(&breaker, "boom").await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker, "boom").await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().failure_count, 3);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(3, 60_000);

        fail(&breaker, "boom").await;
        fail(&breaker, "boom").await;
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        fail(&breaker, "boom").await;

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking() {
        let breaker = breaker(1, 60_000);
        fail(&breaker, "boom").await;

        let calls = AtomicUsize::new(0);
        let err = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::CircuitOpen { .. })
        ));
        assert_eq!(breaker.metrics().rejected_requests, 1);
    }

    #[tokio::test]
    async fn test_expected_errors_do_not_count() {
        let breaker = CircuitBreaker::new(
            "api",
            CircuitBreakerConfig {
                failure_threshold: 1,
                expected_errors: vec!["not found".to_string()],
                expected_patterns: vec![r"^validation: .+".to_string()],
                ..Default::default()
            },
        )
        .unwrap();

        fail(&breaker, "user not found").await;
        fail(&breaker, "validation: email missing").await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);

        fail(&breaker, "connection refused").await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = breaker(1, 20);
        fail(&breaker, "boom").await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        fail(&breaker, "still down").await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = CircuitBreaker::new(
            "api",
            CircuitBreakerConfig {
                expected_patterns: vec!["(unclosed".to_string()],
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_metrics_failure_rate() {
        let breaker = breaker(10, 60_000);
        fail(&breaker, "boom").await;
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        breaker.execute(|| async { Ok(()) }).await.unwrap();
        fail(&breaker, "boom").await;

        let metrics = breaker.metrics();
        assert_eq!(metrics.total_requests, 4);
        assert_eq!(metrics.success_count, 2);
        assert!((metrics.failure_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_registry_reuses_breakers() {
        let registry =
            CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), EventBus::new()).unwrap();
        let a = registry.get("search");
        let b = registry.get("search");
        assert!(Arc::ptr_eq(&a, &b));

        registry.force_state("search", CircuitState::Open);
        assert_eq!(a.state(), CircuitState::Open);
        assert_eq!(registry.snapshot().len(), 1);
    }
}
