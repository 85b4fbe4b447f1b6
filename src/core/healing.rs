//! Self-healing orchestration: detect, recover, verify.
//!
//! The orchestrator keeps one active recovery per service. A failure for a
//! service that is already recovering is ignored. Otherwise a strategy is
//! recommended, executed through the [`RecoveryManager`], and a monitor task
//! polls the health monitor until the service is healthy or the recovery
//! timeout elapses. Either way the service leaves the active set and is
//! eligible for the next failure.
//!
//! The recovery timeout is measured from the moment the service is
//! reserved, so it bounds the recommendation and the remediation call as
//! well as the health polling that follows. Every monitor task exits on
//! success, timeout or cancellation; none outlives its recovery.
//!
//! Accepted failures are also kept in a bounded [`FailureLog`]; the patterns
//! it finds are attached to the recovery they arrive with.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::analytics::{default_strategies, StrategyStats, SystemStatus};
use crate::adapters::{FaultDetector, HealthMonitor, StrategyRecommender};
use crate::domain::{
    EventPayload, FailurePattern, PredictionAlert, PreventiveAction, RecoveryAction, RecoveryStatus,
    SystemFailure,
};

use super::circuit_breaker::{CircuitBreakerRegistry, CircuitSnapshot};
use super::error::CoreError;
use super::event_bus::EventBus;
use super::patterns::FailureLog;
use super::recovery::{ActionOutcome, RecoveryManager};

const HISTORY_LIMIT: usize = 1000;

/// Self-healing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingConfig {
    /// Health polling period during recovery, and fault detection period
    #[serde(default = "default_monitoring_interval_ms")]
    pub monitoring_interval_ms: u64,

    /// Upper bound on one recovery attempt
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    /// Predictions above this probability trigger preventive actions
    #[serde(default = "default_preventive_action_threshold")]
    pub preventive_action_threshold: f64,

    /// How long shutdown waits for active recoveries
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Upper bound on one remediation call
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,

    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,

    #[serde(default = "default_max_scale_factor")]
    pub max_scale_factor: f64,

    /// Most recent failures scanned for patterns
    #[serde(default = "default_pattern_window")]
    pub pattern_window: usize,

    /// Occurrences needed before something counts as a pattern
    #[serde(default = "default_min_pattern_frequency")]
    pub min_pattern_frequency: usize,
}

fn default_monitoring_interval_ms() -> u64 {
    5_000
}
fn default_recovery_timeout_ms() -> u64 {
    300_000
}
fn default_preventive_action_threshold() -> f64 {
    0.7
}
fn default_drain_timeout_ms() -> u64 {
    30_000
}
fn default_action_timeout_ms() -> u64 {
    60_000
}
fn default_scale_factor() -> f64 {
    1.5
}
fn default_max_scale_factor() -> f64 {
    3.0
}
fn default_pattern_window() -> usize {
    100
}
fn default_min_pattern_frequency() -> usize {
    3
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            monitoring_interval_ms: default_monitoring_interval_ms(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            preventive_action_threshold: default_preventive_action_threshold(),
            drain_timeout_ms: default_drain_timeout_ms(),
            action_timeout_ms: default_action_timeout_ms(),
            scale_factor: default_scale_factor(),
            max_scale_factor: default_max_scale_factor(),
            pattern_window: default_pattern_window(),
            min_pattern_frequency: default_min_pattern_frequency(),
        }
    }
}

impl HealingConfig {
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// What `handle_failure` did with a failure
#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    /// Strategy executed; the monitor is verifying the service
    Started { recovery_id: Uuid, strategy: String },

    /// The service already has an active recovery
    Ignored,

    /// The recovery ended before health monitoring began
    Failed { recovery_id: Uuid, error: String },

    /// The orchestrator is shutting down
    Rejected,
}

/// Result of dispatching one preventive action
#[derive(Debug, Clone, PartialEq)]
pub struct PreventiveOutcome {
    pub action: PreventiveAction,
    pub outcome: ActionOutcome,
}

/// Totals over accepted failures and finished recoveries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub active: usize,
    pub finished: usize,
    pub completed: usize,
    pub failed: usize,
    pub success_rate: f64,

    /// Failures accepted since the orchestrator was created
    pub total_failures: usize,

    /// Failures accepted within the last hour
    pub recent_failures: usize,

    /// Finished recoveries per strategy
    pub strategies: BTreeMap<String, StrategyStats>,

    /// `HEALTHY` above 0.8 success, `DEGRADED` above 0.5, else `CRITICAL`.
    /// Healthy while nothing has finished.
    pub status: SystemStatus,
}

/// Outcome of a shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub drained: bool,

    /// Services still recovering when the drain timeout ran out
    pub outstanding: Vec<String>,
}

enum Finish {
    Completed,
    TimedOut,
    Cancelled,
}

/// A step of a recovery run against its deadline and cancel token
enum Bounded<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

async fn bounded<F: Future>(deadline: Instant, cancel: &CancellationToken, step: F) -> Bounded<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Bounded::Cancelled,
        result = tokio::time::timeout_at(deadline, step) => match result {
            Ok(output) => Bounded::Done(output),
            Err(_) => Bounded::TimedOut,
        },
    }
}

struct ActiveRecovery {
    action: RecoveryAction,
    cancel: CancellationToken,
}

struct Inner {
    config: HealingConfig,
    recovery: RecoveryManager,
    recommender: Arc<dyn StrategyRecommender>,
    health: Arc<dyn HealthMonitor>,
    breakers: Arc<CircuitBreakerRegistry>,
    events: EventBus,
    active: Mutex<HashMap<String, ActiveRecovery>>,
    history: Mutex<VecDeque<RecoveryAction>>,
    failures: Mutex<FailureLog>,
    failures_seen: AtomicUsize,
    accepting: AtomicBool,
    idle: Notify,
    shutdown: CancellationToken,
}

/// Drives recoveries for many services concurrently
#[derive(Clone)]
pub struct SelfHealingOrchestrator {
    inner: Arc<Inner>,
}

impl SelfHealingOrchestrator {
    pub fn new(
        config: HealingConfig,
        recovery: RecoveryManager,
        recommender: Arc<dyn StrategyRecommender>,
        health: Arc<dyn HealthMonitor>,
        breakers: Arc<CircuitBreakerRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                recovery,
                recommender,
                health,
                breakers,
                events,
                active: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                failures: Mutex::new(FailureLog::new(HISTORY_LIMIT)),
                failures_seen: AtomicUsize::new(0),
                accepting: AtomicBool::new(true),
                idle: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// React to a detected failure.
    ///
    /// Fails only with [`CoreError::UnknownStrategy`] when the recommender
    /// names a strategy that does not exist; the recovery is closed first.
    #[instrument(skip(self, failure), fields(service = %failure.service, failure_type = %failure.failure_type))]
    pub async fn handle_failure(&self, failure: SystemFailure) -> Result<HandleOutcome, CoreError> {
        let inner = &self.inner;
        let service = failure.service.clone();

        if !inner.accepting.load(Ordering::SeqCst) {
            inner.events.publish(EventPayload::RecoveryIgnored {
                service,
                reason: "orchestrator is shutting down".to_string(),
            });
            return Ok(HandleOutcome::Rejected);
        }

        let patterns = self.record_failure(&failure);

        // Reserve the service before any await so concurrent failures see it
        let deadline = Instant::now() + inner.config.recovery_timeout();
        let reserved = {
            let mut active = self.lock_active();
            if active.contains_key(&service) {
                None
            } else {
                let mut action = RecoveryAction::new(failure.clone());
                action.patterns = patterns.clone();
                let recovery_id = action.id;
                let cancel = CancellationToken::new();
                active.insert(
                    service.clone(),
                    ActiveRecovery {
                        action,
                        cancel: cancel.clone(),
                    },
                );
                Some((recovery_id, cancel))
            }
        };
        let Some((recovery_id, cancel)) = reserved else {
            debug!("Recovery already in progress, ignoring failure");
            inner.events.publish(EventPayload::RecoveryIgnored {
                service,
                reason: "recovery already in progress".to_string(),
            });
            return Ok(HandleOutcome::Ignored);
        };

        let strategy = match bounded(deadline, &cancel, inner.recommender.recommend(&failure)).await {
            Bounded::Done(Ok(strategy)) => strategy,
            Bounded::Done(Err(e)) => {
                let fallback = default_strategies(failure.failure_type)[0];
                warn!(error = %e, fallback, "Strategy recommendation failed, using default");
                fallback.to_string()
            }
            Bounded::TimedOut => {
                let error = self.timeout_reason("no strategy recommended");
                self.finish_failed(&service, error.clone(), false, Some(true)).await;
                return Ok(HandleOutcome::Failed { recovery_id, error });
            }
            Bounded::Cancelled => return Ok(self.finish_cancelled(&service, recovery_id).await),
        };

        if let Some(entry) = self.lock_active().get_mut(&service) {
            entry.action.start(strategy.clone());
        }
        info!(%recovery_id, strategy = %strategy, "Recovery started");
        inner.events.publish(EventPayload::RecoveryStarted {
            recovery_id,
            service: service.clone(),
            strategy: strategy.clone(),
            failure_type: failure.failure_type,
            patterns,
        });

        let outcome = match bounded(deadline, &cancel, inner.recovery.execute_strategy(&strategy, &failure)).await {
            Bounded::Done(Ok(outcome)) => outcome,
            Bounded::Done(Err(e)) => {
                error!(error = %e, "Recovery strategy rejected");
                self.finish_failed(&service, e.to_string(), false, None).await;
                return Err(e);
            }
            Bounded::TimedOut => {
                let error = self.timeout_reason("strategy still running");
                self.finish_failed(&service, error.clone(), true, Some(true)).await;
                return Ok(HandleOutcome::Failed { recovery_id, error });
            }
            Bounded::Cancelled => return Ok(self.finish_cancelled(&service, recovery_id).await),
        };

        if !outcome.success() {
            let error = outcome
                .action
                .error
                .unwrap_or_else(|| "recovery strategy failed".to_string());
            self.finish_failed(&service, error.clone(), true, None).await;
            return Ok(HandleOutcome::Failed { recovery_id, error });
        }

        if let Some(entry) = self.lock_active().get_mut(&service) {
            entry.action.rollback_id = outcome.rollback_id.clone();
        }

        self.spawn_monitor(service, cancel, deadline);
        Ok(HandleOutcome::Started {
            recovery_id,
            strategy,
        })
    }

    /// Poll health until the service recovers, the timeout hits, or the
    /// recovery is cancelled
    fn spawn_monitor(&self, service: String, cancel: CancellationToken, deadline: Instant) {
        let orchestrator = self.clone();
        let period = self.inner.config.monitoring_interval();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let health = Arc::clone(&orchestrator.inner.health);

            let finish = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Finish::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => break Finish::TimedOut,
                    _ = ticker.tick() => {
                        let check = tokio::time::timeout_at(deadline, health.check_service(&service));
                        match check.await {
                            Err(_) => break Finish::TimedOut,
                            Ok(Ok(report)) if report.is_healthy() => break Finish::Completed,
                            Ok(Ok(report)) => {
                                debug!(service = %service, status = ?report.status, "Service not yet healthy");
                            }
                            Ok(Err(e)) => {
                                warn!(service = %service, error = %e, "Health check failed during recovery");
                            }
                        }
                    }
                }
            };

            match finish {
                Finish::Completed => orchestrator.finish_completed(&service).await,
                Finish::TimedOut => {
                    let reason = orchestrator.timeout_reason("service not healthy");
                    orchestrator.finish_failed(&service, reason, true, Some(true)).await;
                }
                Finish::Cancelled => {
                    orchestrator
                        .finish_failed(&service, "recovery cancelled".to_string(), false, Some(false))
                        .await;
                }
            }
        });
    }

    fn timeout_reason(&self, what: &str) -> String {
        format!("{} within {}ms", what, self.inner.config.recovery_timeout_ms)
    }

    /// Log the failure and return the patterns it completes
    fn record_failure(&self, failure: &SystemFailure) -> Vec<FailurePattern> {
        self.inner.failures_seen.fetch_add(1, Ordering::SeqCst);
        let config = &self.inner.config;
        let patterns = {
            let mut log = self.inner.failures.lock().unwrap_or_else(PoisonError::into_inner);
            log.push(failure.clone());
            log.detect(failure, config.pattern_window, config.min_pattern_frequency)
        };
        if !patterns.is_empty() {
            info!(service = %failure.service, count = patterns.len(), "Failure patterns detected");
        }
        patterns
    }

    async fn finish_cancelled(&self, service: &str, recovery_id: Uuid) -> HandleOutcome {
        let error = "recovery cancelled".to_string();
        self.finish_failed(service, error.clone(), false, Some(false)).await;
        HandleOutcome::Failed { recovery_id, error }
    }

    /// Remove a service from the active set and archive its action
    fn take_active(&self, service: &str, update: impl FnOnce(&mut RecoveryAction)) -> Option<RecoveryAction> {
        let (action, now_idle) = {
            let mut active = self.lock_active();
            let Some(mut entry) = active.remove(service) else {
                return None;
            };
            update(&mut entry.action);
            entry.cancel.cancel();
            (entry.action, active.is_empty())
        };

        {
            let mut history = self.inner.history.lock().unwrap_or_else(PoisonError::into_inner);
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(action.clone());
        }

        if now_idle {
            self.inner.idle.notify_waiters();
        }
        Some(action)
    }

    async fn finish_completed(&self, service: &str) {
        let Some(action) = self.take_active(service, RecoveryAction::complete) else {
            return;
        };
        let duration_ms = action.duration_ms();
        info!(service = %service, recovery_id = %action.id, duration_ms, "Recovery completed");

        self.inner.events.publish(EventPayload::RecoveryCompleted {
            recovery_id: action.id,
            service: service.to_string(),
            strategy: action.strategy.clone(),
            duration_ms,
        });
        self.feedback(&action, true).await;
    }

    /// `escalate`: `Some(true)` raises an escalation, `Some(false)` marks a
    /// cancellation, `None` is a plain failure
    async fn finish_failed(&self, service: &str, error: String, feedback: bool, escalate: Option<bool>) {
        let Some(action) = self.take_active(service, |a| a.fail(error.clone())) else {
            return;
        };
        warn!(service = %service, recovery_id = %action.id, error = %error, "Recovery failed");

        let events = &self.inner.events;
        match escalate {
            Some(false) => {
                events.publish(EventPayload::RecoveryCancelled {
                    recovery_id: action.id,
                    service: service.to_string(),
                });
            }
            _ => {
                events.publish(EventPayload::RecoveryFailed {
                    recovery_id: action.id,
                    service: service.to_string(),
                    strategy: action.strategy.clone(),
                    error: error.clone(),
                });
            }
        }
        if escalate == Some(true) {
            error!(service = %service, recovery_id = %action.id, "Recovery timed out, escalating to operator");
            events.publish(EventPayload::EscalationRequired {
                recovery_id: action.id,
                service: service.to_string(),
                reason: error,
            });
        }

        if feedback {
            self.feedback(&action, false).await;
        }
    }

    async fn feedback(&self, action: &RecoveryAction, success: bool) {
        if let Err(e) = self
            .inner
            .recommender
            .record_outcome(&action.failure, &action.strategy, success)
            .await
        {
            warn!(service = %action.service, error = %e, "Failed to record recovery outcome");
        }
    }

    /// Dispatch preventive actions for a likely failure.
    ///
    /// Nothing happens at or below the threshold. No recovery is created.
    #[instrument(skip(self, alert), fields(service = %alert.service, probability = alert.probability))]
    pub async fn handle_prediction(&self, alert: &PredictionAlert) -> Vec<PreventiveOutcome> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::SeqCst)
            || alert.probability <= inner.config.preventive_action_threshold
        {
            debug!("Prediction below threshold, no preventive action");
            return Vec::new();
        }

        let actions = if alert.recommended_actions.is_empty() {
            vec![PreventiveAction::ScaleResources {
                factor: inner.config.scale_factor,
            }]
        } else {
            alert.recommended_actions.clone()
        };

        let mut outcomes = Vec::with_capacity(actions.len());
        for action in actions {
            let outcome = inner.recovery.execute_preventive(&alert.service, &action).await;
            inner.events.publish(EventPayload::PreventiveActionDispatched {
                service: alert.service.clone(),
                probability: alert.probability,
                action: action.clone(),
                success: outcome.success,
            });
            outcomes.push(PreventiveOutcome { action, outcome });
        }
        outcomes
    }

    /// Cancel a service's active recovery.
    ///
    /// The recovery ends `failed` without escalation. Returns false if the
    /// service had no active recovery.
    pub fn cancel_recovery(&self, service: &str) -> bool {
        match self.lock_active().get(service) {
            Some(entry) => {
                info!(service = %service, "Cancelling recovery");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn reset_circuit_breaker(&self, component: &str) -> CircuitSnapshot {
        self.inner.breakers.reset(component)
    }

    /// Poll `detector` every monitoring interval until shutdown
    pub fn start(&self, detector: Arc<dyn FaultDetector>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let period = self.inner.config.monitoring_interval();
        let stop = self.inner.shutdown.clone();

        tokio::spawn(async move {
            info!(interval_ms = period.as_millis() as u64, "Fault detection loop started");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let failures = match detector.detect().await {
                    Ok(failures) => failures,
                    Err(e) => {
                        warn!(error = %e, "Fault detection failed");
                        continue;
                    }
                };

                for failure in failures {
                    if let Err(e) = orchestrator.handle_failure(failure).await {
                        error!(error = %e, "Failure handling rejected");
                    }
                }
            }
            info!("Fault detection loop stopped");
        })
    }

    /// Stop accepting failures and wait for active recoveries to drain.
    ///
    /// Recoveries still running after the drain timeout are logged and left
    /// alone.
    pub async fn shutdown(&self) -> ShutdownReport {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::SeqCst);
        inner.shutdown.cancel();
        info!(active = self.active_count(), "Shutting down, draining recoveries");

        let drain = async {
            loop {
                let idle = inner.idle.notified();
                tokio::pin!(idle);
                idle.as_mut().enable();
                if self.active_count() == 0 {
                    break;
                }
                idle.await;
            }
        };

        let drained = tokio::time::timeout(inner.config.drain_timeout(), drain)
            .await
            .is_ok();

        let outstanding: Vec<String> = {
            let mut services: Vec<String> = self.lock_active().keys().cloned().collect();
            services.sort();
            services
        };
        for service in &outstanding {
            warn!(service = %service, "Recovery still outstanding at shutdown");
        }

        ShutdownReport {
            drained,
            outstanding,
        }
    }

    /// Snapshot of the active recoveries
    pub fn active_recoveries(&self) -> Vec<RecoveryAction> {
        self.lock_active()
            .values()
            .map(|entry| entry.action.clone())
            .collect()
    }

    pub fn is_recovering(&self, service: &str) -> bool {
        self.lock_active().contains_key(service)
    }

    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }

    /// Finished recoveries, oldest first
    pub fn history(&self) -> Vec<RecoveryAction> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn report(&self) -> RecoveryReport {
        let history = self.history();
        let completed = history
            .iter()
            .filter(|a| a.status == RecoveryStatus::Completed)
            .count();
        let failed = history
            .iter()
            .filter(|a| a.status == RecoveryStatus::Failed)
            .count();
        let finished = history.len();
        let success_rate = if finished == 0 {
            0.0
        } else {
            completed as f64 / finished as f64
        };

        let mut strategies: BTreeMap<String, StrategyStats> = BTreeMap::new();
        for action in history.iter().filter(|a| !a.strategy.is_empty()) {
            let stats = strategies.entry(action.strategy.clone()).or_default();
            stats.attempts += 1;
            if action.status == RecoveryStatus::Completed {
                stats.successes += 1;
            }
        }

        let recent_failures = self
            .inner
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent();

        RecoveryReport {
            active: self.active_count(),
            finished,
            completed,
            failed,
            success_rate,
            total_failures: self.inner.failures_seen.load(Ordering::SeqCst),
            recent_failures,
            strategies,
            status: if finished == 0 {
                SystemStatus::Healthy
            } else {
                SystemStatus::from_success_rate(success_rate)
            },
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<String, ActiveRecovery>> {
        self.inner.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
