//! In-memory fakes of the external contracts, shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use mender::adapters::{
    FaultDetector, HealthMonitor, Infrastructure, RollbackExecutor, StepExecutor,
    StrategyRecommender,
};
use mender::core::{
    CircuitBreakerConfig, CircuitBreakerRegistry, EventBus, HealingConfig, LeafStep,
    MemorySink, RecoveryManager, SelfHealingOrchestrator,
};
use mender::domain::{ExecutionContext, HealthReport, SystemFailure};

/// `work` sleeps `params.ms` (default 20) and returns its id; `fail`
/// sleeps then errors
#[derive(Default)]
pub struct WorkExecutor {
    pub calls: AtomicUsize,
}

#[async_trait]
impl StepExecutor for WorkExecutor {
    fn name(&self) -> &str {
        "work"
    }

    fn can_execute(&self, step: &LeafStep) -> bool {
        matches!(step.action.as_str(), "work" | "fail")
    }

    async fn execute(&self, step: &LeafStep, _: &ExecutionContext, _: Duration) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ms = step.params.get("ms").and_then(Value::as_u64).unwrap_or(20);
        tokio::time::sleep(Duration::from_millis(ms)).await;

        if step.action == "fail" {
            anyhow::bail!("{} broke", step.spec.id);
        }
        Ok(json!({ "id": step.spec.id }))
    }
}

/// Records every remediation call as `<call>:<service>`; restarts take
/// `restart_delay`
#[derive(Default)]
pub struct FakeInfra {
    pub calls: Mutex<Vec<String>>,
    restart_delay: Mutex<Duration>,
}

impl FakeInfra {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_restart_delay(&self, delay: Duration) {
        *self.restart_delay.lock().unwrap() = delay;
    }

    fn record(&self, call: &str, service: &str) {
        self.calls.lock().unwrap().push(format!("{}:{}", call, service));
    }
}

#[async_trait]
impl Infrastructure for FakeInfra {
    async fn restart_service(&self, service: &str) -> Result<()> {
        self.record("restart", service);
        let delay = *self.restart_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        Ok(())
    }

    async fn scale(&self, service: &str, _: f64) -> Result<()> {
        self.record("scale", service);
        Ok(())
    }

    async fn failover(&self, service: &str) -> Result<()> {
        self.record("failover", service);
        Ok(())
    }

    async fn adjust_thresholds(&self, service: &str, _: f64) -> Result<()> {
        self.record("adjust_thresholds", service);
        Ok(())
    }

    async fn schedule_maintenance(&self, service: &str, _: u64) -> Result<()> {
        self.record("schedule_maintenance", service);
        Ok(())
    }
}

pub struct FakeRollback;

#[async_trait]
impl RollbackExecutor for FakeRollback {
    async fn rollback(&self, service: &str, _: &SystemFailure) -> Result<String> {
        Ok(format!("rollback-{}", service))
    }
}

/// Services are unhealthy until marked healthy
#[derive(Default)]
pub struct SwitchableHealth {
    healthy: Mutex<HashSet<String>>,
}

impl SwitchableHealth {
    pub fn set_healthy(&self, service: &str) {
        self.healthy.lock().unwrap().insert(service.to_string());
    }
}

#[async_trait]
impl HealthMonitor for SwitchableHealth {
    async fn check_service(&self, service: &str) -> Result<HealthReport> {
        if self.healthy.lock().unwrap().contains(service) {
            Ok(HealthReport::healthy())
        } else {
            Ok(HealthReport::unhealthy(3, "not responding"))
        }
    }
}

/// Always recommends the same strategy after `delay`; records feedback
pub struct FixedRecommender {
    strategy: String,
    delay: Mutex<Duration>,
    pub outcomes: Mutex<Vec<(String, bool)>>,
}

impl FixedRecommender {
    pub fn new(strategy: &str) -> Self {
        Self {
            strategy: strategy.to_string(),
            delay: Mutex::new(Duration::ZERO),
            outcomes: Mutex::new(Vec::new()),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn outcomes(&self) -> Vec<(String, bool)> {
        self.outcomes.lock().unwrap().clone()
    }
}

#[async_trait]
impl StrategyRecommender for FixedRecommender {
    async fn recommend(&self, _: &SystemFailure) -> Result<String> {
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        Ok(self.strategy.clone())
    }

    async fn record_outcome(&self, failure: &SystemFailure, _: &str, success: bool) -> Result<()> {
        self.outcomes
            .lock()
            .unwrap()
            .push((failure.service.clone(), success));
        Ok(())
    }
}

/// Emits each queued batch once, then nothing
#[derive(Default)]
pub struct QueuedDetector {
    batches: Mutex<Vec<Vec<SystemFailure>>>,
}

impl QueuedDetector {
    pub fn push(&self, failures: Vec<SystemFailure>) {
        self.batches.lock().unwrap().push(failures);
    }
}

#[async_trait]
impl FaultDetector for QueuedDetector {
    async fn detect(&self) -> Result<Vec<SystemFailure>> {
        let mut batches = self.batches.lock().unwrap();
        if batches.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(batches.remove(0))
        }
    }
}

/// Everything a self-healing test needs to poke at
pub struct HealingHarness {
    pub orchestrator: SelfHealingOrchestrator,
    pub infra: Arc<FakeInfra>,
    pub health: Arc<SwitchableHealth>,
    pub recommender: Arc<FixedRecommender>,
    pub sink: Arc<MemorySink>,
}

pub fn fast_healing_config() -> HealingConfig {
    HealingConfig {
        monitoring_interval_ms: 10,
        recovery_timeout_ms: 2_000,
        drain_timeout_ms: 500,
        action_timeout_ms: 500,
        ..Default::default()
    }
}

pub fn healing_harness(strategy: &str, config: HealingConfig) -> HealingHarness {
    let events = EventBus::new();
    let sink = MemorySink::new();
    events.add_sink(sink.clone());

    let breakers = Arc::new(
        CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), events.clone()).unwrap(),
    );
    let infra = Arc::new(FakeInfra::default());
    let health = Arc::new(SwitchableHealth::default());
    let recommender = Arc::new(FixedRecommender::new(strategy));

    let recovery = RecoveryManager::new(
        infra.clone(),
        Arc::new(FakeRollback),
        Arc::clone(&breakers),
        config.clone(),
    );
    let orchestrator = SelfHealingOrchestrator::new(
        config,
        recovery,
        recommender.clone(),
        health.clone(),
        breakers,
        events,
    );

    HealingHarness {
        orchestrator,
        infra,
        health,
        recommender,
        sink,
    }
}

/// Poll `condition` every 5ms for up to two seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within two seconds");
}

