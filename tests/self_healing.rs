//! Self-Healing Integration Tests
//!
//! Drives `SelfHealingOrchestrator` against in-memory infrastructure and a
//! health monitor the test flips to healthy.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use common::{eventually, fast_healing_config, healing_harness, QueuedDetector};
use mender::core::{HandleOutcome, HealingConfig};
use mender::adapters::analytics::SystemStatus;
use mender::domain::{
    EventPayload, FailurePattern, FailureType, PredictionAlert, PreventiveAction, RecoveryStatus,
    SystemFailure,
};

fn outage(service: &str) -> SystemFailure {
    SystemFailure::new(service, FailureType::Unavailable, 0.5)
}

#[tokio::test]
async fn test_duplicate_failure_is_ignored_while_recovering() {
    let h = healing_harness("restart_service", fast_healing_config());

    let first = h.orchestrator.handle_failure(outage("api")).await.unwrap();
    assert!(matches!(first, HandleOutcome::Started { ref strategy, .. } if strategy == "restart_service"));

    let second = h.orchestrator.handle_failure(outage("api")).await.unwrap();
    assert_eq!(second, HandleOutcome::Ignored);

    assert_eq!(h.infra.calls(), vec!["restart:api"]);
    assert_eq!(h.sink.count("recovery.started"), 1);
    assert_eq!(h.sink.count("recovery.ignored"), 1);
    assert_eq!(h.orchestrator.active_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_start_one_recovery() {
    let h = healing_harness("restart_service", fast_healing_config());

    let attempts = (0..8).map(|_| {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.handle_failure(outage("db")).await })
    });
    let outcomes: Vec<HandleOutcome> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let started = outcomes
        .iter()
        .filter(|o| matches!(o, HandleOutcome::Started { .. }))
        .count();
    let ignored = outcomes
        .iter()
        .filter(|o| **o == HandleOutcome::Ignored)
        .count();
    assert_eq!(started, 1);
    assert_eq!(ignored, 7);
    assert_eq!(h.infra.calls(), vec!["restart:db"]);
}

#[tokio::test]
async fn test_recovery_completes_when_service_turns_healthy() {
    let h = healing_harness("restart_service", fast_healing_config());

    h.orchestrator.handle_failure(outage("api")).await.unwrap();
    assert!(h.orchestrator.is_recovering("api"));

    h.health.set_healthy("api");
    let orchestrator = h.orchestrator.clone();
    eventually(move || !orchestrator.is_recovering("api")).await;

    let history = h.orchestrator.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RecoveryStatus::Completed);
    assert_eq!(history[0].strategy, "restart_service");
    assert!(history[0].end_time.is_some());

    assert_eq!(h.recommender.outcomes(), vec![("api".to_string(), true)]);
    assert_eq!(h.sink.count("recovery.completed"), 1);
    assert_eq!(h.sink.count("recovery.escalation_required"), 0);

    let report = h.orchestrator.report();
    assert_eq!(report.completed, 1);
    assert_eq!(report.active, 0);
    assert_eq!(report.success_rate, 1.0);
}

#[tokio::test]
async fn test_timeout_escalates_once_and_frees_service() {
    let config = HealingConfig {
        recovery_timeout_ms: 100,
        ..fast_healing_config()
    };
    let h = healing_harness("restart_service", config);

    h.orchestrator.handle_failure(outage("api")).await.unwrap();
    let orchestrator = h.orchestrator.clone();
    eventually(move || !orchestrator.is_recovering("api")).await;

    assert_eq!(h.sink.count("recovery.escalation_required"), 1);
    assert_eq!(h.sink.count("recovery.failed"), 1);
    assert_eq!(h.sink.count("recovery.completed"), 0);

    let history = h.orchestrator.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RecoveryStatus::Failed);
    assert!(history[0].error.as_deref().unwrap().contains("100ms"));
    assert_eq!(h.recommender.outcomes(), vec![("api".to_string(), false)]);

    // Eligible again once the failed recovery is archived
    let again = h.orchestrator.handle_failure(outage("api")).await.unwrap();
    assert!(matches!(again, HandleOutcome::Started { .. }));
    assert_eq!(h.infra.calls(), vec!["restart:api", "restart:api"]);
}

#[tokio::test]
async fn test_timeout_covers_a_slow_strategy_call() {
    let config = HealingConfig {
        recovery_timeout_ms: 100,
        action_timeout_ms: 5_000,
        ..fast_healing_config()
    };
    let h = healing_harness("restart_service", config);
    h.infra.set_restart_delay(Duration::from_millis(600));

    let started = Instant::now();
    let outcome = h.orchestrator.handle_failure(outage("api")).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(300), "took {:?}", elapsed);
    match outcome {
        HandleOutcome::Failed { error, .. } => assert!(error.contains("100ms"), "{}", error),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(!h.orchestrator.is_recovering("api"));
    assert_eq!(h.sink.count("recovery.escalation_required"), 1);
    assert_eq!(h.sink.count("recovery.failed"), 1);
    assert_eq!(h.recommender.outcomes(), vec![("api".to_string(), false)]);
}

#[tokio::test]
async fn test_timeout_covers_a_hung_recommender() {
    let config = HealingConfig {
        recovery_timeout_ms: 100,
        ..fast_healing_config()
    };
    let h = healing_harness("restart_service", config);
    h.recommender.set_delay(Duration::from_secs(30));

    let started = Instant::now();
    let outcome = h.orchestrator.handle_failure(outage("api")).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(300));
    assert!(matches!(outcome, HandleOutcome::Failed { .. }));
    assert!(!h.orchestrator.is_recovering("api"));
    assert!(h.infra.calls().is_empty());
    assert_eq!(h.sink.count("recovery.started"), 0);
    assert_eq!(h.sink.count("recovery.escalation_required"), 1);
    assert_eq!(h.orchestrator.history()[0].status, RecoveryStatus::Failed);
}

#[tokio::test]
async fn test_cancel_interrupts_a_running_strategy() {
    let h = healing_harness("restart_service", fast_healing_config());
    h.infra.set_restart_delay(Duration::from_secs(30));

    let running = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move { orchestrator.handle_failure(outage("api")).await })
    };
    let infra = Arc::clone(&h.infra);
    eventually(move || !infra.calls().is_empty()).await;

    assert!(h.orchestrator.cancel_recovery("api"));
    let outcome = running.await.unwrap().unwrap();

    assert!(matches!(outcome, HandleOutcome::Failed { ref error, .. } if error.contains("cancelled")));
    assert!(!h.orchestrator.is_recovering("api"));
    assert_eq!(h.sink.count("recovery.cancelled"), 1);
    assert_eq!(h.sink.count("recovery.escalation_required"), 0);
}

#[tokio::test]
async fn test_recurring_failure_type_is_attached_to_the_recovery() {
    let h = healing_harness("restart_service", fast_healing_config());

    for service in ["api", "db", "cache"] {
        h.orchestrator.handle_failure(outage(service)).await.unwrap();
    }

    let cache = h
        .orchestrator
        .active_recoveries()
        .into_iter()
        .find(|a| a.service == "cache")
        .unwrap();
    assert!(cache.patterns.iter().any(|p| matches!(
        p,
        FailurePattern::RecurringFailure { failure_type: FailureType::Unavailable, frequency: 3, .. }
    )));

    let api = h
        .orchestrator
        .active_recoveries()
        .into_iter()
        .find(|a| a.service == "api")
        .unwrap();
    assert!(api.patterns.is_empty());

    let last_started = h
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::RecoveryStarted { service, patterns, .. } => Some((service, patterns)),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(last_started.0, "cache");
    assert_eq!(last_started.1, cache.patterns);
}

#[tokio::test]
async fn test_report_counts_failures_and_hotspots() {
    let h = healing_harness("restart_service", fast_healing_config());

    // Duplicates are ignored but still counted as failures
    for _ in 0..3 {
        h.orchestrator.handle_failure(outage("api")).await.unwrap();
    }
    h.health.set_healthy("api");
    let orchestrator = h.orchestrator.clone();
    eventually(move || !orchestrator.is_recovering("api")).await;

    let again = h
        .orchestrator
        .handle_failure(SystemFailure::new("api", FailureType::HighLatency, 0.5))
        .await
        .unwrap();
    assert!(matches!(again, HandleOutcome::Started { .. }));
    let action = h.orchestrator.active_recoveries().pop().unwrap();
    assert!(action.patterns.contains(&FailurePattern::ComponentHotspot {
        service: "api".to_string(),
        failure_count: 4,
        failure_types: vec![FailureType::Unavailable, FailureType::HighLatency],
    }));

    let orchestrator = h.orchestrator.clone();
    eventually(move || !orchestrator.is_recovering("api")).await;

    let report = h.orchestrator.report();
    assert_eq!(report.total_failures, 4);
    assert_eq!(report.recent_failures, 4);
    assert_eq!(report.completed, 2);
    assert_eq!(report.status, SystemStatus::Healthy);
    let restart = report.strategies["restart_service"];
    assert_eq!((restart.attempts, restart.successes), (2, 2));
}

#[tokio::test]
async fn test_services_recover_independently() {
    let h = healing_harness("restart_service", fast_healing_config());

    for service in ["api", "db", "cache"] {
        let outcome = h.orchestrator.handle_failure(outage(service)).await.unwrap();
        assert!(matches!(outcome, HandleOutcome::Started { .. }));
    }
    assert_eq!(h.orchestrator.active_count(), 3);

    h.health.set_healthy("db");
    let orchestrator = h.orchestrator.clone();
    eventually(move || !orchestrator.is_recovering("db")).await;
    assert!(h.orchestrator.is_recovering("api"));
    assert!(h.orchestrator.is_recovering("cache"));

    h.health.set_healthy("api");
    h.health.set_healthy("cache");
    let orchestrator = h.orchestrator.clone();
    eventually(move || orchestrator.active_count() == 0).await;
    assert_eq!(h.orchestrator.report().completed, 3);
}

#[tokio::test]
async fn test_rollback_id_is_kept_on_the_action() {
    let h = healing_harness("rollback", fast_healing_config());

    h.orchestrator.handle_failure(outage("billing")).await.unwrap();
    let active = h.orchestrator.active_recoveries();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].rollback_id.as_deref(), Some("rollback-billing"));
    assert_eq!(active[0].status, RecoveryStatus::InProgress);

    h.health.set_healthy("billing");
    let orchestrator = h.orchestrator.clone();
    eventually(move || !orchestrator.is_recovering("billing")).await;
    assert_eq!(
        h.orchestrator.history()[0].rollback_id.as_deref(),
        Some("rollback-billing")
    );
}

#[tokio::test]
async fn test_cancelled_recovery_does_not_escalate() {
    let h = healing_harness("restart_service", fast_healing_config());

    h.orchestrator.handle_failure(outage("api")).await.unwrap();
    assert!(h.orchestrator.cancel_recovery("api"));

    let orchestrator = h.orchestrator.clone();
    eventually(move || !orchestrator.is_recovering("api")).await;

    assert_eq!(h.sink.count("recovery.cancelled"), 1);
    assert_eq!(h.sink.count("recovery.escalation_required"), 0);
    assert_eq!(h.orchestrator.history()[0].status, RecoveryStatus::Failed);
    assert!(!h.orchestrator.cancel_recovery("api"));
}

#[tokio::test]
async fn test_prediction_dispatches_preventive_actions_above_threshold() {
    let h = healing_harness("restart_service", fast_healing_config());

    let quiet = h
        .orchestrator
        .handle_prediction(&PredictionAlert::new("api", 0.7))
        .await;
    assert!(quiet.is_empty());
    assert!(h.infra.calls().is_empty());

    let outcomes = h
        .orchestrator
        .handle_prediction(&PredictionAlert::new("api", 0.9))
        .await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].action, PreventiveAction::ScaleResources { factor: 1.5 });
    assert!(outcomes[0].outcome.success);

    let alert = PredictionAlert::new("db", 0.95)
        .with_action(PreventiveAction::AdjustThresholds { factor: 1.2 })
        .with_action(PreventiveAction::ScheduleMaintenance { in_minutes: 30 });
    let outcomes = h.orchestrator.handle_prediction(&alert).await;
    assert_eq!(outcomes.len(), 2);

    assert_eq!(
        h.infra.calls(),
        vec!["scale:api", "adjust_thresholds:db", "schedule_maintenance:db"]
    );
    assert_eq!(h.sink.count("prediction.preventive_action"), 3);
    assert_eq!(h.orchestrator.active_count(), 0);
}

#[tokio::test]
async fn test_detection_loop_feeds_failures_until_shutdown() {
    let h = healing_harness("restart_service", fast_healing_config());
    let detector = Arc::new(QueuedDetector::default());
    detector.push(vec![outage("api"), outage("api"), outage("db")]);

    let loop_handle = h.orchestrator.start(detector.clone());

    let infra = Arc::clone(&h.infra);
    eventually(move || infra.calls().len() == 2).await;
    assert_eq!(h.sink.count("recovery.ignored"), 1);

    h.health.set_healthy("api");
    h.health.set_healthy("db");

    let report = h.orchestrator.shutdown().await;
    assert!(report.drained);
    assert!(report.outstanding.is_empty());
    loop_handle.await.unwrap();

    let late = h.orchestrator.handle_failure(outage("api")).await.unwrap();
    assert_eq!(late, HandleOutcome::Rejected);
    assert_eq!(h.orchestrator.report().completed, 2);
}

#[tokio::test]
async fn test_shutdown_reports_outstanding_recoveries() {
    let config = HealingConfig {
        drain_timeout_ms: 50,
        ..fast_healing_config()
    };
    let h = healing_harness("restart_service", config);

    h.orchestrator.handle_failure(outage("api")).await.unwrap();
    let report = h.orchestrator.shutdown().await;

    assert!(!report.drained);
    assert_eq!(report.outstanding, vec!["api"]);
    assert!(h.orchestrator.is_recovering("api"));
}
