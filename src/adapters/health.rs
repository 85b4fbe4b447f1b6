//! Health registry and the fault detector built on it.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::domain::{FailureType, HealthReport, HealthState, SystemFailure};

use super::{FaultDetector, HealthCheckable, HealthMonitor};

const DEFAULT_ERROR_THRESHOLD: u64 = 10;

/// Named [`HealthCheckable`] components
#[derive(Default)]
pub struct ComponentHealthMonitor {
    components: RwLock<BTreeMap<String, Arc<dyn HealthCheckable>>>,
}

impl ComponentHealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a component under `service`
    pub fn register(&self, service: impl Into<String>, component: Arc<dyn HealthCheckable>) {
        self.components
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.into(), component);
    }

    pub fn unregister(&self, service: &str) -> bool {
        self.components
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service)
            .is_some()
    }

    pub fn services(&self) -> Vec<String> {
        self.components
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn component(&self, service: &str) -> Option<Arc<dyn HealthCheckable>> {
        self.components
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }
}

#[async_trait]
impl HealthMonitor for ComponentHealthMonitor {
    /// A failing health check is reported as unhealthy, not as an error
    async fn check_service(&self, service: &str) -> Result<HealthReport> {
        let component = self
            .component(service)
            .ok_or_else(|| anyhow::anyhow!("No health check registered for '{}'", service))?;

        match component.health_check().await {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!(service = %service, error = %e, "Health check failed");
                Ok(HealthReport::unhealthy(1, format!("{:#}", e)))
            }
        }
    }
}

/// Turns unhealthy or degraded reports into [`SystemFailure`]s
pub struct HealthFaultDetector {
    monitor: Arc<ComponentHealthMonitor>,
    error_threshold: u64,
}

impl HealthFaultDetector {
    pub fn new(monitor: Arc<ComponentHealthMonitor>) -> Self {
        Self {
            monitor,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
        }
    }

    /// Error count above which an unhealthy service is classed as high-error-rate
    pub fn with_error_threshold(mut self, threshold: u64) -> Self {
        self.error_threshold = threshold;
        self
    }

    fn classify(&self, service: &str, report: &HealthReport) -> Option<SystemFailure> {
        let (failure_type, impact) = match report.status {
            HealthState::Healthy => return None,
            HealthState::Degraded => (FailureType::HighLatency, 0.5),
            HealthState::Unhealthy if report.error_count > self.error_threshold => {
                (FailureType::HighErrorRate, 0.7)
            }
            HealthState::Unhealthy => (FailureType::Unavailable, 0.9),
        };

        Some(
            SystemFailure::new(service, failure_type, impact)
                .with_metric("error_count", report.error_count as f64),
        )
    }
}

#[async_trait]
impl FaultDetector for HealthFaultDetector {
    async fn detect(&self) -> Result<Vec<SystemFailure>> {
        let mut failures = Vec::new();
        for service in self.monitor.services() {
            let report = self.monitor.check_service(&service).await?;
            if let Some(failure) = self.classify(&service, &report) {
                debug!(service = %service, failure_type = %failure.failure_type, "Fault detected");
                failures.push(failure);
            }
        }
        Ok(failures)
    }
}
