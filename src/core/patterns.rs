//! Failure history and pattern detection.
//!
//! Every failure the orchestrator accepts is appended to a bounded
//! [`FailureLog`]. The most recent `window` entries are scanned for two
//! patterns: a failure type recurring less than an hour apart on average,
//! and services that account for many of the recent failures.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::domain::{FailurePattern, SystemFailure};

/// Mean gap below which a failure type counts as recurring
const RECURRING_INTERVAL_SECS: f64 = 3600.0;

/// Bounded log of accepted failures, oldest first
#[derive(Debug)]
pub struct FailureLog {
    failures: VecDeque<SystemFailure>,
    capacity: usize,
}

impl FailureLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            failures: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Append a failure, evicting the oldest entry when full
    pub fn push(&mut self, failure: SystemFailure) {
        if self.failures.len() == self.capacity {
            self.failures.pop_front();
        }
        self.failures.push_back(failure);
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures recorded at or after `since`
    pub fn count_since(&self, since: DateTime<Utc>) -> usize {
        self.failures.iter().filter(|f| f.timestamp >= since).count()
    }

    /// Failures recorded within the last hour
    pub fn recent(&self) -> usize {
        self.count_since(Utc::now() - ChronoDuration::hours(1))
    }

    /// Scan the last `window` failures for patterns involving `latest`.
    ///
    /// `latest` must already be in the log. A pattern needs at least
    /// `min_frequency` occurrences.
    pub fn detect(&self, latest: &SystemFailure, window: usize, min_frequency: usize) -> Vec<FailurePattern> {
        let skip = self.failures.len().saturating_sub(window);
        let recent: Vec<&SystemFailure> = self.failures.iter().skip(skip).collect();
        let min_frequency = min_frequency.max(1);
        let mut patterns = Vec::new();

        let same_type: Vec<DateTime<Utc>> = recent
            .iter()
            .filter(|f| f.failure_type == latest.failure_type)
            .map(|f| f.timestamp)
            .collect();
        if same_type.len() >= min_frequency && same_type.len() > 1 {
            let gaps: Vec<f64> = same_type
                .windows(2)
                .map(|pair| (pair[1] - pair[0]).num_milliseconds().max(0) as f64 / 1000.0)
                .collect();
            let average = gaps.iter().sum::<f64>() / gaps.len() as f64;
            if average < RECURRING_INTERVAL_SECS {
                patterns.push(FailurePattern::RecurringFailure {
                    failure_type: latest.failure_type,
                    average_interval_secs: average,
                    frequency: same_type.len(),
                });
            }
        }

        let mut by_service: BTreeMap<&str, (usize, BTreeSet<&'static str>, Vec<_>)> = BTreeMap::new();
        for failure in &recent {
            let entry = by_service.entry(failure.service.as_str()).or_default();
            entry.0 += 1;
            if entry.1.insert(failure.failure_type.as_str()) {
                entry.2.push(failure.failure_type);
            }
        }
        for (service, (count, _, failure_types)) in by_service {
            if count >= min_frequency {
                patterns.push(FailurePattern::ComponentHotspot {
                    service: service.to_string(),
                    failure_count: count,
                    failure_types,
                });
            }
        }

        patterns
    }
}
