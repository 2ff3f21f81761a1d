//! Outcome Tracker
//!
//! Records each decision and its eventual ground-truth label, and keeps
//! per-policy performance counters on a rolling monthly window. These
//! counters are the optimizer's only input.

use crate::{DecisionValue, OutcomeLabel, PolicyPerformance};
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
pub struct RecordedDecision {
    pub request_id: String,
    pub policy_id: String,
    pub decision: DecisionValue,
    pub decided_at: DateTime<Utc>,
}

pub struct OutcomeTracker {
    decisions: dashmap::DashMap<String, RecordedDecision>,
    performance: dashmap::DashMap<String, PolicyPerformance>,
    window: Duration,
}

impl OutcomeTracker {
    pub fn new() -> Self {
        Self::with_window(Duration::days(30))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            decisions: dashmap::DashMap::new(),
            performance: dashmap::DashMap::new(),
            window,
        }
    }

    fn is_fresh(&self, perf: &PolicyPerformance) -> bool {
        Utc::now() - perf.window_start <= self.window
    }

    /// Called by the engine at evaluation time, keyed by request id.
    pub fn register_decision(&self, request_id: &str, policy_id: &str, decision: DecisionValue) {
        self.decisions.insert(
            request_id.to_string(),
            RecordedDecision {
                request_id: request_id.to_string(),
                policy_id: policy_id.to_string(),
                decision,
                decided_at: Utc::now(),
            },
        );
    }

    /// Classify a labeled outcome into the governing policy's counters.
    /// Returns false when the request id is unknown.
    pub fn record_outcome(&self, request_id: &str, label: OutcomeLabel) -> bool {
        let Some(recorded) = self.decisions.get(request_id).map(|d| d.clone()) else {
            return false;
        };

        let mut perf = self
            .performance
            .entry(recorded.policy_id.clone())
            .or_insert_with(|| PolicyPerformance::new(&recorded.policy_id));

        // Rolling monthly window: stale counters reset before recording.
        if !self.is_fresh(&perf) {
            *perf = PolicyPerformance::new(&recorded.policy_id);
        }

        let granted = recorded.decision.is_grant();
        match label {
            OutcomeLabel::Legitimate => {
                if granted {
                    perf.true_positives += 1;
                } else {
                    perf.false_negatives += 1;
                }
                perf.total_applications += 1;
            }
            OutcomeLabel::Malicious => {
                if granted {
                    perf.false_positives += 1;
                } else {
                    perf.true_negatives += 1;
                }
                perf.total_applications += 1;
            }
            OutcomeLabel::Unknown => {
                perf.unlabeled += 1;
            }
        }

        debug_assert_eq!(
            perf.true_positives + perf.false_positives + perf.true_negatives
                + perf.false_negatives,
            perf.total_applications
        );
        true
    }

    /// Counters whose window has aged out without a new outcome are
    /// withheld from readers, the same as having no data.
    pub fn performance(&self, policy_id: &str) -> Option<PolicyPerformance> {
        self.performance
            .get(policy_id)
            .map(|p| p.clone())
            .filter(|p| self.is_fresh(p))
    }

    pub fn all_performance(&self) -> Vec<PolicyPerformance> {
        self.performance
            .iter()
            .filter(|p| self.is_fresh(p))
            .map(|p| p.clone())
            .collect()
    }

    pub fn decision_for(&self, request_id: &str) -> Option<RecordedDecision> {
        self.decisions.get(request_id).map(|d| d.clone())
    }
}

impl Default for OutcomeTracker {
    fn default() -> Self {
        Self::new()
    }
}
