//! Adaptive Policy Optimizer
//!
//! Keeps each policy's confidence floor calibrated to observed outcomes
//! without manual tuning, while bounding the blast radius of any single
//! automatic change: every applied step is monitored for a window and
//! rolled back if effectiveness regresses. Threshold writes for a policy
//! are serialized; different policies tune independently.

use crate::audit::{AuditEvent, AuditEventType, AuditSink};
use crate::error::OptimizerError;
use crate::outcomes::OutcomeTracker;
use crate::store::PolicyStore;
use crate::{PolicyPerformance, TriggerSource};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

#[derive(Clone)]
pub struct OptimizerConfig {
    /// Below this many labeled applications a cycle is a reported no-op.
    pub min_applications: u64,
    pub fpr_limit: f64,
    pub fnr_limit: f64,
    /// Threshold step size, in confidence points.
    pub step: f64,
    pub monitoring_window_hours: i64,
    /// Rollback outright when effectiveness drops below this.
    pub effectiveness_floor: f64,
    /// Rollback when effectiveness regresses by more than this.
    pub regression_tolerance: f64,
    /// Sustained approval rate above which the floor may be relaxed.
    pub relaxation_approval_rate: f64,
    /// Default auto-apply behavior; overridable per policy.
    pub auto_apply: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            min_applications: 30,
            fpr_limit: 0.20,
            fnr_limit: 0.10,
            step: 5.0,
            monitoring_window_hours: 24,
            effectiveness_floor: 70.0,
            regression_tolerance: 2.0,
            relaxation_approval_rate: 0.95,
            auto_apply: true,
        }
    }
}

/// Outcome counter totals frozen at the moment a threshold change lands.
/// The monitoring verdict is computed from the delta against these, so
/// only outcomes observed under the new threshold count.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CounterBaseline {
    true_positives: u64,
    false_positives: u64,
    true_negatives: u64,
    false_negatives: u64,
    total_applications: u64,
}

impl CounterBaseline {
    fn capture(perf: &PolicyPerformance) -> Self {
        Self {
            true_positives: perf.true_positives,
            false_positives: perf.false_positives,
            true_negatives: perf.true_negatives,
            false_negatives: perf.false_negatives,
            total_applications: perf.total_applications,
        }
    }

    /// Outcomes recorded since capture. If the rolling window reset
    /// underneath us the deltas saturate to the current counters.
    fn window(&self, perf: &PolicyPerformance) -> PolicyPerformance {
        if perf.total_applications < self.total_applications {
            return perf.clone();
        }
        let mut window = PolicyPerformance::new(&perf.policy_id);
        window.true_positives = perf.true_positives.saturating_sub(self.true_positives);
        window.false_positives = perf.false_positives.saturating_sub(self.false_positives);
        window.true_negatives = perf.true_negatives.saturating_sub(self.true_negatives);
        window.false_negatives = perf.false_negatives.saturating_sub(self.false_negatives);
        window.total_applications =
            perf.total_applications.saturating_sub(self.total_applications);
        window
    }
}

/// Per-policy tuning state. Transitions not listed in
/// [`TuningState::can_transition`] are rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum TuningState {
    Stable,
    Recommending,
    Applying,
    Monitoring {
        since: DateTime<Utc>,
        baseline_effectiveness: f64,
        previous_threshold: f64,
        counters_at_apply: CounterBaseline,
    },
    RollingBack,
}

impl TuningState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Recommending => "recommending",
            Self::Applying => "applying",
            Self::Monitoring { .. } => "monitoring",
            Self::RollingBack => "rolling_back",
        }
    }

    pub fn can_transition(&self, next: &TuningState) -> bool {
        matches!(
            (self, next),
            (Self::Stable, Self::Recommending)
                | (Self::Recommending, Self::Applying)
                | (Self::Recommending, Self::Stable)
                | (Self::Applying, Self::Monitoring { .. })
                | (Self::Applying, Self::Stable)
                | (Self::Monitoring { .. }, Self::Stable)
                | (Self::Monitoring { .. }, Self::RollingBack)
                | (Self::RollingBack, Self::Stable)
        )
    }
}

#[derive(Debug, Clone)]
struct PolicyTuning {
    state: TuningState,
    auto_apply: bool,
    last_cycle: Option<DateTime<Utc>>,
    /// Labeled-outcome total when the last threshold change landed. A
    /// new recommendation requires outcomes newer than this; stale
    /// counters never re-trigger the same step.
    labeled_at_last_change: Option<u64>,
}

/// A proposed threshold change, with its rationale.
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub policy_id: String,
    pub current_threshold: f64,
    pub proposed_threshold: f64,
    pub reason: String,
    /// Set when FPR and FNR limits were breached simultaneously; the
    /// security-relaxing FNR fix takes precedence.
    pub conflict: bool,
}

/// What one optimizer cycle did for one policy.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Too few labeled applications; reported no-op, not an error.
    InsufficientData,
    NoChange,
    /// Auto-apply disabled; surfaced for an administrator.
    Recommended(Recommendation),
    Applied(Recommendation),
    Monitoring,
    RolledBack { restored_threshold: f64 },
}

pub struct PolicyOptimizer {
    store: Arc<PolicyStore>,
    outcomes: Arc<OutcomeTracker>,
    audit: Arc<dyn AuditSink>,
    config: OptimizerConfig,
    tuning: dashmap::DashMap<String, PolicyTuning>,
}

impl PolicyOptimizer {
    pub fn new(
        store: Arc<PolicyStore>,
        outcomes: Arc<OutcomeTracker>,
        audit: Arc<dyn AuditSink>,
        config: OptimizerConfig,
    ) -> Self {
        Self {
            store,
            outcomes,
            audit,
            config,
            tuning: dashmap::DashMap::new(),
        }
    }

    /// Override auto-apply for one policy.
    pub fn set_auto_apply(&self, policy_id: &str, auto_apply: bool) {
        self.tuning
            .entry(policy_id.to_string())
            .or_insert_with(|| PolicyTuning {
                state: TuningState::Stable,
                auto_apply: self.config.auto_apply,
                last_cycle: None,
                labeled_at_last_change: None,
            })
            .auto_apply = auto_apply;
    }

    pub fn state(&self, policy_id: &str) -> Option<TuningState> {
        self.tuning.get(policy_id).map(|t| t.state.clone())
    }

    /// One evaluation cycle over every active policy. The per-policy
    /// tuning entry lock serializes cycles that would touch the same
    /// policy; different policies optimize independently.
    pub fn run_cycle(&self) -> Vec<(String, CycleOutcome)> {
        let mut results = Vec::new();
        for policy in self.store.all() {
            if !policy.active {
                continue;
            }
            let outcome = match self.cycle_policy(&policy.id) {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(policy_id = %policy.id, %err, "optimizer cycle failed");
                    CycleOutcome::NoChange
                }
            };
            results.push((policy.id, outcome));
        }
        results
    }

    fn cycle_policy(&self, policy_id: &str) -> Result<CycleOutcome, OptimizerError> {
        let mut tuning = self
            .tuning
            .entry(policy_id.to_string())
            .or_insert_with(|| PolicyTuning {
                state: TuningState::Stable,
                auto_apply: self.config.auto_apply,
                last_cycle: None,
                labeled_at_last_change: None,
            });
        tuning.last_cycle = Some(Utc::now());

        match tuning.state.clone() {
            TuningState::Monitoring {
                since,
                baseline_effectiveness,
                previous_threshold,
                counters_at_apply,
            } => self.check_monitoring(
                policy_id,
                &mut tuning,
                since,
                baseline_effectiveness,
                previous_threshold,
                counters_at_apply,
            ),
            TuningState::Stable => self.recommend_and_apply(policy_id, &mut tuning),
            // Transient states are never left dangling across cycles,
            // but recover to Stable rather than wedging the policy.
            other => {
                tracing::warn!(
                    policy_id,
                    state = other.name(),
                    "optimizer found transient state at cycle start; resetting"
                );
                tuning.state = TuningState::Stable;
                Ok(CycleOutcome::NoChange)
            }
        }
    }

    fn recommend_and_apply(
        &self,
        policy_id: &str,
        tuning: &mut PolicyTuning,
    ) -> Result<CycleOutcome, OptimizerError> {
        let Some(perf) = self.outcomes.performance(policy_id) else {
            return Ok(CycleOutcome::InsufficientData);
        };
        if perf.total_applications < self.config.min_applications {
            self.audit.record(AuditEvent::optimizer(
                AuditEventType::OptimizerSkipped,
                policy_id,
                serde_json::json!({ "total_applications": perf.total_applications }),
            ));
            tracing::info!(
                policy_id,
                total = perf.total_applications,
                "insufficient outcome data; skipping cycle"
            );
            return Ok(CycleOutcome::InsufficientData);
        }

        // The rates only move when new outcomes arrive; re-acting on the
        // counters that already triggered a change would step the
        // threshold again for the same evidence.
        if tuning.labeled_at_last_change == Some(perf.total_applications) {
            tracing::debug!(
                policy_id,
                total = perf.total_applications,
                "no labeled outcomes since last threshold change"
            );
            return Ok(CycleOutcome::NoChange);
        }

        let Some(current) = self.store.get(policy_id).map(|p| p.min_confidence) else {
            return Ok(CycleOutcome::NoChange);
        };
        let Some(recommendation) = self.recommend(policy_id, current, &perf) else {
            return Ok(CycleOutcome::NoChange);
        };

        self.transition(policy_id, tuning, TuningState::Recommending)?;
        self.audit.record(AuditEvent::optimizer(
            AuditEventType::OptimizerRecommendation,
            policy_id,
            serde_json::json!({
                "current_threshold": recommendation.current_threshold,
                "proposed_threshold": recommendation.proposed_threshold,
                "reason": recommendation.reason,
                "conflict": recommendation.conflict,
            }),
        ));

        if !tuning.auto_apply {
            self.transition(policy_id, tuning, TuningState::Stable)?;
            return Ok(CycleOutcome::Recommended(recommendation));
        }

        self.transition(policy_id, tuning, TuningState::Applying)?;
        // Evolution record lands before the threshold is visible; a
        // failed append abandons the change.
        match self.store.set_threshold(
            policy_id,
            recommendation.proposed_threshold,
            &recommendation.reason,
            TriggerSource::MlModel,
        ) {
            Ok(previous_threshold) => {
                self.audit.record(AuditEvent::optimizer(
                    AuditEventType::ThresholdApplied,
                    policy_id,
                    serde_json::json!({
                        "old": previous_threshold,
                        "new": recommendation.proposed_threshold,
                    }),
                ));
                tuning.labeled_at_last_change = Some(perf.total_applications);
                self.transition(
                    policy_id,
                    tuning,
                    TuningState::Monitoring {
                        since: Utc::now(),
                        baseline_effectiveness: perf.effectiveness_score(),
                        previous_threshold,
                        counters_at_apply: CounterBaseline::capture(&perf),
                    },
                )?;
                Ok(CycleOutcome::Applied(recommendation))
            }
            Err(err) => {
                tracing::warn!(policy_id, %err, "threshold change abandoned");
                self.transition(policy_id, tuning, TuningState::Stable)?;
                Ok(CycleOutcome::NoChange)
            }
        }
    }

    /// Propose a ±step change from the measured rates. A simultaneous
    /// FPR/FNR breach is resolved in favor of the FNR fix and flagged
    /// rather than silently canceling out.
    fn recommend(
        &self,
        policy_id: &str,
        current: f64,
        perf: &PolicyPerformance,
    ) -> Option<Recommendation> {
        let fpr = perf.false_positive_rate();
        let fnr = perf.false_negative_rate();
        let fpr_breached = fpr > self.config.fpr_limit;
        let fnr_breached = fnr > self.config.fnr_limit;

        let (proposed, reason, conflict) = if fnr_breached && fpr_breached {
            tracing::warn!(
                policy_id,
                fpr,
                fnr,
                "FPR and FNR limits breached simultaneously; FNR fix takes precedence"
            );
            (
                current - self.config.step,
                format!("FNR {fnr:.2} above limit (conflicting FPR {fpr:.2} breach flagged)"),
                true,
            )
        } else if fnr_breached {
            (
                current - self.config.step,
                format!("FNR {fnr:.2} above limit; relaxing floor"),
                false,
            )
        } else if fpr_breached {
            (
                current + self.config.step,
                format!("FPR {fpr:.2} above limit; tightening floor"),
                false,
            )
        } else if perf.approval_rate() > self.config.relaxation_approval_rate {
            (
                current - self.config.step,
                format!(
                    "approval rate {:.2} sustained above {:.2}; relaxing floor",
                    perf.approval_rate(),
                    self.config.relaxation_approval_rate
                ),
                false,
            )
        } else {
            return None;
        };

        Some(Recommendation {
            policy_id: policy_id.to_string(),
            current_threshold: current,
            proposed_threshold: proposed.clamp(0.0, 100.0),
            reason,
            conflict,
        })
    }

    /// Judge an applied change on outcomes observed under it. Counters
    /// that predate the change would mask a real regression (and make a
    /// quiet policy look healthy), so the verdict uses the delta against
    /// the apply-time baseline; with no new labeled outcomes the policy
    /// stays in monitoring.
    fn check_monitoring(
        &self,
        policy_id: &str,
        tuning: &mut PolicyTuning,
        since: DateTime<Utc>,
        baseline_effectiveness: f64,
        previous_threshold: f64,
        counters_at_apply: CounterBaseline,
    ) -> Result<CycleOutcome, OptimizerError> {
        if Utc::now() - since < Duration::hours(self.config.monitoring_window_hours) {
            return Ok(CycleOutcome::Monitoring);
        }

        let Some(perf) = self.outcomes.performance(policy_id) else {
            return Ok(CycleOutcome::Monitoring);
        };
        let window = counters_at_apply.window(&perf);
        if window.total_applications == 0 {
            tracing::debug!(policy_id, "no labeled outcomes under the new threshold yet");
            return Ok(CycleOutcome::Monitoring);
        }

        let effectiveness = window.effectiveness_score();
        let regressed = effectiveness < baseline_effectiveness - self.config.regression_tolerance
            || effectiveness < self.config.effectiveness_floor;

        if !regressed {
            self.transition(policy_id, tuning, TuningState::Stable)?;
            return Ok(CycleOutcome::NoChange);
        }

        self.transition(policy_id, tuning, TuningState::RollingBack)?;
        match self.store.set_threshold(
            policy_id,
            previous_threshold,
            &format!(
                "effectiveness {effectiveness:.1} regressed from baseline {baseline_effectiveness:.1}; reverting"
            ),
            TriggerSource::AutoRollback,
        ) {
            Ok(_) => {
                self.audit.record(AuditEvent::optimizer(
                    AuditEventType::ThresholdRolledBack,
                    policy_id,
                    serde_json::json!({
                        "restored_threshold": previous_threshold,
                        "effectiveness": effectiveness,
                        "baseline": baseline_effectiveness,
                    }),
                ));
                tracing::warn!(
                    policy_id,
                    effectiveness,
                    baseline_effectiveness,
                    restored = previous_threshold,
                    "threshold change rolled back"
                );
                tuning.labeled_at_last_change = Some(perf.total_applications);
                self.transition(policy_id, tuning, TuningState::Stable)?;
                Ok(CycleOutcome::RolledBack {
                    restored_threshold: previous_threshold,
                })
            }
            Err(err) => {
                tracing::error!(policy_id, %err, "rollback write failed");
                self.transition(policy_id, tuning, TuningState::Stable)?;
                Err(err.into())
            }
        }
    }

    fn transition(
        &self,
        policy_id: &str,
        tuning: &mut PolicyTuning,
        next: TuningState,
    ) -> Result<(), OptimizerError> {
        if !tuning.state.can_transition(&next) {
            return Err(OptimizerError::IllegalTransition {
                from: tuning.state.name(),
                to: next.name(),
            });
        }
        tracing::debug!(
            policy_id,
            from = tuning.state.name(),
            to = next.name(),
            "optimizer transition"
        );
        tuning.state = next;
        Ok(())
    }
}
