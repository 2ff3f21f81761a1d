//! Policy Engine
//!
//! The synchronous request-evaluation entry point: match policies, score
//! the five trust signals, combine them under the governing policy's
//! weights, and classify into grant / step-up / deny. Every call produces
//! exactly one audited terminal decision or one validation error. Safe to
//! call concurrently; the only shared state is the read-mostly policy
//! snapshot.

use crate::audit::{AuditEvent, AuditSink};
use crate::error::EngineError;
use crate::outcomes::OutcomeTracker;
use crate::signals::SignalNormalizer;
use crate::store::PolicyStore;
use crate::{
    AccessRequest, ComponentScores, ConfidenceBreakdown, Decision, DecisionValue, Policy,
};
use chrono::Utc;
use std::sync::Arc;

pub struct PolicyEngine {
    store: Arc<PolicyStore>,
    normalizer: SignalNormalizer,
    audit: Arc<dyn AuditSink>,
    outcomes: Arc<OutcomeTracker>,
    /// Confidence at or above which a grant skips step-up.
    auto_grant_threshold: f64,
}

impl PolicyEngine {
    pub fn new(
        store: Arc<PolicyStore>,
        normalizer: SignalNormalizer,
        audit: Arc<dyn AuditSink>,
        outcomes: Arc<OutcomeTracker>,
        auto_grant_threshold: f64,
    ) -> Self {
        Self {
            store,
            normalizer,
            audit,
            outcomes,
            auto_grant_threshold,
        }
    }

    pub fn evaluate(&self, request: &AccessRequest) -> Result<Decision, EngineError> {
        if let Err(err) = validate(request) {
            let EngineError::Validation { field } = &err;
            self.audit.record(AuditEvent::validation_rejected(
                &request.id,
                &request.requester_id,
                field,
            ));
            return Err(err);
        }

        let snapshot = self.store.snapshot();
        let candidates: Vec<&Policy> = snapshot
            .iter()
            .filter(|p| p.matches_resource(&request.resource_type))
            .collect();

        if candidates.is_empty() {
            // Fail closed, and surface the coverage gap to administrators.
            tracing::warn!(
                resource_type = %request.resource_type,
                "no applicable policy for resource type"
            );
            let decision = Decision {
                request_id: request.id.clone(),
                value: DecisionValue::Deny,
                confidence: 0.0,
                breakdown: ConfidenceBreakdown::default(),
                matched_policy_ids: vec![],
                reasons: vec!["no applicable policy".to_string()],
                evaluated_at: Utc::now(),
            };
            self.audit
                .record(AuditEvent::decision(&request.requester_id, &decision));
            return Ok(decision);
        }

        // The snapshot is priority-sorted, so the first candidate with a
        // role match governs; with no role match anywhere, the highest
        // priority candidate governs and the role gate scores zero.
        let governing = candidates
            .iter()
            .find(|p| p.allows_role_for(&request.resource_type, &request.requester_role))
            .copied()
            .unwrap_or(candidates[0]);
        // Candidates are filtered on a resource match, so a rule exists.
        let Some(rule) =
            governing.governing_rule(&request.resource_type, &request.requester_role)
        else {
            let decision = Decision {
                request_id: request.id.clone(),
                value: DecisionValue::Deny,
                confidence: 0.0,
                breakdown: ConfidenceBreakdown::default(),
                matched_policy_ids: vec![governing.id.clone()],
                reasons: vec!["no applicable policy".to_string()],
                evaluated_at: Utc::now(),
            };
            self.audit
                .record(AuditEvent::decision(&request.requester_id, &decision));
            return Ok(decision);
        };

        let (components, partial) = self.normalizer.components(request, rule);
        let weighted = components.weighted(&governing.weights);
        let confidence = weighted.total().clamp(0.0, 100.0);
        let matched_policy_ids: Vec<String> =
            candidates.iter().map(|p| p.id.clone()).collect();

        let (value, reasons) = self.classify(governing, &components, confidence);
        let decision = Decision {
            request_id: request.id.clone(),
            value,
            confidence,
            breakdown: ConfidenceBreakdown {
                components,
                weighted,
                partial,
            },
            matched_policy_ids,
            reasons,
            evaluated_at: Utc::now(),
        };

        self.outcomes
            .register_decision(&request.id, &governing.id, value);
        self.audit
            .record(AuditEvent::decision(&request.requester_id, &decision));
        tracing::info!(
            request_id = %request.id,
            policy_id = %governing.id,
            confidence,
            decision = ?value,
            "request evaluated"
        );

        Ok(decision)
    }

    fn classify(
        &self,
        policy: &Policy,
        components: &ComponentScores,
        confidence: f64,
    ) -> (DecisionValue, Vec<String>) {
        // Role mismatch is a hard eligibility gate.
        if components.role == 0.0 {
            return (
                DecisionValue::Deny,
                vec!["role not permitted".to_string()],
            );
        }

        if confidence < policy.min_confidence {
            return (
                DecisionValue::Deny,
                vec![format!(
                    "confidence {confidence:.1} below policy floor {:.1}",
                    policy.min_confidence
                )],
            );
        }

        if confidence >= self.auto_grant_threshold {
            if policy.mfa_required {
                return (
                    DecisionValue::GrantWithMfa,
                    vec!["step-up required by policy".to_string()],
                );
            }
            return (
                DecisionValue::Grant,
                vec![format!("auto-approved at confidence {confidence:.1}")],
            );
        }

        (
            DecisionValue::GrantWithMfa,
            vec![format!(
                "confidence {confidence:.1} within step-up band"
            )],
        )
    }
}

fn validate(request: &AccessRequest) -> Result<(), EngineError> {
    if request.resource.trim().is_empty() {
        return Err(EngineError::Validation { field: "resource" });
    }
    if request.resource_type.trim().is_empty() {
        return Err(EngineError::Validation {
            field: "resource_type",
        });
    }
    if request.requester_role.trim().is_empty() {
        return Err(EngineError::Validation {
            field: "requester_role",
        });
    }
    Ok(())
}
