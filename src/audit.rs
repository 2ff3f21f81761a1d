//! Audit trail
//!
//! Every evaluation, outcome label, optimizer action and session
//! transition produces one audit event. Recording is fire-and-forget:
//! sink failures are logged, never propagated into the decision path.

use crate::{Decision, DecisionValue, OutcomeLabel, SessionEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    AccessGranted,
    AccessStepUp,
    AccessDenied,
    ValidationRejected,
    OutcomeRecorded,
    OptimizerRecommendation,
    OptimizerSkipped,
    ThresholdApplied,
    ThresholdRolledBack,
    SessionCreated,
    SessionDurationAdjusted,
    SessionReauthRequired,
    SessionFlagged,
    SessionTerminated,
    SessionExpired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub policy_id: Option<String>,
    pub decision: Option<DecisionValue>,
    pub payload: serde_json::Value,
}

impl AuditEvent {
    fn base(event_type: AuditEventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            request_id: None,
            user_id: None,
            session_id: None,
            policy_id: None,
            decision: None,
            payload: serde_json::Value::Null,
        }
    }

    /// Terminal decision event, with the full breakdown for audit.
    pub fn decision(requester_id: &str, decision: &Decision) -> Self {
        let event_type = match decision.value {
            DecisionValue::Grant => AuditEventType::AccessGranted,
            DecisionValue::GrantWithMfa => AuditEventType::AccessStepUp,
            DecisionValue::Deny => AuditEventType::AccessDenied,
        };
        Self {
            request_id: Some(decision.request_id.clone()),
            user_id: Some(requester_id.to_string()),
            policy_id: decision.matched_policy_ids.first().cloned(),
            decision: Some(decision.value),
            payload: serde_json::json!({
                "confidence": decision.confidence,
                "breakdown": decision.breakdown,
                "matched_policy_ids": decision.matched_policy_ids,
                "reasons": decision.reasons,
            }),
            ..Self::base(event_type)
        }
    }

    pub fn validation_rejected(request_id: &str, requester_id: &str, field: &str) -> Self {
        Self {
            request_id: Some(request_id.to_string()),
            user_id: Some(requester_id.to_string()),
            payload: serde_json::json!({ "missing_field": field }),
            ..Self::base(AuditEventType::ValidationRejected)
        }
    }

    pub fn outcome(request_id: &str, label: OutcomeLabel) -> Self {
        Self {
            request_id: Some(request_id.to_string()),
            payload: serde_json::json!({ "label": label }),
            ..Self::base(AuditEventType::OutcomeRecorded)
        }
    }

    pub fn optimizer(event_type: AuditEventType, policy_id: &str, payload: serde_json::Value) -> Self {
        Self {
            policy_id: Some(policy_id.to_string()),
            payload,
            ..Self::base(event_type)
        }
    }

    pub fn session(
        event_type: AuditEventType,
        session_id: &str,
        user_id: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            user_id: Some(user_id.to_string()),
            payload,
            ..Self::base(event_type)
        }
    }
}

/// Fire-and-forget audit collaborator. Implementations must not block or
/// fail the decision path; internal failures are logged via `tracing`.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Best-effort push of session lifecycle events to a live client.
pub trait SessionNotifier: Send + Sync {
    fn notify(&self, session_id: &str, event: SessionEvent);
}

/// In-memory sink with a query surface, for embedding and tests.
pub struct InMemoryAuditSink {
    events: dashmap::DashMap<String, AuditEvent>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self {
            events: dashmap::DashMap::new(),
        }
    }

    pub fn query(&self, query: AuditQuery) -> Vec<AuditEvent> {
        let mut events: Vec<AuditEvent> = self
            .events
            .iter()
            .filter(|e| {
                if let Some(user_id) = &query.user_id {
                    if e.user_id.as_ref() != Some(user_id) {
                        return false;
                    }
                }
                if let Some(request_id) = &query.request_id {
                    if e.request_id.as_ref() != Some(request_id) {
                        return false;
                    }
                }
                if !query.event_types.is_empty() && !query.event_types.contains(&e.event_type) {
                    return false;
                }
                true
            })
            .map(|e| e.clone())
            .collect();
        events.sort_by_key(|e| e.timestamp);
        events.truncate(query.limit);
        events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            event_type = ?event.event_type,
            request_id = ?event.request_id,
            session_id = ?event.session_id,
            "audit event"
        );
        self.events.insert(event.id.clone(), event);
    }
}

/// Notifier that only logs; useful when no push channel is wired up.
pub struct LoggingNotifier;

impl SessionNotifier for LoggingNotifier {
    fn notify(&self, session_id: &str, event: SessionEvent) {
        tracing::info!(session_id, event = ?event, "session event");
    }
}

pub struct AuditQuery {
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub event_types: Vec<AuditEventType>,
    pub limit: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            user_id: None,
            request_id: None,
            event_types: Vec::new(),
            limit: 100,
        }
    }
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_by_type() {
        let sink = InMemoryAuditSink::new();
        sink.record(AuditEvent::outcome("r1", OutcomeLabel::Legitimate));
        sink.record(AuditEvent::validation_rejected("r2", "bob", "resource_type"));

        let outcomes = sink.query(AuditQuery {
            event_types: vec![AuditEventType::OutcomeRecorded],
            ..AuditQuery::new()
        });
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].request_id.as_deref(), Some("r1"));
    }

    #[test]
    fn test_default_query_returns_events() {
        let sink = InMemoryAuditSink::new();
        sink.record(AuditEvent::outcome("r1", OutcomeLabel::Legitimate));
        sink.record(AuditEvent::outcome("r2", OutcomeLabel::Malicious));

        let events = sink.query(AuditQuery::default());
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_trigger_source_serialization() {
        let json = serde_json::to_string(&crate::TriggerSource::MlModel).unwrap();
        assert_eq!(json, "\"ml_model\"");
        let json = serde_json::to_string(&crate::TriggerSource::AutoRollback).unwrap();
        assert_eq!(json, "\"auto_rollback\"");
    }
}
