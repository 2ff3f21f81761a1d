//! Session Risk Monitor
//!
//! Recurring re-evaluation of every live session: risk is re-derived
//! from scratch each cycle from the behavioral collaborator, the session
//! lifetime is re-mapped from that risk (so remaining time can lengthen
//! as well as shorten), and threshold transitions fire idempotently. A
//! session is never re-checked concurrently with itself; contended
//! checks are skipped, not queued.

use crate::audit::{AuditEvent, AuditEventType, AuditSink, SessionNotifier};
use crate::session::SessionManager;
use crate::signals::BehavioralRiskProvider;
use crate::{SessionEvent, SessionStatus};
use chrono::{Duration, Utc};
use std::sync::Arc;

/// Risk band at or above which the session is terminated outright.
pub const TERMINATE_RISK: f64 = 80.0;
/// Risk band requiring re-authentication before further protected actions.
pub const REAUTH_RISK: f64 = 61.0;
/// Below this band a pending re-auth flag is cleared.
pub const RESUME_RISK: f64 = 31.0;

/// Maximum session lifetime for a risk score. Monotonically
/// non-increasing in risk.
pub fn duration_for(risk: f64) -> Duration {
    if risk < 30.0 {
        Duration::hours(8)
    } else if risk < 61.0 {
        Duration::hours(2)
    } else if risk < 80.0 {
        Duration::minutes(30)
    } else {
        Duration::minutes(15)
    }
}

/// What one re-check did to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckAction {
    Terminated,
    ReauthRequired,
    Monitored,
    Resumed,
}

#[derive(Debug, Clone)]
pub struct CheckReport {
    pub session_id: String,
    pub risk: f64,
    pub action: CheckAction,
    pub duration_changed: bool,
}

pub struct SessionRiskMonitor {
    sessions: Arc<SessionManager>,
    behavioral: Arc<dyn BehavioralRiskProvider>,
    notifier: Arc<dyn SessionNotifier>,
    audit: Arc<dyn AuditSink>,
    interval_secs: u64,
}

impl SessionRiskMonitor {
    pub fn new(
        sessions: Arc<SessionManager>,
        behavioral: Arc<dyn BehavioralRiskProvider>,
        notifier: Arc<dyn SessionNotifier>,
        audit: Arc<dyn AuditSink>,
        interval_secs: u64,
    ) -> Self {
        Self {
            sessions,
            behavioral,
            notifier,
            audit,
            interval_secs,
        }
    }

    /// Recurring loop; ticks that fall behind are skipped.
    pub async fn run(&self) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.tick();
        }
    }

    /// One monitoring pass over every live session.
    pub fn tick(&self) -> Vec<CheckReport> {
        for id in self.sessions.expire_overdue() {
            if let Some(session) = self.sessions.get(&id) {
                self.audit.record(AuditEvent::session(
                    AuditEventType::SessionExpired,
                    &id,
                    &session.user_id,
                    serde_json::Value::Null,
                ));
            }
            self.notifier.notify(&id, SessionEvent::Expired);
        }

        let mut reports = Vec::new();
        for id in self.sessions.live_session_ids() {
            if let Some(report) = self.check_session(&id) {
                reports.push(report);
            }
        }

        for user_id in self.sessions.live_user_ids() {
            for id in self.sessions.detect_impossible_travel(&user_id) {
                self.audit.record(AuditEvent::session(
                    AuditEventType::SessionFlagged,
                    &id,
                    &user_id,
                    serde_json::json!({ "reason": "impossible travel" }),
                ));
                self.notifier.notify(&id, SessionEvent::VerificationRequired);
            }
        }

        reports
    }

    /// Re-score one session and apply the mapped transition. Returns
    /// `None` when the session is gone, no longer live, or already being
    /// checked (the check is skipped, not queued).
    pub fn check_session(&self, session_id: &str) -> Option<CheckReport> {
        let lock = self.sessions.check_lock(session_id);
        let _guard = lock.try_lock()?;

        let session = self.sessions.get(session_id)?;
        if !session.status.is_live() {
            return None;
        }

        // Risk is re-derived from scratch; with no fresh signal the
        // previous score carries over unchanged.
        let risk = self
            .behavioral
            .risk_score(&session.user_id)
            .unwrap_or(session.risk_score);
        let previous_risk = session.risk_score;
        let user_id = session.user_id.clone();
        let duration_changed = duration_for(risk) != duration_for(previous_risk);

        if risk >= TERMINATE_RISK {
            let reason = format!("risk {risk:.1} at or above termination threshold");
            self.sessions.terminate(session_id, &reason);
            self.audit.record(AuditEvent::session(
                AuditEventType::SessionTerminated,
                session_id,
                &user_id,
                serde_json::json!({ "risk": risk, "reason": reason }),
            ));
            self.notifier.notify(session_id, SessionEvent::Terminated);
            return Some(CheckReport {
                session_id: session_id.to_string(),
                risk,
                action: CheckAction::Terminated,
                duration_changed,
            });
        }

        let new_expiry = Utc::now() + duration_for(risk);
        let action = self
            .sessions
            .with_session_mut(session_id, |s| {
                s.risk_score = risk;
                s.expires_at = new_expiry;

                if risk >= REAUTH_RISK {
                    if !s.reauth_required {
                        s.reauth_required = true;
                        return CheckAction::ReauthRequired;
                    }
                    CheckAction::Monitored
                } else if risk < RESUME_RISK {
                    if s.reauth_required && s.status == SessionStatus::Active {
                        s.reauth_required = false;
                        return CheckAction::Resumed;
                    }
                    CheckAction::Monitored
                } else {
                    CheckAction::Monitored
                }
            })?;

        match action {
            CheckAction::ReauthRequired => {
                self.audit.record(AuditEvent::session(
                    AuditEventType::SessionReauthRequired,
                    session_id,
                    &user_id,
                    serde_json::json!({ "risk": risk }),
                ));
                self.notifier.notify(session_id, SessionEvent::ReauthRequired);
            }
            CheckAction::Resumed => {
                self.notifier.notify(session_id, SessionEvent::ReauthCleared);
            }
            CheckAction::Monitored => {
                tracing::debug!(session_id, risk, "session re-checked");
            }
            CheckAction::Terminated => unreachable!("terminated sessions return early"),
        }

        if duration_changed {
            self.audit.record(AuditEvent::session(
                AuditEventType::SessionDurationAdjusted,
                session_id,
                &user_id,
                serde_json::json!({ "risk": risk, "expires_at": new_expiry }),
            ));
            self.notifier
                .notify(session_id, SessionEvent::DurationAdjusted);
        }

        Some(CheckReport {
            session_id: session_id.to_string(),
            risk,
            action,
            duration_changed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use parking_lot::Mutex;

    struct ScriptedRisk(Mutex<Vec<f64>>);

    impl ScriptedRisk {
        fn new(scores: Vec<f64>) -> Self {
            Self(Mutex::new(scores))
        }
    }

    impl BehavioralRiskProvider for ScriptedRisk {
        fn risk_score(&self, _subject: &str) -> Option<f64> {
            let mut scores = self.0.lock();
            if scores.len() > 1 {
                Some(scores.remove(0))
            } else {
                scores.first().copied()
            }
        }
    }

    struct RecordingNotifier(Mutex<Vec<(String, SessionEvent)>>);

    impl SessionNotifier for RecordingNotifier {
        fn notify(&self, session_id: &str, event: SessionEvent) {
            self.0.lock().push((session_id.to_string(), event));
        }
    }

    fn monitor_with(
        scores: Vec<f64>,
        initial_risk: f64,
    ) -> (SessionRiskMonitor, Arc<SessionManager>, Arc<RecordingNotifier>, String) {
        let sessions = Arc::new(SessionManager::new());
        let session = sessions.create(
            "alice",
            Some("laptop".into()),
            None,
            initial_risk,
            duration_for(initial_risk),
        );
        let notifier = Arc::new(RecordingNotifier(Mutex::new(vec![])));
        let monitor = SessionRiskMonitor::new(
            sessions.clone(),
            Arc::new(ScriptedRisk::new(scores)),
            notifier.clone(),
            Arc::new(InMemoryAuditSink::new()),
            30,
        );
        (monitor, sessions, notifier, session.id)
    }

    #[test]
    fn test_duration_mapping() {
        assert_eq!(duration_for(0.0), Duration::hours(8));
        assert_eq!(duration_for(29.9), Duration::hours(8));
        assert_eq!(duration_for(30.0), Duration::hours(2));
        assert_eq!(duration_for(60.9), Duration::hours(2));
        assert_eq!(duration_for(61.0), Duration::minutes(30));
        assert_eq!(duration_for(79.9), Duration::minutes(30));
        assert_eq!(duration_for(80.0), Duration::minutes(15));
        assert_eq!(duration_for(100.0), Duration::minutes(15));
    }

    #[test]
    fn test_duration_monotonic_in_risk() {
        let samples = [0.0, 10.0, 29.9, 30.0, 45.0, 60.9, 61.0, 79.9, 80.0, 95.0];
        for pair in samples.windows(2) {
            assert!(duration_for(pair[0]) >= duration_for(pair[1]));
        }
    }

    #[test]
    fn test_scenario_d_escalation_sequence() {
        // risk 20 -> 75 -> 85: 8h lifetime, then reauth, then terminate.
        let (monitor, sessions, notifier, id) = monitor_with(vec![20.0, 75.0, 85.0], 20.0);

        let first = monitor.check_session(&id).unwrap();
        assert_eq!(first.action, CheckAction::Monitored);
        let session = sessions.get(&id).unwrap();
        let remaining = session.expires_at - Utc::now();
        assert!(remaining > Duration::hours(7));
        assert!(!session.reauth_required);

        let second = monitor.check_session(&id).unwrap();
        assert_eq!(second.action, CheckAction::ReauthRequired);
        assert!(second.duration_changed);
        let session = sessions.get(&id).unwrap();
        assert!(session.reauth_required);
        assert!(session.expires_at - Utc::now() <= Duration::minutes(30));

        let third = monitor.check_session(&id).unwrap();
        assert_eq!(third.action, CheckAction::Terminated);
        let session = sessions.get(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Terminated);

        let events: Vec<SessionEvent> =
            notifier.0.lock().iter().map(|(_, e)| *e).collect();
        assert_eq!(
            events,
            vec![
                SessionEvent::ReauthRequired,
                SessionEvent::DurationAdjusted,
                SessionEvent::Terminated,
            ]
        );
    }

    #[test]
    fn test_risk_drop_lengthens_session() {
        let (monitor, sessions, _, id) = monitor_with(vec![75.0, 10.0], 75.0);

        monitor.check_session(&id).unwrap();
        let short = sessions.get(&id).unwrap().expires_at;

        let report = monitor.check_session(&id).unwrap();
        assert_eq!(report.action, CheckAction::Resumed);
        let long = sessions.get(&id).unwrap().expires_at;
        assert!(long > short);
        assert!(!sessions.get(&id).unwrap().reauth_required);
    }

    #[test]
    fn test_reauth_transition_is_idempotent() {
        let (monitor, _, notifier, id) = monitor_with(vec![70.0], 70.0);

        let first = monitor.check_session(&id).unwrap();
        assert_eq!(first.action, CheckAction::ReauthRequired);
        let second = monitor.check_session(&id).unwrap();
        assert_eq!(second.action, CheckAction::Monitored);

        let reauth_events = notifier
            .0
            .lock()
            .iter()
            .filter(|(_, e)| *e == SessionEvent::ReauthRequired)
            .count();
        assert_eq!(reauth_events, 1);
    }

    #[test]
    fn test_contended_check_is_skipped() {
        let (monitor, sessions, _, id) = monitor_with(vec![20.0], 20.0);
        let lock = sessions.check_lock(&id);
        let _held = lock.lock();
        assert!(monitor.check_session(&id).is_none());
    }

    #[test]
    fn test_no_signal_carries_previous_risk() {
        let (monitor, _, _, id) = monitor_with(vec![], 40.0);
        let report = monitor.check_session(&id).unwrap();
        assert_eq!(report.risk, 40.0);
    }

    #[test]
    fn test_tick_expires_overdue_sessions() {
        let sessions = Arc::new(SessionManager::new());
        let session = sessions.create("bob", None, None, 20.0, Duration::seconds(-1));
        let notifier = Arc::new(RecordingNotifier(Mutex::new(vec![])));
        let monitor = SessionRiskMonitor::new(
            sessions.clone(),
            Arc::new(ScriptedRisk::new(vec![20.0])),
            notifier.clone(),
            Arc::new(InMemoryAuditSink::new()),
            30,
        );

        monitor.tick();
        assert_eq!(
            sessions.get(&session.id).unwrap().status,
            SessionStatus::Expired
        );
        assert!(notifier
            .0
            .lock()
            .iter()
            .any(|(_, e)| *e == SessionEvent::Expired));
    }
}
