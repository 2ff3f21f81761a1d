//! Session management
//!
//! Lifecycle of live authenticated contexts: created at grant, mutated
//! by the risk monitor and the activity-recording surface, destroyed on
//! logout, expiry or termination. Also detects physically-impossible
//! concurrent sessions for the same user.

use crate::{ActiveSession, ActivityEntry, GeoPoint, SessionStatus};
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Separation beyond which two concurrent sessions are flagged.
const IMPOSSIBLE_TRAVEL_KM: f64 = 100.0;
/// Both sessions must have been active within this window.
const CONCURRENCY_WINDOW_MINS: i64 = 5;

pub struct SessionManager {
    sessions: dashmap::DashMap<String, ActiveSession>,
    user_sessions: dashmap::DashMap<String, HashSet<String>>,
    /// Per-session re-check locks; a contended check is skipped.
    check_locks: dashmap::DashMap<String, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: dashmap::DashMap::new(),
            user_sessions: dashmap::DashMap::new(),
            check_locks: dashmap::DashMap::new(),
        }
    }

    /// Create a session whose initial lifetime is derived from the
    /// current risk score.
    pub fn create(
        &self,
        user_id: &str,
        device: Option<String>,
        location: Option<GeoPoint>,
        risk: f64,
        lifetime: Duration,
    ) -> ActiveSession {
        let now = Utc::now();
        let session = ActiveSession {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            device,
            location,
            created_at: now,
            last_activity: now,
            risk_score: risk,
            expires_at: now + lifetime,
            timeline: vec![],
            reauth_required: false,
            status: SessionStatus::Active,
            termination_reason: None,
        };

        self.sessions.insert(session.id.clone(), session.clone());
        self.user_sessions
            .entry(user_id.to_string())
            .or_default()
            .insert(session.id.clone());

        tracing::info!(
            session_id = %session.id,
            user_id,
            risk,
            expires_at = %session.expires_at,
            "session created"
        );
        session
    }

    pub fn get(&self, session_id: &str) -> Option<ActiveSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Live (active or flagged) sessions for a user.
    pub fn user_sessions(&self, user_id: &str) -> Vec<ActiveSession> {
        self.user_sessions
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.sessions.get(id))
                    .filter(|s| s.status.is_live())
                    .map(|s| s.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn live_session_ids(&self) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|s| s.status.is_live())
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn live_user_ids(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.status.is_live())
            .map(|s| s.user_id.clone())
            .collect();
        users.sort();
        users.dedup();
        users
    }

    /// Append to the activity timeline and bump `last_activity`.
    pub fn record_activity(&self, session_id: &str, action: &str) -> bool {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        if !session.status.is_live() {
            return false;
        }
        let now = Utc::now();
        let risk = session.risk_score;
        session.timeline.push(ActivityEntry {
            timestamp: now,
            action: action.to_string(),
            risk_at_time: risk,
        });
        session.last_activity = now;
        true
    }

    /// Run `f` against the session under its map entry lock.
    pub fn with_session_mut<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut ActiveSession) -> R,
    ) -> Option<R> {
        self.sessions.get_mut(session_id).map(|mut s| f(&mut s))
    }

    pub fn logout(&self, session_id: &str) -> bool {
        self.close(session_id, SessionStatus::LoggedOut, None)
    }

    pub fn terminate(&self, session_id: &str, reason: &str) -> bool {
        self.close(session_id, SessionStatus::Terminated, Some(reason.to_string()))
    }

    fn close(&self, session_id: &str, status: SessionStatus, reason: Option<String>) -> bool {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        if !session.status.is_live() {
            return false;
        }
        session.status = status;
        session.termination_reason = reason;
        let user_id = session.user_id.clone();
        drop(session);

        if let Some(mut ids) = self.user_sessions.get_mut(&user_id) {
            ids.remove(session_id);
        }
        self.check_locks.remove(session_id);
        tracing::info!(session_id, status = ?status, "session closed");
        true
    }

    /// Mark overdue live sessions expired; returns their ids.
    pub fn expire_overdue(&self) -> Vec<String> {
        let now = Utc::now();
        let overdue: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.status.is_live() && now > s.expires_at)
            .map(|s| s.id.clone())
            .collect();

        for id in &overdue {
            self.close(id, SessionStatus::Expired, None);
        }
        overdue
    }

    /// Lock guarding re-checks of one session.
    pub fn check_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.check_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Detect physically-impossible concurrent sessions for a user:
    /// pairs of live sessions more than 100 km apart, both active within
    /// a 5-minute window. Returns the flagged session ids. Flags, never
    /// auto-terminates — a VPN exit-node change looks the same.
    pub fn detect_impossible_travel(&self, user_id: &str) -> Vec<String> {
        let sessions = self.user_sessions(user_id);
        let mut flagged: HashSet<String> = HashSet::new();

        for (i, a) in sessions.iter().enumerate() {
            for b in sessions.iter().skip(i + 1) {
                let (Some(loc_a), Some(loc_b)) = (a.location, b.location) else {
                    continue;
                };
                let active_overlap = (a.last_activity - b.last_activity)
                    .num_minutes()
                    .abs()
                    <= CONCURRENCY_WINDOW_MINS;
                if active_overlap && haversine_km(&loc_a, &loc_b) > IMPOSSIBLE_TRAVEL_KM {
                    flagged.insert(a.id.clone());
                    flagged.insert(b.id.clone());
                }
            }
        }

        let mut newly_flagged = Vec::new();
        for id in flagged {
            let changed = self
                .with_session_mut(&id, |s| {
                    if s.status == SessionStatus::Active {
                        s.status = SessionStatus::Flagged;
                        s.reauth_required = true;
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if changed {
                tracing::warn!(session_id = %id, user_id, "impossible travel; session flagged");
                newly_flagged.push(id);
            }
        }
        newly_flagged
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = SessionStats::default();
        for session in self.sessions.iter() {
            stats.total += 1;
            match session.status {
                SessionStatus::Active => stats.active += 1,
                SessionStatus::Flagged => stats.flagged += 1,
                SessionStatus::Expired => stats.expired += 1,
                SessionStatus::LoggedOut => stats.logged_out += 1,
                SessionStatus::Terminated => stats.terminated += 1,
            }
        }
        stats
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub flagged: usize,
    pub expired: usize,
    pub logged_out: usize,
    pub terminated: usize,
}

/// Great-circle distance between two points.
pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_session(risk: f64) -> (SessionManager, String) {
        let manager = SessionManager::new();
        let session = manager.create("alice", Some("laptop".into()), None, risk, Duration::hours(8));
        let id = session.id;
        (manager, id)
    }

    #[test]
    fn test_create_and_activity() {
        let (manager, id) = manager_with_session(10.0);
        assert!(manager.record_activity(&id, "open grades-db"));

        let session = manager.get(&id).unwrap();
        assert_eq!(session.timeline.len(), 1);
        assert_eq!(session.timeline[0].action, "open grades-db");
        assert_eq!(session.timeline[0].risk_at_time, 10.0);
    }

    #[test]
    fn test_logout_removes_from_index() {
        let (manager, id) = manager_with_session(10.0);
        assert!(manager.logout(&id));
        assert!(!manager.logout(&id)); // already closed
        assert_eq!(manager.get(&id).unwrap().status, SessionStatus::LoggedOut);
        assert!(manager.user_sessions("alice").is_empty());
        assert!(!manager.record_activity(&id, "post-logout"));
    }

    #[test]
    fn test_terminate_records_reason() {
        let (manager, id) = manager_with_session(10.0);
        assert!(manager.terminate(&id, "risk 85.0 at or above termination threshold"));

        let session = manager.get(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Terminated);
        assert!(session
            .termination_reason
            .as_deref()
            .unwrap()
            .contains("85.0"));
    }

    #[test]
    fn test_expire_overdue() {
        let manager = SessionManager::new();
        let session = manager.create("bob", None, None, 20.0, Duration::seconds(-1));
        let expired = manager.expire_overdue();
        assert_eq!(expired, vec![session.id.clone()]);
        assert_eq!(
            manager.get(&session.id).unwrap().status,
            SessionStatus::Expired
        );
    }

    #[test]
    fn test_haversine_distances() {
        let london = GeoPoint {
            latitude: 51.5074,
            longitude: -0.1278,
        };
        let paris = GeoPoint {
            latitude: 48.8566,
            longitude: 2.3522,
        };
        let km = haversine_km(&london, &paris);
        assert!(km > 300.0 && km < 400.0);
        assert!(haversine_km(&london, &london) < 1e-6);
    }

    #[test]
    fn test_impossible_travel_flags_both() {
        let manager = SessionManager::new();
        let here = GeoPoint {
            latitude: 51.5074,
            longitude: -0.1278,
        };
        let far = GeoPoint {
            latitude: 48.8566,
            longitude: 2.3522,
        };
        let a = manager.create("carol", None, Some(here), 10.0, Duration::hours(8));
        let b = manager.create("carol", None, Some(far), 10.0, Duration::hours(8));

        let flagged = manager.detect_impossible_travel("carol");
        assert_eq!(flagged.len(), 2);
        for id in [&a.id, &b.id] {
            let session = manager.get(id).unwrap();
            assert_eq!(session.status, SessionStatus::Flagged);
            assert!(session.reauth_required);
            // Flagged, not terminated.
            assert!(session.status.is_live());
        }

        // Idempotent: a second pass flags nothing new.
        assert!(manager.detect_impossible_travel("carol").is_empty());
    }

    #[test]
    fn test_nearby_sessions_not_flagged() {
        let manager = SessionManager::new();
        let office = GeoPoint {
            latitude: 51.5074,
            longitude: -0.1278,
        };
        let home = GeoPoint {
            latitude: 51.5200,
            longitude: -0.1000,
        };
        manager.create("dave", None, Some(office), 10.0, Duration::hours(8));
        manager.create("dave", None, Some(home), 10.0, Duration::hours(8));

        assert!(manager.detect_impossible_travel("dave").is_empty());
    }
}
