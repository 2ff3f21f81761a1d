//! Policy store
//!
//! Authoritative policy map with a TTL-bounded read snapshot for the
//! evaluate path. Edits write an append-only [`PolicyEvolution`] record
//! before the policy document mutates (audit-before-effect); if the
//! record cannot be appended the change is abandoned.

use crate::error::StoreError;
use crate::{Policy, PolicyEvolution, TriggerSource};
use arc_swap::ArcSwap;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Snapshot {
    built_at: Instant,
    policies: Arc<Vec<Policy>>,
}

pub struct PolicyStore {
    policies: dashmap::DashMap<String, Policy>,
    evolutions: dashmap::DashMap<String, Vec<PolicyEvolution>>,
    snapshot: ArcSwap<Snapshot>,
    ttl: Duration,
    rebuild: parking_lot::Mutex<()>,
}

impl PolicyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            policies: dashmap::DashMap::new(),
            evolutions: dashmap::DashMap::new(),
            snapshot: ArcSwap::from_pointee(Snapshot {
                built_at: Instant::now(),
                policies: Arc::new(Vec::new()),
            }),
            ttl,
            rebuild: parking_lot::Mutex::new(()),
        }
    }

    /// Create or edit a policy. Weight vectors that do not sum to 1.0 are
    /// rejected. Edits append an evolution record before the mutation.
    pub fn upsert(&self, policy: Policy) -> Result<(), StoreError> {
        if !policy.weights.is_normalized() {
            return Err(StoreError::WeightsNotNormalized {
                sum: policy.weights.sum(),
            });
        }

        let old = self.policies.get(&policy.id).map(|p| p.clone());
        let (old_value, reason) = match &old {
            Some(existing) => (
                serde_json::to_value(existing).unwrap_or(serde_json::Value::Null),
                "policy edited",
            ),
            None => (serde_json::Value::Null, "policy created"),
        };
        let new_value = serde_json::to_value(&policy).unwrap_or(serde_json::Value::Null);

        self.append_evolution(
            &policy.id,
            old_value,
            new_value,
            reason,
            TriggerSource::Admin,
        )?;
        self.policies.insert(policy.id.clone(), policy);
        Ok(())
    }

    /// Optimizer write path: move a policy's confidence floor. The
    /// evolution record is appended first; a failed append abandons the
    /// change. Writers to the same policy serialize on its entry lock.
    pub fn set_threshold(
        &self,
        policy_id: &str,
        new_threshold: f64,
        reason: &str,
        trigger: TriggerSource,
    ) -> Result<f64, StoreError> {
        let mut entry = self
            .policies
            .get_mut(policy_id)
            .ok_or_else(|| StoreError::PolicyNotFound(policy_id.to_string()))?;
        let old_threshold = entry.min_confidence;

        self.append_evolution(
            policy_id,
            serde_json::json!({ "min_confidence": old_threshold }),
            serde_json::json!({ "min_confidence": new_threshold }),
            reason,
            trigger,
        )?;
        entry.min_confidence = new_threshold;

        tracing::info!(
            policy_id,
            old_threshold,
            new_threshold,
            trigger = ?trigger,
            "policy threshold updated"
        );
        Ok(old_threshold)
    }

    /// Soft delete: policies are never removed, only deactivated.
    pub fn deactivate(&self, policy_id: &str) -> Result<(), StoreError> {
        let mut entry = self
            .policies
            .get_mut(policy_id)
            .ok_or_else(|| StoreError::PolicyNotFound(policy_id.to_string()))?;

        self.append_evolution(
            policy_id,
            serde_json::json!({ "active": entry.active }),
            serde_json::json!({ "active": false }),
            "policy deactivated",
            TriggerSource::Admin,
        )?;
        entry.active = false;
        Ok(())
    }

    pub fn get(&self, policy_id: &str) -> Option<Policy> {
        self.policies.get(policy_id).map(|p| p.clone())
    }

    pub fn all(&self) -> Vec<Policy> {
        self.policies.iter().map(|p| p.clone()).collect()
    }

    /// Read-only append-only history for a policy.
    pub fn evolutions(&self, policy_id: &str) -> Vec<PolicyEvolution> {
        self.evolutions
            .get(policy_id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// TTL-bounded snapshot for the evaluate path: active policies sorted
    /// by descending priority. Edits become visible within the TTL,
    /// never required instantly.
    pub fn snapshot(&self) -> Arc<Vec<Policy>> {
        {
            let current = self.snapshot.load();
            if current.built_at.elapsed() <= self.ttl {
                return current.policies.clone();
            }
        }

        let _guard = self.rebuild.lock();
        // Another thread may have rebuilt while we waited.
        let current = self.snapshot.load();
        if current.built_at.elapsed() <= self.ttl {
            return current.policies.clone();
        }

        let rebuilt = self.build_snapshot();
        self.snapshot.store(Arc::new(Snapshot {
            built_at: Instant::now(),
            policies: rebuilt.clone(),
        }));
        rebuilt
    }

    /// Drop the cached snapshot so the next read rebuilds. Mainly for
    /// tests; production readers rely on the TTL.
    pub fn force_refresh(&self) {
        let _guard = self.rebuild.lock();
        let rebuilt = self.build_snapshot();
        self.snapshot.store(Arc::new(Snapshot {
            built_at: Instant::now(),
            policies: rebuilt,
        }));
    }

    fn build_snapshot(&self) -> Arc<Vec<Policy>> {
        let mut policies: Vec<Policy> = self
            .policies
            .iter()
            .filter(|p| p.active)
            .map(|p| p.clone())
            .collect();
        // Id tiebreak keeps the governing policy stable across rebuilds
        // when priorities collide.
        policies.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Arc::new(policies)
    }

    fn append_evolution(
        &self,
        policy_id: &str,
        old_value: serde_json::Value,
        new_value: serde_json::Value,
        reason: &str,
        trigger: TriggerSource,
    ) -> Result<(), StoreError> {
        let record = PolicyEvolution {
            id: uuid::Uuid::new_v4().to_string(),
            policy_id: policy_id.to_string(),
            old_value,
            new_value,
            reason: reason.to_string(),
            triggered_by: trigger,
            timestamp: Utc::now(),
        };
        self.evolutions
            .entry(policy_id.to_string())
            .or_default()
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PolicyRule, ResourceMatcher, SignalWeights};

    fn policy(id: &str, priority: i32) -> Policy {
        Policy {
            id: id.to_string(),
            name: format!("policy {id}"),
            rules: vec![PolicyRule {
                resource: ResourceMatcher::Wildcard,
                allowed_roles: vec!["admin".to_string()],
                time_window: None,
            }],
            min_confidence: 60.0,
            mfa_required: false,
            priority,
            active: true,
            weights: SignalWeights::default(),
        }
    }

    #[test]
    fn test_rejects_unnormalized_weights() {
        let store = PolicyStore::new(Duration::from_secs(5));
        let mut p = policy("p1", 0);
        p.weights.role = 0.5; // sum now 1.2
        let err = store.upsert(p).unwrap_err();
        assert!(matches!(err, StoreError::WeightsNotNormalized { .. }));
        assert!(store.get("p1").is_none());
    }

    #[test]
    fn test_upsert_records_evolution() {
        let store = PolicyStore::new(Duration::from_secs(5));
        store.upsert(policy("p1", 0)).unwrap();

        let mut edited = policy("p1", 5);
        edited.min_confidence = 70.0;
        store.upsert(edited).unwrap();

        let history = store.evolutions("p1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].reason, "policy created");
        assert_eq!(history[1].reason, "policy edited");
        assert_eq!(history[1].triggered_by, TriggerSource::Admin);
    }

    #[test]
    fn test_set_threshold_appends_before_mutation() {
        let store = PolicyStore::new(Duration::from_secs(5));
        store.upsert(policy("p1", 0)).unwrap();

        let old = store
            .set_threshold("p1", 65.0, "fpr above limit", TriggerSource::MlModel)
            .unwrap();
        assert_eq!(old, 60.0);
        assert_eq!(store.get("p1").unwrap().min_confidence, 65.0);

        let history = store.evolutions("p1");
        let last = history.last().unwrap();
        assert_eq!(last.triggered_by, TriggerSource::MlModel);
        assert_eq!(last.new_value["min_confidence"], 65.0);
    }

    #[test]
    fn test_deactivate_is_soft() {
        let store = PolicyStore::new(Duration::from_secs(0));
        store.upsert(policy("p1", 0)).unwrap();
        store.deactivate("p1").unwrap();

        assert!(store.get("p1").is_some());
        assert!(!store.get("p1").unwrap().active);
        // Inactive policies drop out of the snapshot.
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_sorted_by_priority() {
        let store = PolicyStore::new(Duration::from_secs(0));
        store.upsert(policy("low", 1)).unwrap();
        store.upsert(policy("high", 10)).unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot[0].id, "high");
        assert_eq!(snapshot[1].id, "low");
    }

    #[test]
    fn test_equal_priority_orders_by_id() {
        let store = PolicyStore::new(Duration::from_secs(0));
        store.upsert(policy("zeta", 5)).unwrap();
        store.upsert(policy("alpha", 5)).unwrap();
        store.upsert(policy("mid", 5)).unwrap();

        let snapshot = store.snapshot();
        let ids: Vec<&str> = snapshot.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);

        // Stable across rebuilds.
        store.force_refresh();
        let rebuilt: Vec<String> = store.snapshot().iter().map(|p| p.id.clone()).collect();
        assert_eq!(rebuilt, ids);
    }

    #[test]
    fn test_snapshot_ttl_staleness() {
        let store = PolicyStore::new(Duration::from_secs(60));
        store.upsert(policy("p1", 0)).unwrap();
        store.force_refresh();
        assert_eq!(store.snapshot().len(), 1);

        // Within the TTL the snapshot may miss new edits.
        store.upsert(policy("p2", 0)).unwrap();
        assert_eq!(store.snapshot().len(), 1);

        store.force_refresh();
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn test_missing_policy() {
        let store = PolicyStore::new(Duration::from_secs(5));
        let err = store
            .set_threshold("ghost", 50.0, "x", TriggerSource::MlModel)
            .unwrap_err();
        assert_eq!(err, StoreError::PolicyNotFound("ghost".to_string()));
    }
}
