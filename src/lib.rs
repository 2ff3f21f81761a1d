//! TrustGate — Adaptive Access-Control Decision Engine
//!
//! Combines static policy rules with dynamically computed trust signals
//! into bounded, auditable access decisions, and closes the loop by
//! watching decision outcomes and tuning policy thresholds over time.
//!
//! # Pipeline
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     ACCESS DECISION CORE                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  Request ──► Matcher ──► Normalizer ──► Scorer ──► Decision      │
//! │                 │            │             │           │         │
//! │                 ▼            ▼             ▼           ▼         │
//! │            ┌────────┐  ┌──────────┐  ┌─────────┐ ┌──────────┐   │
//! │            │ Policy │  │ 5 signal │  │ weighted│ │ grant /  │   │
//! │            │ store  │  │  scores  │  │   sum   │ │ step-up /│   │
//! │            │ (TTL)  │  │ [0,100]  │  │ [0,100] │ │   deny   │   │
//! │            └────────┘  └──────────┘  └─────────┘ └──────────┘   │
//! │                                                                  │
//! │   outcomes ──► performance counters ──► threshold optimizer      │
//! │   sessions ──► recurring risk re-check ──► shorten/extend/kill   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The evaluate path is synchronous CPU work and safe to call
//! concurrently; the session monitor and the policy optimizer run as
//! independent background tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

pub mod audit;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod optimizer;
pub mod outcomes;
pub mod session;
pub mod signals;
pub mod store;

use audit::{AuditEvent, AuditEventType, AuditSink, SessionNotifier};
use error::EngineError;
use signals::{BehavioralRiskProvider, HistoryProvider};

// =============================================================================
// Policy model
// =============================================================================

/// Per-signal weight vector. Must sum to 1.0 (±1e-6).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalWeights {
    pub role: f64,
    pub intent: f64,
    pub context: f64,
    pub history: f64,
    pub anomaly: f64,
}

impl SignalWeights {
    pub fn sum(&self) -> f64 {
        self.role + self.intent + self.context + self.history + self.anomaly
    }

    pub fn is_normalized(&self) -> bool {
        (self.sum() - 1.0).abs() <= 1e-6
    }
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            role: 0.30,
            intent: 0.25,
            context: 0.20,
            history: 0.15,
            anomaly: 0.10,
        }
    }
}

/// Allowed access window for a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Empty means every day.
    pub days: Vec<chrono::Weekday>,
    pub start_hour: u8,
    pub end_hour: u8,
}

impl TimeWindow {
    pub fn contains(&self, at: &DateTime<Utc>) -> bool {
        use chrono::{Datelike, Timelike};

        if !self.days.is_empty() && !self.days.contains(&at.weekday()) {
            return false;
        }
        let hour = at.hour() as u8;
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            // Overnight window, e.g. 22-06
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Resource-type matcher for a policy rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceMatcher {
    Exact(String),
    Prefix(String),
    Wildcard,
}

impl ResourceMatcher {
    pub fn matches(&self, resource_type: &str) -> bool {
        match self {
            Self::Exact(t) => t == resource_type,
            Self::Prefix(p) => resource_type.starts_with(p.as_str()),
            Self::Wildcard => true,
        }
    }
}

/// One matching entry inside a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub resource: ResourceMatcher,
    pub allowed_roles: Vec<String>,
    pub time_window: Option<TimeWindow>,
}

impl PolicyRule {
    pub fn allows_role(&self, role: &str) -> bool {
        self.allowed_roles.iter().any(|r| r == role)
    }
}

/// Access policy. Never hard-deleted; deactivated instead. Every edit is
/// preceded by an append-only [`PolicyEvolution`] record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub rules: Vec<PolicyRule>,
    /// Confidence floor; requests scoring below it are denied.
    pub min_confidence: f64,
    /// Forces step-up even inside the auto-grant band.
    pub mfa_required: bool,
    /// Higher priority wins when multiple policies match.
    pub priority: i32,
    pub active: bool,
    pub weights: SignalWeights,
}

impl Policy {
    /// First rule matching the resource type, preferring a rule that also
    /// allows the requester's role.
    pub fn governing_rule(&self, resource_type: &str, role: &str) -> Option<&PolicyRule> {
        self.rules
            .iter()
            .find(|r| r.resource.matches(resource_type) && r.allows_role(role))
            .or_else(|| self.rules.iter().find(|r| r.resource.matches(resource_type)))
    }

    pub fn matches_resource(&self, resource_type: &str) -> bool {
        self.rules.iter().any(|r| r.resource.matches(resource_type))
    }

    pub fn allows_role_for(&self, resource_type: &str, role: &str) -> bool {
        self.rules
            .iter()
            .any(|r| r.resource.matches(resource_type) && r.allows_role(role))
    }
}

/// What caused a policy mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Admin,
    MlModel,
    AutoRollback,
}

/// Append-only audit record written before any policy mutation lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEvolution {
    pub id: String,
    pub policy_id: String,
    pub old_value: serde_json::Value,
    pub new_value: serde_json::Value,
    pub reason: String,
    pub triggered_by: TriggerSource,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Request / decision model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientContext {
    pub ip: Option<IpAddr>,
    pub device: Option<String>,
    pub location: Option<GeoPoint>,
}

/// One evaluation event. Immutable after creation; the evaluation result
/// is written exactly once by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRequest {
    pub id: String,
    pub requester_id: String,
    pub requester_role: String,
    pub resource: String,
    pub resource_type: String,
    pub intent: String,
    pub requested_duration_mins: u32,
    pub urgency: Urgency,
    pub timestamp: DateTime<Utc>,
    pub client: ClientContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionValue {
    Grant,
    GrantWithMfa,
    Deny,
}

impl DecisionValue {
    pub fn is_grant(&self) -> bool {
        matches!(self, Self::Grant | Self::GrantWithMfa)
    }
}

/// The five component scores, each in [0,100].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub role: f64,
    pub intent: f64,
    pub context: f64,
    pub history: f64,
    pub anomaly: f64,
}

impl ComponentScores {
    pub fn weighted(&self, w: &SignalWeights) -> ComponentScores {
        ComponentScores {
            role: self.role * w.role,
            intent: self.intent * w.intent,
            context: self.context * w.context,
            history: self.history * w.history,
            anomaly: self.anomaly * w.anomaly,
        }
    }

    pub fn total(&self) -> f64 {
        self.role + self.intent + self.context + self.history + self.anomaly
    }
}

/// Per-component explanation returned with every decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub components: ComponentScores,
    pub weighted: ComponentScores,
    /// True when a neutral default was substituted for a missing signal.
    pub partial: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub request_id: String,
    pub value: DecisionValue,
    pub confidence: f64,
    pub breakdown: ConfidenceBreakdown,
    pub matched_policy_ids: Vec<String>,
    pub reasons: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}

// =============================================================================
// Outcome model
// =============================================================================

/// Ground-truth label reported after the fact for a past decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeLabel {
    Legitimate,
    Malicious,
    Unknown,
}

/// Rolling per-policy counters over a monthly window. Grants are the
/// positive class: TP = granted+legitimate, FP = granted+malicious,
/// TN = denied+malicious, FN = denied+legitimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyPerformance {
    pub policy_id: String,
    pub total_applications: u64,
    pub true_positives: u64,
    pub false_positives: u64,
    pub true_negatives: u64,
    pub false_negatives: u64,
    /// Outcomes reported with an unknown label; excluded from the rates.
    pub unlabeled: u64,
    pub window_start: DateTime<Utc>,
}

impl PolicyPerformance {
    pub fn new(policy_id: &str) -> Self {
        Self {
            policy_id: policy_id.to_string(),
            total_applications: 0,
            true_positives: 0,
            false_positives: 0,
            true_negatives: 0,
            false_negatives: 0,
            unlabeled: 0,
            window_start: Utc::now(),
        }
    }

    /// FP / (FP + TN), as a fraction.
    pub fn false_positive_rate(&self) -> f64 {
        let denom = self.false_positives + self.true_negatives;
        if denom == 0 {
            0.0
        } else {
            self.false_positives as f64 / denom as f64
        }
    }

    /// FN / (FN + TP), as a fraction.
    pub fn false_negative_rate(&self) -> f64 {
        let denom = self.false_negatives + self.true_positives;
        if denom == 0 {
            0.0
        } else {
            self.false_negatives as f64 / denom as f64
        }
    }

    /// `100 - (FPR*50 + FNR*50)`, on a [0,100] scale.
    pub fn effectiveness_score(&self) -> f64 {
        100.0 - (self.false_positive_rate() * 50.0 + self.false_negative_rate() * 50.0)
    }

    /// Share of labeled applications that were granted.
    pub fn approval_rate(&self) -> f64 {
        if self.total_applications == 0 {
            0.0
        } else {
            (self.true_positives + self.false_positives) as f64 / self.total_applications as f64
        }
    }
}

// =============================================================================
// Session model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    /// Flagged for identity verification (e.g. impossible travel); still
    /// live but protected actions must be blocked until verified.
    Flagged,
    Expired,
    LoggedOut,
    Terminated,
}

impl SessionStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Flagged)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub risk_at_time: f64,
}

/// One live authenticated context. Created at successful grant; mutated
/// only by the session monitor and the activity-recording surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSession {
    pub id: String,
    pub user_id: String,
    pub device: Option<String>,
    pub location: Option<GeoPoint>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub risk_score: f64,
    /// Re-derived from the current risk score on every monitor check.
    pub expires_at: DateTime<Utc>,
    pub timeline: Vec<ActivityEntry>,
    pub reauth_required: bool,
    pub status: SessionStatus,
    pub termination_reason: Option<String>,
}

/// Lifecycle events relayed to an external notification layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    Created,
    DurationAdjusted,
    ReauthRequired,
    ReauthCleared,
    VerificationRequired,
    Terminated,
    Expired,
    LoggedOut,
}

// =============================================================================
// Gateway
// =============================================================================

#[derive(Clone)]
pub struct GatewayConfig {
    /// Confidence at or above which a grant skips step-up (unless the
    /// policy forces MFA).
    pub auto_grant_threshold: f64,
    /// Staleness bound for the policy snapshot read by evaluations.
    pub policy_ttl_secs: u64,
    /// Session re-check cadence.
    pub monitor_interval_secs: u64,
    /// Optimizer evaluation cycle.
    pub optimizer_cycle_secs: u64,
    pub optimizer: optimizer::OptimizerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auto_grant_threshold: 90.0,
            policy_ttl_secs: 5,
            monitor_interval_secs: 30,
            optimizer_cycle_secs: 86_400,
            optimizer: optimizer::OptimizerConfig::default(),
        }
    }
}

/// Composes the decision engine, outcome tracker, policy optimizer and
/// session risk monitor behind one surface.
pub struct AccessGateway {
    store: Arc<store::PolicyStore>,
    engine: engine::PolicyEngine,
    outcomes: Arc<outcomes::OutcomeTracker>,
    optimizer: Arc<optimizer::PolicyOptimizer>,
    sessions: Arc<session::SessionManager>,
    monitor: Arc<monitor::SessionRiskMonitor>,
    behavioral: Arc<dyn BehavioralRiskProvider>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn SessionNotifier>,
    config: GatewayConfig,
}

impl AccessGateway {
    pub fn new(
        config: GatewayConfig,
        behavioral: Arc<dyn BehavioralRiskProvider>,
        history: Arc<dyn HistoryProvider>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn SessionNotifier>,
    ) -> Self {
        let store = Arc::new(store::PolicyStore::new(std::time::Duration::from_secs(
            config.policy_ttl_secs,
        )));
        let outcomes = Arc::new(outcomes::OutcomeTracker::new());
        let engine = engine::PolicyEngine::new(
            store.clone(),
            signals::SignalNormalizer::new(history, behavioral.clone()),
            audit.clone(),
            outcomes.clone(),
            config.auto_grant_threshold,
        );
        let optimizer = Arc::new(optimizer::PolicyOptimizer::new(
            store.clone(),
            outcomes.clone(),
            audit.clone(),
            config.optimizer.clone(),
        ));
        let sessions = Arc::new(session::SessionManager::new());
        let monitor = Arc::new(monitor::SessionRiskMonitor::new(
            sessions.clone(),
            behavioral.clone(),
            notifier.clone(),
            audit.clone(),
            config.monitor_interval_secs,
        ));

        Self {
            store,
            engine,
            outcomes,
            optimizer,
            sessions,
            monitor,
            behavioral,
            audit,
            notifier,
            config,
        }
    }

    /// Administrative policy surface.
    pub fn store(&self) -> &Arc<store::PolicyStore> {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<session::SessionManager> {
        &self.sessions
    }

    pub fn monitor(&self) -> &Arc<monitor::SessionRiskMonitor> {
        &self.monitor
    }

    /// Synchronous request evaluation. Every call produces exactly one
    /// audited terminal decision or one validation error.
    pub fn evaluate(&self, request: &AccessRequest) -> Result<Decision, EngineError> {
        self.engine.evaluate(request)
    }

    /// Open a session for a granted request. Initial lifetime is derived
    /// from the requester's current behavioral risk (neutral 50 when the
    /// provider has no data).
    pub fn open_session(&self, request: &AccessRequest) -> ActiveSession {
        let risk = self
            .behavioral
            .risk_score(&request.requester_id)
            .unwrap_or(signals::NEUTRAL_SCORE);
        let session = self.sessions.create(
            &request.requester_id,
            request.client.device.clone(),
            request.client.location,
            risk,
            monitor::duration_for(risk),
        );

        self.audit.record(AuditEvent::session(
            AuditEventType::SessionCreated,
            &session.id,
            &session.user_id,
            serde_json::json!({ "risk": risk, "expires_at": session.expires_at }),
        ));
        self.notifier.notify(&session.id, SessionEvent::Created);
        session
    }

    pub fn record_activity(&self, session_id: &str, action: &str) -> bool {
        self.sessions.record_activity(session_id, action)
    }

    pub fn logout(&self, session_id: &str) -> bool {
        let done = self.sessions.logout(session_id);
        if done {
            self.notifier.notify(session_id, SessionEvent::LoggedOut);
        }
        done
    }

    pub fn terminate_session(&self, session_id: &str, reason: &str) -> bool {
        let done = self.sessions.terminate(session_id, reason);
        if done {
            self.notifier.notify(session_id, SessionEvent::Terminated);
        }
        done
    }

    /// Asynchronous ground-truth feedback into the outcome tracker.
    pub fn record_outcome(&self, request_id: &str, label: OutcomeLabel) -> bool {
        let recorded = self.outcomes.record_outcome(request_id, label);
        if recorded {
            self.audit.record(AuditEvent::outcome(request_id, label));
        }
        recorded
    }

    pub fn policy_performance(&self, policy_id: Option<&str>) -> Vec<PolicyPerformance> {
        match policy_id {
            Some(id) => self.outcomes.performance(id).into_iter().collect(),
            None => self.outcomes.all_performance(),
        }
    }

    /// Read-only, append-only threshold history for a policy.
    pub fn list_policy_evolution(&self, policy_id: &str) -> Vec<PolicyEvolution> {
        self.store.evolutions(policy_id)
    }

    pub fn run_optimizer_cycle(&self) -> Vec<(String, optimizer::CycleOutcome)> {
        self.optimizer.run_cycle()
    }

    /// Spawn the recurring monitor and optimizer loops.
    pub fn spawn_background(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let monitor = self.monitor.clone();
        let monitor_task = tokio::spawn(async move { monitor.run().await });

        let optimizer = self.optimizer.clone();
        let cycle_secs = self.config.optimizer_cycle_secs;
        let optimizer_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(cycle_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                optimizer.run_cycle();
            }
        });

        vec![monitor_task, optimizer_task]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_normalized() {
        let w = SignalWeights::default();
        assert!(w.is_normalized());
        assert!((w.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_window_contains() {
        let window = TimeWindow {
            days: vec![],
            start_hour: 8,
            end_hour: 18,
        };
        let morning = Utc::now()
            .date_naive()
            .and_hms_opt(9, 0, 0)
            .unwrap()
            .and_utc();
        let night = Utc::now()
            .date_naive()
            .and_hms_opt(23, 0, 0)
            .unwrap()
            .and_utc();
        assert!(window.contains(&morning));
        assert!(!window.contains(&night));
    }

    #[test]
    fn test_overnight_window() {
        let window = TimeWindow {
            days: vec![],
            start_hour: 22,
            end_hour: 6,
        };
        let night = Utc::now()
            .date_naive()
            .and_hms_opt(23, 0, 0)
            .unwrap()
            .and_utc();
        let noon = Utc::now()
            .date_naive()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc();
        assert!(window.contains(&night));
        assert!(!window.contains(&noon));
    }

    #[test]
    fn test_resource_matcher() {
        assert!(ResourceMatcher::Wildcard.matches("anything"));
        assert!(ResourceMatcher::Exact("database".into()).matches("database"));
        assert!(!ResourceMatcher::Exact("database".into()).matches("api"));
        assert!(ResourceMatcher::Prefix("db/".into()).matches("db/students"));
    }

    #[test]
    fn test_effectiveness_score() {
        let mut perf = PolicyPerformance::new("p1");
        perf.true_positives = 30;
        perf.false_negatives = 10; // FNR = 0.25
        perf.true_negatives = 8;
        perf.false_positives = 2; // FPR = 0.2
        perf.total_applications = 50;

        assert!((perf.false_positive_rate() - 0.2).abs() < 1e-9);
        assert!((perf.false_negative_rate() - 0.25).abs() < 1e-9);
        assert!((perf.effectiveness_score() - 77.5).abs() < 1e-9);
    }

    #[test]
    fn test_performance_invariant() {
        let mut perf = PolicyPerformance::new("p1");
        perf.true_positives = 5;
        perf.false_positives = 1;
        perf.true_negatives = 3;
        perf.false_negatives = 1;
        perf.total_applications = 10;
        assert_eq!(
            perf.true_positives + perf.false_positives + perf.true_negatives
                + perf.false_negatives,
            perf.total_applications
        );
    }
}
