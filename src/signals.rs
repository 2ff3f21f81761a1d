//! Signal Normalizer
//!
//! Converts heterogeneous upstream inputs into five bounded [0,100]
//! component scores. Missing signals degrade to a documented neutral
//! default instead of failing the evaluation.

use crate::{AccessRequest, ComponentScores, PolicyRule};
use std::sync::Arc;

/// Neutral default substituted when a collaborator has no data.
pub const NEUTRAL_SCORE: f64 = 50.0;

/// Latest behavioral-anomaly risk for a subject, [0,100]. `None` means
/// the collaborator has no data yet.
pub trait BehavioralRiskProvider: Send + Sync {
    fn risk_score(&self, subject: &str) -> Option<f64>;
}

/// Historical approval ratio for an identity, [0,1]. `None` when fewer
/// than 3 prior decisions exist (cold start).
pub trait HistoryProvider: Send + Sync {
    fn approval_ratio(&self, identity: &str) -> Option<f64>;
}

// =============================================================================
// Intent scoring
// =============================================================================

/// One keyword category and its score delta. Applied at most once per
/// evaluation, however many of its keywords appear.
#[derive(Debug, Clone)]
pub struct KeywordCategory {
    pub name: String,
    pub keywords: Vec<String>,
    pub delta: f64,
}

/// Data-driven intent-clarity table. Categories can be extended without
/// touching the scoring logic.
#[derive(Debug, Clone)]
pub struct IntentLexicon {
    pub categories: Vec<KeywordCategory>,
    /// Word pairs that contradict each other when both are present.
    pub contradictions: Vec<(String, String)>,
    pub contradiction_penalty: f64,
    pub detail_bonus: f64,
    pub base: f64,
}

impl Default for IntentLexicon {
    fn default() -> Self {
        let legitimate = [
            "research",
            "project",
            "academic",
            "coursework",
            "assignment",
            "thesis",
            "grading",
            "review",
            "maintenance",
            "audit",
            "lecture",
            "lab",
        ];
        let suspicious = [
            "bypass", "hack", "steal", "exfiltrate", "dump", "crack", "spoof",
            "backdoor", "tamper",
        ];

        Self {
            categories: vec![
                KeywordCategory {
                    name: "legitimate".to_string(),
                    keywords: legitimate.iter().map(|s| s.to_string()).collect(),
                    delta: 20.0,
                },
                KeywordCategory {
                    name: "suspicious".to_string(),
                    keywords: suspicious.iter().map(|s| s.to_string()).collect(),
                    delta: -30.0,
                },
            ],
            contradictions: vec![
                ("urgent".to_string(), "routine".to_string()),
                ("temporary".to_string(), "permanent".to_string()),
            ],
            contradiction_penalty: 15.0,
            detail_bonus: 10.0,
            base: 50.0,
        }
    }
}

impl IntentLexicon {
    /// Score free-text intent: base 50, category deltas, −15 per
    /// contradiction pair, +10 detail bonus for ≥3 words without a
    /// contradiction. Clamped to [0,100].
    pub fn score(&self, intent: &str) -> f64 {
        let lower = intent.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let mut score = self.base;
        for category in &self.categories {
            if category.keywords.iter().any(|k| words.contains(&k.as_str())) {
                score += category.delta;
            }
        }

        let mut contradicted = false;
        for (a, b) in &self.contradictions {
            if words.contains(&a.as_str()) && words.contains(&b.as_str()) {
                score -= self.contradiction_penalty;
                contradicted = true;
            }
        }

        if words.len() >= 3 && !contradicted {
            score += self.detail_bonus;
        }

        score.clamp(0.0, 100.0)
    }
}

// =============================================================================
// Normalizer
// =============================================================================

/// Produces the five component scores for one request against the
/// governing rule.
pub struct SignalNormalizer {
    lexicon: IntentLexicon,
    history: Arc<dyn HistoryProvider>,
    behavioral: Arc<dyn BehavioralRiskProvider>,
}

impl SignalNormalizer {
    pub fn new(
        history: Arc<dyn HistoryProvider>,
        behavioral: Arc<dyn BehavioralRiskProvider>,
    ) -> Self {
        Self {
            lexicon: IntentLexicon::default(),
            history,
            behavioral,
        }
    }

    pub fn with_lexicon(mut self, lexicon: IntentLexicon) -> Self {
        self.lexicon = lexicon;
        self
    }

    /// Returns the component scores plus whether any neutral default was
    /// substituted for a missing signal.
    pub fn components(&self, request: &AccessRequest, rule: &PolicyRule) -> (ComponentScores, bool) {
        let mut partial = false;

        // Role mismatch is a hard eligibility gate, not a soft signal.
        let role = if rule.allows_role(&request.requester_role) {
            100.0
        } else {
            0.0
        };

        let intent = self.lexicon.score(&request.intent);
        let context = self.context_score(request, rule);

        let history = match self.history.approval_ratio(&request.requester_id) {
            Some(ratio) => (ratio.clamp(0.0, 1.0)) * 100.0,
            None => {
                partial = true;
                NEUTRAL_SCORE
            }
        };

        let anomaly = match self.behavioral.risk_score(&request.requester_id) {
            Some(risk) => (100.0 - risk).clamp(0.0, 100.0),
            None => {
                partial = true;
                NEUTRAL_SCORE
            }
        };

        (
            ComponentScores {
                role,
                intent,
                context,
                history,
                anomaly,
            },
            partial,
        )
    }

    fn context_score(&self, request: &AccessRequest, rule: &PolicyRule) -> f64 {
        let mut score: f64 = 100.0;

        if let Some(window) = &rule.time_window {
            if !window.contains(&request.timestamp) {
                score -= 40.0;
            }
        }
        match &request.client.device {
            Some(device) if !device.trim().is_empty() => {}
            _ => score -= 20.0,
        }
        if request.client.ip.is_none() {
            score -= 10.0;
        }

        score.clamp(0.0, 100.0)
    }
}
