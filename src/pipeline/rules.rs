//! Heuristic classifier: regex rules plus learned preferences, no LLM.
//!
//! Used when no LLM key is configured. Order of evaluation:
//! - a learned sender/domain preference above 0.7 wins
//! - important keywords → action (0.8)
//! - unsubscribe header or 2+ marketing keywords → trash (0.7 + 0.1 per keyword)
//! - noreply/automated senders → trash
//! - everything else → revisit (0.5)

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::pipeline::learning::{LEARNED_DECISIVE_CONFIDENCE, label_for, strongest_preference};
use crate::pipeline::types::{Classification, Classifier, Label, Message};
use crate::store::PreferenceStore;

/// Confidence for messages no rule matched.
const DEFAULT_CONFIDENCE: f32 = 0.5;

/// Marketing keywords needed before a message counts as promotional.
const MARKETING_THRESHOLD: usize = 2;

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy)]
pub enum RuleField {
    Sender,
    Subject,
    Content,
}

/// A single rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct TriageRule {
    /// Compiled regex for matching.
    pub regex: Regex,
    /// Which message field to match.
    pub field: RuleField,
    pub label: Label,
    pub confidence: f32,
    /// Why this rule triggers.
    pub reason: String,
}

impl TriageRule {
    fn matches(&self, message: &Message) -> bool {
        match self.field {
            RuleField::Sender => self.regex.is_match(&message.sender_key()),
            RuleField::Subject => self.regex.is_match(&message.subject),
            RuleField::Content => self.regex.is_match(&message.snippet),
        }
    }
}

/// Rule-based classifier.
pub struct HeuristicClassifier {
    /// Checked first, in order.
    important_rules: Vec<TriageRule>,
    /// Counted across subject and snippet.
    marketing_terms: Vec<Regex>,
    /// Checked after marketing scoring.
    sender_rules: Vec<TriageRule>,
    store: Option<Arc<dyn PreferenceStore>>,
}

impl HeuristicClassifier {
    /// Create a classifier with the default rule set.
    pub fn default_rules() -> Self {
        let important_rules = vec![
            TriageRule {
                regex: Regex::new(
                    r"(?i)\b(urgent|important|asap|action required|deadline|due (today|tomorrow)|please (review|respond|confirm))\b",
                )
                .unwrap(),
                field: RuleField::Subject,
                label: Label::Action,
                confidence: 0.8,
                reason: "important keyword in subject".into(),
            },
            TriageRule {
                regex: Regex::new(r"(?i)\b(invoice|payment (due|overdue|failed)|meeting (request|invite)|interview)\b")
                    .unwrap(),
                field: RuleField::Subject,
                label: Label::Action,
                confidence: 0.8,
                reason: "actionable request in subject".into(),
            },
        ];

        let marketing_terms = [
            r"(?i)\bsale\b",
            r"(?i)\bdiscount",
            r"(?i)\boffer\b",
            r"(?i)\bdeals?\b",
            r"(?i)\bpromo(tion)?",
            r"(?i)limited time",
            r"(?i)\bnewsletter\b",
            r"(?i)\d+\s?% off",
            r"(?i)free shipping",
            r"(?i)\bunsubscribe\b",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect();

        let sender_rules = vec![
            TriageRule {
                regex: Regex::new(r"(?i)^no[\-_.]?reply@").unwrap(),
                field: RuleField::Sender,
                label: Label::Trash,
                confidence: 0.6,
                reason: "noreply sender".into(),
            },
            TriageRule {
                regex: Regex::new(r"(?i)^(mailer[\-_]?daemon|postmaster)@").unwrap(),
                field: RuleField::Sender,
                label: Label::Trash,
                confidence: 0.6,
                reason: "automated mail system".into(),
            },
            TriageRule {
                regex: Regex::new(r"(?i)@(marketing|newsletter|promo|campaign)\b").unwrap(),
                field: RuleField::Sender,
                label: Label::Trash,
                confidence: 0.7,
                reason: "marketing/newsletter sender".into(),
            },
        ];

        Self {
            important_rules,
            marketing_terms,
            sender_rules,
            store: None,
        }
    }

    /// Create an empty classifier (for testing).
    pub fn empty() -> Self {
        Self {
            important_rules: Vec::new(),
            marketing_terms: Vec::new(),
            sender_rules: Vec::new(),
            store: None,
        }
    }

    /// Consult learned preferences from `store` before the rules.
    pub fn with_store(mut self, store: Arc<dyn PreferenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Add an extra rule checked after the important rules.
    pub fn add_rule(&mut self, rule: TriageRule) {
        self.sender_rules.push(rule);
    }

    /// Number of marketing terms present in subject and snippet.
    pub fn marketing_score(&self, message: &Message) -> usize {
        self.marketing_terms
            .iter()
            .filter(|re| re.is_match(&message.subject) || re.is_match(&message.snippet))
            .count()
    }

    /// Evaluate the rules only (no learned preferences).
    pub fn evaluate(&self, message: &Message) -> Classification {
        if let Some(rule) = self.important_rules.iter().find(|r| r.matches(message)) {
            debug!(id = %message.id, reason = %rule.reason, "Important rule matched");
            return Classification::new(&message.id, rule.label, rule.confidence, &rule.reason);
        }

        let score = self.marketing_score(message);
        if message.has_unsubscribe || score >= MARKETING_THRESHOLD {
            let confidence = (0.7 + 0.1 * score as f32).min(1.0);
            let reason = if message.has_unsubscribe && score < MARKETING_THRESHOLD {
                "mailing list (unsubscribe header)".to_string()
            } else {
                format!("promotional content ({score} marketing terms)")
            };
            return Classification::new(&message.id, Label::Trash, confidence, reason);
        }

        if let Some(rule) = self.sender_rules.iter().find(|r| r.matches(message)) {
            debug!(id = %message.id, reason = %rule.reason, "Sender rule matched");
            return Classification::new(&message.id, rule.label, rule.confidence, &rule.reason);
        }

        Classification::new(
            &message.id,
            Label::Revisit,
            DEFAULT_CONFIDENCE,
            "no strong signal",
        )
    }
}

#[async_trait]
impl Classifier for HeuristicClassifier {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn classify(&self, message: &Message) -> Result<Classification, LlmError> {
        if let Some(store) = &self.store {
            match strongest_preference(store.as_ref(), message).await {
                Ok(Some(pref)) if pref.confidence > LEARNED_DECISIVE_CONFIDENCE => {
                    return Ok(Classification::new(
                        &message.id,
                        label_for(pref.disposition),
                        pref.confidence,
                        format!("learned from past decisions ({} {})", pref.kind, pref.value),
                    ));
                }
                Ok(_) => {}
                Err(e) => warn!(id = %message.id, error = %e, "Preference lookup failed"),
            }
        }
        Ok(self.evaluate(message))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::pipeline::types::Disposition;
    use crate::store::{LibSqlBackend, PatternKind};

    fn message(sender: &str, subject: &str, snippet: &str) -> Message {
        Message {
            id: "m1".into(),
            sender: sender.into(),
            sender_name: None,
            subject: subject.into(),
            snippet: snippet.into(),
            thread_id: "m1".into(),
            received_at: Utc::now(),
            has_unsubscribe: false,
            disposition: None,
        }
    }

    #[test]
    fn important_subject_is_action() {
        let engine = HeuristicClassifier::default_rules();
        let c = engine.evaluate(&message("boss@work.com", "URGENT: contract review", ""));
        assert_eq!(c.label, Label::Action);
        assert!((c.confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn invoice_is_action() {
        let engine = HeuristicClassifier::default_rules();
        let c = engine.evaluate(&message("billing@vendor.com", "Your invoice for March", ""));
        assert_eq!(c.label, Label::Action);
    }

    #[test]
    fn marketing_terms_scale_confidence() {
        let engine = HeuristicClassifier::default_rules();
        let c = engine.evaluate(&message(
            "shop@store.com",
            "Summer sale: 30% off",
            "Free shipping for a limited time",
        ));
        assert_eq!(c.label, Label::Trash);
        assert!(engine.marketing_score(&message("a@b.com", "Summer sale: 30% off", "Free shipping for a limited time")) >= 4);
        assert!(c.confidence >= 1.0 - 1e-6);
    }

    #[test]
    fn single_marketing_term_is_not_enough() {
        let engine = HeuristicClassifier::default_rules();
        let c = engine.evaluate(&message("friend@mail.com", "Garage sale this weekend", ""));
        assert_eq!(c.label, Label::Revisit);
    }

    #[test]
    fn unsubscribe_header_alone_is_trash() {
        let engine = HeuristicClassifier::default_rules();
        let mut msg = message("list@project.org", "Release notes", "");
        msg.has_unsubscribe = true;
        let c = engine.evaluate(&msg);
        assert_eq!(c.label, Label::Trash);
        assert!((c.confidence - 0.7).abs() < 1e-6);
        assert!(c.rationale.contains("unsubscribe"));
    }

    #[test]
    fn noreply_sender_is_trash() {
        let engine = HeuristicClassifier::default_rules();
        let c = engine.evaluate(&message("No-Reply@service.com", "Your account", ""));
        assert_eq!(c.label, Label::Trash);
    }

    #[test]
    fn important_wins_over_marketing() {
        let engine = HeuristicClassifier::default_rules();
        let c = engine.evaluate(&message(
            "shop@store.com",
            "Action required: sale ends",
            "discount offer",
        ));
        assert_eq!(c.label, Label::Action);
    }

    #[test]
    fn empty_engine_defaults_to_revisit() {
        let engine = HeuristicClassifier::empty();
        let c = engine.evaluate(&message("a@b.com", "URGENT", "sale discount"));
        assert_eq!(c.label, Label::Revisit);
        assert!((c.confidence - DEFAULT_CONFIDENCE).abs() < 1e-6);
    }

    #[test]
    fn custom_rule() {
        let mut engine = HeuristicClassifier::empty();
        engine.add_rule(TriageRule {
            regex: Regex::new(r"(?i)@alerts\.example\.com$").unwrap(),
            field: RuleField::Sender,
            label: Label::Trash,
            confidence: 0.9,
            reason: "alert spam".into(),
        });
        let c = engine.evaluate(&message("Pager <bot@alerts.example.com>", "Disk 80%", ""));
        assert_eq!(c.label, Label::Trash);
        assert_eq!(c.rationale, "alert spam");
    }

    #[tokio::test]
    async fn strong_learned_preference_wins() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        store
            .add_preference(PatternKind::Sender, "boss@work.com", Disposition::Revisit, 0.95)
            .await
            .unwrap();

        let engine = HeuristicClassifier::default_rules().with_store(store);
        let c = engine
            .classify(&message("Boss <boss@work.com>", "URGENT: sign this", ""))
            .await
            .unwrap();
        assert_eq!(c.label, Label::Revisit);
        assert!(c.rationale.contains("learned"));
    }

    #[tokio::test]
    async fn weak_learned_preference_is_ignored() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        store
            .reinforce_preference(PatternKind::Domain, "work.com", Disposition::Trash)
            .await
            .unwrap();

        let engine = HeuristicClassifier::default_rules().with_store(store);
        let c = engine
            .classify(&message("boss@work.com", "URGENT: sign this", ""))
            .await
            .unwrap();
        assert_eq!(c.label, Label::Action);
    }
}
