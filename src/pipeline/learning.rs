//! Preference learning from committed decisions.
//!
//! Every decision reinforces patterns for the sender, the sender's domain,
//! and the first few significant subject words. Classifiers consult the
//! learned patterns before (or alongside) their own judgement.

use tracing::warn;

use crate::error::DatabaseError;
use crate::pipeline::bulk::normalize_subject;
use crate::pipeline::types::{Disposition, Label, Message};
use crate::store::{PatternKind, Preference, PreferenceStore};

/// Subject words shorter than this are not learned.
const MIN_KEYWORD_LEN: usize = 4;

/// How many subject words are learned per message.
const MAX_KEYWORDS: usize = 3;

/// A learned preference must be above this to decide on its own.
pub const LEARNED_DECISIVE_CONFIDENCE: f32 = 0.7;

/// Patterns a message contributes to learning.
pub fn extract_patterns(message: &Message) -> Vec<(PatternKind, String)> {
    let mut patterns = Vec::with_capacity(2 + MAX_KEYWORDS);
    let sender = message.sender_key();
    if !sender.is_empty() {
        patterns.push((PatternKind::Sender, sender));
    }
    if let Some(domain) = message.sender_domain() {
        patterns.push((PatternKind::Domain, domain));
    }
    for word in subject_keywords(&message.subject) {
        patterns.push((PatternKind::SubjectKeyword, word));
    }
    patterns
}

/// Significant lowercase words from a subject, in order.
pub fn subject_keywords(subject: &str) -> Vec<String> {
    normalize_subject(subject)
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| w.chars().count() >= MIN_KEYWORD_LEN)
        .take(MAX_KEYWORDS)
        .collect()
}

/// Reinforce every pattern of `message` toward `disposition`.
///
/// Individual failures are logged; learning never blocks a session.
pub async fn learn_from_decision(
    store: &dyn PreferenceStore,
    message: &Message,
    disposition: Disposition,
) -> usize {
    let mut learned = 0;
    for (kind, value) in extract_patterns(message) {
        match store.reinforce_preference(kind, &value, disposition).await {
            Ok(()) => learned += 1,
            Err(e) => warn!(kind = %kind, value = %value, error = %e, "Failed to learn preference"),
        }
    }
    learned
}

/// Strongest learned preference for the message's sender or domain.
pub async fn strongest_preference(
    store: &dyn PreferenceStore,
    message: &Message,
) -> Result<Option<Preference>, DatabaseError> {
    let mut best: Option<Preference> = None;
    let mut lookups = vec![(PatternKind::Sender, message.sender_key())];
    if let Some(domain) = message.sender_domain() {
        lookups.push((PatternKind::Domain, domain));
    }
    for (kind, value) in lookups {
        for pref in store.find_preferences(kind, &value).await? {
            if best.as_ref().is_none_or(|b| pref.confidence > b.confidence) {
                best = Some(pref);
            }
        }
    }
    Ok(best)
}

/// Label a learned disposition maps back to.
pub fn label_for(disposition: Disposition) -> Label {
    match disposition {
        Disposition::Trash | Disposition::OptOut | Disposition::Spam => Label::Trash,
        Disposition::Revisit => Label::Revisit,
        Disposition::Action => Label::Action,
    }
}
