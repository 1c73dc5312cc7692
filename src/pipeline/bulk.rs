//! Bulk match engine: same sender, same subject, standalone thread.
//!
//! When the operator bulk-archives a message, every other undecided
//! message in the batch from the same sender with the same normalized
//! subject is resolved the same way, unless it belongs to a conversation
//! with more than one message in the batch.

use std::collections::HashMap;

use crate::pipeline::types::{BatchContext, Message};

/// Reply/forward prefixes stripped from subjects before comparison.
const SUBJECT_PREFIXES: &[&str] = &["re:", "fwd:", "fw:"];

/// Strip any leading run of `Re:`/`Fwd:`/`Fw:` tokens (case-insensitive)
/// and surrounding whitespace.
///
/// Idempotent: `normalize_subject(normalize_subject(s)) == normalize_subject(s)`.
pub fn normalize_subject(subject: &str) -> &str {
    let mut rest = subject.trim();
    'strip: loop {
        for prefix in SUBJECT_PREFIXES {
            if rest
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
            {
                rest = rest[prefix.len()..].trim_start();
                continue 'strip;
            }
        }
        return rest;
    }
}

/// Indices of batch messages eligible to share the anchor's bulk action,
/// in fetch order. The anchor itself is never included.
pub fn find_bulk_candidates(anchor: &Message, batch: &BatchContext) -> Vec<usize> {
    let sender = anchor.sender_key();
    let subject = normalize_subject(&anchor.subject);

    let mut thread_sizes: HashMap<&str, usize> = HashMap::new();
    for msg in batch.messages() {
        *thread_sizes.entry(msg.thread_id.as_str()).or_default() += 1;
    }

    batch
        .messages()
        .iter()
        .enumerate()
        .filter(|(_, msg)| msg.id != anchor.id && msg.disposition.is_none())
        .filter(|(_, msg)| msg.sender_key() == sender)
        .filter(|(_, msg)| normalize_subject(&msg.subject).eq_ignore_ascii_case(subject))
        .filter(|(_, msg)| thread_sizes.get(msg.thread_id.as_str()).copied().unwrap_or(0) <= 1)
        .map(|(i, _)| i)
        .collect()
}
