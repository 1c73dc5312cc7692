//! Staged narration text for one message.

use crate::pipeline::types::{Classification, Disposition, Message};
use crate::voice::clean_text_for_speech;

/// Rationales at least this long are not read aloud.
const MAX_SPOKEN_RATIONALE: usize = 100;

/// Suggestion first, details second. Either stage can be interrupted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarrationScript {
    pub suggestion: String,
    pub details: String,
}

impl NarrationScript {
    pub fn for_message(message: &Message, classification: &Classification) -> Self {
        let suggestion = if classification.confidence <= 0.0 {
            "I couldn't classify this one.".to_string()
        } else {
            format!(
                "Should I {}?",
                Disposition::from(classification.label).verb()
            )
        };

        let subject = if message.subject.trim().is_empty() {
            "no subject"
        } else {
            message.subject.trim()
        };
        let mut details = format!(
            "Email from {}. Subject: {}.",
            message.display_sender(),
            subject
        );
        let rationale = classification.rationale.trim();
        if !rationale.is_empty() && rationale.chars().count() < MAX_SPOKEN_RATIONALE {
            details.push(' ');
            details.push_str(rationale);
        }

        Self {
            suggestion: clean_text_for_speech(&suggestion),
            details: clean_text_for_speech(&details),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::pipeline::types::Label;

    fn message(subject: &str) -> Message {
        Message {
            id: "1".into(),
            sender: "deals@shop.com".into(),
            sender_name: Some("Shop & Co".into()),
            subject: subject.into(),
            snippet: String::new(),
            thread_id: "1".into(),
            received_at: Utc::now(),
            has_unsubscribe: false,
            disposition: None,
        }
    }

    #[test]
    fn suggestion_only_names_the_action() {
        let script = NarrationScript::for_message(
            &message("Sale"),
            &Classification::new("1", Label::Trash, 0.6, "Promotional"),
        );
        assert_eq!(script.suggestion, "Should I trash it?");
        assert!(!script.suggestion.contains("Sale"));
    }

    #[test]
    fn details_include_sender_subject_and_short_rationale() {
        let script = NarrationScript::for_message(
            &message("Weekend sale"),
            &Classification::new("1", Label::Trash, 0.6, "Looks promotional."),
        );
        assert_eq!(
            script.details,
            "Email from Shop and Co. Subject: Weekend sale. Looks promotional."
        );
    }

    #[test]
    fn long_rationale_is_skipped() {
        let script = NarrationScript::for_message(
            &message("Hi"),
            &Classification::new("1", Label::Revisit, 0.6, "x".repeat(150)),
        );
        assert_eq!(script.details, "Email from Shop and Co. Subject: Hi.");
    }

    #[test]
    fn unclassified_message_says_so() {
        let script = NarrationScript::for_message(
            &message(""),
            &Classification::unclassified("1", "timeout"),
        );
        assert_eq!(script.suggestion, "I couldn't classify this one.");
        assert!(script.details.contains("no subject"));
    }
}
