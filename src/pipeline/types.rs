//! Shared types for the triage pipeline.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{InboxError, LlmError, SessionError};

// ── Message ─────────────────────────────────────────────────────────

/// A fetched email as the session sees it.
///
/// Providers convert their native format into this struct. The
/// disposition starts unset and is written only when the message is
/// resolved, either by auto-apply or by the decision loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Provider-assigned id, unique within the mailbox.
    pub id: String,
    /// Sender email address as it appeared in the From header.
    pub sender: String,
    /// Human-readable sender name (if available).
    pub sender_name: Option<String>,
    pub subject: String,
    /// Body excerpt used for classification and narration.
    pub snippet: String,
    /// Conversation grouping key.
    pub thread_id: String,
    pub received_at: DateTime<Utc>,
    /// The message carries a List-Unsubscribe header.
    #[serde(default)]
    pub has_unsubscribe: bool,
    #[serde(default)]
    pub disposition: Option<Disposition>,
}

impl Message {
    /// Normalized sender address, used as the key for opt-outs and
    /// bulk matching.
    pub fn sender_key(&self) -> String {
        normalize_address(&self.sender)
    }

    /// Domain part of the normalized sender address.
    pub fn sender_domain(&self) -> Option<String> {
        let key = self.sender_key();
        key.rsplit_once('@').map(|(_, domain)| domain.to_string())
    }

    /// Display name if present, otherwise the address.
    pub fn display_sender(&self) -> &str {
        self.sender_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.sender)
    }
}

/// Normalize an email address: extract `addr` from `Name <addr>`,
/// trim, lowercase.
pub fn normalize_address(raw: &str) -> String {
    let trimmed = raw.trim();
    let inner = match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if end > start => &trimmed[start + 1..end],
        _ => trimmed,
    };
    inner.trim().to_lowercase()
}

// ── Labels & dispositions ───────────────────────────────────────────

/// Classifier output label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Trash,
    Revisit,
    Action,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trash => "trash",
            Self::Revisit => "revisit",
            Self::Action => "action",
        }
    }

    /// Parse a label, accepting the common synonyms models produce.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trash" | "delete" | "archive" => Some(Self::Trash),
            "revisit" | "later" => Some(Self::Revisit),
            "action" | "action_needed" | "action-needed" => Some(Self::Action),
            _ => None,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Trash,
    Revisit,
    Action,
    OptOut,
    /// Opt-out escalated for a repeat offender.
    Spam,
}

impl Disposition {
    pub const ALL: [Disposition; 5] = [
        Self::Trash,
        Self::Revisit,
        Self::Action,
        Self::OptOut,
        Self::Spam,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trash => "trash",
            Self::Revisit => "revisit",
            Self::Action => "action",
            Self::OptOut => "opt_out",
            Self::Spam => "spam",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trash" => Some(Self::Trash),
            "revisit" => Some(Self::Revisit),
            "action" => Some(Self::Action),
            "opt_out" => Some(Self::OptOut),
            "spam" => Some(Self::Spam),
            _ => None,
        }
    }

    /// Phrase used when speaking or printing a suggestion.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Trash => "trash it",
            Self::Revisit => "mark it to revisit",
            Self::Action => "mark it as needing action",
            Self::OptOut => "opt out",
            Self::Spam => "report it as spam",
        }
    }
}

impl From<Label> for Disposition {
    fn from(label: Label) -> Self {
        match label {
            Label::Trash => Self::Trash,
            Label::Revisit => Self::Revisit,
            Label::Action => Self::Action,
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Classification ──────────────────────────────────────────────────

/// One classifier verdict for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub message_id: String,
    pub label: Label,
    /// In `[0, 1]`.
    pub confidence: f32,
    pub rationale: String,
}

impl Classification {
    pub fn new(
        message_id: impl Into<String>,
        label: Label,
        confidence: f32,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            label,
            confidence: confidence.clamp(0.0, 1.0),
            rationale: rationale.into(),
        }
    }

    /// Placeholder used when the classifier failed for a message.
    /// Never auto-applied.
    pub fn unclassified(message_id: impl Into<String>, reason: &str) -> Self {
        Self {
            message_id: message_id.into(),
            label: Label::Revisit,
            confidence: 0.0,
            rationale: format!("Unclassified: {reason}"),
        }
    }
}

// ── Decision ────────────────────────────────────────────────────────

/// Who produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Auto,
    Manual,
    Bulk,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::Bulk => "bulk",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            "bulk" => Some(Self::Bulk),
            _ => None,
        }
    }
}

/// The terminal record for a message in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub message_id: String,
    pub disposition: Disposition,
    pub source: DecisionSource,
    pub decided_at: DateTime<Utc>,
}

// ── Batch context ───────────────────────────────────────────────────

/// The messages and classifications of one session batch, in fetch order.
#[derive(Debug, Default)]
pub struct BatchContext {
    messages: Vec<Message>,
    classifications: Vec<Classification>,
    decisions: Vec<Decision>,
    /// Indices proposed for auto-apply.
    auto_candidates: Vec<usize>,
}

impl BatchContext {
    /// Build a batch. `classifications[i]` belongs to `messages[i]`.
    pub fn new(messages: Vec<Message>, classifications: Vec<Classification>) -> Self {
        debug_assert_eq!(messages.len(), classifications.len());
        Self {
            messages,
            classifications,
            decisions: Vec::new(),
            auto_candidates: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, index: usize) -> &Message {
        &self.messages[index]
    }

    pub fn classification(&self, index: usize) -> &Classification {
        &self.classifications[index]
    }

    pub fn index_of(&self, message_id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == message_id)
    }

    pub fn is_decided(&self, index: usize) -> bool {
        self.messages[index].disposition.is_some()
    }

    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    pub fn auto_candidates(&self) -> &[usize] {
        &self.auto_candidates
    }

    pub(crate) fn set_auto_candidates(&mut self, candidates: Vec<usize>) {
        self.auto_candidates = candidates;
    }

    pub(crate) fn take_auto_candidates(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.auto_candidates)
    }

    /// Undecided message indices in fetch order.
    pub fn undecided(&self) -> Vec<usize> {
        (0..self.messages.len())
            .filter(|&i| !self.is_decided(i))
            .collect()
    }

    /// Whether every message has a decision.
    pub fn is_complete(&self) -> bool {
        self.messages.iter().all(|m| m.disposition.is_some())
    }

    /// Record the decision for a message. A message is resolved at most once.
    pub fn resolve(
        &mut self,
        index: usize,
        disposition: Disposition,
        source: DecisionSource,
        now: DateTime<Utc>,
    ) -> Result<&Decision, SessionError> {
        let message = &mut self.messages[index];
        if message.disposition.is_some() {
            return Err(SessionError::AlreadyDecided(message.id.clone()));
        }
        message.disposition = Some(disposition);
        self.decisions.push(Decision {
            message_id: message.id.clone(),
            disposition,
            source,
            decided_at: now,
        });
        Ok(&self.decisions[self.decisions.len() - 1])
    }
}

// ── Collaborator traits ─────────────────────────────────────────────

/// Mailbox access. Pure I/O, no triage logic.
#[async_trait]
pub trait InboxProvider: Send + Sync {
    /// Provider name for logging (e.g. "imap").
    fn name(&self) -> &str;

    /// Fetch up to `limit` messages in inbox order, excluding any that
    /// already carry a terminal triage label from an earlier session.
    async fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<Message>, InboxError>;

    /// Carry out a disposition on the mailbox.
    async fn apply_disposition(
        &self,
        message: &Message,
        disposition: Disposition,
    ) -> Result<(), InboxError>;
}

/// Message classifier. Failures are recovered by the caller.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(&self, message: &Message) -> Result<Classification, LlmError>;
}
