//! `PreferenceStore` trait: single async interface for all persistence.
//!
//! Holds the decision history, opt-out records, and learned preferences.
//! Passed to the session as an explicit handle.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::optout::{OptOutRecord, OptOutStats};
use crate::pipeline::types::{Decision, Disposition, Message};

/// What a learned preference matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    Sender,
    Domain,
    SubjectKeyword,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sender => "sender",
            Self::Domain => "domain",
            Self::SubjectKeyword => "subject_keyword",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sender" => Some(Self::Sender),
            "domain" => Some(Self::Domain),
            "subject_keyword" | "keyword" => Some(Self::SubjectKeyword),
            _ => None,
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A learned triage rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Preference {
    pub id: i64,
    pub kind: PatternKind,
    pub value: String,
    pub disposition: Disposition,
    pub confidence: f32,
    pub usage_count: u32,
    pub updated_at: DateTime<Utc>,
}

/// A persisted decision with the message context it was made on.
#[derive(Debug, Clone)]
pub struct StoredDecision {
    pub decision: Decision,
    pub sender: String,
    pub subject: String,
    pub applied: bool,
}

/// Backend-agnostic store for decisions, opt-outs, and preferences.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    // ── Decisions ───────────────────────────────────────────────────

    /// Durably record a decision. Re-recording a message replaces it.
    async fn record_decision(
        &self,
        decision: &Decision,
        message: &Message,
    ) -> Result<(), DatabaseError>;

    /// Mark a decision as carried out on the mailbox.
    async fn mark_applied(&self, message_id: &str) -> Result<(), DatabaseError>;

    /// The subset of `message_ids` whose decision was already applied.
    async fn applied_message_ids(
        &self,
        message_ids: &[String],
    ) -> Result<HashSet<String>, DatabaseError>;

    async fn get_decision(&self, message_id: &str)
    -> Result<Option<StoredDecision>, DatabaseError>;

    /// Decision counts per disposition across all sessions.
    async fn decision_counts(&self) -> Result<Vec<(Disposition, u64)>, DatabaseError>;

    // ── Opt-outs ────────────────────────────────────────────────────

    async fn get_opt_out(&self, sender: &str) -> Result<Option<OptOutRecord>, DatabaseError>;

    /// Insert or replace the record for `record.sender`.
    async fn put_opt_out(&self, record: &OptOutRecord) -> Result<(), DatabaseError>;

    async fn opt_out_stats(&self) -> Result<OptOutStats, DatabaseError>;

    // ── Preferences ─────────────────────────────────────────────────

    /// Strengthen (or create) the preference for a pattern.
    async fn reinforce_preference(
        &self,
        kind: PatternKind,
        value: &str,
        disposition: Disposition,
    ) -> Result<(), DatabaseError>;

    /// Preferences for an exact pattern, strongest first.
    async fn find_preferences(
        &self,
        kind: PatternKind,
        value: &str,
    ) -> Result<Vec<Preference>, DatabaseError>;

    /// Strongest preferences overall.
    async fn list_preferences(&self, limit: usize) -> Result<Vec<Preference>, DatabaseError>;

    /// Add a preference by hand. Returns its id.
    async fn add_preference(
        &self,
        kind: PatternKind,
        value: &str,
        disposition: Disposition,
        confidence: f32,
    ) -> Result<i64, DatabaseError>;

    /// Delete a preference. Returns whether it existed.
    async fn delete_preference(&self, id: i64) -> Result<bool, DatabaseError>;
}
