//! Opt-out tracker: erasure requests and repeat-offender escalation.
//!
//! One record per normalized sender address. A sender who mails again
//! after the grace window has passed since their last request is a
//! repeat offender and gets escalated. Escalation never reverts.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SessionError;
use crate::pipeline::bulk::normalize_subject;
use crate::pipeline::types::normalize_address;
use crate::store::PreferenceStore;

/// Default grace window before a repeat sender is escalated.
pub const DEFAULT_GRACE_DAYS: i64 = 7;

/// Persistent opt-out state for one sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptOutRecord {
    /// Normalized sender address.
    pub sender: String,
    pub first_request: DateTime<Utc>,
    pub last_request: DateTime<Utc>,
    pub request_count: u32,
    pub escalated: bool,
}

/// Result of recording a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptOutOutcome {
    pub is_new_record: bool,
    pub escalated: bool,
}

/// Aggregate opt-out statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptOutStats {
    pub senders: u64,
    pub escalated: u64,
    pub total_requests: u64,
}

/// Apply one request to the prior record (if any).
///
/// Pure: the caller persists the returned record.
pub fn evaluate_request(
    prior: Option<&OptOutRecord>,
    sender: &str,
    now: DateTime<Utc>,
    grace: Duration,
) -> (OptOutRecord, OptOutOutcome) {
    match prior {
        None => (
            OptOutRecord {
                sender: normalize_address(sender),
                first_request: now,
                last_request: now,
                request_count: 1,
                escalated: false,
            },
            OptOutOutcome {
                is_new_record: true,
                escalated: false,
            },
        ),
        Some(prior) => {
            let escalated = prior.escalated || now - prior.last_request > grace;
            let record = OptOutRecord {
                sender: prior.sender.clone(),
                first_request: prior.first_request,
                last_request: now.max(prior.last_request),
                request_count: prior.request_count.saturating_add(1),
                escalated,
            };
            (
                record,
                OptOutOutcome {
                    is_new_record: false,
                    escalated,
                },
            )
        }
    }
}

/// Store-backed opt-out tracker.
pub struct OptOutTracker {
    store: Arc<dyn PreferenceStore>,
    grace: Duration,
}

impl OptOutTracker {
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        Self {
            store,
            grace: Duration::days(DEFAULT_GRACE_DAYS),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Record an opt-out request. The record is written before this returns.
    pub async fn record_request(
        &self,
        sender: &str,
        now: DateTime<Utc>,
    ) -> Result<OptOutOutcome, SessionError> {
        let key = normalize_address(sender);
        let persist_err = |source| SessionError::OptOutNotPersisted {
            sender: key.clone(),
            source,
        };

        let prior = self.store.get_opt_out(&key).await.map_err(persist_err)?;
        let (record, outcome) = evaluate_request(prior.as_ref(), &key, now, self.grace);
        self.store.put_opt_out(&record).await.map_err(persist_err)?;

        if outcome.escalated && !prior.as_ref().is_some_and(|p| p.escalated) {
            info!(sender = %key, count = record.request_count, "Repeat offender escalated");
        } else {
            info!(
                sender = %key,
                count = record.request_count,
                new = outcome.is_new_record,
                "Opt-out request recorded"
            );
        }
        Ok(outcome)
    }
}

// ── Erasure request draft ───────────────────────────────────────────

/// A data-erasure request to be filed as a draft reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErasureDraft {
    pub to: String,
    pub subject: String,
    pub body: String,
}

const ERASURE_BODY: &str = "\
Hello,

I am writing to request the erasure of all personal data you hold about me, \
and to withdraw any consent I have given for marketing communications.

Please:
- Remove my email address from all of your mailing lists
- Delete all personal data you hold about me
- Stop processing my personal data for marketing purposes
- Confirm in writing once this has been completed

I expect this request to be completed without undue delay and in any case \
within one month of receipt.

Thank you.";

/// Build the erasure request reply for a message from `sender`.
pub fn erasure_draft(sender: &str, subject: &str) -> ErasureDraft {
    let base = normalize_subject(subject);
    let subject = if base.is_empty() {
        "Data Erasure Request".to_string()
    } else {
        format!("Re: {base} - Data Erasure Request")
    };
    ErasureDraft {
        to: normalize_address(sender),
        subject,
        body: ERASURE_BODY.to_string(),
    }
}
