//! Batch policy: fetch, classify, and offer high-confidence results for
//! auto-apply.
//!
//! Flow:
//! 1. Fetch up to `size` messages from the inbox
//! 2. Drop anything the store says was already applied
//! 3. Classify each message (a failure becomes an unclassified revisit)
//! 4. Propose every classification at or above the threshold for auto-apply
//! 5. One approval covers the whole proposal; a rejection demotes all of it

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::channels::cli::truncate;
use crate::error::{Error, SessionError};
use crate::pipeline::types::{
    BatchContext, Classification, Classifier, DecisionSource, Disposition, InboxProvider, Label,
};
use crate::store::PreferenceStore;

/// Default auto-apply threshold.
pub const DEFAULT_THRESHOLD: f32 = 0.85;

/// Confidence at which a proposal is reported as high rather than medium.
pub const HIGH_CONFIDENCE: f32 = 0.95;

/// Subject width in the printed auto-apply summary.
const SUMMARY_SUBJECT_CHARS: usize = 60;

/// One message proposed for auto-apply.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryEntry {
    pub index: usize,
    pub sender: String,
    pub subject: String,
    pub label: Label,
    pub confidence: f32,
}

/// What the operator is asked to approve in one step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoApplySummary {
    pub entries: Vec<SummaryEntry>,
}

impl AutoApplySummary {
    pub fn from_batch(batch: &BatchContext, candidates: &[usize]) -> Self {
        let entries = candidates
            .iter()
            .map(|&i| {
                let message = batch.message(i);
                let c = batch.classification(i);
                SummaryEntry {
                    index: i,
                    sender: message.display_sender().to_string(),
                    subject: message.subject.clone(),
                    label: c.label,
                    confidence: c.confidence,
                }
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries grouped by label, in label order.
    pub fn by_label(&self) -> BTreeMap<Label, Vec<&SummaryEntry>> {
        let mut groups: BTreeMap<Label, Vec<&SummaryEntry>> = BTreeMap::new();
        for entry in &self.entries {
            groups.entry(entry.label).or_default().push(entry);
        }
        groups
    }

    /// `(high, medium)` confidence counts.
    pub fn bands(&self) -> (usize, usize) {
        let high = self
            .entries
            .iter()
            .filter(|e| e.confidence >= HIGH_CONFIDENCE)
            .count();
        (high, self.entries.len() - high)
    }

    /// Short sentence for narration.
    pub fn spoken(&self) -> String {
        let parts: Vec<String> = self
            .by_label()
            .iter()
            .map(|(label, entries)| format!("{} {}", entries.len(), label))
            .collect();
        let noun = if self.len() == 1 { "email" } else { "emails" };
        format!(
            "I can file {} {} automatically: {}. Apply them?",
            self.len(),
            noun,
            parts.join(", ")
        )
    }
}

impl fmt::Display for AutoApplySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (high, medium) = self.bands();
        writeln!(
            f,
            "Auto-apply {} message(s) ({} high, {} medium confidence):",
            self.len(),
            high,
            medium
        )?;
        for (label, entries) in self.by_label() {
            writeln!(f, "  {} ({})", label.as_str().to_uppercase(), entries.len())?;
            for e in entries {
                writeln!(
                    f,
                    "    {:>3.0}%  {}  {}",
                    e.confidence * 100.0,
                    e.sender,
                    truncate(&e.subject, SUMMARY_SUBJECT_CHARS)
                )?;
            }
        }
        Ok(())
    }
}

/// Asks the operator to approve an auto-apply proposal.
#[async_trait]
pub trait AutoApprover: Send {
    async fn approve(&mut self, summary: &AutoApplySummary) -> Result<bool, SessionError>;
}

/// Builds and pre-settles session batches.
pub struct BatchPolicy {
    inbox: Arc<dyn InboxProvider>,
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn PreferenceStore>,
    threshold: f32,
}

impl BatchPolicy {
    pub fn new(
        inbox: Arc<dyn InboxProvider>,
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn PreferenceStore>,
    ) -> Self {
        Self {
            inbox,
            classifier,
            store,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Fetch and classify a batch, marking auto-apply candidates.
    ///
    /// Inbox errors are returned as-is. Classifier errors never are.
    pub async fn prepare(&self, size: usize) -> Result<BatchContext, Error> {
        if size == 0 {
            return Ok(BatchContext::default());
        }

        let mut messages = self.inbox.fetch_unprocessed(size).await?;
        debug!(inbox = self.inbox.name(), fetched = messages.len(), "Fetched batch");

        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        match self.store.applied_message_ids(&ids).await {
            Ok(applied) if !applied.is_empty() => {
                messages.retain(|m| !applied.contains(&m.id));
                debug!(skipped = applied.len(), "Skipped already-applied messages");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not check applied messages"),
        }

        let mut classifications = Vec::with_capacity(messages.len());
        for message in &messages {
            let classification = match self.classifier.classify(message).await {
                Ok(mut c) => {
                    c.message_id.clone_from(&message.id);
                    c
                }
                Err(e) => {
                    warn!(
                        id = %message.id,
                        classifier = self.classifier.name(),
                        error = %e,
                        "Classification failed, leaving for manual review"
                    );
                    Classification::unclassified(message.id.clone(), &e.to_string())
                }
            };
            classifications.push(classification);
        }

        let candidates: Vec<usize> = classifications
            .iter()
            .enumerate()
            .filter(|(_, c)| c.confidence > 0.0 && c.confidence >= self.threshold)
            .map(|(i, _)| i)
            .collect();

        let mut batch = BatchContext::new(messages, classifications);
        batch.set_auto_candidates(candidates);
        Ok(batch)
    }

    /// Apply the operator's verdict on the auto-apply proposal.
    ///
    /// Approved candidates are resolved with their suggested label. A
    /// rejection leaves them all for manual review.
    pub fn settle(&self, batch: &mut BatchContext, approved: bool) -> Result<usize, SessionError> {
        let candidates = batch.take_auto_candidates();
        if !approved {
            info!(demoted = candidates.len(), "Auto-apply declined");
            return Ok(0);
        }
        let now = Utc::now();
        for &i in &candidates {
            let disposition = Disposition::from(batch.classification(i).label);
            batch.resolve(i, disposition, DecisionSource::Auto, now)?;
        }
        info!(applied = candidates.len(), "Auto-apply approved");
        Ok(candidates.len())
    }

    /// Prepare a batch and put its auto-apply proposal to `approver`.
    ///
    /// The returned batch's `undecided()` indices are the review queue.
    pub async fn next_batch(
        &self,
        size: usize,
        approver: &mut dyn AutoApprover,
    ) -> Result<BatchContext, Error> {
        let mut batch = self.prepare(size).await?;
        if batch.auto_candidates().is_empty() {
            return Ok(batch);
        }
        let summary = AutoApplySummary::from_batch(&batch, batch.auto_candidates());
        let approved = approver.approve(&summary).await?;
        self.settle(&mut batch, approved)?;
        Ok(batch)
    }
}
