//! Session runner: one batch at a time, decisions first, mailbox second.
//!
//! A batch is only committed once every message in it has a decision.
//! Commit order is fixed: every decision is written to the store, then
//! dispositions are applied to the mailbox, then preferences are learned.
//! A store failure aborts before the mailbox is touched.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::channels::Console;
use crate::error::{Error, SessionError};
use crate::optout::{DEFAULT_GRACE_DAYS, OptOutTracker};
use crate::pipeline::learning::learn_from_decision;
use crate::pipeline::policy::{AutoApplySummary, AutoApprover, BatchPolicy};
use crate::pipeline::types::{
    BatchContext, Classifier, Decision, DecisionSource, Disposition, InboxProvider, Message,
};
use crate::session::decision_loop::{DecisionLoop, LoopState, speak_until_key};
use crate::session::keys::{Key, KeySource};
use crate::store::PreferenceStore;
use crate::voice::{VoiceRenderer, clean_text_for_speech};

/// Totals for one or more committed batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub batches: usize,
    pub counts: BTreeMap<Disposition, usize>,
    pub auto: usize,
    pub manual: usize,
    pub bulk: usize,
    /// Dispositions the mailbox rejected with a transient error.
    pub apply_failures: usize,
}

impl SessionSummary {
    pub fn total(&self) -> usize {
        self.auto + self.manual + self.bulk
    }

    pub fn count(&self, disposition: Disposition) -> usize {
        self.counts.get(&disposition).copied().unwrap_or(0)
    }

    /// Share of decisions that needed no per-message keypress.
    pub fn automation_rate(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            self.auto as f64 / self.total() as f64
        }
    }

    fn record(&mut self, decision: &Decision) {
        *self.counts.entry(decision.disposition).or_default() += 1;
        match decision.source {
            DecisionSource::Auto => self.auto += 1,
            DecisionSource::Manual => self.manual += 1,
            DecisionSource::Bulk => self.bulk += 1,
        }
    }

    pub fn merge(&mut self, other: &SessionSummary) {
        self.batches += other.batches;
        for (d, n) in &other.counts {
            *self.counts.entry(*d).or_default() += n;
        }
        self.auto += other.auto;
        self.manual += other.manual;
        self.bulk += other.bulk;
        self.apply_failures += other.apply_failures;
    }
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Triaged {} message(s) in {} batch(es)",
            self.total(),
            self.batches
        )?;
        for (disposition, n) in &self.counts {
            writeln!(f, "  {:<8} {n}", disposition.as_str())?;
        }
        writeln!(
            f,
            "  auto {} / manual {} / bulk {}  (automation {:.0}%)",
            self.auto,
            self.manual,
            self.bulk,
            self.automation_rate() * 100.0
        )?;
        if self.apply_failures > 0 {
            writeln!(f, "  {} disposition(s) failed to apply", self.apply_failures)?;
        }
        Ok(())
    }
}

/// Interactive triage session over one inbox.
pub struct TriageSession {
    policy: BatchPolicy,
    decision_loop: DecisionLoop,
    inbox: Arc<dyn InboxProvider>,
    store: Arc<dyn PreferenceStore>,
    voice: Arc<dyn VoiceRenderer>,
    keys: Box<dyn KeySource>,
    console: Console,
    batches_seen: usize,
}

impl TriageSession {
    pub fn new(
        inbox: Arc<dyn InboxProvider>,
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn PreferenceStore>,
        voice: Arc<dyn VoiceRenderer>,
        keys: Box<dyn KeySource>,
    ) -> Self {
        let policy = BatchPolicy::new(Arc::clone(&inbox), classifier, Arc::clone(&store));
        let decision_loop = DecisionLoop::new(
            Arc::clone(&voice),
            OptOutTracker::new(Arc::clone(&store)),
        );
        Self {
            policy,
            decision_loop,
            inbox,
            store,
            voice,
            keys,
            console: Console::new(),
            batches_seen: 0,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.policy = self.policy.with_threshold(threshold);
        self
    }

    /// Opt-out grace window, in days.
    pub fn with_grace_days(mut self, days: i64) -> Self {
        let days = if days > 0 { days } else { DEFAULT_GRACE_DAYS };
        let tracker = OptOutTracker::new(Arc::clone(&self.store)).with_grace(Duration::days(days));
        self.decision_loop = DecisionLoop::new(Arc::clone(&self.voice), tracker);
        self
    }

    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    /// Observe the decision loop state.
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.decision_loop.subscribe()
    }

    /// Triage one batch of up to `batch_size` messages.
    ///
    /// An empty summary means the inbox had nothing left. Ctrl+C returns
    /// `SessionError::Interrupted` and the batch is not applied.
    pub async fn run_session(&mut self, batch_size: usize) -> Result<SessionSummary, Error> {
        let mut approver = OperatorApprover {
            voice: &self.voice,
            keys: self.keys.as_mut(),
            console: self.console,
        };
        let mut batch = self.policy.next_batch(batch_size, &mut approver).await?;
        if batch.is_empty() {
            info!("No untriaged messages");
            return Ok(SessionSummary::default());
        }

        self.batches_seen += 1;
        self.console.batch_started(self.batches_seen, batch.len());
        info!(
            size = batch.len(),
            auto = batch.decisions().len(),
            "Batch ready for review"
        );

        let total = batch.len();
        for index in batch.undecided() {
            if batch.is_decided(index) {
                continue;
            }
            self.console.message(
                index + 1,
                total,
                batch.message(index),
                batch.classification(index),
            );
            let resolution = self
                .decision_loop
                .resolve(&mut batch, index, self.keys.as_mut())
                .await?;
            self.console.resolved(&resolution);
        }

        let left = batch.undecided().len();
        if left > 0 {
            return Err(SessionError::IncompleteBatch(left).into());
        }
        self.commit(&batch).await
    }

    /// Run batches until the inbox is empty, the operator stops, or Ctrl+C.
    pub async fn run(&mut self, batch_size: usize) -> Result<SessionSummary, Error> {
        let mut totals = SessionSummary::default();
        loop {
            let summary = match self.run_session(batch_size).await {
                Ok(summary) => summary,
                Err(Error::Session(SessionError::Interrupted)) => {
                    self.console.notice("Interrupted. The current batch was not applied.");
                    break;
                }
                Err(e) => return Err(e),
            };
            if summary.total() == 0 {
                self.console.notice("Inbox is clear.");
                break;
            }
            totals.merge(&summary);

            match self.confirm_continue().await {
                Ok(true) => {}
                Ok(false) | Err(SessionError::Interrupted) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(totals)
    }

    async fn confirm_continue(&mut self) -> Result<bool, SessionError> {
        self.console.notice("Continue with the next batch? [y/n]");
        ask_yes_no(
            &self.voice,
            self.keys.as_mut(),
            "Continue with the next batch?".into(),
        )
        .await
    }

    async fn commit(&self, batch: &BatchContext) -> Result<SessionSummary, Error> {
        let decided: Vec<(&Decision, &Message)> = batch
            .decisions()
            .iter()
            .filter_map(|d| batch.index_of(&d.message_id).map(|i| (d, batch.message(i))))
            .collect();

        for (decision, message) in &decided {
            self.store
                .record_decision(decision, message)
                .await
                .map_err(|source| {
                    error!(id = %decision.message_id, error = %source, "Decision not persisted");
                    SessionError::DecisionNotPersisted {
                        message_id: decision.message_id.clone(),
                        source,
                    }
                })?;
        }

        let mut summary = SessionSummary {
            batches: 1,
            ..SessionSummary::default()
        };
        for (decision, message) in &decided {
            summary.record(decision);
            match self.inbox.apply_disposition(message, decision.disposition).await {
                Ok(()) => {
                    if let Err(e) = self.store.mark_applied(&decision.message_id).await {
                        warn!(id = %decision.message_id, error = %e, "Could not mark decision applied");
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!(id = %decision.message_id, error = %e, "Mailbox rejected the session");
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(id = %decision.message_id, error = %e, "Disposition not applied");
                    self.console.warning(&format!("Could not apply {}: {e}", decision.disposition));
                    summary.apply_failures += 1;
                }
            }
            learn_from_decision(self.store.as_ref(), message, decision.disposition).await;
        }

        info!(
            decisions = summary.total(),
            auto = summary.auto,
            failures = summary.apply_failures,
            "Batch committed"
        );
        Ok(summary)
    }
}

/// Wait for `y` or `n` while `spoken` is narrated. Other keys are ignored.
async fn ask_yes_no(
    voice: &Arc<dyn VoiceRenderer>,
    keys: &mut dyn KeySource,
    spoken: String,
) -> Result<bool, SessionError> {
    let (state, _) = watch::channel(LoopState::Idle);
    let state = Arc::new(state);
    let stages = vec![(LoopState::NarratingSuggestion, clean_text_for_speech(&spoken))];
    let mut key = speak_until_key(voice, stages, &state, keys).await?;
    loop {
        match key {
            Key::Char('y' | 'Y') => return Ok(true),
            Key::Char('n' | 'N') => return Ok(false),
            Key::Interrupt => return Err(SessionError::Interrupted),
            _ => {}
        }
        key = keys.next_key().await?;
    }
}

/// Puts the auto-apply proposal to the operator.
struct OperatorApprover<'a> {
    voice: &'a Arc<dyn VoiceRenderer>,
    keys: &'a mut dyn KeySource,
    console: Console,
}

#[async_trait]
impl AutoApprover for OperatorApprover<'_> {
    async fn approve(&mut self, summary: &AutoApplySummary) -> Result<bool, SessionError> {
        self.console.auto_summary(summary);
        ask_yes_no(self.voice, &mut *self.keys, summary.spoken()).await
    }
}
