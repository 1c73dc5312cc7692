//! Per-message decision loop.
//!
//! Narration runs on its own task while the loop waits for a key. The
//! first key press cancels the narration token and waits for the
//! narration task to stop before the key is acted on, so audio never
//! overlaps the next prompt.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SessionError, VoiceError};
use crate::optout::OptOutTracker;
use crate::pipeline::bulk::find_bulk_candidates;
use crate::pipeline::types::{BatchContext, DecisionSource, Disposition};
use crate::session::keys::{Key, KeyAction, KeySource, map_key};
use crate::voice::script::NarrationScript;
use crate::voice::{CancellationToken, Playback, VoiceRenderer};

/// Observable state of the loop for the message being decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    NarratingSuggestion,
    NarratingDetails,
    AwaitingKey,
    Resolved,
}

/// How a message was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub disposition: Disposition,
    /// Other batch indices trashed along with this one by a bulk action.
    pub bulk: Vec<usize>,
}

/// How long a cancelled renderer gets to wind down before its task is aborted.
const NARRATION_STOP_GRACE: Duration = Duration::from_millis(50);

#[derive(Debug)]
enum NarrationOutcome {
    Completed,
    Cancelled,
    Failed(VoiceError),
}

enum Choice {
    Direct(Disposition),
    OptOut,
    Bulk,
}

pub struct DecisionLoop {
    voice: Arc<dyn VoiceRenderer>,
    tracker: OptOutTracker,
    state: Arc<watch::Sender<LoopState>>,
}

impl DecisionLoop {
    pub fn new(voice: Arc<dyn VoiceRenderer>, tracker: OptOutTracker) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            voice,
            tracker,
            state: Arc::new(state),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Narrate the message at `index` and resolve it from the operator's keys.
    ///
    /// Returns once a decision is recorded in `batch`. Ctrl+C returns
    /// `SessionError::Interrupted` with the message left undecided.
    pub async fn resolve(
        &self,
        batch: &mut BatchContext,
        index: usize,
        keys: &mut dyn KeySource,
    ) -> Result<Resolution, SessionError> {
        let script = NarrationScript::for_message(batch.message(index), batch.classification(index));
        let stages = vec![
            (LoopState::NarratingSuggestion, script.suggestion),
            (LoopState::NarratingDetails, script.details),
        ];

        self.state.send_replace(LoopState::Idle);
        let first = speak_until_key(&self.voice, stages, &self.state, keys).await?;

        let suggested = Disposition::from(batch.classification(index).label);
        let mut rejected = false;
        let mut key = first;
        let choice = loop {
            match map_key(key) {
                KeyAction::Abort => {
                    info!("Operator interrupted the session");
                    return Err(SessionError::Interrupted);
                }
                KeyAction::Choose(d) => break Choice::Direct(d),
                KeyAction::OptOut => break Choice::OptOut,
                KeyAction::Accept if !rejected => break Choice::Direct(suggested),
                KeyAction::Bulk if !rejected => break Choice::Bulk,
                KeyAction::Reject => {
                    rejected = true;
                    debug!("Suggestion rejected, waiting for a replacement");
                }
                KeyAction::Accept | KeyAction::Bulk | KeyAction::Ignored => {
                    debug!(?key, rejected, "Key ignored");
                }
            }
            key = keys.next_key().await?;
        };

        let now = Utc::now();
        let resolution = match choice {
            Choice::Direct(disposition) => {
                batch.resolve(index, disposition, DecisionSource::Manual, now)?;
                Resolution {
                    disposition,
                    bulk: Vec::new(),
                }
            }
            Choice::OptOut => {
                let sender = batch.message(index).sender.clone();
                let outcome = self.tracker.record_request(&sender, now).await?;
                let disposition = if outcome.escalated {
                    Disposition::Spam
                } else {
                    Disposition::OptOut
                };
                batch.resolve(index, disposition, DecisionSource::Manual, now)?;
                Resolution {
                    disposition,
                    bulk: Vec::new(),
                }
            }
            Choice::Bulk => {
                batch.resolve(index, Disposition::Trash, DecisionSource::Manual, now)?;
                let anchor = batch.message(index).clone();
                let matches = find_bulk_candidates(&anchor, batch);
                for &i in &matches {
                    batch.resolve(i, Disposition::Trash, DecisionSource::Bulk, now)?;
                }
                info!(anchor = %anchor.id, matched = matches.len(), "Bulk trash");
                Resolution {
                    disposition: Disposition::Trash,
                    bulk: matches,
                }
            }
        };

        self.state.send_replace(LoopState::Resolved);
        Ok(resolution)
    }
}

/// Speak `stages` in order while waiting for a key.
///
/// The first key cancels any narration still running. It is returned only
/// after the narration task has stopped. A narration failure is logged
/// and the wait continues silently.
pub(crate) async fn speak_until_key(
    voice: &Arc<dyn VoiceRenderer>,
    stages: Vec<(LoopState, String)>,
    state: &Arc<watch::Sender<LoopState>>,
    keys: &mut dyn KeySource,
) -> Result<Key, SessionError> {
    let cancel = CancellationToken::new();
    let mut narration: JoinHandle<NarrationOutcome> = tokio::spawn(narrate(
        Arc::clone(voice),
        stages,
        cancel.clone(),
        Arc::clone(state),
    ));
    let mut narrating = true;

    let key = {
        let next = keys.next_key();
        tokio::pin!(next);
        loop {
            tokio::select! {
                biased;
                key = &mut next => break key,
                outcome = &mut narration, if narrating => {
                    narrating = false;
                    match outcome {
                        Ok(NarrationOutcome::Failed(e)) => {
                            warn!(backend = voice.name(), error = %e, "Narration failed");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Narration task aborted"),
                    }
                    state.send_replace(LoopState::AwaitingKey);
                }
            }
        }
    };

    cancel.cancel();
    if narrating {
        match tokio::time::timeout(NARRATION_STOP_GRACE, &mut narration).await {
            Ok(Ok(outcome)) => debug!(?outcome, "Narration stopped by key press"),
            Ok(Err(e)) => warn!(error = %e, "Narration task aborted"),
            Err(_) => {
                // Renderer ignored its token; players are kill_on_drop.
                warn!(backend = voice.name(), "Narration did not stop in time, aborting");
                narration.abort();
            }
        }
    }
    state.send_replace(LoopState::AwaitingKey);
    key
}

async fn narrate(
    voice: Arc<dyn VoiceRenderer>,
    stages: Vec<(LoopState, String)>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<LoopState>>,
) -> NarrationOutcome {
    for (stage, text) in stages {
        if cancel.is_cancelled() {
            return NarrationOutcome::Cancelled;
        }
        state.send_replace(stage);
        match voice.speak(&text, cancel.child_token()).await {
            Ok(Playback::Finished) => {}
            Ok(Playback::Cancelled) => return NarrationOutcome::Cancelled,
            Err(e) => return NarrationOutcome::Failed(e),
        }
    }
    NarrationOutcome::Completed
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::optout::OptOutRecord;
    use crate::pipeline::types::{Classification, Label, Message};
    use crate::session::keys::ChannelKeys;
    use crate::store::{LibSqlBackend, PreferenceStore};

    /// Records each utterance and blocks until cancelled.
    #[derive(Default)]
    struct BlockingVoice {
        spoken: Mutex<Vec<String>>,
        cancelled: Mutex<usize>,
    }

    #[async_trait]
    impl VoiceRenderer for BlockingVoice {
        fn name(&self) -> &str {
            "blocking"
        }

        async fn speak(&self, text: &str, cancel: CancellationToken) -> Result<Playback, VoiceError> {
            self.spoken.lock().unwrap().push(text.to_string());
            cancel.cancelled().await;
            *self.cancelled.lock().unwrap() += 1;
            Ok(Playback::Cancelled)
        }
    }

    /// Finishes each utterance immediately.
    #[derive(Default)]
    struct InstantVoice {
        spoken: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VoiceRenderer for InstantVoice {
        fn name(&self) -> &str {
            "instant"
        }

        async fn speak(&self, text: &str, _cancel: CancellationToken) -> Result<Playback, VoiceError> {
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(Playback::Finished)
        }
    }

    struct BrokenVoice;

    #[async_trait]
    impl VoiceRenderer for BrokenVoice {
        fn name(&self) -> &str {
            "broken"
        }

        async fn speak(&self, _text: &str, _cancel: CancellationToken) -> Result<Playback, VoiceError> {
            Err(VoiceError::Synthesis {
                backend: "broken".into(),
                reason: "no audio device".into(),
            })
        }
    }

    fn msg(id: &str, sender: &str, subject: &str) -> Message {
        Message {
            id: id.into(),
            sender: sender.into(),
            sender_name: None,
            subject: subject.into(),
            snippet: String::new(),
            thread_id: id.into(),
            received_at: Utc::now(),
            has_unsubscribe: false,
            disposition: None,
        }
    }

    fn batch(messages: Vec<Message>, label: Label) -> BatchContext {
        let classes = messages
            .iter()
            .map(|m| Classification::new(m.id.clone(), label, 0.6, "Looks routine"))
            .collect();
        BatchContext::new(messages, classes)
    }

    async fn store() -> Arc<dyn PreferenceStore> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    async fn decision_loop(voice: Arc<dyn VoiceRenderer>) -> (DecisionLoop, Arc<dyn PreferenceStore>) {
        let store = store().await;
        let tracker = OptOutTracker::new(Arc::clone(&store));
        (DecisionLoop::new(voice, tracker), store)
    }

    #[tokio::test]
    async fn key_during_suggestion_cancels_narration() {
        let voice = Arc::new(BlockingVoice::default());
        let (dl, _) = decision_loop(voice.clone()).await;
        let mut states = dl.subscribe();
        let mut b = batch(vec![msg("1", "a@x.com", "Hello")], Label::Trash);

        let (tx, mut keys) = ChannelKeys::pair();
        let driver = tokio::spawn(async move {
            states
                .wait_for(|s| *s == LoopState::NarratingSuggestion)
                .await
                .unwrap();
            tx.send(Key::Char('5')).unwrap();
            tx
        });

        let resolution = tokio::time::timeout(
            Duration::from_secs(5),
            dl.resolve(&mut b, 0, &mut keys),
        )
        .await
        .expect("resolve should not hang")
        .unwrap();
        driver.await.unwrap();

        assert_eq!(resolution.disposition, Disposition::Revisit);
        assert_eq!(*voice.cancelled.lock().unwrap(), 1);
        // Details were never started after the key press.
        assert_eq!(voice.spoken.lock().unwrap().len(), 1);
        assert_eq!(dl.state(), LoopState::Resolved);
    }

    #[tokio::test]
    async fn key_while_details_speak_stops_them() {
        let voice = Arc::new(DetailsBlockingVoice::default());
        let (dl, _) = decision_loop(voice.clone()).await;
        let mut states = dl.subscribe();
        let mut b = batch(vec![msg("1", "a@x.com", "Hello")], Label::Action);

        let (tx, mut keys) = ChannelKeys::pair();
        let driver = tokio::spawn(async move {
            states
                .wait_for(|s| *s == LoopState::NarratingDetails)
                .await
                .unwrap();
            tx.send(Key::Enter).unwrap();
            tx
        });

        let resolution = tokio::time::timeout(
            Duration::from_secs(5),
            dl.resolve(&mut b, 0, &mut keys),
        )
        .await
        .expect("resolve should not hang")
        .unwrap();
        driver.await.unwrap();

        assert_eq!(resolution.disposition, Disposition::Action);
        assert!(*voice.details_cancelled.lock().unwrap());
    }

    /// Never looks at its token; flags when its playback future is dropped.
    #[derive(Default)]
    struct DeafVoice {
        dropped: Arc<std::sync::atomic::AtomicBool>,
    }

    struct DropFlag(Arc<std::sync::atomic::AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl VoiceRenderer for DeafVoice {
        fn name(&self) -> &str {
            "deaf"
        }

        async fn speak(&self, _text: &str, _cancel: CancellationToken) -> Result<Playback, VoiceError> {
            let _flag = DropFlag(Arc::clone(&self.dropped));
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Playback::Finished)
        }
    }

    #[tokio::test]
    async fn renderer_ignoring_cancel_cannot_hold_the_key() {
        let voice = Arc::new(DeafVoice::default());
        let dropped = Arc::clone(&voice.dropped);
        let (dl, _) = decision_loop(voice).await;
        let mut states = dl.subscribe();
        let mut b = batch(vec![msg("1", "a@x.com", "Hello")], Label::Revisit);

        let (tx, mut keys) = ChannelKeys::pair();
        let driver = tokio::spawn(async move {
            states
                .wait_for(|s| *s == LoopState::NarratingSuggestion)
                .await
                .unwrap();
            tx.send(Key::Char('9')).unwrap();
            tx
        });

        let started = std::time::Instant::now();
        let resolution = tokio::time::timeout(
            Duration::from_secs(2),
            dl.resolve(&mut b, 0, &mut keys),
        )
        .await
        .expect("key was held by narration")
        .unwrap();
        driver.await.unwrap();

        assert_eq!(resolution.disposition, Disposition::Trash);
        assert!(started.elapsed() < Duration::from_secs(1));
        // The aborted task drops the playback future.
        tokio::time::timeout(Duration::from_secs(1), async {
            while !dropped.load(std::sync::atomic::Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("playback future still alive");
    }

    /// Finishes the first utterance, blocks on the second until cancelled.
    #[derive(Default)]
    struct DetailsBlockingVoice {
        calls: Mutex<usize>,
        details_cancelled: Mutex<bool>,
    }

    #[async_trait]
    impl VoiceRenderer for DetailsBlockingVoice {
        fn name(&self) -> &str {
            "details-blocking"
        }

        async fn speak(&self, _text: &str, cancel: CancellationToken) -> Result<Playback, VoiceError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if call == 1 {
                return Ok(Playback::Finished);
            }
            cancel.cancelled().await;
            *self.details_cancelled.lock().unwrap() = true;
            Ok(Playback::Cancelled)
        }
    }

    #[tokio::test]
    async fn enter_accepts_suggestion() {
        let (dl, _) = decision_loop(Arc::new(InstantVoice::default())).await;
        let mut b = batch(vec![msg("1", "a@x.com", "Hello")], Label::Trash);
        let (tx, mut keys) = ChannelKeys::pair();
        tx.send(Key::Enter).unwrap();

        let r = dl.resolve(&mut b, 0, &mut keys).await.unwrap();
        assert_eq!(r.disposition, Disposition::Trash);
        assert_eq!(b.decisions()[0].source, DecisionSource::Manual);
    }

    #[tokio::test]
    async fn reject_then_numeric_key_replaces_suggestion() {
        let (dl, _) = decision_loop(Arc::new(InstantVoice::default())).await;
        let mut b = batch(vec![msg("1", "a@x.com", "Hello")], Label::Trash);
        let (tx, mut keys) = ChannelKeys::pair();
        tx.send(Key::Space).unwrap();
        tx.send(Key::Char('5')).unwrap();

        let r = dl.resolve(&mut b, 0, &mut keys).await.unwrap();
        assert_eq!(r.disposition, Disposition::Revisit);
    }

    #[tokio::test]
    async fn enter_after_reject_does_not_resolve() {
        let (dl, _) = decision_loop(Arc::new(InstantVoice::default())).await;
        let mut b = batch(vec![msg("1", "a@x.com", "Hello")], Label::Trash);
        let (tx, mut keys) = ChannelKeys::pair();
        tx.send(Key::Space).unwrap();
        tx.send(Key::Enter).unwrap();
        tx.send(Key::Char('-')).unwrap();
        tx.send(Key::Char('1')).unwrap();

        let r = dl.resolve(&mut b, 0, &mut keys).await.unwrap();
        assert_eq!(r.disposition, Disposition::Action);
        assert_eq!(b.decisions().len(), 1);
    }

    #[tokio::test]
    async fn unrecognized_keys_keep_waiting() {
        let voice = Arc::new(InstantVoice::default());
        let (dl, _) = decision_loop(voice.clone()).await;
        let mut b = batch(vec![msg("1", "a@x.com", "Hello")], Label::Trash);
        let (tx, mut keys) = ChannelKeys::pair();
        tx.send(Key::Char('x')).unwrap();
        tx.send(Key::Other).unwrap();
        tx.send(Key::Char('9')).unwrap();

        let r = dl.resolve(&mut b, 0, &mut keys).await.unwrap();
        assert_eq!(r.disposition, Disposition::Trash);
        // Narration is not restarted by ignored keys.
        assert!(voice.spoken.lock().unwrap().len() <= 2);
    }

    #[tokio::test]
    async fn voice_failure_falls_back_to_awaiting_key() {
        let (dl, _) = decision_loop(Arc::new(BrokenVoice)).await;
        let mut states = dl.subscribe();
        let mut b = batch(vec![msg("1", "a@x.com", "Hello")], Label::Revisit);
        let (tx, mut keys) = ChannelKeys::pair();

        let driver = tokio::spawn(async move {
            states
                .wait_for(|s| *s == LoopState::AwaitingKey)
                .await
                .unwrap();
            tx.send(Key::Enter).unwrap();
            tx
        });

        let r = tokio::time::timeout(Duration::from_secs(5), dl.resolve(&mut b, 0, &mut keys))
            .await
            .expect("resolve should not hang")
            .unwrap();
        driver.await.unwrap();
        assert_eq!(r.disposition, Disposition::Revisit);
    }

    #[tokio::test]
    async fn ctrl_c_interrupts_without_deciding() {
        let (dl, _) = decision_loop(Arc::new(InstantVoice::default())).await;
        let mut b = batch(vec![msg("1", "a@x.com", "Hello")], Label::Trash);
        let (tx, mut keys) = ChannelKeys::pair();
        tx.send(Key::Interrupt).unwrap();

        let err = dl.resolve(&mut b, 0, &mut keys).await.unwrap_err();
        assert!(matches!(err, SessionError::Interrupted));
        assert!(!b.is_decided(0));
    }

    #[tokio::test]
    async fn closed_input_is_an_error() {
        let (dl, _) = decision_loop(Arc::new(InstantVoice::default())).await;
        let mut b = batch(vec![msg("1", "a@x.com", "Hello")], Label::Trash);
        let (tx, mut keys) = ChannelKeys::pair();
        drop(tx);

        let err = dl.resolve(&mut b, 0, &mut keys).await.unwrap_err();
        assert!(matches!(err, SessionError::InputClosed));
    }

    #[tokio::test]
    async fn first_opt_out_records_request() {
        let (dl, store) = decision_loop(Arc::new(InstantVoice::default())).await;
        let mut b = batch(vec![msg("1", "News <News@List.com>", "Weekly")], Label::Trash);
        let (tx, mut keys) = ChannelKeys::pair();
        tx.send(Key::Char('0')).unwrap();

        let r = dl.resolve(&mut b, 0, &mut keys).await.unwrap();
        assert_eq!(r.disposition, Disposition::OptOut);
        let record = store.get_opt_out("news@list.com").await.unwrap().unwrap();
        assert_eq!(record.request_count, 1);
        assert!(!record.escalated);
    }

    #[tokio::test]
    async fn repeat_offender_opt_out_becomes_spam() {
        let (dl, store) = decision_loop(Arc::new(InstantVoice::default())).await;
        let long_ago: DateTime<Utc> = Utc::now() - chrono::Duration::days(10);
        store
            .put_opt_out(&OptOutRecord {
                sender: "news@list.com".into(),
                first_request: long_ago,
                last_request: long_ago,
                request_count: 1,
                escalated: false,
            })
            .await
            .unwrap();

        let mut b = batch(vec![msg("1", "news@list.com", "Weekly")], Label::Trash);
        let (tx, mut keys) = ChannelKeys::pair();
        tx.send(Key::Char('0')).unwrap();

        let r = dl.resolve(&mut b, 0, &mut keys).await.unwrap();
        assert_eq!(r.disposition, Disposition::Spam);
        let record = store.get_opt_out("news@list.com").await.unwrap().unwrap();
        assert_eq!(record.request_count, 2);
        assert!(record.escalated);
    }

    #[tokio::test]
    async fn bulk_trashes_matching_standalone_messages() {
        let (dl, _) = decision_loop(Arc::new(InstantVoice::default())).await;
        let mut b = batch(
            vec![
                msg("1", "deals@shop.com", "Flash sale"),
                msg("2", "deals@shop.com", "Re: Flash sale"),
                msg("3", "friend@mail.com", "Flash sale"),
                msg("4", "deals@shop.com", "Your receipt"),
            ],
            Label::Revisit,
        );
        let (tx, mut keys) = ChannelKeys::pair();
        tx.send(Key::Char('-')).unwrap();

        let r = dl.resolve(&mut b, 0, &mut keys).await.unwrap();
        assert_eq!(r.disposition, Disposition::Trash);
        assert_eq!(r.bulk, vec![1]);
        assert_eq!(b.undecided(), vec![2, 3]);
        assert_eq!(b.decisions()[1].source, DecisionSource::Bulk);
    }
}
