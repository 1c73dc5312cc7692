//! Single-keypress input.
//!
//! The terminal is put in raw mode and a reader thread forwards key
//! presses over a channel, so a key is available the moment it is
//! pressed (no Enter needed). Keys typed ahead stay queued in order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::SessionError;
use crate::pipeline::types::Disposition;

/// How often the reader thread checks for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A captured key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Space,
    /// Ctrl+C.
    Interrupt,
    Other,
}

impl From<KeyEvent> for Key {
    fn from(event: KeyEvent) -> Self {
        match (event.modifiers, event.code) {
            (KeyModifiers::CONTROL, KeyCode::Char('c')) => Key::Interrupt,
            (_, KeyCode::Enter) => Key::Enter,
            (_, KeyCode::Char(' ')) => Key::Space,
            (_, KeyCode::Char(c)) => Key::Char(c),
            _ => Key::Other,
        }
    }
}

/// What a key means during a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// `9`, `5`, `1`.
    Choose(Disposition),
    /// Enter: take the suggested label.
    Accept,
    /// Space: reject the suggestion and wait for a numeric key.
    Reject,
    /// `0`.
    OptOut,
    /// `-`: trash this and matching messages.
    Bulk,
    /// Ctrl+C.
    Abort,
    Ignored,
}

/// The fixed decision key table.
pub fn map_key(key: Key) -> KeyAction {
    match key {
        Key::Char('9') => KeyAction::Choose(Disposition::Trash),
        Key::Char('5') => KeyAction::Choose(Disposition::Revisit),
        Key::Char('1') => KeyAction::Choose(Disposition::Action),
        Key::Char('0') => KeyAction::OptOut,
        Key::Char('-') => KeyAction::Bulk,
        Key::Enter => KeyAction::Accept,
        Key::Space => KeyAction::Reject,
        Key::Interrupt => KeyAction::Abort,
        _ => KeyAction::Ignored,
    }
}

/// Source of key presses.
#[async_trait]
pub trait KeySource: Send {
    /// Wait for the next key. No timeout.
    async fn next_key(&mut self) -> Result<Key, SessionError>;
}

/// Keys delivered over an mpsc channel.
pub struct ChannelKeys {
    rx: mpsc::UnboundedReceiver<Key>,
}

impl ChannelKeys {
    /// Create a connected sender and source.
    pub fn pair() -> (mpsc::UnboundedSender<Key>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl KeySource for ChannelKeys {
    async fn next_key(&mut self) -> Result<Key, SessionError> {
        self.rx.recv().await.ok_or(SessionError::InputClosed)
    }
}

/// Raw-mode terminal keyboard. Restores the terminal on drop.
pub struct TerminalKeys {
    keys: ChannelKeys,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl TerminalKeys {
    pub fn start() -> Result<Self, SessionError> {
        terminal::enable_raw_mode()
            .map_err(|e| SessionError::Terminal(format!("failed to enable raw mode: {e}")))?;

        let (tx, keys) = ChannelKeys::pair();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let reader = std::thread::Builder::new()
            .name("key-reader".into())
            .spawn(move || read_keys(tx, stop_flag))
            .map_err(|e| {
                let _ = terminal::disable_raw_mode();
                SessionError::Terminal(format!("failed to start key reader: {e}"))
            })?;

        debug!("Terminal key reader started");
        Ok(Self {
            keys,
            stop,
            reader: Some(reader),
        })
    }
}

fn read_keys(tx: mpsc::UnboundedSender<Key>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match event::poll(POLL_INTERVAL) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                error!(error = %e, "Terminal poll failed");
                break;
            }
        }
        match event::read() {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                if tx.send(Key::from(key)).is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Terminal read failed");
                break;
            }
        }
    }
}

#[async_trait]
impl KeySource for TerminalKeys {
    async fn next_key(&mut self) -> Result<Key, SessionError> {
        self.keys.next_key().await
    }
}

impl Drop for TerminalKeys {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        let _ = terminal::disable_raw_mode();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_key_table() {
        assert_eq!(map_key(Key::Char('9')), KeyAction::Choose(Disposition::Trash));
        assert_eq!(map_key(Key::Char('5')), KeyAction::Choose(Disposition::Revisit));
        assert_eq!(map_key(Key::Char('1')), KeyAction::Choose(Disposition::Action));
        assert_eq!(map_key(Key::Char('0')), KeyAction::OptOut);
        assert_eq!(map_key(Key::Char('-')), KeyAction::Bulk);
        assert_eq!(map_key(Key::Enter), KeyAction::Accept);
        assert_eq!(map_key(Key::Space), KeyAction::Reject);
        assert_eq!(map_key(Key::Interrupt), KeyAction::Abort);
    }

    #[test]
    fn other_keys_are_ignored() {
        for key in [Key::Char('x'), Key::Char('2'), Key::Char('q'), Key::Other] {
            assert_eq!(map_key(key), KeyAction::Ignored);
        }
    }

    #[test]
    fn crossterm_events_translate() {
        let ev = |code, modifiers| KeyEvent::new(code, modifiers);
        assert_eq!(
            Key::from(ev(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Key::Interrupt
        );
        assert_eq!(Key::from(ev(KeyCode::Char('c'), KeyModifiers::NONE)), Key::Char('c'));
        assert_eq!(Key::from(ev(KeyCode::Char(' '), KeyModifiers::NONE)), Key::Space);
        assert_eq!(Key::from(ev(KeyCode::Enter, KeyModifiers::NONE)), Key::Enter);
        assert_eq!(Key::from(ev(KeyCode::Esc, KeyModifiers::NONE)), Key::Other);
    }

    #[tokio::test]
    async fn channel_keys_preserve_order_and_close() {
        let (tx, mut keys) = ChannelKeys::pair();
        tx.send(Key::Char('9')).unwrap();
        tx.send(Key::Enter).unwrap();
        drop(tx);
        assert_eq!(keys.next_key().await.unwrap(), Key::Char('9'));
        assert_eq!(keys.next_key().await.unwrap(), Key::Enter);
        assert!(matches!(keys.next_key().await, Err(SessionError::InputClosed)));
    }
}
