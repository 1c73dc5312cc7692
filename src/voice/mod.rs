//! Speech output for narration.
//!
//! A [`VoiceRenderer`] speaks one utterance at a time and must stop
//! playback promptly when the supplied [`CancellationToken`] fires.
//! Renderers: ElevenLabs streaming, a local synthesizer command, and a
//! console text fallback.

pub mod command;
pub mod console;
pub mod elevenlabs;
pub mod script;

pub use command::CommandRenderer;
pub use console::{ConsoleRenderer, SilentRenderer};
pub use elevenlabs::ElevenLabsRenderer;
pub use script::NarrationScript;

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
pub use tokio_util::sync::CancellationToken;

use crate::error::VoiceError;

/// Longest utterance sent to a synthesizer, in characters.
pub const MAX_SPEECH_CHARS: usize = 500;

/// How an utterance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Playback {
    Finished,
    Cancelled,
}

/// Text-to-speech backend.
#[async_trait]
pub trait VoiceRenderer: Send + Sync {
    fn name(&self) -> &str;

    /// Speak `text`. Returns when playback finishes or `cancel` fires;
    /// after a cancelled return no audio from this call may still play.
    async fn speak(&self, text: &str, cancel: CancellationToken) -> Result<Playback, VoiceError>;
}

/// Voice backend selection.
#[derive(Debug, Clone)]
pub enum VoiceBackend {
    ElevenLabs {
        api_key: SecretString,
        voice_id: String,
        model_id: String,
        player: String,
    },
    Command(String),
    Console,
    Off,
}

/// Build the renderer for a backend.
pub fn create_renderer(backend: &VoiceBackend) -> Arc<dyn VoiceRenderer> {
    match backend {
        VoiceBackend::ElevenLabs {
            api_key,
            voice_id,
            model_id,
            player,
        } => Arc::new(
            ElevenLabsRenderer::new(api_key.clone(), voice_id.clone())
                .with_model(model_id.clone())
                .with_player(player.clone()),
        ),
        VoiceBackend::Command(cmd) => Arc::new(CommandRenderer::new(cmd)),
        VoiceBackend::Console => Arc::new(ConsoleRenderer),
        VoiceBackend::Off => Arc::new(SilentRenderer),
    }
}

/// Make text pleasant to hear: spell out symbols, collapse whitespace,
/// cap the length.
pub fn clean_text_for_speech(text: &str) -> String {
    const REPLACEMENTS: &[(&str, &str)] = &[
        ("@", " at "),
        ("#", " number "),
        ("&", " and "),
        ("%", " percent "),
        ("$", " dollars "),
        ("€", " euros "),
        ("£", " pounds "),
        ("→", " goes to "),
        ("←", " comes from "),
    ];

    let mut clean = text.to_string();
    for (from, to) in REPLACEMENTS {
        if clean.contains(from) {
            clean = clean.replace(from, to);
        }
    }
    let clean = clean.split_whitespace().collect::<Vec<_>>().join(" ");

    if clean.chars().count() > MAX_SPEECH_CHARS {
        let mut cut: String = clean.chars().take(MAX_SPEECH_CHARS - 3).collect();
        cut.push_str("...");
        cut
    } else {
        clean
    }
}

/// Split a command line into program and arguments.
pub(crate) fn split_command(cmd: &str) -> Option<(String, Vec<String>)> {
    let mut parts = cmd.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}
