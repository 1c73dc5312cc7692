//! Text-only renderers.

use async_trait::async_trait;

use crate::error::VoiceError;
use crate::voice::{CancellationToken, Playback, VoiceRenderer};

/// Prints each utterance to the terminal instead of speaking it.
pub struct ConsoleRenderer;

#[async_trait]
impl VoiceRenderer for ConsoleRenderer {
    fn name(&self) -> &str {
        "console"
    }

    async fn speak(&self, text: &str, cancel: CancellationToken) -> Result<Playback, VoiceError> {
        if cancel.is_cancelled() {
            return Ok(Playback::Cancelled);
        }
        // Raw mode needs explicit carriage returns.
        print!("  🔊 {text}\r\n");
        Ok(Playback::Finished)
    }
}

/// Says nothing. Used when voice is disabled.
pub struct SilentRenderer;

#[async_trait]
impl VoiceRenderer for SilentRenderer {
    fn name(&self) -> &str {
        "off"
    }

    async fn speak(&self, _text: &str, cancel: CancellationToken) -> Result<Playback, VoiceError> {
        if cancel.is_cancelled() {
            Ok(Playback::Cancelled)
        } else {
            Ok(Playback::Finished)
        }
    }
}
