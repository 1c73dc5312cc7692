//! Local synthesizer process (`espeak`, `say`, ...).

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::VoiceError;
use crate::voice::{CancellationToken, Playback, VoiceRenderer, split_command};

/// Runs a synthesizer command per utterance; the text is the last argument.
/// Cancellation kills the process.
pub struct CommandRenderer {
    command: String,
}

impl CommandRenderer {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl VoiceRenderer for CommandRenderer {
    fn name(&self) -> &str {
        &self.command
    }

    async fn speak(&self, text: &str, cancel: CancellationToken) -> Result<Playback, VoiceError> {
        if cancel.is_cancelled() {
            return Ok(Playback::Cancelled);
        }
        let (program, args) = split_command(&self.command).ok_or_else(|| VoiceError::Synthesis {
            backend: "command".into(),
            reason: "empty voice command".into(),
        })?;

        let mut child = Command::new(&program)
            .args(&args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::Synthesis {
                backend: program.clone(),
                reason: format!("failed to start: {e}"),
            })?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                debug!(program = %program, "Speech cancelled");
                Ok(Playback::Cancelled)
            }
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    Ok(Playback::Finished)
                } else {
                    Err(VoiceError::Synthesis {
                        backend: program,
                        reason: format!("exited with {status}"),
                    })
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    #[tokio::test]
    async fn finished_when_command_succeeds() {
        let renderer = CommandRenderer::new("true");
        let result = renderer.speak("hello", CancellationToken::new()).await.unwrap();
        assert_eq!(result, Playback::Finished);
    }

    #[tokio::test]
    async fn failing_command_is_an_error() {
        let renderer = CommandRenderer::new("false");
        assert!(renderer.speak("hello", CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let renderer = CommandRenderer::new("definitely-not-a-synthesizer-xyz");
        assert!(renderer.speak("hello", CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn cancel_kills_long_utterance() {
        // `sleep` treats the utterance as its duration argument.
        let renderer = CommandRenderer::new("sleep");
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = renderer.speak("30", token).await.unwrap();
        assert_eq!(result, Playback::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
