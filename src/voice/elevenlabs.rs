//! ElevenLabs streaming synthesis piped into a local audio player.
//!
//! Posts to `https://api.elevenlabs.io/v1/text-to-speech/{voice_id}/stream`
//! with `xi-api-key` authentication and writes MP3 chunks to the player's
//! stdin as they arrive. Cancellation drops the HTTP stream and kills the
//! player, so no buffered audio keeps playing.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::VoiceError;
use crate::voice::{CancellationToken, Playback, VoiceRenderer, split_command};

const API_BASE: &str = "https://api.elevenlabs.io/v1/text-to-speech";
const BACKEND: &str = "elevenlabs";

/// Default voice ("Rachel").
pub const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";

/// Low-latency model.
pub const DEFAULT_MODEL_ID: &str = "eleven_flash_v2_5";

/// Player reading MP3 from stdin.
pub const DEFAULT_PLAYER: &str = "mpg123 -q -";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for one utterance, including streaming the audio.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to default HTTP client for ElevenLabs");
            reqwest::Client::new()
        })
}

pub struct ElevenLabsRenderer {
    api_key: SecretString,
    voice_id: String,
    model_id: String,
    player: String,
    base_url: String,
    client: reqwest::Client,
}

impl ElevenLabsRenderer {
    pub fn new(api_key: SecretString, voice_id: impl Into<String>) -> Self {
        Self {
            api_key,
            voice_id: voice_id.into(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            player: DEFAULT_PLAYER.to_string(),
            base_url: API_BASE.to_string(),
            client: http_client(),
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn with_player(mut self, player: impl Into<String>) -> Self {
        self.player = player.into();
        self
    }

    /// Point at another API host (a proxy, or a local test server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn stream_url(&self) -> String {
        format!("{}/{}/stream", self.base_url, self.voice_id)
    }

    fn request_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "text": text,
            "model_id": self.model_id,
            "voice_settings": {
                "stability": 0.5,
                "similarity_boost": 0.8,
                "style": 0.2,
                "use_speaker_boost": true,
            },
        })
    }

    fn spawn_player(&self) -> Result<Child, VoiceError> {
        let (program, args) = split_command(&self.player)
            .ok_or_else(|| VoiceError::Playback("empty player command".into()))?;
        Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::Playback(format!("failed to start {program}: {e}")))
    }

    /// Stream audio into the player until the response ends.
    async fn pump(&self, mut resp: reqwest::Response, player: &mut Child) -> Result<(), VoiceError> {
        let mut stdin = player
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Playback("player stdin unavailable".into()))?;

        while let Some(chunk) = resp.chunk().await.map_err(|e| VoiceError::Synthesis {
            backend: BACKEND.into(),
            reason: format!("stream read error: {e}"),
        })? {
            stdin
                .write_all(&chunk)
                .await
                .map_err(|e| VoiceError::Playback(format!("player write failed: {e}")))?;
        }
        stdin.shutdown().await?;
        drop(stdin);

        let status = player.wait().await?;
        if !status.success() {
            return Err(VoiceError::Playback(format!("player exited with {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl VoiceRenderer for ElevenLabsRenderer {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn speak(&self, text: &str, cancel: CancellationToken) -> Result<Playback, VoiceError> {
        if cancel.is_cancelled() {
            return Ok(Playback::Cancelled);
        }

        let request = self
            .client
            .post(self.stream_url())
            .header("xi-api-key", self.api_key.expose_secret())
            .header("Accept", "audio/mpeg")
            .json(&self.request_body(text))
            .send();

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Playback::Cancelled),
            resp = request => resp.map_err(|e| VoiceError::Synthesis {
                backend: BACKEND.into(),
                reason: format!("request failed: {e}"),
            })?,
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Playback::Cancelled),
                body = resp.text() => body.unwrap_or_default(),
            };
            return Err(VoiceError::Synthesis {
                backend: BACKEND.into(),
                reason: format!("HTTP {status}: {}", body.chars().take(200).collect::<String>()),
            });
        }

        let mut player = self.spawn_player()?;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.pump(resp, &mut player) => Some(result),
        };

        match outcome {
            None => {
                let _ = player.kill().await;
                debug!("ElevenLabs playback cancelled");
                Ok(Playback::Cancelled)
            }
            Some(result) => result.map(|()| Playback::Finished),
        }
    }
}
