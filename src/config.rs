//! Configuration, built from environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use secrecy::SecretString;

use crate::channels::ImapConfig;
use crate::error::ConfigError;
use crate::llm::LlmConfig;
use crate::optout::DEFAULT_GRACE_DAYS;
use crate::pipeline::policy::DEFAULT_THRESHOLD;
use crate::voice::VoiceBackend;
use crate::voice::elevenlabs::{DEFAULT_MODEL_ID, DEFAULT_PLAYER, DEFAULT_VOICE_ID};

pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_VOICE_COMMAND: &str = "espeak";

/// Everything the binary needs to start a session.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// Auto-apply threshold in [0, 1].
    pub threshold: f32,
    pub batch_size: usize,
    pub grace_days: i64,
    pub voice: VoiceBackend,
    /// `None` falls back to the heuristic classifier.
    pub llm: Option<LlmConfig>,
    /// `None` when `IMAP_HOST` is unset.
    pub imap: Option<ImapConfig>,
}

impl TriageConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = get("TRIAGE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./triage_data"));
        let db_path = get("TRIAGE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("triage.db"));

        let threshold: f32 = parse_or(&get, "TRIAGE_THRESHOLD", DEFAULT_THRESHOLD)?;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_THRESHOLD".into(),
                message: format!("{threshold} is outside 0.0..=1.0"),
            });
        }

        let batch_size: usize = parse_or(&get, "TRIAGE_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_BATCH_SIZE".into(),
                message: "must be at least 1".into(),
            });
        }

        let grace_days: i64 = parse_or(&get, "TRIAGE_OPTOUT_GRACE_DAYS", DEFAULT_GRACE_DAYS)?;
        if grace_days < 1 {
            return Err(ConfigError::InvalidValue {
                key: "TRIAGE_OPTOUT_GRACE_DAYS".into(),
                message: "must be at least 1 day".into(),
            });
        }

        let voice = voice_backend(&get)?;

        let llm = get("ANTHROPIC_API_KEY").map(|key| LlmConfig {
            api_key: SecretString::from(key),
            model: get("TRIAGE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        });

        let imap = match get("IMAP_HOST") {
            None => None,
            Some(host) => {
                let username = get("IMAP_USERNAME")
                    .ok_or_else(|| ConfigError::MissingEnvVar("IMAP_USERNAME".into()))?;
                let password = get("IMAP_PASSWORD")
                    .ok_or_else(|| ConfigError::MissingEnvVar("IMAP_PASSWORD".into()))?;
                let mut imap = ImapConfig::new(host, username, SecretString::from(password));
                imap.port = parse_or(&get, "IMAP_PORT", 993)?;
                if let Some(v) = get("IMAP_MAILBOX") {
                    imap.mailbox = v;
                }
                if let Some(v) = get("IMAP_TRASH_FOLDER") {
                    imap.trash_folder = v;
                }
                if let Some(v) = get("IMAP_ARCHIVE_FOLDER") {
                    imap.archive_folder = v;
                }
                if let Some(v) = get("IMAP_SPAM_FOLDER") {
                    imap.spam_folder = v;
                }
                if let Some(v) = get("IMAP_DRAFTS_FOLDER") {
                    imap.drafts_folder = v;
                }
                if let Some(v) = get("IMAP_FROM_ADDRESS") {
                    imap.from_address = v;
                }
                Some(imap)
            }
        };

        Ok(Self {
            data_dir,
            db_path,
            threshold,
            batch_size,
            grace_days,
            voice,
            llm,
            imap,
        })
    }

    /// Point the data directory (and the default database) somewhere else.
    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        if self.db_path == self.data_dir.join("triage.db") {
            self.db_path = dir.join("triage.db");
        }
        self.data_dir = dir;
        self
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

/// `TRIAGE_VOICE` picks the backend. Without it, ElevenLabs is used when a
/// key is configured and console text otherwise.
fn voice_backend<G>(get: &G) -> Result<VoiceBackend, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let enabled: bool = match get("TRIAGE_VOICE_ENABLED") {
        None => true,
        Some(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
    };
    if !enabled {
        return Ok(VoiceBackend::Off);
    }

    let eleven_key = get("ELEVENLABS_API_KEY");
    let choice = get("TRIAGE_VOICE").map(|v| v.trim().to_lowercase());
    let choice = choice.as_deref().unwrap_or(if eleven_key.is_some() {
        "elevenlabs"
    } else {
        "console"
    });

    match choice {
        "elevenlabs" => {
            let api_key =
                eleven_key.ok_or_else(|| ConfigError::MissingEnvVar("ELEVENLABS_API_KEY".into()))?;
            Ok(VoiceBackend::ElevenLabs {
                api_key: SecretString::from(api_key),
                voice_id: get("ELEVENLABS_VOICE_ID").unwrap_or_else(|| DEFAULT_VOICE_ID.into()),
                model_id: get("ELEVENLABS_MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.into()),
                player: get("TRIAGE_PLAYER").unwrap_or_else(|| DEFAULT_PLAYER.into()),
            })
        }
        "command" => Ok(VoiceBackend::Command(
            get("TRIAGE_VOICE_COMMAND").unwrap_or_else(|| DEFAULT_VOICE_COMMAND.into()),
        )),
        "console" => Ok(VoiceBackend::Console),
        "off" | "none" => Ok(VoiceBackend::Off),
        other => Err(ConfigError::InvalidValue {
            key: "TRIAGE_VOICE".into(),
            message: format!("unknown backend {other:?} (elevenlabs, command, console, off)"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<TriageConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TriageConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let c = config(&[]).unwrap();
        assert_eq!(c.data_dir, PathBuf::from("./triage_data"));
        assert_eq!(c.db_path, PathBuf::from("./triage_data/triage.db"));
        assert_eq!(c.threshold, DEFAULT_THRESHOLD);
        assert_eq!(c.batch_size, 5);
        assert_eq!(c.grace_days, 7);
        assert!(matches!(c.voice, VoiceBackend::Console));
        assert!(c.llm.is_none());
        assert!(c.imap.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let c = config(&[
            ("TRIAGE_THRESHOLD", "0.9"),
            ("TRIAGE_BATCH_SIZE", "10"),
            ("TRIAGE_OPTOUT_GRACE_DAYS", "14"),
            ("ANTHROPIC_API_KEY", "sk-test"),
        ])
        .unwrap();
        assert_eq!(c.threshold, 0.9);
        assert_eq!(c.batch_size, 10);
        assert_eq!(c.grace_days, 14);
        let llm = c.llm.unwrap();
        assert_eq!(llm.api_key.expose_secret(), "sk-test");
        assert_eq!(llm.model, DEFAULT_MODEL);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            config(&[("TRIAGE_THRESHOLD", "1.5")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config(&[("TRIAGE_BATCH_SIZE", "0")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config(&[("TRIAGE_BATCH_SIZE", "many")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config(&[("TRIAGE_VOICE", "robot")]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn imap_requires_credentials() {
        assert!(matches!(
            config(&[("IMAP_HOST", "imap.example.com")]),
            Err(ConfigError::MissingEnvVar(_))
        ));
        let c = config(&[
            ("IMAP_HOST", "imap.example.com"),
            ("IMAP_USERNAME", "me@example.com"),
            ("IMAP_PASSWORD", "pw"),
            ("IMAP_SPAM_FOLDER", "Spam"),
        ])
        .unwrap();
        let imap = c.imap.unwrap();
        assert_eq!(imap.port, 993);
        assert_eq!(imap.spam_folder, "Spam");
        assert_eq!(imap.trash_folder, "Trash");
        assert_eq!(imap.from_address, "me@example.com");
    }

    #[test]
    fn elevenlabs_chosen_when_key_present() {
        let c = config(&[("ELEVENLABS_API_KEY", "xi")]).unwrap();
        match c.voice {
            VoiceBackend::ElevenLabs { voice_id, player, .. } => {
                assert_eq!(voice_id, DEFAULT_VOICE_ID);
                assert_eq!(player, DEFAULT_PLAYER);
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn voice_can_be_disabled_or_commanded() {
        let c = config(&[("TRIAGE_VOICE_ENABLED", "false"), ("ELEVENLABS_API_KEY", "xi")]).unwrap();
        assert!(matches!(c.voice, VoiceBackend::Off));
        let c = config(&[("TRIAGE_VOICE", "command"), ("TRIAGE_VOICE_COMMAND", "say")]).unwrap();
        assert!(matches!(c.voice, VoiceBackend::Command(ref cmd) if cmd == "say"));
    }

    #[test]
    fn data_dir_override_moves_default_db() {
        let c = config(&[]).unwrap().with_data_dir(PathBuf::from("/tmp/tri"));
        assert_eq!(c.db_path, PathBuf::from("/tmp/tri/triage.db"));
        let c = config(&[("TRIAGE_DB_PATH", "/var/db/t.db")])
            .unwrap()
            .with_data_dir(PathBuf::from("/tmp/tri"));
        assert_eq!(c.db_path, PathBuf::from("/var/db/t.db"));
    }
}
