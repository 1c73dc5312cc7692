//! Error types for Inbox Triage.

use std::time::Duration;

/// Top-level error type for a triage session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Inbox error: {0}")]
    Inbox(#[from] InboxError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Voice error: {0}")]
    Voice(#[from] VoiceError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mailbox provider errors.
///
/// Authentication and credential problems are fatal: no decision can be
/// made without the mailbox. Everything else is transient.
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("Authentication failed for {account}: {reason}")]
    AuthFailed { account: String, reason: String },

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to apply {disposition} to message {message_id}: {reason}")]
    Apply {
        message_id: String,
        disposition: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InboxError {
    /// Whether this error must terminate the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthFailed { .. } | Self::InvalidCredentials(_))
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Speech synthesis and playback errors. Never fatal to a session.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("Synthesis failed on {backend}: {reason}")]
    Synthesis { backend: String, reason: String },

    #[error("Audio player failed: {0}")]
    Playback(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the interactive session itself.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The operator pressed Ctrl+C.
    #[error("Session interrupted by operator")]
    Interrupted,

    #[error("Keyboard input closed")]
    InputClosed,

    #[error("Terminal error: {0}")]
    Terminal(String),

    /// A decision could not be written durably. Always aborts the session.
    #[error("Decision for message {message_id} was not persisted: {source}")]
    DecisionNotPersisted {
        message_id: String,
        #[source]
        source: DatabaseError,
    },

    /// An opt-out request could not be recorded durably.
    #[error("Opt-out request for {sender} was not persisted: {source}")]
    OptOutNotPersisted {
        sender: String,
        #[source]
        source: DatabaseError,
    },

    #[error("Message {0} was resolved twice in one batch")]
    AlreadyDecided(String),

    #[error("Batch finished with {0} undecided message(s)")]
    IncompleteBatch(usize),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_are_fatal() {
        let err = InboxError::AuthFailed {
            account: "me@example.com".into(),
            reason: "bad password".into(),
        };
        assert!(err.is_fatal());
        assert!(InboxError::InvalidCredentials("empty".into()).is_fatal());
    }

    #[test]
    fn apply_failures_are_transient() {
        let err = InboxError::Apply {
            message_id: "42".into(),
            disposition: "trash".into(),
            reason: "NO [TRYCREATE]".into(),
        };
        assert!(!err.is_fatal());
        assert!(
            !InboxError::Connection {
                host: "imap.example.com".into(),
                reason: "timeout".into(),
            }
            .is_fatal()
        );
    }

    #[test]
    fn decision_error_keeps_source() {
        let err = SessionError::DecisionNotPersisted {
            message_id: "7".into(),
            source: DatabaseError::Query("disk full".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("7"));
        assert!(msg.contains("disk full"));
    }
}
