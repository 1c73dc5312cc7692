//! Inbox Triage: voice-guided, keyboard-driven email triage.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod optout;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod voice;
