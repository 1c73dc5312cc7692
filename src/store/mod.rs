//! Preference Store: libSQL-backed storage for decisions, opt-outs, and
//! learned preferences.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{PatternKind, Preference, PreferenceStore, StoredDecision};
