//! Interactive session: key capture, the per-message decision loop, and
//! the batch runner.

pub mod decision_loop;
pub mod keys;
pub mod runner;

pub use decision_loop::{DecisionLoop, LoopState, Resolution};
pub use keys::{ChannelKeys, Key, KeySource, TerminalKeys};
pub use runner::{SessionSummary, TriageSession};
