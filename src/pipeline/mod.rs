//! Triage pipeline.
//!
//! Every fetched message flows through:
//! 1. `InboxProvider::fetch_unprocessed()`: mailbox I/O
//! 2. `Classifier::classify()`: LLM verdict, or heuristics when no LLM is configured
//! 3. `BatchPolicy`: confident verdicts are offered for one-step auto-apply
//! 4. Everything else waits for the operator in the decision loop
//!
//! **Nothing touches the mailbox without an operator decision or approval.**

pub mod bulk;
pub mod classifier;
pub mod learning;
pub mod policy;
pub mod rules;
pub mod types;

pub use bulk::{find_bulk_candidates, normalize_subject};
pub use classifier::LlmClassifier;
pub use policy::{AutoApplySummary, AutoApprover, BatchPolicy};
pub use rules::HeuristicClassifier;
pub use types::{
    BatchContext, Classification, Classifier, Decision, DecisionSource, Disposition,
    InboxProvider, Label, Message,
};
