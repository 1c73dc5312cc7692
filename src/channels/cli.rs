//! Terminal output for the triage session.
//!
//! The decision loop keeps the terminal in raw mode, so every line is
//! written with an explicit `\r\n`.

use std::io::Write;

use crate::pipeline::policy::AutoApplySummary;
use crate::pipeline::types::{Classification, Disposition, Message};
use crate::session::decision_loop::Resolution;

/// Subject width in listings.
const SUBJECT_WIDTH: usize = 60;

pub const KEY_LEGEND: &str =
    "[9] trash  [5] revisit  [1] action  [Enter] accept  [Space] reject  [0] opt out  [-] bulk trash";

/// Session output. A quiet console prints nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Console {
    quiet: bool,
}

impl Console {
    pub fn new() -> Self {
        Self { quiet: false }
    }

    pub fn quiet() -> Self {
        Self { quiet: true }
    }

    fn write(&self, text: &str) {
        if self.quiet {
            return;
        }
        let mut out = std::io::stdout().lock();
        for line in text.lines() {
            let _ = write!(out, "{line}\r\n");
        }
        let _ = out.flush();
    }

    pub fn notice(&self, text: &str) {
        self.write(&format!("ℹ️  {text}"));
    }

    pub fn batch_started(&self, batch: usize, size: usize) {
        self.write(&format!("\n📬 Batch {batch}: {size} message(s)"));
    }

    pub fn auto_summary(&self, summary: &AutoApplySummary) {
        self.write(&format!("\n{summary}Apply all? [y/n]"));
    }

    pub fn message(&self, position: usize, total: usize, message: &Message, c: &Classification) {
        let confidence = if c.confidence > 0.0 {
            format!("{:.0}%", c.confidence * 100.0)
        } else {
            "unclassified".to_string()
        };
        self.write(&format!(
            "\n── {position}/{total} ── {}\n   {}\n   {}\n   → {} ({confidence}) {}\n   {KEY_LEGEND}",
            message.display_sender(),
            truncate(if message.subject.is_empty() { "(no subject)" } else { &message.subject }, SUBJECT_WIDTH),
            truncate(&message.snippet, SUBJECT_WIDTH * 2),
            c.label.as_str().to_uppercase(),
            c.rationale,
        ));
    }

    pub fn resolved(&self, resolution: &Resolution) {
        let icon = match resolution.disposition {
            Disposition::Trash => "🗑️ ",
            Disposition::Revisit => "🕓",
            Disposition::Action => "✅",
            Disposition::OptOut => "✋",
            Disposition::Spam => "🚫",
        };
        let mut line = format!("{icon} {}", resolution.disposition);
        if !resolution.bulk.is_empty() {
            line.push_str(&format!(" (+{} matching)", resolution.bulk.len()));
        }
        self.write(&line);
    }

    pub fn warning(&self, text: &str) {
        self.write(&format!("⚠️  {text}"));
    }
}

/// Cut to `max` characters, marking the cut.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}
