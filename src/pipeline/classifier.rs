//! LLM classifier: one completion per message, structured JSON verdict.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::pipeline::types::{Classification, Classifier, Label, Message};
use crate::store::{Preference, PreferenceStore};

/// Max tokens for the classification call (runs on every message).
const CLASSIFY_MAX_TOKENS: u32 = 300;

/// Temperature for classification (deterministic-ish).
const CLASSIFY_TEMPERATURE: f32 = 0.1;

/// Learned preferences included in the prompt.
const PROMPT_PREFERENCES: usize = 10;

/// Snippet characters sent to the model.
const SNIPPET_CHARS: usize = 1000;

/// Classifies messages with an LLM, informed by learned preferences.
pub struct LlmClassifier {
    llm: Arc<dyn LlmProvider>,
    store: Option<Arc<dyn PreferenceStore>>,
}

impl LlmClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm, store: None }
    }

    /// Include the strongest learned preferences in each prompt.
    pub fn with_store(mut self, store: Arc<dyn PreferenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    async fn learned_preferences(&self) -> Vec<Preference> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        store
            .list_preferences(PROMPT_PREFERENCES)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to load learned preferences for prompt");
                Vec::new()
            })
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    fn name(&self) -> &str {
        self.llm.model_name()
    }

    async fn classify(&self, message: &Message) -> Result<Classification, LlmError> {
        let preferences = self.learned_preferences().await;
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_system_prompt()),
            ChatMessage::user(build_user_prompt(message, &preferences)),
        ])
        .with_temperature(CLASSIFY_TEMPERATURE)
        .with_max_tokens(CLASSIFY_MAX_TOKENS);

        let response = self.llm.complete(request).await?;

        let classification = parse_classification(&message.id, &response.content).map_err(|e| {
            warn!(
                id = %message.id,
                raw_response = %response.content,
                error = %e,
                "Failed to parse classification"
            );
            LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: e,
            }
        })?;

        debug!(
            id = %message.id,
            label = %classification.label,
            confidence = classification.confidence,
            "Message classified"
        );
        Ok(classification)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_system_prompt() -> String {
    "You are an email triage assistant. Classify each email into exactly one label.\n\n\
     Labels:\n\
     - \"trash\": marketing, promotions, newsletters, automated noise the user will not miss.\n\
     - \"revisit\": worth reading later, no action needed now.\n\
     - \"action\": the user must reply, pay, decide, or do something.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"label\": \"...\", \"confidence\": 0.0, \"rationale\": \"...\"}\n\n\
     Rules:\n\
     - confidence is between 0.0 and 1.0; above 0.85 only when you are certain\n\
     - rationale is one short sentence that can be read aloud\n\
     - follow the user's learned preferences when they apply"
        .to_string()
}

fn build_user_prompt(message: &Message, preferences: &[Preference]) -> String {
    let mut prompt = String::with_capacity(1024);

    prompt.push_str(&format!("From: {}", message.sender));
    if let Some(ref name) = message.sender_name {
        prompt.push_str(&format!(" ({})", name));
    }
    prompt.push('\n');
    prompt.push_str(&format!("Subject: {}\n", message.subject));
    if message.has_unsubscribe {
        prompt.push_str("Signals: has unsubscribe link (mailing list)\n");
    }

    if !preferences.is_empty() {
        prompt.push_str("\nLearned preferences:\n");
        for pref in preferences {
            prompt.push_str(&format!(
                "- {} '{}' → {} (confidence {:.2}, seen {}x)\n",
                pref.kind, pref.value, pref.disposition, pref.confidence, pref.usage_count
            ));
        }
    }

    let snippet: String = message.snippet.chars().take(SNIPPET_CHARS).collect();
    prompt.push_str(&format!("\nBody:\n{}", snippet));

    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct ClassificationResponse {
    #[serde(alias = "action")]
    label: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default, alias = "reasoning")]
    rationale: String,
}

/// Parse the model output into a `Classification`.
fn parse_classification(message_id: &str, raw: &str) -> Result<Classification, String> {
    let json_str = extract_json_object(raw);
    let response: ClassificationResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let label = Label::parse(&response.label)
        .ok_or_else(|| format!("unknown label: '{}'", response.label))?;

    if !response.confidence.is_finite() {
        return Err("confidence is not a number".into());
    }

    Ok(Classification::new(
        message_id,
        label,
        response.confidence,
        response.rationale.trim(),
    ))
}

/// Extract a JSON object from LLM output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
