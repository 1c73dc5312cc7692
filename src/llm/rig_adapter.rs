//! Bridges a rig `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel, Message};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Wraps any rig completion model behind `LlmProvider`.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
        }
    }
}

/// A chat transcript split the way rig wants it: system text as the
/// preamble, the final user turn as the prompt, everything before it as
/// history.
#[derive(Debug)]
struct SplitChat<'a> {
    preamble: Option<String>,
    history: Vec<&'a ChatMessage>,
    prompt: &'a str,
}

fn split_chat(messages: &[ChatMessage]) -> Result<SplitChat<'_>, LlmError> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let mut turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != Role::System).collect();

    let Some(last) = turns.pop() else {
        return Err(LlmError::InvalidResponse {
            provider: "rig".into(),
            reason: "request has no user message".into(),
        });
    };
    if last.role != Role::User {
        return Err(LlmError::InvalidResponse {
            provider: "rig".into(),
            reason: "last message must come from the user".into(),
        });
    }

    Ok(SplitChat {
        preamble: (!system.is_empty()).then(|| system.join("\n\n")),
        history: turns,
        prompt: &last.content,
    })
}

fn to_rig(message: &ChatMessage) -> Message {
    match message.role {
        Role::Assistant => Message::assistant(message.content.clone()),
        Role::User | Role::System => Message::user(message.content.clone()),
    }
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let chat = split_chat(&request.messages)?;
        let history: Vec<Message> = chat.history.iter().copied().map(to_rig).collect();

        let mut builder = self
            .model
            .completion_request(Message::user(chat.prompt.to_string()))
            .messages(history)
            .max_tokens(u64::from(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)));
        if let Some(preamble) = chat.preamble {
            builder = builder.preamble(preamble);
        }
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(f64::from(temperature));
        }

        let response = builder.send().await.map_err(|e| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: e.to_string(),
        })?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        if content.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "response carried no text".into(),
            });
        }

        debug!(
            model = %self.model_name,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Completion received"
        );

        Ok(CompletionResponse {
            content,
            input_tokens: u32::try_from(response.usage.input_tokens).unwrap_or(u32::MAX),
            output_tokens: u32::try_from(response.usage.output_tokens).unwrap_or(u32::MAX),
            finish_reason: FinishReason::Stop,
        })
    }
}
