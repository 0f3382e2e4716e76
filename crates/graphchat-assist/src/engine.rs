use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use llm::builder::{LLMBackend, LLMBuilder};
use llm::chat::ChatMessage;
use llm::LLMProvider;
use tracing::debug;

use graphchat_core::Settings;

use crate::error::{AssistError, Result};

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Assistant,
}

/// One entry of the conversation as the model sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ModelTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// The model completion API: streamed replies for the conversation and a
/// one-shot completion for small side tasks such as titles.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream_reply(
        &self,
        system: &str,
        turns: &[ModelTurn],
        temperature: f32,
    ) -> Result<TokenStream>;

    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

fn map_backend(provider: &str) -> Result<LLMBackend> {
    match provider {
        "openai" => Ok(LLMBackend::OpenAI),
        "anthropic" => Ok(LLMBackend::Anthropic),
        "google" => Ok(LLMBackend::Google),
        "ollama" => Ok(LLMBackend::Ollama),
        "groq" => Ok(LLMBackend::Groq),
        "mistral" => Ok(LLMBackend::Mistral),
        "deepseek" => Ok(LLMBackend::DeepSeek),
        other => Err(AssistError::UnknownProvider(other.to_string())),
    }
}

/// [`ModelClient`] backed by the `llm` crate, provider chosen from settings.
#[derive(Debug, Clone)]
pub struct LlmClient {
    settings: Settings,
}

impl LlmClient {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    fn build(&self, system: &str, temperature: Option<f32>) -> Result<Box<dyn LLMProvider>> {
        let backend = map_backend(&self.settings.provider)?;

        let mut builder = LLMBuilder::new()
            .backend(backend)
            .model(&self.settings.model)
            .system(system);

        if let Some(temperature) = temperature {
            builder = builder.temperature(temperature);
        }
        if !self.settings.api_key.is_empty() {
            builder = builder.api_key(&self.settings.api_key);
        }

        builder.build().map_err(|e| AssistError::Build(e.to_string()))
    }
}

fn to_llm_messages(turns: &[ModelTurn]) -> Vec<ChatMessage> {
    turns
        .iter()
        .map(|turn| match turn.role {
            TurnRole::User => ChatMessage::user().content(&turn.content).build(),
            TurnRole::Assistant => ChatMessage::assistant().content(&turn.content).build(),
        })
        .collect()
}

#[async_trait]
impl ModelClient for LlmClient {
    async fn stream_reply(
        &self,
        system: &str,
        turns: &[ModelTurn],
        temperature: f32,
    ) -> Result<TokenStream> {
        let llm = self.build(system, Some(temperature))?;
        let messages = to_llm_messages(turns);

        debug!(
            provider = %self.settings.provider,
            model = %self.settings.model,
            turns = messages.len(),
            "opening reply stream"
        );

        let stream = llm
            .chat_stream(&messages)
            .await
            .map_err(|e| AssistError::Request(e.to_string()))?;

        Ok(Box::pin(
            stream.map(|chunk| chunk.map_err(|e| AssistError::Stream(e.to_string()))),
        ))
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let llm = self.build(system, None)?;
        let messages = vec![ChatMessage::user().content(prompt).build()];

        let response = llm
            .chat(&messages)
            .await
            .map_err(|e| AssistError::Request(e.to_string()))?;

        match response.text() {
            Some(text) if !text.trim().is_empty() => Ok(text),
            _ => Err(AssistError::EmptyReply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_providers_map() {
        assert!(matches!(map_backend("google"), Ok(LLMBackend::Google)));
        assert!(matches!(map_backend("ollama"), Ok(LLMBackend::Ollama)));
        assert!(matches!(
            map_backend("palm"),
            Err(AssistError::UnknownProvider(p)) if p == "palm"
        ));
    }
}
