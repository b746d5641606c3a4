//! Completion service contract and chat message model.
//!
//! The orchestrator, DAG synthesis and research insights all talk to the
//! language model through [`CompletionClient`]. A concrete OpenAI-compatible
//! client is available behind the `openai-client` feature.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(feature = "openai-client")]
mod openai;
#[cfg(feature = "openai-client")]
pub use openai::OpenAiCompatibleClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A single request to the completion service.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// When set the service must answer with a single JSON object.
    pub structured: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            system_prompt: None,
            temperature: 0.5,
            max_tokens: 1024,
            structured: false,
        }
    }

    /// Convenience constructor for a one-shot user prompt.
    pub fn prompt(text: impl Into<String>) -> Self {
        Self::new(vec![ChatMessage::user(text)])
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn structured(mut self) -> Self {
        self.structured = true;
        self
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String>;
}

pub type DynCompletionClient = Arc<dyn CompletionClient>;

/// Ask for a JSON object and decode it, tolerating fenced or padded output.
pub async fn complete_json(
    client: &dyn CompletionClient,
    request: CompletionRequest,
) -> anyhow::Result<serde_json::Value> {
    let raw = client.complete(request.structured()).await?;
    crate::action::extract_json_object(&raw)
        .ok_or_else(|| anyhow::anyhow!("completion did not contain a JSON object"))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl CompletionClient for Fixed {
        async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String> {
            assert!(request.structured, "complete_json must request structured output");
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn complete_json_accepts_fenced_payload() {
        let client = Fixed("```json\n{\"insights\": [\"a\"]}\n```");
        let value = complete_json(&client, CompletionRequest::prompt("x"))
            .await
            .unwrap();
        assert_eq!(value["insights"][0], "a");
    }

    #[tokio::test]
    async fn complete_json_rejects_plain_text() {
        let client = Fixed("no structure here");
        assert!(
            complete_json(&client, CompletionRequest::prompt("x"))
                .await
                .is_err()
        );
    }
}
