use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{ChatMessage, CompletionClient, CompletionRequest};
use crate::config::{LlmConfig, SecretValue};
use crate::error::AgentLoopError;

/// Chat-completions client for OpenAI-compatible endpoints.
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: SecretValue,
    max_retries: usize,
    initial_backoff_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn new(config: &LlmConfig, api_key: SecretValue) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            max_retries: config.max_retries,
            initial_backoff_ms: config.initial_backoff_ms,
        })
    }

    fn payload(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut messages: Vec<serde_json::Value> = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(request.messages.iter().map(|m: &ChatMessage| {
            json!({"role": m.role.as_str(), "content": m.content})
        }));

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": false,
        });
        if request.structured {
            payload["response_format"] = json!({"type": "json_object"});
        }
        payload
    }

    async fn send_once(&self, payload: &serde_json::Value) -> anyhow::Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.api_key.expose())
            .json(payload)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentLoopError::Completion(format!(
                "{} returned {status}: {body}",
                self.model
            ))
            .into());
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("malformed completion response")?;
        Ok(first_choice(parsed)?)
    }
}

fn first_choice(response: ChatResponse) -> Result<String, AgentLoopError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .ok_or_else(|| AgentLoopError::Completion("response contained no choices".to_string()))
}

#[async_trait]
impl CompletionClient for OpenAiCompatibleClient {
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String> {
        let payload = self.payload(&request);
        let mut attempt = 0;
        let mut backoff_ms = self.initial_backoff_ms;

        loop {
            match self.send_once(&payload).await {
                Ok(content) => return Ok(content),
                Err(err) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        error = %err,
                        attempt,
                        backoff_ms,
                        model = %self.model,
                        "completion call failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;

    fn client() -> OpenAiCompatibleClient {
        OpenAiCompatibleClient::new(&LlmConfig::default(), SecretValue::new("sk-test")).unwrap()
    }

    #[test]
    fn structured_requests_ask_for_json_objects() {
        let request = CompletionRequest::new(vec![ChatMessage::user("hi")])
            .with_system_prompt("be brief")
            .structured();
        let payload = client().payload(&request);

        assert_eq!(payload["response_format"]["type"], "json_object");
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["content"], "hi");
    }

    #[test]
    fn free_text_requests_leave_format_open() {
        let payload = client().payload(&CompletionRequest::prompt("hi"));
        assert!(payload.get("response_format").is_none());
    }

    #[test]
    fn empty_choices_are_a_completion_error() {
        let response: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        let err = first_choice(response).unwrap_err();
        assert!(matches!(err, AgentLoopError::Completion(_)));

        let response: ChatResponse =
            serde_json::from_value(json!({"choices": [{"message": {"content": "  ok \n"}}]})).unwrap();
        assert_eq!(first_choice(response).unwrap(), "ok");
    }
}
