//! OpenAI-compatible chat-completions client.
//!
//! Deliberately narrow: no native tool-calling, no DALL-E image
//! generation, no streaming, none of which the model router's contract
//! needs (`complete(prompt) -> text + usage`). Targets the same Chat
//! Completions wire format most OpenAI-compatible providers speak, built
//! directly over `reqwest`.

use crate::model::client::{ModelCallError, ModelClient, ModelRequest, ModelResponse, Role, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub struct OpenAiModelClient {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl OpenAiModelClient {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            http: reqwest::Client::builder().timeout(timeout).build().expect("http client"),
        }
    }

    /// Override the base URL — used in tests against a local mock server
    /// and for OpenAI-compatible third-party endpoints.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
}

#[derive(Deserialize)]
struct ChatErrorBody {
    error: ChatErrorDetail,
}

#[derive(Deserialize)]
struct ChatErrorDetail {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

#[async_trait]
impl ModelClient for OpenAiModelClient {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelCallError> {
        let mut messages = Vec::new();
        if let Some(system_prompt) = &request.system_prompt {
            messages.push(ChatMessage { role: "system", content: system_prompt.clone() });
        }
        for (role, content) in &request.conversation_history {
            messages.push(ChatMessage { role: role_str(*role), content: content.clone() });
        }
        messages.push(ChatMessage { role: "user", content: request.prompt.clone() });

        let response_format = match &request.response_format {
            Some(crate::model::client::ResponseFormat::Json { .. }) => {
                Some(serde_json::json!({ "type": "json_object" }))
            }
            _ => None,
        };

        let body = ChatRequest {
            model: &request.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelCallError::Transient(Box::new(e)))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
            return Err(ModelCallError::Transient(Box::new(std::io::Error::other(format!(
                "model provider returned {status}"
            )))));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ModelCallError::Transient(Box::new(std::io::Error::other(
                "rate limited",
            ))));
        }
        if !status.is_success() {
            let detail = response
                .json::<ChatErrorBody>()
                .await
                .map(|b| b.error.message)
                .unwrap_or_else(|_| status.to_string());
            // auth failures, invalid requests, and content-policy rejections
            // are permanent: retrying the same model will not help.
            return Err(ModelCallError::Permanent(Box::new(std::io::Error::other(detail))));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelCallError::Transient(Box::new(e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| {
                ModelCallError::Transient(Box::new(std::io::Error::other("empty choices array")))
            })?;

        let usage = parsed.usage.map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        });

        Ok(ModelResponse { content, usage })
    }

    fn provider_name(&self) -> &str {
        "openai"
    }
}
