//! OpenAI-compatible chat completions client.
//!
//! Used to evaluate or query a policy that is served remotely. Remote models
//! cannot be trained from this crate, so only generation is exposed.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::generate::Generator;
use super::prompt::EXPAND_INSTRUCTION;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `"system"`, `"user"` or `"assistant"`.
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A single completion choice returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: usize,
    pub message: ChatMessage,
    /// Why generation stopped (e.g. `"stop"`, `"length"`).
    pub finish_reason: Option<String>,
}

/// Token usage statistics for a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// A chat completion response from the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

impl ChatResponse {
    /// Content of the first choice, or an empty string.
    pub fn first_content(&self) -> String {
        self.choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for an OpenAI-compatible chat completions API.
#[derive(Debug, Clone)]
pub struct LlmClient {
    /// Base URL without trailing slash (e.g. `"http://localhost:8080/v1"`).
    pub api_base: String,
    pub api_key: String,
    /// Model name sent with every request.
    pub model_id: String,
    /// Nucleus mass sent with sampled requests.
    pub top_p: f64,
    pub http: reqwest::Client,
}

impl LlmClient {
    pub fn new(base_url: &str, api_key: &str, model_id: &str, top_p: f64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            api_base: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model_id: model_id.to_string(),
            top_p,
            http,
        })
    }

    /// Send a chat completion request and return the parsed response.
    ///
    /// Calls `POST {base_url}/chat/completions`.
    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: usize,
    ) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.api_base);
        let model = self.model_id.as_str();
        debug!(model, temperature, max_tokens, "sending chat completion request");

        let body = request_body(model, messages, temperature, self.top_p, max_tokens);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to send chat completion request")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("chat completion API returned {status}: {text}");
        }

        let chat_response: ChatResponse = resp
            .json()
            .await
            .context("failed to parse chat completion response")?;

        info!(
            model,
            prompt_tokens = chat_response.usage.prompt_tokens,
            completion_tokens = chat_response.usage.completion_tokens,
            "chat completion succeeded"
        );

        Ok(chat_response)
    }
}

impl Generator for LlmClient {
    async fn generate(
        &mut self,
        query: &str,
        max_tokens: usize,
        temperature: f64,
    ) -> Result<String> {
        let messages = [ChatMessage::user(format!("{EXPAND_INSTRUCTION}{query}"))];
        let resp = self
            .chat_completion(&messages, temperature.max(0.0), max_tokens)
            .await?;
        Ok(resp.first_content())
    }
}

/// JSON body for `/chat/completions`. `top_p` is omitted for greedy requests.
fn request_body(
    model: &str,
    messages: &[ChatMessage],
    temperature: f64,
    top_p: f64,
    max_tokens: usize,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "temperature": temperature,
        "max_tokens": max_tokens,
    });
    if temperature > 0.0 {
        body["top_p"] = serde_json::json!(top_p);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_user() {
        let msg = ChatMessage::user("Hello");
        assert_eq!(msg.role, "user");
        assert_eq!(msg.content, "Hello");
    }

    #[test]
    fn test_request_body_greedy_omits_top_p() {
        let messages = [ChatMessage::user("x")];
        let greedy = request_body("m", &messages, 0.0, 0.9, 200);
        assert!(greedy.get("top_p").is_none());
        assert_eq!(greedy["max_tokens"], 200);

        let sampled = request_body("m", &messages, 1.5, 0.9, 200);
        assert_eq!(sampled["top_p"], 0.9);
    }

    #[test]
    fn test_response_without_usage_parses() {
        let json = r#"{"id": "c1", "choices": [{"index": 0, "message": {"role": "assistant", "content": "lex: a"}, "finish_reason": "stop"}]}"#;
        let resp: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.first_content(), "lex: a");
        assert_eq!(resp.usage.total_tokens, 0);
    }

    #[test]
    fn test_first_content_empty_choices() {
        let resp = ChatResponse {
            id: "x".into(),
            choices: vec![],
            usage: Usage::default(),
        };
        assert_eq!(resp.first_content(), "");
    }

    #[test]
    fn test_new_trims_base_url() {
        let client = LlmClient::new("http://localhost:8080/v1/", "k", "m", 0.9).unwrap();
        assert_eq!(client.api_base, "http://localhost:8080/v1");
    }
}
