use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::TextProvider;
use crate::errors::ProviderError;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENAI_DEFAULT_MODEL: &str = "gpt-4o";

fn build_client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(ProviderError::Request)
}

fn credential(var: &'static str) -> Result<String, ProviderError> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ProviderError::MissingCredential { var })
}

async fn read_body(resp: reqwest::Response) -> Result<String, ProviderError> {
    let status = resp.status();
    let body = resp.text().await.map_err(ProviderError::Request)?;
    if !status.is_success() {
        return Err(ProviderError::Http {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

// =========================================
// Anthropic Messages API
// =========================================

/// Anthropic Messages API (`POST /v1/messages`).
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicProvider {
    pub fn new(
        api_key: impl Into<String>,
        model: Option<String>,
        max_tokens: u32,
        timeout: Duration,
        base_url: Option<String>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(timeout)?,
            api_key: api_key.into(),
            model: model.unwrap_or_else(|| ANTHROPIC_DEFAULT_MODEL.to_string()),
            max_tokens,
            base_url: base_url.unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string()),
        })
    }

    /// Read the key from `ANTHROPIC_API_KEY`.
    pub fn from_env(
        model: Option<String>,
        max_tokens: u32,
        timeout: Duration,
        base_url: Option<String>,
    ) -> Result<Self, ProviderError> {
        Self::new(
            credential("ANTHROPIC_API_KEY")?,
            model,
            max_tokens,
            timeout,
            base_url,
        )
    }

    fn request_body(&self, prompt: &str) -> serde_json::Value {
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        })
    }

    fn parse_response(body: &str) -> Result<String, ProviderError> {
        let response: AnthropicResponse = serde_json::from_str(body)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let text: Vec<String> = response
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect();
        if text.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "response contained no text blocks".into(),
            ));
        }
        Ok(text.join("\n"))
    }
}

#[async_trait]
impl TextProvider for AnthropicProvider {
    fn id(&self) -> String {
        format!("anthropic:{}", self.model)
    }

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(ProviderError::Request)?;
        let body = read_body(resp).await?;
        Self::parse_response(&body)
    }
}

// =========================================
// OpenAI Chat Completions API
// =========================================

/// OpenAI Chat Completions API (`POST /v1/chat/completions`).
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    base_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

impl OpenAiProvider {
    pub fn new(
        api_key: impl Into<String>,
        model: Option<String>,
        max_tokens: u32,
        timeout: Duration,
        base_url: Option<String>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client(timeout)?,
            api_key: api_key.into(),
            model: model.unwrap_or_else(|| OPENAI_DEFAULT_MODEL.to_string()),
            max_tokens,
            base_url: base_url.unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
        })
    }

    /// Read the key from `OPENAI_API_KEY`.
    pub fn from_env(
        model: Option<String>,
        max_tokens: u32,
        timeout: Duration,
        base_url: Option<String>,
    ) -> Result<Self, ProviderError> {
        Self::new(
            credential("OPENAI_API_KEY")?,
            model,
            max_tokens,
            timeout,
            base_url,
        )
    }

    fn request_body(&self, prompt: &str) -> serde_json::Value {
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        })
    }

    fn parse_response(body: &str) -> Result<String, ProviderError> {
        let response: ChatResponse = serde_json::from_str(body)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("response contained no message".into()))
    }
}

#[async_trait]
impl TextProvider for OpenAiProvider {
    fn id(&self) -> String {
        format!("openai:{}", self.model)
    }

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let resp = self
            .client
            .post(format!(
                "{}/v1/chat/completions",
                self.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(ProviderError::Request)?;
        let body = read_body(resp).await?;
        Self::parse_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anthropic() -> AnthropicProvider {
        AnthropicProvider::new("key", None, 4096, Duration::from_secs(5), None).unwrap()
    }

    #[test]
    fn test_anthropic_defaults() {
        let provider = anthropic();
        assert_eq!(provider.id(), "anthropic:claude-sonnet-4-20250514");
        let body = provider.request_body("hi");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_anthropic_parse_joins_text_blocks() {
        let body = r#"{"content":[{"type":"text","text":"one"},{"type":"tool_use","id":"x"},{"type":"text","text":"two"}]}"#;
        assert_eq!(AnthropicProvider::parse_response(body).unwrap(), "one\ntwo");
    }

    #[test]
    fn test_anthropic_parse_rejects_empty() {
        assert!(matches!(
            AnthropicProvider::parse_response(r#"{"content":[]}"#),
            Err(ProviderError::InvalidResponse(_))
        ));
        assert!(AnthropicProvider::parse_response("not json").is_err());
    }

    #[test]
    fn test_openai_parse() {
        let provider =
            OpenAiProvider::new("key", Some("gpt-4o-mini".into()), 512, Duration::from_secs(5), None)
                .unwrap();
        assert_eq!(provider.id(), "openai:gpt-4o-mini");
        assert_eq!(provider.request_body("q")["max_tokens"], 512);

        let body = r#"{"choices":[{"message":{"role":"assistant","content":"answer"}}]}"#;
        assert_eq!(OpenAiProvider::parse_response(body).unwrap(), "answer");
        assert!(OpenAiProvider::parse_response(r#"{"choices":[]}"#).is_err());
    }
}
