use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

const MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One turn of a chat-completion conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Chat-completion backend used by the execution engine and the quality-gate scorer.
///
/// Error messages keep the HTTP status so callers can tell rate limiting
/// (`429`) apart from other failures.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String>;
}

async fn ensure_success(provider: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("{} API returned {}: {}", provider, status.as_u16(), body.trim())
}

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            model: "claude-3-5-sonnet-20240620".to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String> {
        // The messages API takes system prompts out of band.
        let (system, turns): (Vec<ChatMessage>, Vec<ChatMessage>) = messages
            .into_iter()
            .partition(|m| m.role == ChatRole::System);
        let system = (!system.is_empty()).then(|| {
            system
                .into_iter()
                .map(|m| m.content)
                .collect::<Vec<_>>()
                .join("\n\n")
        });

        let request = AnthropicRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system,
            messages: turns,
        };

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request)
            .send()
            .await?;
        let body: AnthropicResponse = ensure_success("Anthropic", response).await?.json().await?;

        let text: String = body.content.into_iter().map(|b| b.text).collect();
        if text.trim().is_empty() {
            return Err(anyhow!("Anthropic response had no text content"));
        }
        Ok(text)
    }
}

#[derive(Debug, Clone)]
pub struct OpenAIProvider {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIReply,
}

#[derive(Deserialize)]
struct OpenAIReply {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAIProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            model: "gpt-4o".to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let request = OpenAIRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            messages: &messages,
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let body: OpenAIResponse = ensure_success("OpenAI", response).await?.json().await?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("OpenAI response had no choices"))
    }
}

/// Replays canned responses in order, wrapping around at the end.
pub struct MockLLMProvider {
    responses: Vec<String>,
    cursor: AtomicUsize,
}

impl MockLLMProvider {
    pub fn new() -> Self {
        Self::with_response("STATUS: DONE\nTask complete.".to_string())
    }

    pub fn with_response(response: String) -> Self {
        Self::with_responses(vec![response])
    }

    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

impl Default for MockLLMProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMProvider for MockLLMProvider {
    async fn complete(&self, _messages: Vec<ChatMessage>) -> Result<String> {
        if self.responses.is_empty() {
            bail!("mock provider has no responses");
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        Ok(self.responses[index % self.responses.len()].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_serialize_lowercase() {
        let json = serde_json::to_value(ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(ChatMessage::system("x").role, ChatRole::System);
    }

    #[test]
    fn test_anthropic_request_omits_empty_system() {
        let request = AnthropicRequest {
            model: "m",
            max_tokens: 10,
            system: None,
            messages: vec![ChatMessage::user("hello")],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("system").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn test_provider_models() {
        let provider = AnthropicProvider::new("test-key".to_string());
        assert_eq!(provider.model, "claude-3-5-sonnet-20240620");

        let provider = OpenAIProvider::new("test-key".to_string()).with_model("gpt-4o-mini");
        assert_eq!(provider.model, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_mock_provider_cycles() {
        let provider = MockLLMProvider::with_responses(vec!["a".into(), "b".into()]);
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(provider.complete(vec![ChatMessage::user("x")]).await.unwrap());
        }
        assert_eq!(seen, vec!["a", "b", "a"]);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_empty_mock_is_an_error() {
        let provider = MockLLMProvider::with_responses(Vec::new());
        assert!(provider.complete(Vec::new()).await.is_err());
    }
}
