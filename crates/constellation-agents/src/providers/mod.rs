use async_trait::async_trait;
use constellation_common::{HistoryMessage, HistoryRole, Result};
use serde::{Deserialize, Serialize};

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

/// Trait for LLM provider integrations (Anthropic, OpenRouter, xAI).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g. "anthropic", "openrouter", "xai").
    fn provider_id(&self) -> &str;

    /// Send a completion request and return the response.
    ///
    /// HTTP 429 must surface as [`constellation_common::Error::RateLimited`];
    /// other failures as `Error::Provider`.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Check if the provider is reachable with its credentials.
    async fn health_check(&self) -> Result<bool>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl LlmRequest {
    /// Request for one relay turn: the speaker's rolling history and prompt.
    pub fn from_history(model: &str, history: &[HistoryMessage], system: &str) -> Self {
        Self {
            model: model.to_string(),
            messages: history.iter().map(ChatMessage::from).collect(),
            system: (!system.is_empty()).then(|| system.to_string()),
            max_tokens: None,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// The agent's own turns are assistant messages; the partner's are user input.
impl From<&HistoryMessage> for ChatMessage {
    fn from(message: &HistoryMessage) -> Self {
        let role = match message.role {
            HistoryRole::Speaker => ChatRole::Assistant,
            HistoryRole::Partner => ChatRole::User,
        };
        Self {
            role,
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
    pub usage: Option<Usage>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Build the error for a non-success HTTP status, keeping 429 retryable.
pub(crate) fn status_error(provider: &str, status: u16, body: &str) -> constellation_common::Error {
    let message = format!("{provider} API error: status={status}, body={body}");
    if status == 429 {
        constellation_common::Error::RateLimited(message)
    } else {
        constellation_common::Error::Provider(message)
    }
}
