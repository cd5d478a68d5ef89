//! LLM client capability.
//!
//! OpenAI-compatible, non-streaming chat completions with token usage
//! reporting. The HTTP client owns its retry/backoff: retriable statuses
//! (408/429/5xx) and transport errors get up to three attempts with jittered
//! exponential backoff; everything else surfaces immediately.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::LlmSettings;
use crate::error::{CoreError, CoreResult};

// ─── Message types ──────────────────────────────────────────────────────────

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single message in a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Per-call overrides of the configured generation parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// A completed generation.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

// ─── Capability ─────────────────────────────────────────────────────────────

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: GenerationOptions,
    ) -> CoreResult<Completion>;
}

// ─── HTTP implementation ────────────────────────────────────────────────────

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client.
pub struct HttpLlmClient {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl HttpLlmClient {
    pub fn new(settings: LlmSettings) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CoreError::infra(format!("failed to build HTTP client: {e}")))?;
        Ok(HttpLlmClient { http, settings })
    }

    fn is_retriable_status(status: u16) -> bool {
        status == 408 || status == 429 || (500..=599).contains(&status)
    }

    /// Jittered exponential backoff: base * 2^attempt plus up to 250ms noise.
    fn backoff(attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..250u64);
        Duration::from_millis(BACKOFF_BASE_MS * 2u64.pow(attempt) + jitter)
    }

    async fn try_once(
        &self,
        messages: &[ChatMessage],
        options: GenerationOptions,
    ) -> CoreResult<Completion> {
        let url = format!("{}/chat/completions", self.settings.base_url);
        let body = CompletionRequest {
            model: &self.settings.model,
            messages,
            temperature: options.temperature.unwrap_or(self.settings.temperature),
            max_tokens: options.max_tokens.unwrap_or(self.settings.max_tokens),
        };

        tracing::debug!(
            url = %url,
            model = %self.settings.model,
            message_count = messages.len(),
            "llm request"
        );

        let mut request = self.http.post(&url).json(&body);
        if let Some(ref key) = self.settings.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| CoreError::Model {
            reason: format!("llm request failed: {e}"),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Model {
                reason: format!("llm backend HTTP {status}: {body}"),
            });
        }

        let parsed: CompletionResponse = response.json().await.map_err(|e| CoreError::Model {
            reason: format!("llm response parse failed: {e}"),
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        if text.is_empty() {
            return Err(CoreError::Model {
                reason: "llm returned an empty completion".into(),
            });
        }

        Ok(Completion {
            text,
            usage: parsed.usage,
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: GenerationOptions,
    ) -> CoreResult<Completion> {
        let mut last_error: Option<CoreError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            match self.try_once(messages, options).await {
                Ok(completion) => return Ok(completion),
                Err(CoreError::Model { reason }) => {
                    let retriable = reason.contains("request failed")
                        || extract_status(&reason).map(Self::is_retriable_status).unwrap_or(false);
                    if !retriable {
                        return Err(CoreError::Model { reason });
                    }
                    tracing::warn!(attempt, reason = %reason, "llm attempt failed, backing off");
                    last_error = Some(CoreError::Model { reason });
                    if attempt + 1 < MAX_ATTEMPTS {
                        tokio::time::sleep(Self::backoff(attempt)).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Err(last_error.unwrap_or(CoreError::Model {
            reason: "llm attempts exhausted".into(),
        }))
    }
}

/// Pull the numeric status out of a `"llm backend HTTP 503 …"` reason.
fn extract_status(reason: &str) -> Option<u16> {
    let idx = reason.find("HTTP ")?;
    reason[idx + 5..]
        .split_whitespace()
        .next()?
        .trim_end_matches(':')
        .parse()
        .ok()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_status_classification() {
        assert!(HttpLlmClient::is_retriable_status(429));
        assert!(HttpLlmClient::is_retriable_status(500));
        assert!(HttpLlmClient::is_retriable_status(503));
        assert!(HttpLlmClient::is_retriable_status(408));
        assert!(!HttpLlmClient::is_retriable_status(400));
        assert!(!HttpLlmClient::is_retriable_status(401));
    }

    #[test]
    fn test_extract_status_from_reason() {
        assert_eq!(extract_status("llm backend HTTP 503: busy"), Some(503));
        assert_eq!(
            extract_status("llm backend HTTP 429 Too Many Requests: slow down"),
            Some(429)
        );
        assert_eq!(extract_status("connection refused"), None);
    }

    #[test]
    fn test_backoff_grows() {
        let first = HttpLlmClient::backoff(0);
        let third = HttpLlmClient::backoff(2);
        assert!(first >= Duration::from_millis(500));
        assert!(third >= Duration::from_millis(2_000));
    }

    #[test]
    fn test_message_constructors() {
        let m = ChatMessage::system("You are a real-estate assistant.");
        assert_eq!(m.role, ChatRole::System);
        assert_eq!(
            serde_json::to_value(&m).unwrap()["role"],
            serde_json::json!("system")
        );
    }
}
