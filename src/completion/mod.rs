mod types;

pub use types::{ChatMessage, Completion, MessageRole, TokenUsage};

use crate::completion::types::{ChatCompletionRequest, ChatCompletionResponse};
use crate::config::CompletionConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};
use tracing::instrument;
use tracing::log::{debug, error, info, warn};

/// Prepended to every user message.
pub const INSTRUCTION_PREFIX: &str = "Please solve this problem step by step: ";

#[derive(thiserror::Error, Debug)]
pub enum CompletionError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Rate limited by completion API: {0}")]
    RateLimited(String),

    #[error("Completion API error {status}: {body}")]
    Upstream { status: StatusCode, body: String },

    #[error("Failed to decode completion response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Completion response contained no text")]
    Empty,
}
impl CompletionError {
    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CompletionError::Network(_) | CompletionError::RateLimited(_) => true,
            CompletionError::Upstream { status, .. } => status.is_server_error(),
            CompletionError::Decode(_) | CompletionError::Empty => false,
        }
    }
}

/// Turns a user's question into generated text.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, user_text: &str) -> Result<Completion, CompletionError>;
}

/// OpenAI wire format chat completion client, pointed at OpenRouter by default.
pub struct OpenRouterClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    system_prompt: String,
    max_attempts: u32,
    retry_delay: Duration,
}
impl OpenRouterClient {
    pub fn new(config: &CompletionConfig, api_key: String) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            system_prompt: config.system_prompt.clone(),
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay(),
        })
    }

    pub fn build_messages(&self, user_text: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(self.system_prompt.as_str()),
            ChatMessage::user(format!("{INSTRUCTION_PREFIX}{user_text}")),
        ]
    }

    async fn attempt(
        &self,
        request: &ChatCompletionRequest<'_>,
    ) -> Result<Completion, CompletionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(if status == StatusCode::TOO_MANY_REQUESTS {
                CompletionError::RateLimited(body)
            } else {
                CompletionError::Upstream { status, body }
            });
        }

        let bytes = response.bytes().await?;
        let response: ChatCompletionResponse = serde_json::from_slice(&bytes)?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or(CompletionError::Empty)?;

        let text = choice
            .message
            .content
            .filter(|content| !content.trim().is_empty())
            .ok_or(CompletionError::Empty)?;

        Ok(Completion {
            text,
            finish_reason: choice.finish_reason,
            usage: response.usage,
            model: response.model,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenRouterClient {
    #[instrument(skip(self, user_text), fields(model = %self.model))]
    async fn complete(&self, user_text: &str) -> Result<Completion, CompletionError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: self.build_messages(user_text),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let started = Instant::now();
        let mut delay = self.retry_delay;
        let mut attempt = 1;

        loop {
            match self.attempt(&request).await {
                Ok(completion) => {
                    info!(
                        "Answer generation took {:.2} seconds ({attempt} attempt(s))",
                        started.elapsed().as_secs_f64()
                    );
                    debug!(
                        "Completion from {:?}, finish_reason: {:?}",
                        completion.model, completion.finish_reason
                    );
                    if let Some(usage) = completion.usage {
                        debug!(
                            "Token usage: {} prompt, {} completion, {} total",
                            usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
                        );
                    }
                    return Ok(completion);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        "Completion attempt {attempt}/{} failed: {e}, retrying in {delay:?}",
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => {
                    error!("Completion failed after {attempt} attempt(s): {e}");
                    return Err(e);
                }
            }
        }
    }
}
