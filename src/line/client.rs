use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::instrument;
use tracing::log::{debug, warn};

/// Platform limit for a single text message, in characters.
pub const MAX_TEXT_LENGTH: usize = 5000;

/// Platform limit for messages in one reply.
pub const MAX_REPLY_MESSAGES: usize = 5;

#[derive(thiserror::Error, Debug)]
pub enum ReplyError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Reply rejected with {status}: {body}")]
    Rejected { status: StatusCode, body: String },
}

/// Delivers a reply into the conversation an event came from.
#[async_trait]
pub trait ReplySender: Send + Sync {
    /// A reply token may only be used once, so implementations must not retry.
    async fn reply(&self, reply_token: &str, text: &str) -> Result<(), ReplyError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMessageRequest<'a> {
    pub reply_token: &'a str,
    pub messages: Vec<TextMessage<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename = "text")]
pub struct TextMessage<'a> {
    pub text: &'a str,
}

/// Splits text into at most [`MAX_REPLY_MESSAGES`] chunks of at most
/// [`MAX_TEXT_LENGTH`] characters. Anything past that is dropped.
pub fn split_reply_text(text: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() && chunks.len() < MAX_REPLY_MESSAGES {
        let end = rest
            .char_indices()
            .nth(MAX_TEXT_LENGTH)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());

        let (chunk, remaining) = rest.split_at(end);
        chunks.push(chunk);
        rest = remaining;
    }

    if !rest.is_empty() {
        warn!(
            "Reply text exceeds {} messages, dropping {} trailing characters",
            MAX_REPLY_MESSAGES,
            rest.chars().count()
        );
    }
    chunks
}

pub struct LineMessagingClient {
    client: Client,
    reply_url: String,
    channel_access_token: String,
}
impl LineMessagingClient {
    pub fn new(
        api_base: &str,
        channel_access_token: String,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            reply_url: format!("{}/v2/bot/message/reply", api_base.trim_end_matches('/')),
            channel_access_token,
        })
    }
}

#[async_trait]
impl ReplySender for LineMessagingClient {
    #[instrument(skip(self, reply_token, text), fields(reply_length = text.len()))]
    async fn reply(&self, reply_token: &str, text: &str) -> Result<(), ReplyError> {
        let request_body = ReplyMessageRequest {
            reply_token,
            messages: split_reply_text(text)
                .into_iter()
                .map(|text| TextMessage { text })
                .collect(),
        };

        let response = self
            .client
            .post(&self.reply_url)
            .bearer_auth(&self.channel_access_token)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(
                "Reply accepted with {} message(s)",
                request_body.messages.len()
            );
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(ReplyError::Rejected { status, body })
    }
}
