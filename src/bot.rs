use crate::completion::{CompletionError, CompletionProvider};
use crate::line::{ReplyError, ReplySender, TextEvent};
use std::sync::Arc;
use tracing::instrument;
use tracing::log::{debug, error, info, warn};

/// What happened to a single text event.
#[derive(Debug)]
pub enum EventOutcome {
    /// The generated answer was delivered.
    Replied,

    /// No answer was generated. `fallback` is the result of sending the
    /// apology message, or `None` when no fallback is configured.
    CompletionFailed {
        error: CompletionError,
        fallback: Option<Result<(), ReplyError>>,
    },

    /// An answer was generated but the platform refused or never got it.
    ReplyFailed(ReplyError),
}
impl EventOutcome {
    /// Describes why the event failed, `None` when it succeeded.
    pub fn failure(&self) -> Option<String> {
        match self {
            EventOutcome::Replied => None,
            EventOutcome::CompletionFailed {
                error,
                fallback: Some(Err(e)),
            } => Some(format!("{error} (fallback also failed: {e})")),
            EventOutcome::CompletionFailed { error, .. } => Some(error.to_string()),
            EventOutcome::ReplyFailed(e) => Some(e.to_string()),
        }
    }
}

/// Answers text events: one completion call, then one reply call.
pub struct HomeworkBot {
    completion: Arc<dyn CompletionProvider>,
    messaging: Arc<dyn ReplySender>,
    fallback_message: Option<String>,
}
impl HomeworkBot {
    pub fn new(
        completion: Arc<dyn CompletionProvider>,
        messaging: Arc<dyn ReplySender>,
        fallback_message: Option<String>,
    ) -> Self {
        Self {
            completion,
            messaging,
            fallback_message,
        }
    }

    #[instrument(skip(self, event), fields(sender = event.sender_id.as_deref().unwrap_or("unknown")))]
    pub async fn answer(&self, event: &TextEvent) -> EventOutcome {
        info!("Received message, {} characters", event.text.chars().count());
        debug!("User prompt: {:?}", event.text);

        let completion = match self.completion.complete(&event.text).await {
            Ok(completion) => completion,
            Err(error) => {
                error!("Failed to generate solution: {error}");
                let fallback = self.send_fallback(&event.reply_token).await;
                return EventOutcome::CompletionFailed { error, fallback };
            }
        };
        debug!("Solution content length: {}", completion.text.len());

        match self
            .messaging
            .reply(&event.reply_token, &completion.text)
            .await
        {
            Ok(()) => {
                info!("Successfully sent solution");
                EventOutcome::Replied
            }
            Err(e) => {
                error!("Failed to send solution: {e}");
                EventOutcome::ReplyFailed(e)
            }
        }
    }

    async fn send_fallback(&self, reply_token: &str) -> Option<Result<(), ReplyError>> {
        let message = self.fallback_message.as_deref()?;
        let result = self.messaging.reply(reply_token, message).await;
        if let Err(e) = &result {
            warn!("Failed to send fallback message: {e}");
        }
        Some(result)
    }
}
