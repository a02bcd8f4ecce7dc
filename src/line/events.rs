use serde::Deserialize;
use serde_json::Value;
use tracing::log::{debug, warn};

/// Webhook request body. Events are kept raw so that one event the server
/// doesn't understand can't fail the whole delivery.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub destination: Option<String>,

    pub events: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WebhookEvent {
    Message(MessageEvent),

    /// follow, unfollow, postback, join, etc.
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    /// Missing for events delivered in standby mode.
    #[serde(default)]
    pub reply_token: Option<String>,

    #[serde(default)]
    pub source: Option<EventSource>,

    #[serde(default)]
    pub timestamp: Option<i64>,

    #[serde(default)]
    pub webhook_event_id: Option<String>,

    pub message: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageContent {
    Text {
        #[serde(default)]
        id: String,
        text: String,
    },

    /// image, video, audio, file, location, sticker.
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum EventSource {
    User {
        user_id: String,
    },
    Group {
        group_id: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    Room {
        room_id: String,
        #[serde(default)]
        user_id: Option<String>,
    },

    #[serde(other)]
    Unknown,
}
impl EventSource {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            EventSource::User { user_id } => Some(user_id),
            EventSource::Group { user_id, .. } | EventSource::Room { user_id, .. } => {
                user_id.as_deref()
            }
            EventSource::Unknown => None,
        }
    }

    /// The chat the event came from: the user for 1:1 chats, otherwise the
    /// group or room.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            EventSource::User { user_id } => Some(user_id),
            EventSource::Group { group_id, .. } => Some(group_id),
            EventSource::Room { room_id, .. } => Some(room_id),
            EventSource::Unknown => None,
        }
    }
}

/// A text message that can be answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEvent {
    pub reply_token: String,
    pub sender_id: Option<String>,
    pub text: String,
}
impl TextEvent {
    fn from_event(event: WebhookEvent) -> Option<Self> {
        let WebhookEvent::Message(message) = event else {
            return None;
        };
        let MessageContent::Text { id, text } = message.message else {
            return None;
        };
        debug!(
            "Text message {id} in {:?} (event {:?}, sent at {:?})",
            message.source.as_ref().and_then(EventSource::conversation_id),
            message.webhook_event_id,
            message.timestamp
        );
        let reply_token = message.reply_token?;

        Some(Self {
            reply_token,
            sender_id: message
                .source
                .as_ref()
                .and_then(EventSource::user_id)
                .map(str::to_string),
            text,
        })
    }
}

/// Returns every answerable text event in payload order. Undecodable events,
/// non-text events, events without a reply token and blank texts are skipped.
pub fn extract_text_events(payload: &WebhookPayload) -> Vec<TextEvent> {
    payload
        .events
        .iter()
        .enumerate()
        .filter_map(|(idx, raw)| match WebhookEvent::deserialize(raw) {
            Ok(event) => Some((idx, event)),
            Err(e) => {
                warn!("Skipping undecodable webhook event #{idx}: {e}");
                None
            }
        })
        .filter_map(|(idx, event)| {
            let text_event = TextEvent::from_event(event);
            if text_event.is_none() {
                debug!("Skipping webhook event #{idx}, not an answerable text message");
            }
            text_event
        })
        .filter(|event| {
            let blank = event.text.trim().is_empty();
            if blank {
                debug!("Skipping blank text message");
            }
            !blank
        })
        .collect()
}
