mod client;
mod events;
mod signature;

pub use client::{LineMessagingClient, ReplyError, ReplySender};
pub use events::{extract_text_events, TextEvent, WebhookPayload};
pub use signature::{SignatureVerifier, SIGNATURE_HEADER};
