//! Domain records and the events delivered by the transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A person (or the bot itself) known to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub handle: Option<String>,
}

impl User {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            first_name: None,
            last_name: None,
            handle: None,
        }
    }
}

/// A stored chat message. Ids are only unique within `conversation_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: i64,
    pub text: String,
    pub media_path: Option<String>,
    pub reply_to_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Composite identity of the message.
    pub fn key(&self) -> (i64, i64) {
        (self.id, self.conversation_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub message_id: i64,
    pub conversation_id: i64,
    /// Seconds since the Unix epoch.
    pub created_at: f64,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    /// One-to-one conversation with the bot.
    Private,
    Group,
}

/// The sender of an inbound event as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub handle: Option<String>,
}

impl Sender {
    pub fn display_name(&self) -> String {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        match (&self.handle, name.is_empty()) {
            (Some(handle), false) => format!("{} ({})", name, handle),
            (Some(handle), true) => handle.clone(),
            (None, false) => name,
            (None, true) => format!("user {}", self.id),
        }
    }
}

impl From<&Sender> for User {
    fn from(sender: &Sender) -> Self {
        User {
            id: sender.id,
            first_name: sender.first_name.clone(),
            last_name: sender.last_name.clone(),
            handle: sender.handle.clone(),
        }
    }
}

/// The message an inbound message replies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyRef {
    pub message_id: i64,
    pub sender_id: Option<i64>,
}

/// Transport-side reference to downloadable media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub kind: ConversationKind,
    pub sender: Sender,
    /// Message text, or the caption for media messages.
    pub text: Option<String>,
    pub image: Option<MediaRef>,
    pub reply_to: Option<ReplyRef>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEdit {
    pub conversation_id: i64,
    pub message_id: i64,
    pub text: String,
}

/// Reviewer verdict on a pending sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewerDecision {
    pub verdict: Verdict,
    pub sender_id: i64,
}

/// Everything the ingestion loop dispatches on.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Inbound(InboundMessage),
    Edit(MessageEdit),
    ReviewerDecision(ReviewerDecision),
}

impl ChatEvent {
    /// The conversation whose message log this event touches.
    pub fn conversation_id(&self) -> Option<i64> {
        match self {
            ChatEvent::Inbound(inbound) => Some(inbound.conversation_id),
            ChatEvent::Edit(edit) => Some(edit.conversation_id),
            ChatEvent::ReviewerDecision(_) => None,
        }
    }
}
