//! Chat transport seam. The pipeline talks to the platform only through [`Transport`].

pub mod discord;
pub mod text;

use crate::model::{MediaRef, ReviewerDecision, Sender};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A message the transport delivered on our behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: i64,
    /// The text as delivered, after formatting and splitting.
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `text`, replying to `reply_to` when given.
    ///
    /// Long texts go out as several messages; all of them are returned in
    /// send order, and only the first one carries the reply reference.
    async fn send_text(
        &self,
        conversation_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> anyhow::Result<Vec<SentMessage>>;

    async fn send_reaction(
        &self,
        conversation_id: i64,
        message_id: i64,
        label: &str,
    ) -> anyhow::Result<()>;

    async fn download_media(&self, media: &MediaRef) -> anyhow::Result<Vec<u8>>;

    /// Asks the reviewer to approve or deny `sender`.
    async fn notify_reviewer(&self, sender: &Sender) -> anyhow::Result<()>;

    async fn acknowledge_decision(&self, decision: &ReviewerDecision) -> anyhow::Result<()>;

    /// Out-of-band operator alert.
    async fn alert_reviewer(&self, text: &str) -> anyhow::Result<()>;

    async fn start_typing(&self, conversation_id: i64) -> anyhow::Result<()>;
}
