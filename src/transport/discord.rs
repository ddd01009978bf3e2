//! Discord adapter: gateway events in, [`Transport`] calls out.

use super::text::{format_reply, replace_bot_mentions, split_message};
use super::{SentMessage, Transport};
use crate::config::DISCORD_MESSAGE_LIMIT;
use crate::model::{
    ChatEvent, ConversationKind, InboundMessage, MediaRef, MessageEdit, ReplyRef,
    ReviewerDecision, Sender, Verdict,
};
use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use poise::serenity_prelude as serenity;
use poise::serenity_prelude::{
    Attachment, ButtonStyle, ChannelId, ComponentInteraction, CreateActionRow,
    CreateAllowedMentions, CreateButton, CreateInteractionResponse,
    CreateInteractionResponseMessage, CreateMessage, Http, MessageId, MessageUpdateEvent,
    ReactionType, UserId,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Discord epoch (2015-01-01T00:00:00Z) in milliseconds.
const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

/// Creation time encoded in a Discord snowflake.
pub fn snowflake_time(id: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(((id >> 22) + DISCORD_EPOCH_MS) as i64)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn reviewer_prompt(sender: &Sender) -> String {
    format!("Approve {} to use the bot?", sender.display_name())
}

pub fn acknowledgement(decision: &ReviewerDecision) -> String {
    match decision.verdict {
        Verdict::Approve => "Approved.".to_string(),
        Verdict::Deny => format!("User with ID {} was denied.", decision.sender_id),
    }
}

pub struct DiscordTransport {
    http: Arc<Http>,
    http_client: reqwest::Client,
    admin_user_id: u64,
}

impl DiscordTransport {
    pub fn new(http: Arc<Http>, admin_user_id: u64) -> Self {
        Self {
            http,
            http_client: reqwest::Client::new(),
            admin_user_id,
        }
    }

    async fn dm_reviewer(&self, builder: CreateMessage) -> anyhow::Result<()> {
        UserId::new(self.admin_user_id)
            .direct_message(&self.http, builder)
            .await
            .context("Failed to DM the reviewer")?;
        Ok(())
    }
}

#[async_trait]
impl Transport for DiscordTransport {
    async fn send_text(
        &self,
        conversation_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> anyhow::Result<Vec<SentMessage>> {
        let channel = ChannelId::new(conversation_id as u64);
        let mut sent = Vec::new();

        for chunk in split_message(&format_reply(text), DISCORD_MESSAGE_LIMIT) {
            let mut builder = CreateMessage::new()
                .content(chunk.as_str())
                .allowed_mentions(CreateAllowedMentions::new().replied_user(true));
            if let (true, Some(reply_to)) = (sent.is_empty(), reply_to) {
                builder = builder.reference_message((channel, MessageId::new(reply_to as u64)));
            }
            let message = channel
                .send_message(&self.http, builder)
                .await
                .context("Failed to send message")?;
            sent.push(SentMessage {
                id: message.id.get() as i64,
                text: chunk,
                created_at: snowflake_time(message.id.get()),
            });
        }

        anyhow::ensure!(!sent.is_empty(), "Nothing was sent");
        Ok(sent)
    }

    async fn send_reaction(
        &self,
        conversation_id: i64,
        message_id: i64,
        label: &str,
    ) -> anyhow::Result<()> {
        ChannelId::new(conversation_id as u64)
            .create_reaction(
                &self.http,
                MessageId::new(message_id as u64),
                ReactionType::Unicode(label.to_string()),
            )
            .await
            .context("Failed to add reaction")?;
        Ok(())
    }

    async fn download_media(&self, media: &MediaRef) -> anyhow::Result<Vec<u8>> {
        let bytes = self
            .http_client
            .get(&media.url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        debug!("Downloaded {} bytes from {}", bytes.len(), media.url);
        Ok(bytes.to_vec())
    }

    async fn notify_reviewer(&self, sender: &Sender) -> anyhow::Result<()> {
        let approve = ReviewerDecision {
            verdict: Verdict::Approve,
            sender_id: sender.id,
        };
        let deny = ReviewerDecision {
            verdict: Verdict::Deny,
            sender_id: sender.id,
        };
        let row = CreateActionRow::Buttons(vec![
            CreateButton::new(approve.token())
                .label("Yes")
                .style(ButtonStyle::Success),
            CreateButton::new(deny.token())
                .label("No")
                .style(ButtonStyle::Danger),
        ]);

        self.dm_reviewer(
            CreateMessage::new()
                .content(reviewer_prompt(sender))
                .components(vec![row]),
        )
        .await
    }

    async fn acknowledge_decision(&self, decision: &ReviewerDecision) -> anyhow::Result<()> {
        self.dm_reviewer(CreateMessage::new().content(acknowledgement(decision)))
            .await
    }

    async fn alert_reviewer(&self, text: &str) -> anyhow::Result<()> {
        self.dm_reviewer(CreateMessage::new().content(text)).await
    }

    async fn start_typing(&self, conversation_id: i64) -> anyhow::Result<()> {
        ChannelId::new(conversation_id as u64)
            .broadcast_typing(&self.http)
            .await?;
        Ok(())
    }
}

// --- Gateway event conversion ---

pub fn sender_from_user(user: &serenity::User) -> Sender {
    Sender {
        id: user.id.get() as i64,
        first_name: user.global_name.clone(),
        last_name: None,
        handle: Some(user.name.clone()),
    }
}

/// The largest image attachment, if any.
fn largest_image(attachments: &[Attachment]) -> Option<&Attachment> {
    attachments
        .iter()
        .filter(|a| {
            a.content_type
                .as_deref()
                .is_some_and(|t| t.starts_with("image/"))
        })
        .max_by_key(|a| u64::from(a.width.unwrap_or(0)) * u64::from(a.height.unwrap_or(0)))
}

/// Converts a gateway message into an inbound event. Messages from bots are skipped.
pub fn inbound_event(msg: &serenity::Message, bot_id: u64, bot_name: &str) -> Option<ChatEvent> {
    if msg.author.bot {
        return None;
    }

    let text = replace_bot_mentions(&msg.content, bot_id, bot_name);
    let image = largest_image(&msg.attachments).map(|a| MediaRef { url: a.url.clone() });
    let text = (!text.is_empty()).then_some(text);
    if text.is_none() && image.is_none() {
        return None;
    }

    let reply_to = match (&msg.referenced_message, &msg.message_reference) {
        (Some(referenced), _) => Some(ReplyRef {
            message_id: referenced.id.get() as i64,
            sender_id: Some(referenced.author.id.get() as i64),
        }),
        (None, Some(reference)) => reference.message_id.map(|id| ReplyRef {
            message_id: id.get() as i64,
            sender_id: None,
        }),
        (None, None) => None,
    };

    Some(ChatEvent::Inbound(InboundMessage {
        id: msg.id.get() as i64,
        conversation_id: msg.channel_id.get() as i64,
        kind: if msg.guild_id.is_some() {
            ConversationKind::Group
        } else {
            ConversationKind::Private
        },
        sender: sender_from_user(&msg.author),
        text,
        image,
        reply_to,
        created_at: snowflake_time(msg.id.get()),
    }))
}

pub fn edit_event(update: &MessageUpdateEvent, bot_id: u64, bot_name: &str) -> Option<ChatEvent> {
    if update.author.as_ref().is_some_and(|author| author.bot) {
        return None;
    }
    let content = update.content.as_deref()?;
    Some(ChatEvent::Edit(MessageEdit {
        conversation_id: update.channel_id.get() as i64,
        message_id: update.id.get() as i64,
        text: replace_bot_mentions(content, bot_id, bot_name),
    }))
}

/// Turns a reviewer's button press into a decision and removes the buttons.
///
/// Presses from anyone but the reviewer and unknown tokens are ignored.
pub async fn decision_event(
    http: &Http,
    component: &ComponentInteraction,
    admin_user_id: u64,
) -> Option<ChatEvent> {
    if component.user.id.get() != admin_user_id {
        return None;
    }
    let Some(decision) = ReviewerDecision::parse_token(&component.data.custom_id) else {
        warn!("Ignoring unknown component id: {}", component.data.custom_id);
        return None;
    };

    if let Err(e) = component
        .create_response(
            http,
            CreateInteractionResponse::UpdateMessage(
                CreateInteractionResponseMessage::new().components(vec![]),
            ),
        )
        .await
    {
        warn!("Failed to answer reviewer interaction: {}", e);
    }
    Some(ChatEvent::ReviewerDecision(decision))
}
