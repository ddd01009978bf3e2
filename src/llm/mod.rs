//! Seams to the model backends.
//!
//! The pipeline only sees these traits; [`client::LlmClient`] implements all
//! three against OpenAI-compatible endpoints.

pub mod client;

pub use client::LlmClient;

use crate::model::Message;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;

#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Vector length produced by [`EmbeddingBackend::embed`]; fixed for the backend's lifetime.
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Produces a structured reply for the chronologically ordered `messages`.
    ///
    /// Must fail rather than return an empty reply when the output cannot be parsed.
    async fn generate(&self, prompt: &str, messages: &[Message]) -> anyhow::Result<GeneratedReply>;
}

#[async_trait]
pub trait VisionBackend: Send + Sync {
    async fn analyze(&self, image: &[u8], prompt: &str) -> anyhow::Result<String>;
}

/// Reaction labels the generation backend may pick from.
pub const REACTION_LABELS: &[&str] = &[
    "👍", "👎", "❤", "🔥", "🥰", "👏", "😁", "🤔", "🤯", "😱", "🤬", "😢", "🎉", "🤩", "🤮",
    "💩", "🙏", "👌", "🕊", "🤡", "🥱", "🥴", "😍", "🐳", "❤‍🔥", "🌚", "🌭", "💯", "🤣", "⚡",
    "🍌", "🏆", "💔", "🤨", "😐", "🍓", "🍾", "💋", "😈", "😴", "😭", "🤓", "👻", "👨‍💻", "👀",
    "🎃", "🙈", "😇", "😨", "🤝", "✍", "🤗", "🫡", "🎅", "🎄", "☃", "💅", "🤪", "🗿", "🆒",
    "💘", "🙉", "🦄", "😘", "💊", "🙊", "😎", "👾", "🤷", "😡",
];

/// Structured output of the generation backend.
#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct GeneratedReply {
    /// The message text to send in response.
    pub message: String,
    /// Emoji to react to the last message with, if any.
    #[serde(default)]
    pub reaction: Option<String>,
    /// How strongly to react to the last message, between 0 and 1.
    pub reaction_strength: f32,
}

impl GeneratedReply {
    /// Parses raw model output, normalizing the reaction and bounding the strength.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            anyhow::bail!("generation backend returned empty output");
        }

        let mut reply: GeneratedReply = serde_json::from_str(strip_code_fence(raw))
            .map_err(|e| anyhow::anyhow!("unparseable generation output: {}", e))?;

        if !reply.reaction_strength.is_finite() {
            anyhow::bail!("reaction_strength is not a number");
        }
        reply.reaction_strength = reply.reaction_strength.clamp(0.0, 1.0);
        reply.reaction = reply.reaction.as_deref().and_then(normalize_reaction);
        Ok(reply)
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let Some(inner) = raw.strip_prefix("```") else {
        return raw;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Maps a model-supplied label onto [`REACTION_LABELS`].
///
/// Labels that arrive as UTF-8 bytes decoded as latin-1 are repaired first.
pub fn normalize_reaction(label: &str) -> Option<String> {
    let label = label.trim();
    if label.is_empty() {
        return None;
    }
    if let Some(known) = find_label(label) {
        return Some(known.to_string());
    }

    let bytes: Option<Vec<u8>> = label
        .chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect();
    let decoded = String::from_utf8(bytes?).ok()?;
    find_label(&decoded).map(str::to_string)
}

fn find_label(label: &str) -> Option<&'static str> {
    // Tolerate a trailing variation selector.
    let stripped = label.trim_end_matches('\u{fe0f}');
    REACTION_LABELS
        .iter()
        .copied()
        .find(|known| *known == label || *known == stripped)
}
