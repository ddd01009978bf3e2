//! Fakes for the external collaborators, shared by unit tests.

use crate::llm::{EmbeddingBackend, GeneratedReply, GenerationBackend, VisionBackend};
use crate::model::{MediaRef, Message, ReviewerDecision, Sender};
use crate::observer::{Observer, Severity};
use crate::transport::{SentMessage, Transport};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const KEYWORDS: [&str; 3] = ["cat", "dog", "car"];

/// Bag-of-keywords embedder: one dimension per keyword plus a small bias.
pub struct FakeEmbedder {
    dimensions: usize,
    failing: AtomicBool,
}

impl Default for FakeEmbedder {
    fn default() -> Self {
        Self::with_dimensions(KEYWORDS.len())
    }
}

impl FakeEmbedder {
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            dimensions,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingBackend for FakeEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("embedding service down");
        }
        let lowered = text.to_lowercase();
        Ok((0..self.dimensions)
            .map(|i| match KEYWORDS.get(i) {
                Some(word) if lowered.contains(word) => 1.1,
                _ => 0.1,
            })
            .collect())
    }
}

pub struct FakeGenerator {
    reply: Mutex<GeneratedReply>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
    calls: Mutex<Vec<(String, Vec<Message>)>>,
}

impl Default for FakeGenerator {
    fn default() -> Self {
        Self {
            reply: Mutex::new(GeneratedReply {
                message: "# Hello\nnice to meet you".to_string(),
                reaction: None,
                reaction_strength: 0.0,
            }),
            failing: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeGenerator {
    pub fn set_reply(&self, reply: GeneratedReply) {
        *self.reply.lock().unwrap() = reply;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, Vec<Message>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationBackend for FakeGenerator {
    async fn generate(&self, prompt: &str, messages: &[Message]) -> anyhow::Result<GeneratedReply> {
        self.calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), messages.to_vec()));
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("could not parse structured output");
        }
        Ok(self.reply.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeVision {
    failing: AtomicBool,
}

impl FakeVision {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl VisionBackend for FakeVision {
    async fn analyze(&self, image: &[u8], _prompt: &str) -> anyhow::Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("vision service down");
        }
        Ok(format!("a photo of {} bytes", image.len()))
    }
}

/// Records everything sent through it; sent messages get ids from 1000 upwards.
#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<(i64, String, Option<i64>)>>,
    reactions: Mutex<Vec<(i64, i64, String)>>,
    notifications: Mutex<Vec<i64>>,
    acknowledgements: Mutex<Vec<ReviewerDecision>>,
    alerts: Mutex<Vec<String>>,
    typing: Mutex<Vec<i64>>,
    next_id: AtomicI64,
    chunk_limit: AtomicU64,
    notify_delay_ms: AtomicU64,
    download_delay_ms: AtomicU64,
    fail_send: AtomicBool,
    fail_notify: AtomicBool,
    fail_reaction: AtomicBool,
}

impl FakeTransport {
    pub fn sent(&self) -> Vec<(i64, String, Option<i64>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn reactions(&self) -> Vec<(i64, i64, String)> {
        self.reactions.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<i64> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn acknowledgements(&self) -> Vec<ReviewerDecision> {
        self.acknowledgements.lock().unwrap().clone()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn typing(&self) -> Vec<i64> {
        self.typing.lock().unwrap().clone()
    }

    pub fn set_notify_delay(&self, delay: Duration) {
        self.notify_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_download_delay(&self, delay: Duration) {
        self.download_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Splits sent texts into chunks of at most `limit` chars.
    pub fn set_chunk_limit(&self, limit: usize) {
        self.chunk_limit.store(limit as u64, Ordering::SeqCst);
    }

    pub fn fail_send(&self, failing: bool) {
        self.fail_send.store(failing, Ordering::SeqCst);
    }

    pub fn fail_notify(&self, failing: bool) {
        self.fail_notify.store(failing, Ordering::SeqCst);
    }

    pub fn fail_reaction(&self, failing: bool) {
        self.fail_reaction.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send_text(
        &self,
        conversation_id: i64,
        text: &str,
        reply_to: Option<i64>,
    ) -> anyhow::Result<Vec<SentMessage>> {
        if self.fail_send.load(Ordering::SeqCst) {
            anyhow::bail!("send failed");
        }
        let limit = self.chunk_limit.load(Ordering::SeqCst) as usize;
        let chars: Vec<char> = text.chars().collect();
        let chunks: Vec<String> = if limit == 0 || chars.is_empty() {
            vec![text.to_string()]
        } else {
            chars.chunks(limit).map(|c| c.iter().collect()).collect()
        };

        let mut sent = Vec::new();
        for chunk in chunks {
            let reply_to = if sent.is_empty() { reply_to } else { None };
            self.sent
                .lock()
                .unwrap()
                .push((conversation_id, chunk.clone(), reply_to));
            sent.push(SentMessage {
                id: 1000 + self.next_id.fetch_add(1, Ordering::SeqCst),
                text: chunk,
                created_at: Utc::now(),
            });
        }
        Ok(sent)
    }

    async fn send_reaction(
        &self,
        conversation_id: i64,
        message_id: i64,
        label: &str,
    ) -> anyhow::Result<()> {
        if self.fail_reaction.load(Ordering::SeqCst) {
            anyhow::bail!("reaction rejected");
        }
        self.reactions
            .lock()
            .unwrap()
            .push((conversation_id, message_id, label.to_string()));
        Ok(())
    }

    async fn download_media(&self, media: &MediaRef) -> anyhow::Result<Vec<u8>> {
        let delay = self.download_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(media.url.as_bytes().to_vec())
    }

    async fn notify_reviewer(&self, sender: &Sender) -> anyhow::Result<()> {
        let delay = self.notify_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_notify.load(Ordering::SeqCst) {
            anyhow::bail!("reviewer unreachable");
        }
        self.notifications.lock().unwrap().push(sender.id);
        Ok(())
    }

    async fn acknowledge_decision(&self, decision: &ReviewerDecision) -> anyhow::Result<()> {
        self.acknowledgements.lock().unwrap().push(*decision);
        Ok(())
    }

    async fn alert_reviewer(&self, text: &str) -> anyhow::Result<()> {
        self.alerts.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn start_typing(&self, conversation_id: i64) -> anyhow::Result<()> {
        self.typing.lock().unwrap().push(conversation_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    reports: Mutex<Vec<(Severity, String)>>,
}

impl RecordingObserver {
    pub fn events(&self, severity: Severity) -> Vec<String> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == severity)
            .map(|(_, event)| event.clone())
            .collect()
    }
}

impl Observer for RecordingObserver {
    fn report(&self, severity: Severity, event: &str, _detail: &str) {
        self.reports.lock().unwrap().push((severity, event.to_string()));
    }
}
