//! Per-event pipeline: access check, persist, index, decide, generate, reply.
//!
//! Each event is handled in isolation. Failures are reported to the
//! [`Observer`] and never escape [`ResponseOrchestrator::dispatch`].

use crate::access::{AccessGate, ApprovalState};
use crate::config::Config;
use crate::context::ContextAssembler;
use crate::db::Database;
use crate::deadline::{bounded, call};
use crate::error::{Backend, CoreError, CoreResult};
use crate::llm::{EmbeddingBackend, GenerationBackend, VisionBackend};
use crate::model::{
    ChatEvent, ConversationKind, InboundMessage, MediaRef, Message, MessageEdit, ReviewerDecision,
    User,
};
use crate::observer::{Observer, Severity};
use crate::prompt::generate_prompt;
use crate::rag::SemanticIndex;
use crate::store::MessageStore;
use crate::transport::Transport;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const DESCRIPTION_UNAVAILABLE: &str = "image description unavailable";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub bot_id: i64,
    pub bot_name: String,
    pub identity: String,
    /// Recency window; also the age beyond which semantic retrieval starts.
    pub context_window: Duration,
    pub semantic_limit: usize,
    pub reaction_threshold: f32,
    pub vision_prompt: String,
    pub images_dir: PathBuf,
    pub llm_timeout: Duration,
    pub embedding_timeout: Duration,
    pub vision_timeout: Duration,
    pub transport_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config, bot_id: i64) -> Self {
        Self {
            bot_id,
            bot_name: config.bot_name.clone(),
            identity: config.bot_identity.clone(),
            context_window: config.context_window,
            semantic_limit: config.rag_limit,
            reaction_threshold: config.reaction_threshold,
            vision_prompt: config.vision_prompt.clone(),
            images_dir: config.images_dir(),
            llm_timeout: Duration::from_secs(config.llm_timeout_secs),
            embedding_timeout: Duration::from_secs(config.embedding_timeout_secs),
            vision_timeout: Duration::from_secs(config.vision_timeout_secs),
            transport_timeout: Duration::from_secs(config.transport_timeout_secs),
        }
    }
}

/// External collaborators injected into the pipeline.
pub struct Collaborators {
    pub embedder: Arc<dyn EmbeddingBackend>,
    pub generator: Arc<dyn GenerationBackend>,
    pub vision: Arc<dyn VisionBackend>,
    pub transport: Arc<dyn Transport>,
    pub observer: Arc<dyn Observer>,
}

/// How a single event ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Sender not approved; nothing stored.
    Dropped,
    /// Nothing to ingest.
    Ignored,
    /// Redelivery of a message that is already stored.
    Duplicate,
    /// Stored (and possibly indexed) without a reply.
    Ingested,
    Replied { reply_id: i64 },
    Failed,
    Cancelled,
    Edited,
    EditRejected,
    Approved,
    Denied,
}

pub struct ResponseOrchestrator {
    settings: OrchestratorSettings,
    store: MessageStore,
    index: SemanticIndex,
    gate: AccessGate,
    assembler: ContextAssembler,
    generator: Arc<dyn GenerationBackend>,
    vision: Arc<dyn VisionBackend>,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn Observer>,
}

impl ResponseOrchestrator {
    pub async fn open(
        settings: OrchestratorSettings,
        db: Database,
        collaborators: Collaborators,
    ) -> CoreResult<Self> {
        let store = MessageStore::new(db.clone());
        let index = SemanticIndex::open(db, collaborators.embedder).await?;
        let gate = AccessGate::new(
            store.clone(),
            collaborators.transport.clone(),
            settings.transport_timeout,
        );
        let assembler = ContextAssembler::new(store.clone(), index.clone());

        Ok(Self {
            settings,
            store,
            index,
            gate,
            assembler,
            generator: collaborators.generator,
            vision: collaborators.vision,
            transport: collaborators.transport,
            observer: collaborators.observer,
        })
    }

    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Ensures the reviewer and the bot itself exist as users.
    pub async fn bootstrap(&self, admin: User, bot: User) -> CoreResult<()> {
        for user in [admin, bot] {
            let id = user.id;
            if self.store.ensure_user(user).await? {
                info!("Bootstrap: created user {}", id);
            }
        }
        Ok(())
    }

    /// Event dispatch table.
    pub async fn dispatch(&self, event: ChatEvent, token: &CancellationToken) -> Outcome {
        match event {
            ChatEvent::Inbound(inbound) => self.handle_inbound(inbound, token).await,
            ChatEvent::Edit(edit) => self.handle_edit(edit).await,
            ChatEvent::ReviewerDecision(decision) => self.handle_decision(decision, token).await,
        }
    }

    /// Ingestion loop: one task per event until the channel closes or `shutdown` fires.
    ///
    /// Events of the same conversation run one after another in arrival
    /// order. Other conversations and reviewer decisions are not held up.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ChatEvent>,
        shutdown: CancellationToken,
    ) {
        let tracker = TaskTracker::new();
        // Per conversation, the completion signal of its most recent event.
        let mut tails: HashMap<i64, oneshot::Receiver<()>> = HashMap::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let (previous, done) = match event.conversation_id() {
                        Some(conversation_id) => {
                            tails.retain(|_, tail| matches!(tail.try_recv(), Err(TryRecvError::Empty)));
                            let (done, tail) = oneshot::channel();
                            (tails.insert(conversation_id, tail), Some(done))
                        }
                        None => (None, None),
                    };

                    let this = self.clone();
                    let token = shutdown.child_token();
                    tracker.spawn(async move {
                        if let Some(previous) = previous {
                            // Resolves when the previous task drops its sender, panics included.
                            let _ = previous.await;
                        }
                        this.dispatch(event, &token).await;
                        drop(done);
                    });
                }
            }
        }
        tracker.close();
        tracker.wait().await;
        info!("Orchestrator: ingestion loop stopped");
    }

    async fn handle_inbound(&self, inbound: InboundMessage, token: &CancellationToken) -> Outcome {
        let conversation_id = inbound.conversation_id;
        let message_id = inbound.id;

        match self
            .gate
            .check_or_request(conversation_id, &inbound.sender, token)
            .await
        {
            Ok(ApprovalState::Approved(_)) => {}
            Ok(ApprovalState::Pending) => {
                debug!(
                    "Access: dropped message {} from unapproved sender {}",
                    message_id, inbound.sender.id
                );
                return Outcome::Dropped;
            }
            Err(e) => return self.fail(conversation_id, message_id, e),
        }

        if inbound.text.is_none() && inbound.image.is_none() {
            return Outcome::Ignored;
        }
        info!(conversation_id, message_id, sender_id = inbound.sender.id, "msg_in");

        let message = match &inbound.image {
            Some(image) => self.ingest_image(&inbound, image, token).await,
            None => Message {
                id: message_id,
                conversation_id,
                sender_id: inbound.sender.id,
                text: inbound.text.clone().unwrap_or_default(),
                media_path: None,
                reply_to_id: inbound.reply_to.map(|r| r.message_id),
                created_at: inbound.created_at,
            },
        };
        let (text, created_at) = (message.text.clone(), message.created_at);

        match self.store.append(message).await {
            Ok(()) => info!(conversation_id, message_id, "msg_in_persisted"),
            Err(CoreError::Duplicate { .. }) => {
                debug!(
                    "Store: message {} in conversation {} already ingested",
                    message_id, conversation_id
                );
                return Outcome::Duplicate;
            }
            Err(e) => return self.fail(conversation_id, message_id, e),
        }

        let embedding = match bounded(
            Backend::Embedding,
            self.settings.embedding_timeout,
            token,
            self.index
                .insert(message_id, conversation_id, &text, created_at),
        )
        .await
        {
            Ok(vector) => {
                debug!(conversation_id, message_id, "msg_indexed");
                Some(vector)
            }
            Err(e) => {
                self.observer.report(
                    Severity::Warning,
                    "index_failed",
                    &format!(
                        "conversation_id: {} - message_id: {} - error: {}",
                        conversation_id, message_id, e
                    ),
                );
                None
            }
        };

        if !self.should_reply(&inbound) {
            return Outcome::Ingested;
        }

        match self.respond(&inbound, embedding.as_deref(), token).await {
            Ok(reply_id) => Outcome::Replied { reply_id },
            Err(e) => self.fail(conversation_id, message_id, e),
        }
    }

    /// Reply when named, in one-to-one conversations, or when answering the bot.
    fn should_reply(&self, inbound: &InboundMessage) -> bool {
        let bot_mentioned = inbound.text.as_deref().is_some_and(|text| {
            text.to_lowercase()
                .contains(&self.settings.bot_name.to_lowercase())
        });
        let is_private = inbound.kind == ConversationKind::Private;
        let is_reply_to_bot = inbound
            .reply_to
            .is_some_and(|r| r.sender_id == Some(self.settings.bot_id));

        bot_mentioned || is_private || is_reply_to_bot
    }

    /// Downloads and describes an image. Every failure degrades the message
    /// instead of dropping it.
    async fn ingest_image(
        &self,
        inbound: &InboundMessage,
        image: &MediaRef,
        token: &CancellationToken,
    ) -> Message {
        let conversation_id = inbound.conversation_id;
        let message_id = inbound.id;

        let bytes = match call(
            Backend::Transport,
            self.settings.transport_timeout,
            token,
            self.transport.download_media(image),
        )
        .await
        {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(
                    "Media: download failed for message {} in conversation {}: {}",
                    message_id, conversation_id, e
                );
                None
            }
        };

        let mut media_path = None;
        let mut description = DESCRIPTION_UNAVAILABLE.to_string();
        if let Some(bytes) = bytes {
            let path = self
                .settings
                .images_dir
                .join(format!("{}-{}.jpg", conversation_id, message_id));
            match save_image(&path, &bytes).await {
                Ok(()) => media_path = Some(path.to_string_lossy().into_owned()),
                Err(e) => warn!("Media: could not save {}: {}", path.display(), e),
            }

            match call(
                Backend::Vision,
                self.settings.vision_timeout,
                token,
                self.vision.analyze(&bytes, &self.settings.vision_prompt),
            )
            .await
            {
                Ok(text) => description = text,
                Err(e) => warn!(
                    "Vision: could not describe message {} in conversation {}: {}",
                    message_id, conversation_id, e
                ),
            }
        }

        Message {
            id: message_id,
            conversation_id,
            sender_id: inbound.sender.id,
            text: format!(
                "sent an image with caption: \"{}\", image description: \"{}\"",
                inbound.text.as_deref().unwrap_or_default(),
                description
            ),
            media_path,
            reply_to_id: inbound.reply_to.map(|r| r.message_id),
            created_at: inbound.created_at,
        }
    }

    async fn respond(
        &self,
        inbound: &InboundMessage,
        embedding: Option<&[f32]>,
        token: &CancellationToken,
    ) -> CoreResult<i64> {
        let conversation_id = inbound.conversation_id;
        let message_id = inbound.id;
        let settings = &self.settings;

        if let Err(e) = call(
            Backend::Transport,
            settings.transport_timeout,
            token,
            self.transport.start_typing(conversation_id),
        )
        .await
        {
            debug!("Transport: typing indicator failed: {}", e);
        }

        info!(conversation_id, message_id, "llm_request");
        let context = self
            .assembler
            .build(
                conversation_id,
                embedding,
                settings.context_window,
                settings.context_window,
                settings.semantic_limit,
            )
            .await?;
        let members = self.store.get_members(conversation_id).await?;
        let prompt = generate_prompt(&members, &settings.bot_name, &settings.identity);

        let reply = call(
            Backend::Generation,
            settings.llm_timeout,
            token,
            self.generator.generate(&prompt, &context),
        )
        .await?;
        info!(conversation_id, message_id, "llm_response");
        debug!("{:#?}", reply);

        if let Some(label) = reply.reaction.as_deref() {
            if reply.reaction_strength >= settings.reaction_threshold {
                match call(
                    Backend::Transport,
                    settings.transport_timeout,
                    token,
                    self.transport.send_reaction(conversation_id, message_id, label),
                )
                .await
                {
                    Ok(()) => info!(conversation_id, message_id, "msg_reaction"),
                    Err(e) => self.observer.report(
                        Severity::Warning,
                        "reaction_failed",
                        &format!(
                            "conversation_id: {} - message_id: {} - error: {}",
                            conversation_id, message_id, e
                        ),
                    ),
                }
            }
        }

        let sent = call(
            Backend::Transport,
            settings.transport_timeout,
            token,
            self.transport
                .send_text(conversation_id, &reply.message, Some(message_id)),
        )
        .await?;
        let Some(reply_id) = sent.first().map(|chunk| chunk.id) else {
            return Err(CoreError::unavailable(
                Backend::Transport,
                anyhow::anyhow!("no message was sent"),
            ));
        };
        info!(conversation_id, message_id = reply_id, chunks = sent.len(), "msg_out");

        // Each chunk answers the one before it, so replies to any of them resolve.
        let mut reply_to_id = message_id;
        for chunk in sent {
            let chunk_id = chunk.id;
            self.store
                .append(Message {
                    id: chunk_id,
                    conversation_id,
                    sender_id: settings.bot_id,
                    text: chunk.text,
                    media_path: None,
                    reply_to_id: Some(reply_to_id),
                    created_at: chunk.created_at,
                })
                .await?;
            info!(conversation_id, message_id = chunk_id, "msg_out_persisted");
            reply_to_id = chunk_id;
        }
        Ok(reply_id)
    }

    async fn handle_edit(&self, edit: MessageEdit) -> Outcome {
        let MessageEdit {
            conversation_id,
            message_id,
            text,
        } = edit;
        match self.store.edit_text(conversation_id, message_id, text).await {
            Ok(()) => {
                info!(conversation_id, message_id, "msg_edited");
                Outcome::Edited
            }
            Err(e @ CoreError::NotFound { .. }) => {
                self.observer
                    .report(Severity::Warning, "edit_rejected", &e.to_string());
                Outcome::EditRejected
            }
            Err(e) => self.fail(conversation_id, message_id, e),
        }
    }

    async fn handle_decision(
        &self,
        decision: ReviewerDecision,
        token: &CancellationToken,
    ) -> Outcome {
        let outcome = match self.gate.decide(decision).await {
            Ok(Some(_)) => Outcome::Approved,
            Ok(None) => Outcome::Denied,
            Err(e) => {
                self.observer.report(
                    Severity::Error,
                    "decision_failed",
                    &format!("sender_id: {} - error: {}", decision.sender_id, e),
                );
                return Outcome::Failed;
            }
        };

        if let Err(e) = call(
            Backend::Transport,
            self.settings.transport_timeout,
            token,
            self.transport.acknowledge_decision(&decision),
        )
        .await
        {
            warn!("Access: could not acknowledge decision: {}", e);
        }
        outcome
    }

    fn fail(&self, conversation_id: i64, message_id: i64, error: CoreError) -> Outcome {
        let detail = format!(
            "conversation_id: {} - message_id: {} - error: {}",
            conversation_id, message_id, error
        );
        if matches!(error, CoreError::Cancelled) {
            self.observer.report(Severity::Info, "msg_cancelled", &detail);
            return Outcome::Cancelled;
        }
        self.observer.report(Severity::Error, "msg_failed", &detail);
        Outcome::Failed
    }
}

async fn save_image(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, bytes).await
}
