//! Conversation context assembly for the generation backend.
//!
//! Two non-overlapping time ranges are merged: semantically related messages
//! from before `now - semantic_older_than`, and every message inside the
//! recency window.

use crate::error::CoreResult;
use crate::model::Message;
use crate::rag::SemanticIndex;
use crate::store::MessageStore;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct ContextAssembler {
    store: MessageStore,
    index: SemanticIndex,
}

impl ContextAssembler {
    pub fn new(store: MessageStore, index: SemanticIndex) -> Self {
        Self { store, index }
    }

    /// Returns the context for `conversation_id`, deduplicated and oldest first.
    ///
    /// Without an `embedding` for the current message only the recency window is used.
    pub async fn build(
        &self,
        conversation_id: i64,
        embedding: Option<&[f32]>,
        recency_window: Duration,
        semantic_older_than: Duration,
        semantic_limit: usize,
    ) -> CoreResult<Vec<Message>> {
        let semantic = match embedding {
            Some(vector) => {
                match self
                    .semantic(conversation_id, vector, semantic_older_than, semantic_limit)
                    .await
                {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!(
                            "Context: semantic retrieval failed for conversation {}, using recent messages only: {}",
                            conversation_id, e
                        );
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };
        let recent = self.store.get_since(conversation_id, recency_window).await?;

        debug!(
            "Context: conversation {} - {} semantic, {} recent",
            conversation_id,
            semantic.len(),
            recent.len()
        );
        Ok(merge(semantic, recent))
    }

    async fn semantic(
        &self,
        conversation_id: i64,
        vector: &[f32],
        older_than: Duration,
        limit: usize,
    ) -> CoreResult<Vec<Message>> {
        let ids = self
            .index
            .query(conversation_id, vector, older_than, limit)
            .await?;
        self.store.get_by_ids(conversation_id, &ids).await
    }
}

/// Semantic hits first, then recent ones; a message present in both keeps its
/// recent copy. The result is stably sorted by `created_at`.
pub fn merge(semantic: Vec<Message>, recent: Vec<Message>) -> Vec<Message> {
    let recent_keys: HashSet<(i64, i64)> = recent.iter().map(Message::key).collect();
    let mut seen = HashSet::with_capacity(semantic.len() + recent.len());

    let mut merged: Vec<Message> = semantic
        .into_iter()
        .filter(|m| !recent_keys.contains(&m.key()))
        .chain(recent)
        .filter(|m| seen.insert(m.key()))
        .collect();
    merged.sort_by_key(|m| m.created_at);
    merged
}
