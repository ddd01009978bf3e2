//! Append-only vector index over stored messages, scoped by conversation.

use crate::db::Database;
use crate::error::{Backend, CoreError, CoreResult};
use crate::llm::EmbeddingBackend;
use crate::model::EmbeddingRecord;
use crate::store::cutoff;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[derive(Clone)]
pub struct SemanticIndex {
    db: Database,
    embedder: Arc<dyn EmbeddingBackend>,
    dimensions: usize,
}

impl SemanticIndex {
    /// Binds the index to the embedder's dimensions. An index created with a
    /// different vector length refuses to open.
    pub async fn open(db: Database, embedder: Arc<dyn EmbeddingBackend>) -> CoreResult<Self> {
        let wanted = embedder.dimensions();
        let dimensions = db
            .run_blocking(move |db| db.init_index_dimensions(wanted))
            .await?;
        if dimensions != wanted {
            return Err(CoreError::DimensionMismatch {
                expected: dimensions,
                actual: wanted,
            });
        }
        Ok(Self {
            db,
            embedder,
            dimensions,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn check_dimensions(&self, vector: &[f32]) -> CoreResult<()> {
        if vector.len() != self.dimensions {
            return Err(CoreError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Embeds `text`, stores the record and returns the vector for reuse by the caller.
    ///
    /// Not idempotent: a second insert for the same message fails with `Duplicate`.
    pub async fn insert(
        &self,
        message_id: i64,
        conversation_id: i64,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> CoreResult<Vec<f32>> {
        let vector = self
            .embedder
            .embed(text)
            .await
            .map_err(|e| CoreError::unavailable(Backend::Embedding, e))?;
        self.check_dimensions(&vector)?;

        let record = EmbeddingRecord {
            message_id,
            conversation_id,
            created_at: epoch_seconds(created_at),
            vector,
        };
        let record = self
            .db
            .run_blocking(move |db| db.insert_embedding(&record).map(|_| record))
            .await?;
        debug!(
            "Index: stored embedding for message {} in conversation {}",
            message_id, conversation_id
        );
        Ok(record.vector)
    }

    /// Up to `limit` nearest messages of the conversation created before `now - older_than`.
    pub async fn query(
        &self,
        conversation_id: i64,
        vector: &[f32],
        older_than: Duration,
        limit: usize,
    ) -> CoreResult<HashSet<i64>> {
        self.check_dimensions(vector)?;
        if limit == 0 {
            return Ok(HashSet::new());
        }

        let before = epoch_seconds(cutoff(Utc::now(), older_than));
        let candidates = self
            .db
            .run_blocking(move |db| db.get_embeddings_before(conversation_id, before))
            .await?;

        let mut scored: Vec<(f32, i64)> = candidates
            .into_iter()
            .map(|(id, candidate)| (cosine_similarity(vector, &candidate), id))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let ids: HashSet<i64> = scored.into_iter().take(limit).map(|(_, id)| id).collect();
        debug!(
            "Index: query in conversation {} returned {} ids",
            conversation_id,
            ids.len()
        );
        Ok(ids)
    }

    pub async fn delete(&self, message_id: i64, conversation_id: i64) -> CoreResult<()> {
        self.db
            .run_blocking(move |db| db.delete_embedding(message_id, conversation_id))
            .await?;
        Ok(())
    }
}
