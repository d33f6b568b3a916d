//! Nearest-neighbor index over chunk embeddings.
//!
//! The rest of the crate treats the index as an opaque service behind
//! [`VectorIndex`]: upsert points, delete every point of a file, search by
//! vector. Two backends exist:
//!
//! | Backend | Storage | Score range |
//! |---------|---------|-------------|
//! | [`SqliteVectorIndex`] | `chunk_vectors` table next to the record store, brute-force cosine | `[-1, 1]` |
//! | [`QdrantIndex`] | a Qdrant collection over its REST API | `[-1, 1]` (cosine distance) |

mod qdrant;
mod sqlite;

pub use qdrant::QdrantIndex;
pub use sqlite::SqliteVectorIndex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::Config;
use crate::models::FileType;

/// Denormalized filing metadata stored with each chunk, so a semantic hit
/// can be rendered without a join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub file_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub filename: String,
    pub file_type: FileType,
    pub title: String,
    pub category: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ChunkPayload,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    /// Raw backend similarity; see [`VectorIndex::score_scale`].
    pub score: f32,
    pub payload: ChunkPayload,
}

/// How a backend's raw similarity maps into `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreScale {
    /// Cosine similarity in `[-1, 1]`, rescaled with `(s + 1) / 2`.
    SignedUnit,
    /// Already in `[0, 1]`; clamped.
    Unit,
}

impl ScoreScale {
    pub fn normalize(self, raw: f32) -> f64 {
        let raw = raw as f64;
        let scaled = match self {
            ScoreScale::SignedUnit => (raw + 1.0) / 2.0,
            ScoreScale::Unit => raw,
        };
        scaled.clamp(0.0, 1.0)
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &str;

    /// Create the collection/table if needed and check the service answers.
    async fn ensure_ready(&self) -> Result<()>;

    async fn upsert(&self, points: &[VectorPoint]) -> Result<()>;

    /// Remove every point whose payload belongs to `file_id`.
    async fn delete_file(&self, file_id: &str) -> Result<()>;

    /// Top `limit` points by similarity, best first.
    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<VectorHit>>;

    async fn count_file(&self, file_id: &str) -> Result<usize>;

    fn score_scale(&self) -> ScoreScale;
}

/// Build the backend named by `config.vector.backend`.
///
/// Returns `None` for `disabled`, and also when embeddings are disabled,
/// since no vectors could ever be written.
pub fn create_vector_index(
    config: &Config,
    pool: &SqlitePool,
) -> Result<Option<Arc<dyn VectorIndex>>> {
    if !config.embedding.is_enabled() {
        return Ok(None);
    }

    match config.vector.backend.as_str() {
        "disabled" => Ok(None),
        "sqlite" => Ok(Some(Arc::new(SqliteVectorIndex::new(pool.clone())))),
        "qdrant" => {
            let dims = config
                .embedding
                .dims
                .ok_or_else(|| anyhow::anyhow!("embedding.dims required for qdrant backend"))?;
            Ok(Some(Arc::new(QdrantIndex::new(
                &config.vector.url,
                &config.vector.collection,
                dims,
                config.embedding.timeout_secs,
            )?)))
        }
        other => bail!("Unknown vector backend: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_unit_rescales() {
        assert!((ScoreScale::SignedUnit.normalize(1.0) - 1.0).abs() < 1e-9);
        assert!((ScoreScale::SignedUnit.normalize(0.0) - 0.5).abs() < 1e-9);
        assert!(ScoreScale::SignedUnit.normalize(-1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unit_clamps() {
        assert_eq!(ScoreScale::Unit.normalize(1.7), 1.0);
        assert_eq!(ScoreScale::Unit.normalize(-0.2), 0.0);
        assert!((ScoreScale::Unit.normalize(0.5) - 0.5).abs() < 1e-9);
    }
}
