//! Per-file vector replacement.
//!
//! Every chunk is embedded before the index is touched. Only when all
//! embeddings succeeded are the file's old points deleted and the new ones
//! upserted, so an embedding failure leaves the previous vectors searchable.

use anyhow::{Context, Result};
use tracing::debug;

use crate::chunk::chunk_point_id;
use crate::embedding::Embedder;
use crate::store::DisplayMetadata;
use crate::vector::{ChunkPayload, VectorIndex, VectorPoint};

/// Replace all vectors of `meta.file_id` with embeddings of `chunks`.
///
/// Zero chunks still clears stale vectors. Returns the number of points
/// written.
pub async fn sync_file_vectors(
    index: &dyn VectorIndex,
    embedder: &dyn Embedder,
    meta: &DisplayMetadata,
    chunks: &[String],
) -> Result<usize> {
    let mut points = Vec::with_capacity(chunks.len());

    // one request in flight per file
    for (i, text) in chunks.iter().enumerate() {
        let vector = embedder
            .embed(text)
            .await
            .with_context(|| format!("embedding chunk {} of {}", i, meta.file_id))?;

        points.push(VectorPoint {
            id: chunk_point_id(&meta.file_id, i),
            vector,
            payload: ChunkPayload {
                file_id: meta.file_id.clone(),
                chunk_index: i,
                text: text.clone(),
                filename: meta.filename.clone(),
                file_type: meta.file_type,
                title: meta.title.clone(),
                category: meta.category.clone(),
                tags: meta.tags.clone(),
            },
        });
    }

    index.delete_file(&meta.file_id).await?;
    index.upsert(&points).await?;

    debug!(file_id = %meta.file_id, chunks = points.len(), index = index.name(), "vectors synced");
    Ok(points.len())
}
