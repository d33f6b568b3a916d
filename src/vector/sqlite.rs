use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::{ChunkPayload, ScoreScale, VectorHit, VectorIndex, VectorPoint};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};

/// Chunk vectors stored as little-endian BLOBs in the record store database.
///
/// Search loads every vector and ranks by cosine similarity in Rust, which is
/// fine for a personal collection and needs no extension.
pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn ensure_ready(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunk_vectors (
                id TEXT PRIMARY KEY,
                file_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                payload TEXT NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunk_vectors_file ON chunk_vectors(file_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn upsert(&self, points: &[VectorPoint]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for point in points {
            let payload = serde_json::to_string(&point.payload)?;
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (id, file_id, chunk_index, payload, embedding)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    file_id = excluded.file_id,
                    chunk_index = excluded.chunk_index,
                    payload = excluded.payload,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&point.id)
            .bind(&point.payload.file_id)
            .bind(point.payload.chunk_index as i64)
            .bind(payload)
            .bind(vec_to_blob(&point.vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors WHERE file_id = ?")
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<VectorHit>> {
        let rows = sqlx::query("SELECT id, payload, embedding FROM chunk_vectors")
            .fetch_all(&self.pool)
            .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let payload: String = row.get("payload");
            let payload: ChunkPayload = serde_json::from_str(&payload)?;
            hits.push(VectorHit {
                id: row.get("id"),
                score: cosine_similarity(vector, &blob_to_vec(&blob)),
                payload,
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);

        Ok(hits)
    }

    async fn count_file(&self, file_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE file_id = ?")
            .bind(file_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    fn score_scale(&self) -> ScoreScale {
        ScoreScale::SignedUnit
    }
}
