use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{ChunkPayload, ScoreScale, VectorHit, VectorIndex, VectorPoint};

/// Qdrant collection accessed over its REST API.
///
/// Points carry the [`ChunkPayload`] as their payload; `file_id` gets a
/// keyword payload index so per-file deletes and counts stay cheap.
pub struct QdrantIndex {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    dims: usize,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    result: T,
}

#[derive(Deserialize)]
struct ScoredPoint {
    id: serde_json::Value,
    score: f32,
    payload: Option<ChunkPayload>,
}

#[derive(Deserialize)]
struct CountResult {
    count: usize,
}

impl QdrantIndex {
    pub fn new(url: &str, collection: &str, dims: usize, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            dims,
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }

    fn file_filter(file_id: &str) -> serde_json::Value {
        json!({
            "must": [
                { "key": "file_id", "match": { "value": file_id } }
            ]
        })
    }

    fn point_body(point: &VectorPoint) -> serde_json::Value {
        json!({
            "id": point.id,
            "vector": point.vector,
            "payload": point.payload,
        })
    }

    /// Points stored without a payload are not ours and are skipped.
    fn into_hit(point: ScoredPoint) -> Option<VectorHit> {
        let payload = point.payload?;
        let id = match point.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Some(VectorHit {
            id,
            score: point.score,
            payload,
        })
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        bail!("Qdrant {} failed ({}): {}", what, status, body)
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn name(&self) -> &str {
        "qdrant"
    }

    async fn ensure_ready(&self) -> Result<()> {
        let response = self
            .client
            .get(self.collection_url())
            .send()
            .await
            .with_context(|| format!("Qdrant not reachable at {}", self.base_url))?;

        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != reqwest::StatusCode::NOT_FOUND {
            Self::check(response, "collection lookup").await?;
            return Ok(());
        }

        let response = self
            .client
            .put(self.collection_url())
            .json(&json!({
                "vectors": { "size": self.dims, "distance": "Cosine" }
            }))
            .send()
            .await?;
        Self::check(response, "collection create").await?;

        let response = self
            .client
            .put(format!("{}/index?wait=true", self.collection_url()))
            .json(&json!({ "field_name": "file_id", "field_schema": "keyword" }))
            .send()
            .await?;
        Self::check(response, "payload index create").await?;

        tracing::info!(collection = %self.collection, dims = self.dims, "created Qdrant collection");
        Ok(())
    }

    async fn upsert(&self, points: &[VectorPoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let body: Vec<serde_json::Value> = points.iter().map(Self::point_body).collect();

        let response = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url()))
            .json(&json!({ "points": body }))
            .send()
            .await?;
        Self::check(response, "upsert").await?;
        Ok(())
    }

    async fn delete_file(&self, file_id: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/points/delete?wait=true", self.collection_url()))
            .json(&json!({ "filter": Self::file_filter(file_id) }))
            .send()
            .await?;
        Self::check(response, "delete").await?;
        Ok(())
    }

    async fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<VectorHit>> {
        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url()))
            .json(&json!({
                "vector": vector,
                "limit": limit,
                "with_payload": true,
            }))
            .send()
            .await?;
        let response = Self::check(response, "search").await?;
        let parsed: ApiResponse<Vec<ScoredPoint>> = response.json().await?;

        Ok(parsed.result.into_iter().filter_map(Self::into_hit).collect())
    }

    async fn count_file(&self, file_id: &str) -> Result<usize> {
        let response = self
            .client
            .post(format!("{}/points/count", self.collection_url()))
            .json(&json!({ "filter": Self::file_filter(file_id), "exact": true }))
            .send()
            .await?;
        let response = Self::check(response, "count").await?;
        let parsed: ApiResponse<CountResult> = response.json().await?;
        Ok(parsed.result.count)
    }

    fn score_scale(&self) -> ScoreScale {
        ScoreScale::SignedUnit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_url_trims_slash() {
        let index = QdrantIndex::new("http://127.0.0.1:6333/", "file_chunks", 8, 5).unwrap();
        assert_eq!(
            index.collection_url(),
            "http://127.0.0.1:6333/collections/file_chunks"
        );
    }

    #[test]
    fn test_search_response_parses() {
        let raw = r#"{
            "result": [
                {"id": "3f0c", "version": 1, "score": 0.83, "payload": {
                    "file_id": "f1", "chunk_index": 2, "text": "hello",
                    "filename": "a.txt", "file_type": "text", "title": "A",
                    "category": "Work", "tags": ["x"]
                }},
                {"id": 7, "version": 1, "score": 0.1, "payload": null}
            ],
            "status": "ok",
            "time": 0.001
        }"#;
        let parsed: ApiResponse<Vec<ScoredPoint>> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.result.len(), 2);
        let first = parsed.result[0].payload.as_ref().unwrap();
        assert_eq!(first.chunk_index, 2);
        assert_eq!(first.file_type, crate::models::FileType::Text);
        assert!(parsed.result[1].payload.is_none());
    }

    fn payload() -> ChunkPayload {
        ChunkPayload {
            file_id: "f1".to_string(),
            chunk_index: 0,
            text: "quokka colonies".to_string(),
            filename: "b.txt".to_string(),
            file_type: crate::models::FileType::Text,
            title: "Survey".to_string(),
            category: "Research".to_string(),
            tags: vec!["fixture".to_string()],
        }
    }

    #[test]
    fn test_file_filter_matches_payload_key() {
        let filter = QdrantIndex::file_filter("f1");
        assert_eq!(
            filter,
            json!({ "must": [ { "key": "file_id", "match": { "value": "f1" } } ] })
        );
    }

    #[test]
    fn test_point_body_carries_payload() {
        let point = VectorPoint {
            id: "3f0c".to_string(),
            vector: vec![0.5, -0.5],
            payload: payload(),
        };
        let body = QdrantIndex::point_body(&point);
        assert_eq!(body["id"], "3f0c");
        assert_eq!(body["vector"], json!([0.5, -0.5]));
        assert_eq!(body["payload"]["file_id"], "f1");
        assert_eq!(body["payload"]["file_type"], "text");
        assert_eq!(body["payload"]["tags"], json!(["fixture"]));
    }

    #[test]
    fn test_scored_points_become_hits() {
        let raw = json!([
            { "id": "3f0c", "score": 0.83, "payload": serde_json::to_value(payload()).unwrap() },
            { "id": 7, "score": 0.5, "payload": serde_json::to_value(payload()).unwrap() },
            { "id": 8, "score": 0.1, "payload": null }
        ]);
        let points: Vec<ScoredPoint> = serde_json::from_value(raw).unwrap();
        let hits: Vec<VectorHit> = points.into_iter().filter_map(QdrantIndex::into_hit).collect();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "3f0c");
        assert!((hits[0].score - 0.83).abs() < 1e-6);
        assert_eq!(hits[1].id, "7");
        assert_eq!(hits[1].payload.text, "quokka colonies");
    }

    #[test]
    fn test_count_response_parses() {
        let raw = r#"{"result": {"count": 4}, "status": "ok", "time": 0.0}"#;
        let parsed: ApiResponse<CountResult> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.result.count, 4);
    }
}
