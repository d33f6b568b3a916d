//! Hybrid retrieval: keyword and semantic legs fused into one ranking.
//!
//! # Algorithm
//!
//! 1. Keyword leg: FTS5 prefix-AND query over `complete` files, bm25 rank
//!    mapped to `[0, 1]` (see [`crate::lexical`]).
//! 2. Semantic leg, concurrently: embed the query and ask the vector index
//!    for `top_n` chunk hits; raw similarity is normalized per the index's
//!    [`ScoreScale`](crate::vector::ScoreScale).
//! 3. Chunk hits collapse per file: the best chunk's score and text win.
//! 4. Files only found semantically get display metadata from one batch
//!    query, which also drops files that are not `complete`.
//! 5. Type/category filters are applied after fusion.
//! 6. `hybrid = semantic_weight * semantic + keyword_weight * keyword`,
//!    stable sort descending, truncate to `top_n`.
//!
//! When the semantic leg is disabled, unavailable or fails, the keyword
//! results are returned as they are, with `hybrid_score` equal to the
//! keyword score.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::lexical::{keyword_search, LexicalFilters, LexicalHit};
use crate::models::FileType;
use crate::store::{DisplayMetadata, RecordStore};
use crate::vector::{VectorHit, VectorIndex};

/// Returned by [`SearchEngine::search_until`] when the caller gave up first.
#[derive(Debug, thiserror::Error)]
#[error("search cancelled")]
pub struct SearchCancelled;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub file_type: Option<FileType>,
    pub category: Option<String>,
    pub semantic: bool,
    pub top_n: Option<usize>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            file_type: None,
            category: None,
            semantic: true,
            top_n: None,
        }
    }
}

impl SearchOptions {
    fn matches(&self, hit: &SearchHit) -> bool {
        if let Some(ft) = self.file_type {
            if hit.file_type != ft {
                return false;
            }
        }
        if let Some(cat) = &self.category {
            if !hit.category.eq_ignore_ascii_case(cat) {
                return false;
            }
        }
        true
    }
}

/// A file in a result list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub file_id: String,
    pub filename: String,
    pub file_type: FileType,
    pub title: String,
    pub category: String,
    pub tags: Vec<String>,
    pub keyword_score: Option<f64>,
    pub semantic_score: Option<f64>,
    pub hybrid_score: f64,
    /// FTS5 snippet of the matching content.
    pub snippet: Option<String>,
    /// Text of the best-scoring chunk.
    pub semantic_snippet: Option<String>,
}

impl SearchHit {
    fn from_meta(meta: DisplayMetadata) -> Self {
        Self {
            file_id: meta.file_id,
            filename: meta.filename,
            file_type: meta.file_type,
            title: meta.title,
            category: meta.category,
            tags: meta.tags,
            keyword_score: None,
            semantic_score: None,
            hybrid_score: 0.0,
            snippet: None,
            semantic_snippet: None,
        }
    }

    fn from_lexical(hit: LexicalHit) -> Self {
        let mut out = Self::from_meta(hit.file);
        out.keyword_score = Some(hit.score);
        out.hybrid_score = hit.score;
        out.snippet = Some(hit.snippet).filter(|s| !s.is_empty());
        out
    }
}

/// All three lists, so a caller can show why a result matched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResponse {
    pub keyword_results: Vec<SearchHit>,
    pub semantic_results: Vec<SearchHit>,
    pub results: Vec<SearchHit>,
    /// `false` when the semantic leg was requested but not used.
    pub semantic_used: bool,
}

pub struct SearchEngine {
    store: RecordStore,
    embedder: Arc<dyn Embedder>,
    vectors: Option<Arc<dyn VectorIndex>>,
    retrieval: RetrievalConfig,
}

/// Best chunk per file, in first-seen (best-first) order.
struct FileSimilarity {
    file_id: String,
    score: f64,
    text: String,
}

impl SearchEngine {
    pub fn new(
        store: RecordStore,
        embedder: Arc<dyn Embedder>,
        vectors: Option<Arc<dyn VectorIndex>>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            vectors,
            retrieval,
        }
    }

    pub fn semantic_available(&self) -> bool {
        self.vectors.is_some()
    }

    fn effective_top_n(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.retrieval.default_top_n)
            .clamp(1, self.retrieval.max_top_n.max(1))
    }

    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<SearchResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(SearchResponse::default());
        }
        let top_n = self.effective_top_n(opts.top_n);

        let filters = LexicalFilters {
            file_type: opts.file_type.map(|t| t.as_str()),
            category: opts.category.as_deref(),
        };
        let lexical_limit = self.retrieval.max_top_n.max(top_n) as i64;

        let semantic_index = if opts.semantic {
            self.vectors.as_ref()
        } else {
            None
        };

        let (lexical, semantic) = tokio::join!(
            keyword_search(self.store.pool(), query, &filters, lexical_limit),
            async {
                match semantic_index {
                    Some(index) => Some(self.semantic_leg(index.as_ref(), query, top_n).await),
                    None => None,
                }
            }
        );

        let keyword_results: Vec<SearchHit> =
            lexical?.into_iter().map(SearchHit::from_lexical).collect();

        let chunk_hits = match semantic {
            Some(Ok(hits)) => hits,
            Some(Err(e)) => {
                warn!(error = %e, "semantic search failed, using keyword results only");
                return Ok(keyword_only(keyword_results, top_n));
            }
            None => return Ok(keyword_only(keyword_results, top_n)),
        };

        let scale = match semantic_index {
            Some(index) => index.score_scale(),
            None => return Ok(keyword_only(keyword_results, top_n)),
        };
        let similarities = collapse_by_file(&chunk_hits, |raw| scale.normalize(raw));

        let ids: Vec<String> = similarities.iter().map(|s| s.file_id.clone()).collect();
        let metadata: HashMap<String, DisplayMetadata> = self
            .store
            .display_metadata(&ids)
            .await?
            .into_iter()
            .map(|m| (m.file_id.clone(), m))
            .collect();

        let semantic_results: Vec<SearchHit> = similarities
            .into_iter()
            .filter_map(|s| {
                let meta = metadata.get(&s.file_id)?.clone();
                let mut hit = SearchHit::from_meta(meta);
                hit.semantic_score = Some(s.score);
                hit.hybrid_score = s.score;
                hit.semantic_snippet = Some(s.text);
                Some(hit)
            })
            .filter(|hit| opts.matches(hit))
            .collect();

        let mut results = fuse(
            &keyword_results,
            &semantic_results,
            self.retrieval.semantic_weight,
            self.retrieval.keyword_weight,
        );
        results.retain(|hit| opts.matches(hit));
        results.truncate(top_n);

        debug!(
            query,
            keyword = keyword_results.len(),
            semantic = semantic_results.len(),
            fused = results.len(),
            "hybrid search"
        );

        Ok(SearchResponse {
            keyword_results: truncated(keyword_results, top_n),
            semantic_results: truncated(semantic_results, top_n),
            results,
            semantic_used: true,
        })
    }

    /// [`search`](Self::search), abandoned as soon as `cancel` resolves.
    ///
    /// In-flight embedding, index and database calls are dropped, not
    /// awaited; retrieval has no side effects to compensate.
    pub async fn search_until<F>(
        &self,
        query: &str,
        opts: &SearchOptions,
        cancel: F,
    ) -> Result<SearchResponse>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => {
                debug!("search cancelled by caller");
                Err(SearchCancelled.into())
            }
            result = self.search(query, opts) => result,
        }
    }

    async fn semantic_leg(
        &self,
        index: &dyn VectorIndex,
        query: &str,
        top_n: usize,
    ) -> Result<Vec<VectorHit>> {
        let vector = self.embedder.embed(query).await?;
        index.search(&vector, top_n).await
    }
}

fn truncated(mut hits: Vec<SearchHit>, n: usize) -> Vec<SearchHit> {
    hits.truncate(n);
    hits
}

fn keyword_only(keyword_results: Vec<SearchHit>, top_n: usize) -> SearchResponse {
    let keyword_results = truncated(keyword_results, top_n);
    SearchResponse {
        results: keyword_results.clone(),
        keyword_results,
        semantic_results: Vec::new(),
        semantic_used: false,
    }
}

/// Keep the maximum normalized score per file and that chunk's text.
fn collapse_by_file(hits: &[VectorHit], normalize: impl Fn(f32) -> f64) -> Vec<FileSimilarity> {
    let mut out: Vec<FileSimilarity> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for hit in hits {
        let score = normalize(hit.score);
        match index.get(&hit.payload.file_id) {
            Some(&i) => {
                if score > out[i].score {
                    out[i].score = score;
                    out[i].text = hit.payload.text.clone();
                }
            }
            None => {
                index.insert(hit.payload.file_id.clone(), out.len());
                out.push(FileSimilarity {
                    file_id: hit.payload.file_id.clone(),
                    score,
                    text: hit.payload.text.clone(),
                });
            }
        }
    }

    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    out
}

/// Merge both legs by file id and rank by the weighted sum. Keyword order
/// comes first, then semantic-only files, and the sort is stable.
fn fuse(
    keyword: &[SearchHit],
    semantic: &[SearchHit],
    semantic_weight: f64,
    keyword_weight: f64,
) -> Vec<SearchHit> {
    let mut merged: Vec<SearchHit> = keyword.to_vec();
    let mut position: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .map(|(i, h)| (h.file_id.clone(), i))
        .collect();

    for hit in semantic {
        match position.get(&hit.file_id) {
            Some(&i) => {
                merged[i].semantic_score = hit.semantic_score;
                merged[i].semantic_snippet = hit.semantic_snippet.clone();
            }
            None => {
                position.insert(hit.file_id.clone(), merged.len());
                let mut only_semantic = hit.clone();
                only_semantic.keyword_score = None;
                merged.push(only_semantic);
            }
        }
    }

    for hit in &mut merged {
        hit.hybrid_score = semantic_weight * hit.semantic_score.unwrap_or(0.0)
            + keyword_weight * hit.keyword_score.unwrap_or(0.0);
    }

    merged.sort_by(|a, b| {
        b.hybrid_score
            .partial_cmp(&a.hybrid_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::ChunkPayload;

    fn hit(id: &str, kw: Option<f64>, sem: Option<f64>) -> SearchHit {
        SearchHit {
            file_id: id.to_string(),
            filename: format!("{}.txt", id),
            file_type: FileType::Text,
            title: id.to_uppercase(),
            category: "Work".to_string(),
            tags: vec![],
            keyword_score: kw,
            semantic_score: sem,
            hybrid_score: kw.or(sem).unwrap_or(0.0),
            snippet: None,
            semantic_snippet: sem.map(|_| "chunk".to_string()),
        }
    }

    fn chunk_hit(file_id: &str, text: &str, score: f32) -> VectorHit {
        VectorHit {
            id: format!("{}-{}", file_id, text),
            score,
            payload: ChunkPayload {
                file_id: file_id.to_string(),
                chunk_index: 0,
                text: text.to_string(),
                filename: String::new(),
                file_type: FileType::Text,
                title: String::new(),
                category: String::new(),
                tags: vec![],
            },
        }
    }

    #[test]
    fn test_fusion_weights() {
        let fused = fuse(
            &[hit("a", Some(0.8), None)],
            &[hit("a", None, Some(0.5))],
            0.6,
            0.4,
        );
        assert_eq!(fused.len(), 1);
        assert!((fused[0].hybrid_score - 0.62).abs() < 1e-9);
        assert_eq!(fused[0].keyword_score, Some(0.8));
        assert_eq!(fused[0].semantic_score, Some(0.5));
        assert_eq!(fused[0].semantic_snippet.as_deref(), Some("chunk"));
    }

    #[test]
    fn test_fusion_single_leg_files_and_stable_ties() {
        let fused = fuse(
            &[hit("k1", Some(0.6), None), hit("k2", Some(0.6), None)],
            &[hit("s1", None, Some(0.4))],
            0.6,
            0.4,
        );
        let order: Vec<&str> = fused.iter().map(|h| h.file_id.as_str()).collect();
        // 0.24 each, keyword order kept for the tie
        assert_eq!(order, vec!["k1", "k2", "s1"]);
        assert!((fused[2].hybrid_score - 0.24).abs() < 1e-9);
        assert_eq!(fused[2].keyword_score, None);
    }

    #[test]
    fn test_collapse_keeps_max_chunk() {
        let hits = vec![
            chunk_hit("a", "weak", 0.2),
            chunk_hit("b", "other", 0.5),
            chunk_hit("a", "strong", 0.9),
        ];
        let collapsed = collapse_by_file(&hits, |s| s as f64);
        assert_eq!(collapsed.len(), 2);
        assert_eq!(collapsed[0].file_id, "a");
        assert_eq!(collapsed[0].text, "strong");
        assert!((collapsed[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_filter_matching() {
        let opts = SearchOptions {
            file_type: Some(FileType::Text),
            category: Some("work".to_string()),
            ..Default::default()
        };
        assert!(opts.matches(&hit("a", Some(0.1), None)));

        let mut pdf = hit("b", Some(0.1), None);
        pdf.file_type = FileType::Pdf;
        assert!(!opts.matches(&pdf));
    }
}
