//! Per-file metadata pipeline: extract, classify, commit, then index vectors.
//!
//! The relational commit (metadata, AI tags, lexical mirror, `complete`)
//! is one transaction and always happens before the vector sync. A failure
//! after the commit is returned as [`VectorSyncError`]: the file stays
//! `complete` and keyword-searchable while the scheduler counts the failed
//! sync against its retry budget. A `complete` file handed back to the
//! pipeline only has its vectors rebuilt from the stored text.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::chunk::chunk_words;
use crate::classify::{classify_or_default, Classifier};
use crate::config::ChunkingConfig;
use crate::embedding::Embedder;
use crate::extract::ExtractorRegistry;
use crate::index_sync::sync_file_vectors;
use crate::models::{truncate_chars, FileRecord, FileStatus};
use crate::scheduler::FileProcessor;
use crate::store::{RecordStore, METADATA_TEXT_CAP};
use crate::vector::VectorIndex;

pub struct MetadataPipeline {
    store: RecordStore,
    extractors: Arc<ExtractorRegistry>,
    classifier: Arc<dyn Classifier>,
    embedder: Arc<dyn Embedder>,
    vectors: Option<Arc<dyn VectorIndex>>,
    chunking: ChunkingConfig,
    max_classify_chars: usize,
}

impl MetadataPipeline {
    pub fn new(
        store: RecordStore,
        extractors: Arc<ExtractorRegistry>,
        classifier: Arc<dyn Classifier>,
        embedder: Arc<dyn Embedder>,
        vectors: Option<Arc<dyn VectorIndex>>,
        chunking: ChunkingConfig,
        max_classify_chars: usize,
    ) -> Self {
        Self {
            store,
            extractors,
            classifier,
            embedder,
            vectors,
            chunking,
            max_classify_chars,
        }
    }
}

/// Chunk the same capped text that is stored as metadata, so reindexing
/// from stored text reproduces the pipeline's chunk ids.
pub fn chunks_for(text: &str, chunking: &ChunkingConfig) -> Vec<String> {
    chunk_words(
        truncate_chars(text, METADATA_TEXT_CAP),
        chunking.window_tokens,
        chunking.overlap_tokens,
        chunking.min_tokens,
    )
}

/// A failure after metadata was committed. Only the file's vectors are out
/// of date.
#[derive(Debug, thiserror::Error)]
#[error("vector sync: {0:#}")]
pub struct VectorSyncError(pub anyhow::Error);

impl MetadataPipeline {
    /// Rebuild the file's vectors from its stored text.
    async fn sync_vectors(&self, file_id: &str) -> Result<()> {
        let Some(index) = &self.vectors else {
            return Ok(());
        };

        let (meta, text) = self
            .store
            .reindex_source(file_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("file {} removed during processing", file_id))?;
        let chunks = chunks_for(&text, &self.chunking);

        sync_file_vectors(index.as_ref(), self.embedder.as_ref(), &meta, &chunks).await?;
        Ok(())
    }
}

#[async_trait]
impl FileProcessor for MetadataPipeline {
    async fn process(&self, file: &FileRecord) -> Result<()> {
        if file.status == FileStatus::Complete {
            self.sync_vectors(&file.id).await.map_err(VectorSyncError)?;
            return Ok(());
        }

        let extraction = self.extractors.dispatch(file).await;

        let classify_input = if extraction.content.trim().is_empty() {
            file.filename.as_str()
        } else {
            extraction.content.as_str()
        };
        let classification = classify_or_default(
            self.classifier.as_ref(),
            &file.filename,
            classify_input,
            self.max_classify_chars,
        )
        .await;

        let committed = self
            .store
            .commit_metadata(&file.id, &extraction, &classification)
            .await
            .context("committing metadata")?;
        if !committed {
            debug!(file_id = %file.id, "file left processing before commit, result dropped");
            return Ok(());
        }

        debug!(
            file_id = %file.id,
            words = extraction.word_count,
            category = %classification.category,
            tags = classification.tags.len(),
            "metadata committed"
        );

        self.sync_vectors(&file.id).await.map_err(VectorSyncError)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::embedding::DisabledEmbedder;
    use crate::migrate::run_migrations;
    use crate::models::{Category, Classification, FileStatus, FileType};
    use crate::store::NewFile;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Classifier for Recording {
        async fn classify(&self, filename: &str, content: &str) -> Result<Classification> {
            self.seen.lock().unwrap().push(content.to_string());
            Ok(Classification {
                title: format!("About {}", filename),
                summary: String::new(),
                category: Category::Reference,
                tags: vec!["photo".to_string()],
            })
        }
    }

    #[tokio::test]
    async fn test_empty_extraction_classifies_on_filename() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("p.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store = RecordStore::new(pool);

        let image = tmp.path().join("beach.jpg");
        std::fs::write(&image, [0u8; 4]).unwrap();
        let file = store
            .insert_file(&NewFile {
                id: "img".to_string(),
                filename: "beach.jpg".to_string(),
                storage_path: image.to_string_lossy().into_owned(),
                file_type: FileType::Image,
                size_bytes: 4,
                mime_type: "image/jpeg".to_string(),
                content_hash: "h".to_string(),
            })
            .await
            .unwrap();

        let classifier = Arc::new(Recording::default());
        let pipeline = MetadataPipeline::new(
            store.clone(),
            Arc::new(ExtractorRegistry::with_builtins()),
            classifier.clone(),
            Arc::new(DisabledEmbedder),
            None,
            ChunkingConfig::default(),
            8000,
        );

        store.mark_processing("img").await.unwrap();
        pipeline.process(&file).await.unwrap();

        assert_eq!(*classifier.seen.lock().unwrap(), vec!["beach.jpg".to_string()]);
        let meta = store.get_metadata("img").await.unwrap().unwrap();
        assert_eq!(meta.title, "About beach.jpg");
        assert_eq!(meta.extracted_text, "");
        assert_eq!(
            store.get_status("img").await.unwrap().unwrap().status,
            FileStatus::Complete
        );
    }
}
