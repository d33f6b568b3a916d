//! Service handle owning every long-lived component.
//!
//! A [`Harness`] is built once per process and shared by reference (the
//! HTTP server wraps it in an `Arc`). Opening one runs migrations, checks
//! the vector index, starts the ingestion scheduler and recovers work a
//! previous process left unfinished.

use anyhow::{bail, Result};
use sqlx::SqlitePool;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::classify::{create_classifier, normalize_tags, Classifier};
use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, Embedder};
use crate::extract::ExtractorRegistry;
use crate::ingest::{self, AddOutcome};
use crate::jobs::{self, RecoveryReport, ReindexReport};
use crate::migrate::run_migrations;
use crate::models::FileStatusView;
use crate::pipeline::MetadataPipeline;
use crate::scheduler::{Scheduler, SchedulerOptions};
use crate::search::{SearchEngine, SearchOptions, SearchResponse};
use crate::store::RecordStore;
use crate::vector::{create_vector_index, VectorIndex};

/// Collaborators the harness is assembled from. Tests inject their own.
pub struct Components {
    pub embedder: Arc<dyn Embedder>,
    pub classifier: Arc<dyn Classifier>,
    pub extractors: Arc<ExtractorRegistry>,
    pub vectors: Option<Arc<dyn VectorIndex>>,
}

impl Components {
    pub fn from_config(config: &Config, pool: &SqlitePool) -> Result<Self> {
        Ok(Self {
            embedder: create_embedder(&config.embedding)?,
            classifier: create_classifier(&config.classifier)?,
            extractors: Arc::new(ExtractorRegistry::with_builtins()),
            vectors: create_vector_index(config, pool)?,
        })
    }
}

pub struct Harness {
    config: Config,
    pool: SqlitePool,
    store: RecordStore,
    embedder: Arc<dyn Embedder>,
    vectors: Option<Arc<dyn VectorIndex>>,
    search: SearchEngine,
    scheduler: Scheduler,
}

impl Harness {
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        let components = Components::from_config(&config, &pool)?;
        Self::with_components(config, pool, components).await
    }

    pub async fn with_components(
        config: Config,
        pool: SqlitePool,
        components: Components,
    ) -> Result<Self> {
        run_migrations(&pool).await?;
        let store = RecordStore::new(pool.clone());

        let vectors = match components.vectors {
            Some(index) => match index.ensure_ready().await {
                Ok(()) => Some(index),
                Err(e) => {
                    warn!(
                        index = index.name(),
                        error = %e,
                        "vector index unavailable, semantic search disabled"
                    );
                    None
                }
            },
            None => None,
        };

        let pipeline = Arc::new(MetadataPipeline::new(
            store.clone(),
            components.extractors,
            components.classifier,
            components.embedder.clone(),
            vectors.clone(),
            config.chunking.clone(),
            config.classifier.max_input_chars,
        ));
        let scheduler = Scheduler::start(
            store.clone(),
            pipeline,
            SchedulerOptions::from_config(&config.ingest),
        )?;

        let search = SearchEngine::new(
            store.clone(),
            components.embedder.clone(),
            vectors.clone(),
            config.retrieval.clone(),
        );

        let harness = Self {
            config,
            pool,
            store,
            embedder: components.embedder,
            vectors,
            search,
            scheduler,
        };
        harness.recover().await?;
        Ok(harness)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn semantic_available(&self) -> bool {
        self.vectors.is_some()
    }

    fn admit(&self, outcome: AddOutcome) -> AddOutcome {
        if !outcome.duplicate {
            self.scheduler.enqueue(&outcome.file.id);
        }
        outcome
    }

    pub async fn add_file(&self, filename: &str, bytes: &[u8]) -> Result<AddOutcome> {
        let outcome = ingest::add_file(&self.store, &self.config.storage, filename, bytes).await?;
        Ok(self.admit(outcome))
    }

    pub async fn add_path(&self, path: &Path) -> Result<AddOutcome> {
        let outcome = ingest::add_path(&self.store, &self.config.storage, path).await?;
        Ok(self.admit(outcome))
    }

    pub async fn add_text(&self, title: &str, text: &str) -> Result<AddOutcome> {
        let outcome = ingest::add_text(&self.store, &self.config.storage, title, text).await?;
        Ok(self.admit(outcome))
    }

    pub async fn status(&self, id: &str) -> Result<Option<FileStatusView>> {
        self.store.get_status(id).await
    }

    /// Give a file in `error` a fresh retry budget and queue it. Returns
    /// `false` for any other status or an unknown id.
    pub async fn retry(&self, id: &str) -> Result<bool> {
        if !self.store.reset_for_retry(id).await? {
            return Ok(false);
        }
        self.scheduler.enqueue(id);
        info!(file_id = %id, "retry requested");
        Ok(true)
    }

    /// Drop AI metadata and tags and classify again, whatever the status.
    /// Returns `false` for an unknown id.
    pub async fn reanalyze(&self, id: &str) -> Result<bool> {
        if !self.store.reset_for_reanalyze(id).await? {
            return Ok(false);
        }
        if !self.scheduler.enqueue(id) {
            debug!(file_id = %id, "job in flight, reanalysis runs after it");
        }
        info!(file_id = %id, "reanalyze requested");
        Ok(true)
    }

    /// Remove a file everywhere: relational rows and lexical mirror first,
    /// then its vectors, then the stored artifact. Cleanup after the
    /// relational delete is logged, not returned.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let Some(record) = self.store.delete_file(id).await? else {
            return Ok(false);
        };

        if let Some(index) = &self.vectors {
            if let Err(e) = index.delete_file(id).await {
                warn!(file_id = %id, error = %e, "failed to delete vectors");
            }
        }
        if let Err(e) = tokio::fs::remove_file(&record.storage_path).await {
            warn!(file_id = %id, path = %record.storage_path, error = %e, "failed to remove stored file");
        }

        info!(file_id = %id, filename = %record.filename, "file deleted");
        Ok(true)
    }

    /// Attach a manual tag, normalized like classifier tags. Returns `false`
    /// for an unknown id.
    pub async fn add_tag(&self, id: &str, tag: &str) -> Result<bool> {
        let Some(tag) = normalize_tags([tag.to_string()]).into_iter().next() else {
            bail!("tag must not be empty");
        };
        self.store.add_manual_tag(id, &tag).await
    }

    pub async fn remove_tag(&self, id: &str, tag: &str) -> Result<bool> {
        let tag = tag.trim().to_lowercase();
        self.store.remove_manual_tag(id, &tag).await
    }

    pub async fn search(&self, query: &str, opts: &SearchOptions) -> Result<SearchResponse> {
        self.search.search(query, opts).await
    }

    pub async fn search_until<F>(
        &self,
        query: &str,
        opts: &SearchOptions,
        cancel: F,
    ) -> Result<SearchResponse>
    where
        F: Future<Output = ()>,
    {
        self.search.search_until(query, opts, cancel).await
    }

    pub async fn reindex(&self) -> Result<ReindexReport> {
        let Some(index) = &self.vectors else {
            bail!("vector index unavailable: embeddings disabled or index unreachable");
        };
        jobs::reindex(
            &self.store,
            index.as_ref(),
            self.embedder.as_ref(),
            &self.config.chunking,
        )
        .await
    }

    pub async fn recover(&self) -> Result<RecoveryReport> {
        jobs::recover(&self.store, &self.scheduler, self.config.ingest.max_retries).await
    }

    /// Resolve once no file is queued or processing.
    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await
    }

    /// Drain the queue, stop the workers and close the pool.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.pool.close().await;
    }

    /// Close without processing the backlog. Queued files stay `pending`
    /// and are recovered the next time a harness opens.
    pub async fn close(&self) {
        self.scheduler.abort();
        self.pool.close().await;
    }
}
