//! Maintenance jobs: startup recovery and full vector reindex.

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ChunkingConfig;
use crate::embedding::Embedder;
use crate::index_sync::sync_file_vectors;
use crate::pipeline::chunks_for;
use crate::scheduler::Scheduler;
use crate::store::RecordStore;
use crate::vector::VectorIndex;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    /// Files found in `processing` and put back to `pending`.
    pub reset: u64,
    /// Files handed to the scheduler.
    pub enqueued: usize,
}

/// Put abandoned `processing` files back to `pending`, then enqueue every
/// pending file that still has retry budget, along with `complete` files
/// whose vector sync failed.
pub async fn recover(
    store: &RecordStore,
    scheduler: &Scheduler,
    max_retries: i64,
) -> Result<RecoveryReport> {
    let reset = store.reset_interrupted().await?;
    let mut ids = store.list_retryable_pending(max_retries).await?;
    ids.extend(store.list_vector_retries(max_retries).await?);

    let enqueued = ids.iter().filter(|id| scheduler.enqueue(id)).count();

    if reset > 0 || enqueued > 0 {
        info!(reset, enqueued, "recovered unfinished ingestion");
    }
    Ok(RecoveryReport { reset, enqueued })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReindexReport {
    pub files_total: usize,
    pub files_indexed: usize,
    /// Files with no stored text, or deleted while the run was in progress.
    pub files_skipped: usize,
    pub files_failed: usize,
    pub chunks_indexed: usize,
}

/// Rebuild vectors for every `complete` file from its stored text.
///
/// Nothing is re-extracted or re-classified. Per-file failures are counted
/// and logged; the run continues.
pub async fn reindex(
    store: &RecordStore,
    index: &dyn VectorIndex,
    embedder: &dyn Embedder,
    chunking: &ChunkingConfig,
) -> Result<ReindexReport> {
    let ids = store.list_complete_for_reindex().await?;
    let mut report = ReindexReport {
        files_total: ids.len(),
        ..Default::default()
    };

    for id in &ids {
        let Some((meta, text)) = store.reindex_source(id).await? else {
            report.files_skipped += 1;
            continue;
        };

        if text.trim().is_empty() {
            if let Err(e) = index.delete_file(id).await {
                warn!(file_id = %id, error = %e, "failed to drop stale vectors");
            }
            report.files_skipped += 1;
            continue;
        }

        let chunks = chunks_for(&text, chunking);
        match sync_file_vectors(index, embedder, &meta, &chunks).await {
            Ok(n) => {
                report.files_indexed += 1;
                report.chunks_indexed += n;
                if let Err(e) = store.mark_complete(id).await {
                    warn!(file_id = %id, error = %e, "could not clear vector failure");
                }
            }
            Err(e) => {
                warn!(file_id = %id, error = %e, "reindex failed for file");
                report.files_failed += 1;
            }
        }
    }

    info!(
        files = report.files_total,
        indexed = report.files_indexed,
        skipped = report.files_skipped,
        failed = report.files_failed,
        chunks = report.chunks_indexed,
        index = index.name(),
        "reindex finished"
    );
    Ok(report)
}
