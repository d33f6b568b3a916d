//! Relational record store: files, metadata, tags and their lifecycle.
//!
//! [`RecordStore`] is the single writer of `status` and `retry_count`. Every
//! write that changes searchable text also rewrites the file's lexical
//! mirror row inside the same transaction (see [`crate::lexical`]).

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::lexical;
use crate::models::{
    truncate_chars, Category, Classification, ExtractionResult, FileMetadata, FileRecord,
    FileStatus, FileStatusView, FileType, Tag, TagSource,
};

/// Maximum characters of extracted text kept in `file_metadata`.
pub const METADATA_TEXT_CAP: usize = 100_000;

/// Display fields for a file, as shown next to a search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayMetadata {
    pub file_id: String,
    pub filename: String,
    pub file_type: FileType,
    pub title: String,
    pub category: String,
    pub tags: Vec<String>,
}

/// Failure modes of [`RecordStore::insert_file`].
#[derive(Debug, thiserror::Error)]
pub enum InsertError {
    /// Another row already holds this content hash.
    #[error("a file with content hash {0} already exists")]
    DuplicateHash(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Fields supplied when registering a new upload.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub id: String,
    pub filename: String,
    pub storage_path: String,
    pub file_type: FileType,
    pub size_bytes: i64,
    pub mime_type: String,
    pub content_hash: String,
}

#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

const FILE_COLUMNS: &str = "id, filename, storage_path, thumbnail_path, file_type, size_bytes, \
     mime_type, content_hash, status, retry_count, error_message, created_at, updated_at";

fn file_from_row(row: &SqliteRow) -> Result<FileRecord> {
    let file_type: String = row.get("file_type");
    let status: String = row.get("status");
    Ok(FileRecord {
        id: row.get("id"),
        filename: row.get("filename"),
        storage_path: row.get("storage_path"),
        thumbnail_path: row.get("thumbnail_path"),
        file_type: file_type.parse()?,
        size_bytes: row.get("size_bytes"),
        mime_type: row.get("mime_type"),
        content_hash: row.get("content_hash"),
        status: status.parse()?,
        retry_count: row.get("retry_count"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn status_from_row(row: &SqliteRow) -> Result<FileStatusView> {
    let status: String = row.get("status");
    Ok(FileStatusView {
        id: row.get("id"),
        status: status.parse()?,
        retry_count: row.get("retry_count"),
        error_message: row.get("error_message"),
    })
}

fn display_from_row(row: &SqliteRow) -> Result<DisplayMetadata> {
    let file_type: String = row.get("file_type");
    let tags: String = row.get("tags");
    Ok(DisplayMetadata {
        file_id: row.get("id"),
        filename: row.get("filename"),
        file_type: file_type.parse()?,
        title: row.get("title"),
        category: row.get("category"),
        tags: lexical::split_tags(&tags),
    })
}

const DISPLAY_SELECT: &str = r#"
    SELECT f.id, f.filename, f.file_type,
           COALESCE(m.title, f.filename) AS title,
           COALESCE(m.category, 'Other') AS category,
           COALESCE((SELECT group_concat(tag, char(31))
                     FROM (SELECT tag FROM tags WHERE file_id = f.id ORDER BY id)), '') AS tags
    FROM files f
    LEFT JOIN file_metadata m ON m.file_id = f.id
"#;

impl RecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new `pending` row.
    ///
    /// The `content_hash` uniqueness constraint is the final arbiter between
    /// concurrent uploads of the same bytes.
    pub async fn insert_file(&self, new: &NewFile) -> Result<FileRecord, InsertError> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO files (id, filename, storage_path, file_type, size_bytes, mime_type,
                               content_hash, status, retry_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?)
            "#,
        )
        .bind(&new.id)
        .bind(&new.filename)
        .bind(&new.storage_path)
        .bind(new.file_type.as_str())
        .bind(new.size_bytes)
        .bind(&new.mime_type)
        .bind(&new.content_hash)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(InsertError::DuplicateHash(new.content_hash.clone()));
            }
            Err(e) => return Err(InsertError::Db(e)),
        }

        Ok(FileRecord {
            id: new.id.clone(),
            filename: new.filename.clone(),
            storage_path: new.storage_path.clone(),
            thumbnail_path: None,
            file_type: new.file_type,
            size_bytes: new.size_bytes,
            mime_type: new.mime_type.clone(),
            content_hash: Some(new.content_hash.clone()),
            status: FileStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn find_by_hash(&self, content_hash: &str) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {} FROM files WHERE content_hash = ?", FILE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(content_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    pub async fn get_file(&self, id: &str) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {} FROM files WHERE id = ?", FILE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    pub async fn get_status(&self, id: &str) -> Result<Option<FileStatusView>> {
        let row =
            sqlx::query("SELECT id, status, retry_count, error_message FROM files WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(status_from_row).transpose()
    }

    pub async fn get_metadata(&self, id: &str) -> Result<Option<FileMetadata>> {
        let row = sqlx::query(
            r#"
            SELECT file_id, title, summary, category, extracted_text, word_count, language,
                   processed_at
            FROM file_metadata WHERE file_id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let category: String = r.get("category");
            FileMetadata {
                file_id: r.get("file_id"),
                title: r.get("title"),
                summary: r.get("summary"),
                category: Category::parse_lenient(&category),
                extracted_text: r.get("extracted_text"),
                word_count: r.get("word_count"),
                language: r.get("language"),
                processed_at: r.get("processed_at"),
            }
        }))
    }

    pub async fn get_tags(&self, id: &str) -> Result<Vec<Tag>> {
        let rows = sqlx::query("SELECT tag, source FROM tags WHERE file_id = ? ORDER BY id")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let source: String = r.get("source");
                Tag {
                    tag: r.get("tag"),
                    source: if source == "manual" {
                        TagSource::Manual
                    } else {
                        TagSource::Ai
                    },
                }
            })
            .collect())
    }

    pub async fn mark_processing(&self, id: &str) -> Result<()> {
        self.set_status(id, FileStatus::Processing).await
    }

    /// Finish a job: `processing → complete`, or clear an outstanding vector
    /// failure on a file that is already `complete`. Returns `false` when the
    /// file moved elsewhere in the meantime (reanalyzed or deleted).
    pub async fn mark_complete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE files SET status = 'complete', error_message = NULL, updated_at = ?
            WHERE id = ? AND status IN ('processing', 'complete')
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_status(&self, id: &str, status: FileStatus) -> Result<()> {
        sqlx::query("UPDATE files SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Count one failed attempt.
    ///
    /// Moves the file to `error` once `retry_count` reaches `max_retries`,
    /// otherwise back to `pending`. Returns `None` if the file is gone or no
    /// longer belongs to the failed job.
    pub async fn record_failure(
        &self,
        id: &str,
        message: &str,
        max_retries: i64,
    ) -> Result<Option<FileStatusView>> {
        let row = sqlx::query(
            r#"
            UPDATE files
            SET retry_count = retry_count + 1,
                status = CASE WHEN retry_count + 1 >= ? THEN 'error' ELSE 'pending' END,
                error_message = ?,
                updated_at = ?
            WHERE id = ? AND status IN ('processing', 'complete')
            RETURNING id, status, retry_count, error_message
            "#,
        )
        .bind(max_retries)
        .bind(message)
        .bind(Utc::now().timestamp())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(status_from_row).transpose()
    }

    /// Count a failed vector sync on a file whose metadata is committed.
    ///
    /// The file stays `complete` so keyword search keeps finding it; the
    /// failure is carried in `retry_count` and `error_message` until a later
    /// sync clears it.
    pub async fn record_vector_failure(
        &self,
        id: &str,
        message: &str,
    ) -> Result<Option<FileStatusView>> {
        let row = sqlx::query(
            r#"
            UPDATE files
            SET retry_count = retry_count + 1, error_message = ?, updated_at = ?
            WHERE id = ? AND status = 'complete'
            RETURNING id, status, retry_count, error_message
            "#,
        )
        .bind(message)
        .bind(Utc::now().timestamp())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(status_from_row).transpose()
    }

    /// `error → pending` with a fresh retry budget. Returns `false` when the
    /// file does not exist or is not in `error`.
    pub async fn reset_for_retry(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE files
            SET status = 'pending', retry_count = 0, error_message = NULL, updated_at = ?
            WHERE id = ? AND status = 'error'
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop AI metadata and AI tags and return the file to `pending`,
    /// whatever its status. Manual tags survive. Returns `false` if the file
    /// does not exist.
    pub async fn reset_for_reanalyze(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE files
            SET status = 'pending', retry_count = 0, error_message = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM file_metadata WHERE file_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tags WHERE file_id = ? AND source = 'ai'")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        lexical::refresh_row(&mut tx, id).await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Persist one successful classification run atomically: metadata
    /// upsert, AI tag replacement, mirror row rewrite and `complete` status.
    ///
    /// Only a file in `processing` is committed. Returns `false`, writing
    /// nothing, when the file was reanalyzed or deleted while its job ran.
    pub async fn commit_metadata(
        &self,
        file_id: &str,
        extraction: &ExtractionResult,
        classification: &Classification,
    ) -> Result<bool> {
        let now = Utc::now().timestamp();
        let text = truncate_chars(&extraction.content, METADATA_TEXT_CAP);

        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE files SET status = 'complete', error_message = NULL, updated_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(now)
        .bind(file_id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO file_metadata (file_id, title, summary, category, extracted_text,
                                       word_count, language, processed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_id) DO UPDATE SET
                title = excluded.title,
                summary = excluded.summary,
                category = excluded.category,
                extracted_text = excluded.extracted_text,
                word_count = excluded.word_count,
                language = excluded.language,
                processed_at = excluded.processed_at
            "#,
        )
        .bind(file_id)
        .bind(&classification.title)
        .bind(&classification.summary)
        .bind(classification.category.as_str())
        .bind(text)
        .bind(extraction.word_count as i64)
        .bind(&extraction.language)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tags WHERE file_id = ? AND source = 'ai'")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        for tag in &classification.tags {
            sqlx::query("INSERT OR IGNORE INTO tags (file_id, tag, source) VALUES (?, ?, 'ai')")
                .bind(file_id)
                .bind(tag)
                .execute(&mut *tx)
                .await?;
        }

        lexical::refresh_row(&mut tx, file_id).await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Attach a user tag. Returns `false` if the file does not exist.
    pub async fn add_manual_tag(&self, file_id: &str, tag: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM files WHERE id = ?")
            .bind(file_id)
            .fetch_one(&mut *tx)
            .await?;
        if !exists {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("INSERT OR IGNORE INTO tags (file_id, tag, source) VALUES (?, ?, 'manual')")
            .bind(file_id)
            .bind(tag)
            .execute(&mut *tx)
            .await?;
        lexical::refresh_row(&mut tx, file_id).await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Returns `false` if no such manual tag existed.
    pub async fn remove_manual_tag(&self, file_id: &str, tag: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result =
            sqlx::query("DELETE FROM tags WHERE file_id = ? AND tag = ? AND source = 'manual'")
                .bind(file_id)
                .bind(tag)
                .execute(&mut *tx)
                .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        lexical::refresh_row(&mut tx, file_id).await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Remove the file row, its mirror row, and (by cascade) its metadata
    /// and tags. Returns the deleted record so the caller can clean up the
    /// stored artifact and vectors.
    pub async fn delete_file(&self, id: &str) -> Result<Option<FileRecord>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {} FROM files WHERE id = ?", FILE_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *tx).await?;
        let record = match row.as_ref().map(file_from_row).transpose()? {
            Some(r) => r,
            None => {
                tx.rollback().await?;
                return Ok(None);
            }
        };

        lexical::delete_row(&mut tx, id).await?;
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(record))
    }

    /// `processing → pending` for every file an earlier process abandoned.
    pub async fn reset_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE files SET status = 'pending', updated_at = ? WHERE status = 'processing'",
        )
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_retryable_pending(&self, max_retries: i64) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM files WHERE status = 'pending' AND retry_count < ? ORDER BY created_at, id",
        )
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// `complete` files whose last vector sync failed and that still have
    /// retry budget.
    pub async fn list_vector_retries(&self, max_retries: i64) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT id FROM files
            WHERE status = 'complete' AND error_message IS NOT NULL AND retry_count < ?
            ORDER BY created_at, id
            "#,
        )
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn list_complete_for_reindex(&self) -> Result<Vec<String>> {
        let ids =
            sqlx::query_scalar("SELECT id FROM files WHERE status = 'complete' ORDER BY created_at, id")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    /// Display fields plus stored extracted text, used to rebuild vectors
    /// without re-extracting the original file.
    pub async fn reindex_source(&self, id: &str) -> Result<Option<(DisplayMetadata, String)>> {
        let sql = format!(
            "{} WHERE f.id = ?",
            DISPLAY_SELECT.replace(
                "AS tags",
                "AS tags, COALESCE(m.extracted_text, '') AS extracted_text"
            )
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let text: String = r.get("extracted_text");
                Ok(Some((display_from_row(&r)?, text)))
            }
            None => Ok(None),
        }
    }

    /// Display fields for one file regardless of status.
    pub async fn display_one(&self, id: &str) -> Result<Option<DisplayMetadata>> {
        let sql = format!("{} WHERE f.id = ?", DISPLAY_SELECT);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(display_from_row).transpose()
    }

    /// Batch lookup of display fields for `complete` files only.
    ///
    /// Ids that are missing or not `complete` are absent from the result.
    pub async fn display_metadata(&self, ids: &[String]) -> Result<Vec<DisplayMetadata>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "{} WHERE f.status = 'complete' AND f.id IN ({})",
            DISPLAY_SELECT, placeholders
        );

        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.iter().map(display_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate::run_migrations;
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, RecordStore) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("kh.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (tmp, RecordStore::new(pool))
    }

    fn new_file(id: &str, hash: &str) -> NewFile {
        NewFile {
            id: id.to_string(),
            filename: format!("{}.txt", id),
            storage_path: format!("/store/{}.txt", id),
            file_type: FileType::Text,
            size_bytes: 10,
            mime_type: "text/plain".to_string(),
            content_hash: hash.to_string(),
        }
    }

    fn classification(title: &str, tags: &[&str]) -> Classification {
        Classification {
            title: title.to_string(),
            summary: "summary".to_string(),
            category: Category::Research,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    async fn fts_row(store: &RecordStore, id: &str) -> Vec<(String, String)> {
        sqlx::query_as("SELECT title, tags FROM files_fts WHERE file_id = ?")
            .bind(id)
            .fetch_all(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_hash_is_reported() {
        let (_tmp, store) = test_store().await;
        store.insert_file(&new_file("a", "h1")).await.unwrap();
        let err = store.insert_file(&new_file("b", "h1")).await.unwrap_err();
        assert!(matches!(err, InsertError::DuplicateHash(ref h) if h == "h1"));
        assert_eq!(store.find_by_hash("h1").await.unwrap().unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_failures_walk_to_error_then_retry_resets() {
        let (_tmp, store) = test_store().await;
        store.insert_file(&new_file("a", "h1")).await.unwrap();

        for attempt in 1..=3 {
            store.mark_processing("a").await.unwrap();
            let view = store.record_failure("a", "boom", 3).await.unwrap().unwrap();
            assert_eq!(view.retry_count, attempt);
            let expected = if attempt < 3 {
                FileStatus::Pending
            } else {
                FileStatus::Error
            };
            assert_eq!(view.status, expected);
            assert_eq!(view.error_message.as_deref(), Some("boom"));
        }

        assert!(store.reset_for_retry("a").await.unwrap());
        let view = store.get_status("a").await.unwrap().unwrap();
        assert_eq!(view.status, FileStatus::Pending);
        assert_eq!(view.retry_count, 0);
        assert!(view.error_message.is_none());

        // only files in `error` may be retried
        assert!(!store.reset_for_retry("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_replaces_ai_tags_and_keeps_manual() {
        let (_tmp, store) = test_store().await;
        store.insert_file(&new_file("a", "h1")).await.unwrap();
        store.add_manual_tag("a", "keepme").await.unwrap();

        let extraction = ExtractionResult::from_text("alpha beta".to_string(), None);
        store.mark_processing("a").await.unwrap();
        store
            .commit_metadata("a", &extraction, &classification("First", &["old"]))
            .await
            .unwrap();
        store.mark_processing("a").await.unwrap();
        store
            .commit_metadata("a", &extraction, &classification("Second", &["new"]))
            .await
            .unwrap();

        let tags: Vec<(String, TagSource)> = store
            .get_tags("a")
            .await
            .unwrap()
            .into_iter()
            .map(|t| (t.tag, t.source))
            .collect();
        assert_eq!(
            tags,
            vec![
                ("keepme".to_string(), TagSource::Manual),
                ("new".to_string(), TagSource::Ai)
            ]
        );

        let rows = fts_row(&store, "a").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "Second");
        assert_eq!(rows[0].1, "keepme new");

        let status = store.get_status("a").await.unwrap().unwrap();
        assert_eq!(status.status, FileStatus::Complete);
    }

    #[tokio::test]
    async fn test_metadata_text_is_capped() {
        let (_tmp, store) = test_store().await;
        store.insert_file(&new_file("a", "h1")).await.unwrap();

        let long = "x".repeat(METADATA_TEXT_CAP + 500);
        let extraction = ExtractionResult::from_text(long, None);
        store.mark_processing("a").await.unwrap();
        store
            .commit_metadata("a", &extraction, &classification("T", &[]))
            .await
            .unwrap();

        let meta = store.get_metadata("a").await.unwrap().unwrap();
        assert_eq!(meta.extracted_text.len(), METADATA_TEXT_CAP);

        let mirrored: i64 =
            sqlx::query_scalar("SELECT length(content) FROM files_fts WHERE file_id = 'a'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(mirrored, lexical::MIRROR_TEXT_CAP);
    }

    #[tokio::test]
    async fn test_reanalyze_clears_ai_state() {
        let (_tmp, store) = test_store().await;
        store.insert_file(&new_file("a", "h1")).await.unwrap();
        store.add_manual_tag("a", "mine").await.unwrap();
        let extraction = ExtractionResult::from_text("text".to_string(), None);
        store.mark_processing("a").await.unwrap();
        store
            .commit_metadata("a", &extraction, &classification("Title", &["ai1"]))
            .await
            .unwrap();

        assert!(store.reset_for_reanalyze("a").await.unwrap());
        assert!(store.get_metadata("a").await.unwrap().is_none());
        let tags = store.get_tags("a").await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].source, TagSource::Manual);
        let rows = fts_row(&store, "a").await;
        assert_eq!(rows, vec![(String::new(), "mine".to_string())]);
        assert_eq!(
            store.get_status("a").await.unwrap().unwrap().status,
            FileStatus::Pending
        );

        assert!(!store.reset_for_reanalyze("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_display_metadata_only_returns_complete() {
        let (_tmp, store) = test_store().await;
        store.insert_file(&new_file("done", "h1")).await.unwrap();
        store.insert_file(&new_file("waiting", "h2")).await.unwrap();
        let extraction = ExtractionResult::from_text("text".to_string(), None);
        store.mark_processing("done").await.unwrap();
        store
            .commit_metadata("done", &extraction, &classification("Done", &["x"]))
            .await
            .unwrap();

        let found = store
            .display_metadata(&["done".to_string(), "waiting".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].file_id, "done");
        assert_eq!(found[0].title, "Done");
        assert_eq!(found[0].tags, vec!["x"]);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let (_tmp, store) = test_store().await;
        store.insert_file(&new_file("a", "h1")).await.unwrap();
        let extraction = ExtractionResult::from_text("text".to_string(), None);
        store.mark_processing("a").await.unwrap();
        store
            .commit_metadata("a", &extraction, &classification("T", &["t"]))
            .await
            .unwrap();

        let deleted = store.delete_file("a").await.unwrap().unwrap();
        assert_eq!(deleted.id, "a");
        assert!(store.get_file("a").await.unwrap().is_none());
        assert!(store.get_metadata("a").await.unwrap().is_none());
        assert!(store.get_tags("a").await.unwrap().is_empty());
        assert!(fts_row(&store, "a").await.is_empty());
        assert!(store.delete_file("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_interrupted_and_retryable_listing() {
        let (_tmp, store) = test_store().await;
        store.insert_file(&new_file("a", "h1")).await.unwrap();
        store.insert_file(&new_file("b", "h2")).await.unwrap();
        store.insert_file(&new_file("c", "h3")).await.unwrap();
        store.mark_processing("a").await.unwrap();
        for _ in 0..3 {
            store.mark_processing("c").await.unwrap();
            store.record_failure("c", "bad", 3).await.unwrap();
        }

        assert_eq!(store.reset_interrupted().await.unwrap(), 1);
        let mut ids = store.list_retryable_pending(3).await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_commit_skipped_once_file_left_processing() {
        let (_tmp, store) = test_store().await;
        store.insert_file(&new_file("a", "h1")).await.unwrap();
        store.mark_processing("a").await.unwrap();

        // reanalyze lands while the job is still classifying
        assert!(store.reset_for_reanalyze("a").await.unwrap());
        let extraction = ExtractionResult::from_text("stale text".to_string(), None);
        let committed = store
            .commit_metadata("a", &extraction, &classification("Stale", &["old"]))
            .await
            .unwrap();
        assert!(!committed);
        assert!(store.get_metadata("a").await.unwrap().is_none());
        assert!(store.get_tags("a").await.unwrap().is_empty());

        assert!(!store.mark_complete("a").await.unwrap());
        assert!(store.record_failure("a", "late", 3).await.unwrap().is_none());
        let view = store.get_status("a").await.unwrap().unwrap();
        assert_eq!(view.status, FileStatus::Pending);
        assert_eq!(view.retry_count, 0);
    }

    #[tokio::test]
    async fn test_vector_failure_keeps_file_complete() {
        let (_tmp, store) = test_store().await;
        store.insert_file(&new_file("a", "h1")).await.unwrap();
        store.mark_processing("a").await.unwrap();
        let extraction = ExtractionResult::from_text("alpha beta".to_string(), None);
        store
            .commit_metadata("a", &extraction, &classification("T", &[]))
            .await
            .unwrap();

        for attempt in 1..=3 {
            let view = store
                .record_vector_failure("a", "embedder down")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(view.status, FileStatus::Complete);
            assert_eq!(view.retry_count, attempt);
            let expected: Vec<String> = if attempt < 3 { vec!["a".to_string()] } else { vec![] };
            assert_eq!(store.list_vector_retries(3).await.unwrap(), expected);
        }

        assert!(store.mark_complete("a").await.unwrap());
        let view = store.get_status("a").await.unwrap().unwrap();
        assert_eq!(view.status, FileStatus::Complete);
        assert!(view.error_message.is_none());
        assert!(store.list_vector_retries(3).await.unwrap().is_empty());
    }
}
