//! Upload front door: stage, fingerprint, deduplicate, store, register.
//!
//! Two uploads of the same bytes resolve to one record. The hash lookup
//! handles the common case cheaply; the `content_hash` uniqueness
//! constraint settles concurrent uploads, and the loser removes its own
//! stored copy and returns the winner as a duplicate.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::fingerprint::{fingerprint_file, fingerprint_text};
use crate::models::{guess_mime, FileRecord, FileType};
use crate::store::{InsertError, NewFile, RecordStore};

/// Result of an upload. `duplicate` is set when the content already existed,
/// in which case `file` is the existing record.
#[derive(Debug, Clone, Serialize)]
pub struct AddOutcome {
    pub file: FileRecord,
    pub duplicate: bool,
}

impl AddOutcome {
    fn fresh(file: FileRecord) -> Self {
        Self {
            file,
            duplicate: false,
        }
    }

    fn duplicate(file: FileRecord) -> Self {
        Self {
            file,
            duplicate: true,
        }
    }
}

/// Keep only the final path component of a client-supplied name.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or("").trim();
    if base.is_empty() || base == "." || base == ".." {
        "upload".to_string()
    } else {
        base.to_string()
    }
}

fn stored_path(storage: &StorageConfig, id: &str, filename: &str) -> PathBuf {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext {
        Some(ext) => storage.files_dir().join(format!("{}.{}", id, ext)),
        None => storage.files_dir().join(id),
    }
}

async fn ensure_dirs(storage: &StorageConfig) -> Result<()> {
    tokio::fs::create_dir_all(storage.files_dir()).await?;
    tokio::fs::create_dir_all(storage.tmp_dir()).await?;
    Ok(())
}

/// Store raw upload bytes under `filename`.
pub async fn add_file(
    store: &RecordStore,
    storage: &StorageConfig,
    filename: &str,
    bytes: &[u8],
) -> Result<AddOutcome> {
    ensure_dirs(storage).await?;
    let staged = storage.tmp_dir().join(Uuid::new_v4().to_string());
    tokio::fs::write(&staged, bytes)
        .await
        .with_context(|| format!("staging {}", staged.display()))?;

    register_staged(store, storage, &sanitize_filename(filename), staged).await
}

/// Copy a file from the local filesystem into the store.
pub async fn add_path(store: &RecordStore, storage: &StorageConfig, path: &Path) -> Result<AddOutcome> {
    ensure_dirs(storage).await?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(sanitize_filename)
        .unwrap_or_else(|| "upload".to_string());

    let staged = storage.tmp_dir().join(Uuid::new_v4().to_string());
    tokio::fs::copy(path, &staged)
        .await
        .with_context(|| format!("copying {}", path.display()))?;

    register_staged(store, storage, &filename, staged).await
}

async fn register_staged(
    store: &RecordStore,
    storage: &StorageConfig,
    filename: &str,
    staged: PathBuf,
) -> Result<AddOutcome> {
    let hash_path = staged.clone();
    let hashed = tokio::task::spawn_blocking(move || fingerprint_file(&hash_path)).await;
    let content_hash = match hashed {
        Ok(Ok(hash)) => hash,
        Ok(Err(e)) => {
            remove_quietly(&staged).await;
            return Err(e);
        }
        Err(e) => {
            remove_quietly(&staged).await;
            return Err(e.into());
        }
    };

    if let Some(existing) = store.find_by_hash(&content_hash).await? {
        remove_quietly(&staged).await;
        debug!(file_id = %existing.id, filename, "duplicate upload");
        return Ok(AddOutcome::duplicate(existing));
    }

    let id = Uuid::new_v4().to_string();
    let dest = stored_path(storage, &id, filename);
    if let Err(e) = tokio::fs::rename(&staged, &dest).await {
        remove_quietly(&staged).await;
        return Err(e).with_context(|| format!("moving upload to {}", dest.display()));
    }

    let size_bytes = tokio::fs::metadata(&dest).await?.len() as i64;
    let new = NewFile {
        id,
        filename: filename.to_string(),
        storage_path: dest.to_string_lossy().into_owned(),
        file_type: FileType::from_path(Path::new(filename)),
        size_bytes,
        mime_type: guess_mime(Path::new(filename)),
        content_hash,
    };

    insert_or_resolve(store, new, &dest).await
}

/// Store a generated text artifact (e.g. a saved chat answer) as Markdown.
/// Deduplicated on the text itself.
pub async fn add_text(
    store: &RecordStore,
    storage: &StorageConfig,
    title: &str,
    text: &str,
) -> Result<AddOutcome> {
    let content_hash = fingerprint_text(text);
    if let Some(existing) = store.find_by_hash(&content_hash).await? {
        return Ok(AddOutcome::duplicate(existing));
    }

    ensure_dirs(storage).await?;
    let filename = format!("{}.md", note_stem(title));
    let id = Uuid::new_v4().to_string();
    let dest = stored_path(storage, &id, &filename);
    tokio::fs::write(&dest, text.as_bytes())
        .await
        .with_context(|| format!("writing {}", dest.display()))?;

    let new = NewFile {
        id,
        filename,
        storage_path: dest.to_string_lossy().into_owned(),
        file_type: FileType::Text,
        size_bytes: text.len() as i64,
        mime_type: "text/markdown".to_string(),
        content_hash,
    };

    insert_or_resolve(store, new, &dest).await
}

fn note_stem(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == ' ' {
                c
            } else {
                ' '
            }
        })
        .collect();
    let stem = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if stem.is_empty() {
        "note".to_string()
    } else {
        stem
    }
}

async fn insert_or_resolve(store: &RecordStore, new: NewFile, dest: &Path) -> Result<AddOutcome> {
    match store.insert_file(&new).await {
        Ok(record) => {
            info!(file_id = %record.id, filename = %record.filename, "file added");
            Ok(AddOutcome::fresh(record))
        }
        Err(InsertError::DuplicateHash(hash)) => {
            remove_quietly(dest).await;
            let winner = store
                .find_by_hash(&hash)
                .await?
                .ok_or_else(|| anyhow::anyhow!("duplicate hash {} vanished", hash))?;
            debug!(file_id = %winner.id, "lost concurrent upload race");
            Ok(AddOutcome::duplicate(winner))
        }
        Err(InsertError::Db(e)) => {
            remove_quietly(dest).await;
            Err(e.into())
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "cleanup failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate::run_migrations;
    use crate::models::FileStatus;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, RecordStore, StorageConfig) {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("i.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let storage = StorageConfig {
            root: tmp.path().join("store"),
        };
        (tmp, RecordStore::new(pool), storage)
    }

    fn stored_files(storage: &StorageConfig) -> usize {
        std::fs::read_dir(storage.files_dir()).unwrap().count()
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\docs\\a.txt"), "a.txt");
        assert_eq!(sanitize_filename(""), "upload");
        assert_eq!(sanitize_filename("dir/"), "upload");
    }

    #[test]
    fn test_note_stem() {
        assert_eq!(note_stem("What is RAG?"), "What is RAG");
        assert_eq!(note_stem("///"), "note");
    }

    #[tokio::test]
    async fn test_same_bytes_yield_one_record() {
        let (_tmp, store, storage) = setup().await;

        let first = add_file(&store, &storage, "a.txt", b"same content").await.unwrap();
        let second = add_file(&store, &storage, "b.txt", b"same content").await.unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.file.id, second.file.id);
        assert_eq!(first.file.status, FileStatus::Pending);
        assert_eq!(stored_files(&storage), 1);
        assert_eq!(std::fs::read_dir(storage.tmp_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_same_bytes_yield_one_record() {
        let (_tmp, store, storage) = setup().await;

        let uploads = (0..6).map(|i| {
            let store = store.clone();
            let storage = storage.clone();
            tokio::spawn(async move {
                add_file(&store, &storage, &format!("copy{}.txt", i), b"racing bytes")
                    .await
                    .unwrap()
            })
        });
        let mut outcomes = Vec::new();
        for handle in uploads.collect::<Vec<_>>() {
            outcomes.push(handle.await.unwrap());
        }

        let fresh: Vec<_> = outcomes.iter().filter(|o| !o.duplicate).collect();
        assert_eq!(fresh.len(), 1);
        assert!(outcomes.iter().all(|o| o.file.id == fresh[0].file.id));
        assert_eq!(stored_files(&storage), 1);
    }

    #[tokio::test]
    async fn test_add_text_dedups_on_text() {
        let (_tmp, store, storage) = setup().await;
        let a = add_text(&store, &storage, "Answer", "The answer is 42.").await.unwrap();
        let b = add_text(&store, &storage, "Other title", "The answer is 42.").await.unwrap();
        assert!(!a.duplicate);
        assert!(b.duplicate);
        assert_eq!(a.file.filename, "Answer.md");
        assert_eq!(a.file.file_type, FileType::Text);
        assert_eq!(a.file.id, b.file.id);
    }

    #[tokio::test]
    async fn test_add_path_keeps_name_and_type() {
        let (tmp, store, storage) = setup().await;
        let src = tmp.path().join("lib.rs");
        std::fs::write(&src, "pub fn x() {}").unwrap();

        let outcome = add_path(&store, &storage, &src).await.unwrap();
        assert_eq!(outcome.file.filename, "lib.rs");
        assert_eq!(outcome.file.file_type, FileType::Code);
        assert!(outcome.file.storage_path.ends_with(".rs"));
        assert!(Path::new(&outcome.file.storage_path).exists());
        assert!(src.exists());
    }
}
