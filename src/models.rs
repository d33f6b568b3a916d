//! Core data models used throughout the harness.
//!
//! These types represent the stored files, their machine-generated metadata,
//! and the values exchanged with the extraction and classification
//! collaborators.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Coarse file-type classification used to route extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Image,
    Video,
    Audio,
    Code,
    Text,
    Other,
}

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "kt", "scala", "c", "h", "cc", "cpp",
    "hpp", "cs", "rb", "php", "swift", "sh", "bash", "zsh", "sql", "lua", "r", "html", "css",
    "scss", "vue", "svelte",
];

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "csv", "tsv", "json", "yaml", "yml", "toml", "xml", "log",
    "ini",
];

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Image => "image",
            FileType::Video => "video",
            FileType::Audio => "audio",
            FileType::Code => "code",
            FileType::Text => "text",
            FileType::Other => "other",
        }
    }

    /// Classify by extension first, then by the guessed MIME type.
    pub fn from_path(path: &Path) -> FileType {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        if ext == "pdf" {
            return FileType::Pdf;
        }
        if CODE_EXTENSIONS.contains(&ext.as_str()) {
            return FileType::Code;
        }
        if TEXT_EXTENSIONS.contains(&ext.as_str()) {
            return FileType::Text;
        }

        match mime_guess::from_path(path).first() {
            Some(mime) => match mime.type_().as_str() {
                "image" => FileType::Image,
                "video" => FileType::Video,
                "audio" => FileType::Audio,
                "text" => FileType::Text,
                _ => FileType::Other,
            },
            None => FileType::Other,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "pdf" => FileType::Pdf,
            "image" => FileType::Image,
            "video" => FileType::Video,
            "audio" => FileType::Audio,
            "code" => FileType::Code,
            "text" => FileType::Text,
            "other" => FileType::Other,
            other => anyhow::bail!("unknown file type: {}", other),
        })
    }
}

/// MIME type for a stored file, falling back to `application/octet-stream`.
pub fn guess_mime(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Processing lifecycle of a file.
///
/// `pending → processing → complete`, or back to `pending` on a retryable
/// failure, or `error` once the retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processing,
    Complete,
    Error,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Processing => "processing",
            FileStatus::Complete => "complete",
            FileStatus::Error => "error",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "pending" => FileStatus::Pending,
            "processing" => FileStatus::Processing,
            "complete" => FileStatus::Complete,
            "error" => FileStatus::Error,
            other => anyhow::bail!("unknown file status: {}", other),
        })
    }
}

/// The fixed set of categories the classifier may assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Work,
    Personal,
    Research,
    Finance,
    Education,
    Reference,
    Creative,
    Other,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Work,
        Category::Personal,
        Category::Research,
        Category::Finance,
        Category::Education,
        Category::Reference,
        Category::Creative,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Work => "Work",
            Category::Personal => "Personal",
            Category::Research => "Research",
            Category::Finance => "Finance",
            Category::Education => "Education",
            Category::Reference => "Reference",
            Category::Creative => "Creative",
            Category::Other => "Other",
        }
    }

    /// Case-insensitive parse; anything unrecognised becomes [`Category::Other`].
    pub fn parse_lenient(s: &str) -> Category {
        let wanted = s.trim();
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(wanted))
            .unwrap_or(Category::Other)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagSource {
    Ai,
    Manual,
}

impl TagSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagSource::Ai => "ai",
            TagSource::Manual => "manual",
        }
    }
}

/// A stored upload and its processing state.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: String,
    pub filename: String,
    pub storage_path: String,
    pub thumbnail_path: Option<String>,
    pub file_type: FileType,
    pub size_bytes: i64,
    pub mime_type: String,
    /// `None` only for rows created before fingerprinting existed.
    pub content_hash: Option<String>,
    pub status: FileStatus,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Machine-generated metadata, one row per successfully processed file.
#[derive(Debug, Clone, Serialize)]
pub struct FileMetadata {
    pub file_id: String,
    pub title: String,
    pub summary: String,
    pub category: Category,
    pub extracted_text: String,
    pub word_count: i64,
    pub language: Option<String>,
    pub processed_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tag {
    pub tag: String,
    pub source: TagSource,
}

/// Cheap poll target for upload clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileStatusView {
    pub id: String,
    pub status: FileStatus,
    pub retry_count: i64,
    pub error_message: Option<String>,
}

/// Normalized output of an extractor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionResult {
    pub content: String,
    pub word_count: usize,
    pub language: Option<String>,
}

impl ExtractionResult {
    pub fn from_text(content: String, language: Option<String>) -> Self {
        let word_count = content.split_whitespace().count();
        Self {
            content,
            word_count,
            language,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// Output of the metadata classifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub title: String,
    pub summary: String,
    pub category: Category,
    pub tags: Vec<String>,
}

impl Classification {
    /// Metadata used when the classifier is unavailable or fails.
    pub fn fallback(filename: &str) -> Self {
        Self {
            title: filename.to_string(),
            summary: String::new(),
            category: Category::Other,
            tags: Vec::new(),
        }
    }
}

/// Borrow at most `max` characters of `s`, never splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
