//! Extraction dispatch: route a stored file to the extractor for its type.
//!
//! Extractors are small [`Extractor`] implementations registered per
//! [`FileType`] in an [`ExtractorRegistry`]. The registry's
//! [`dispatch`](ExtractorRegistry::dispatch) never fails: a missing
//! extractor or an extractor error degrades to empty content, and the
//! pipeline classifies on the filename instead.
//!
//! Built in:
//!
//! | Extractor | File types | Notes |
//! |-----------|------------|-------|
//! | [`PlainTextExtractor`] | `text`, `code` | lossy UTF-8; language from the code extension |
//! | [`PdfExtractor`] | `pdf` | `pdf-extract` text layer, on the blocking pool |
//! | [`OfficeExtractor`] | `other` (DOCX, PPTX, XLSX MIME only) | text runs from the OOXML parts |

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::{ExtractionResult, FileRecord, FileType};

pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    fn file_types(&self) -> &[FileType];

    /// Narrow a registration further by MIME type.
    fn accepts(&self, _mime_type: &str) -> bool {
        true
    }

    async fn extract(&self, file: &FileRecord, path: &Path) -> Result<ExtractionResult>;
}

/// Extractors keyed by the file types they handle.
pub struct ExtractorRegistry {
    extractors: HashMap<FileType, Vec<Arc<dyn Extractor>>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PlainTextExtractor));
        registry.register(Arc::new(PdfExtractor));
        registry.register(Arc::new(OfficeExtractor));
        registry
    }

    /// Later registrations are tried after earlier ones for the same type.
    pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
        for file_type in extractor.file_types() {
            self.extractors
                .entry(*file_type)
                .or_default()
                .push(extractor.clone());
        }
    }

    pub fn has_extractor(&self, file_type: FileType) -> bool {
        self.extractors
            .get(&file_type)
            .is_some_and(|list| !list.is_empty())
    }

    fn select(&self, file: &FileRecord) -> Option<&Arc<dyn Extractor>> {
        self.extractors
            .get(&file.file_type)?
            .iter()
            .find(|e| e.accepts(&file.mime_type))
    }

    /// Extract text for `file`, degrading to empty content on any problem.
    pub async fn dispatch(&self, file: &FileRecord) -> ExtractionResult {
        let extractor = match self.select(file) {
            Some(e) => e,
            None => {
                debug!(file_id = %file.id, file_type = %file.file_type, "no extractor registered");
                return ExtractionResult::empty();
            }
        };

        let path = PathBuf::from(&file.storage_path);
        match extractor.extract(file, &path).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    file_id = %file.id,
                    extractor = extractor.name(),
                    error = %e,
                    "extraction failed, continuing with empty content"
                );
                ExtractionResult::empty()
            }
        }
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============ Plain text / code ============

pub struct PlainTextExtractor;

const CODE_LANGUAGES: &[(&str, &str)] = &[
    ("rs", "rust"),
    ("py", "python"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("go", "go"),
    ("java", "java"),
    ("kt", "kotlin"),
    ("c", "c"),
    ("h", "c"),
    ("cpp", "cpp"),
    ("cc", "cpp"),
    ("cs", "csharp"),
    ("rb", "ruby"),
    ("php", "php"),
    ("swift", "swift"),
    ("sh", "shell"),
    ("sql", "sql"),
    ("lua", "lua"),
    ("html", "html"),
    ("css", "css"),
];

fn code_language(filename: &str) -> Option<String> {
    let ext = Path::new(filename)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    CODE_LANGUAGES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, lang)| lang.to_string())
}

#[async_trait]
impl Extractor for PlainTextExtractor {
    fn name(&self) -> &str {
        "plain-text"
    }

    fn file_types(&self) -> &[FileType] {
        &[FileType::Text, FileType::Code]
    }

    async fn extract(&self, file: &FileRecord, path: &Path) -> Result<ExtractionResult> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let content = String::from_utf8_lossy(&bytes).into_owned();
        let language = match file.file_type {
            FileType::Code => code_language(&file.filename),
            _ => None,
        };
        Ok(ExtractionResult::from_text(content, language))
    }
}

// ============ PDF ============

pub struct PdfExtractor;

#[async_trait]
impl Extractor for PdfExtractor {
    fn name(&self) -> &str {
        "pdf"
    }

    fn file_types(&self) -> &[FileType] {
        &[FileType::Pdf]
    }

    async fn extract(&self, _file: &FileRecord, path: &Path) -> Result<ExtractionResult> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await?
            .map_err(|e| anyhow::anyhow!("PDF extraction failed: {}", e))?;
        Ok(ExtractionResult::from_text(text, None))
    }
}

// ============ Office Open XML ============

pub struct OfficeExtractor;

#[async_trait]
impl Extractor for OfficeExtractor {
    fn name(&self) -> &str {
        "office"
    }

    fn file_types(&self) -> &[FileType] {
        &[FileType::Other]
    }

    fn accepts(&self, mime_type: &str) -> bool {
        matches!(mime_type, MIME_DOCX | MIME_PPTX | MIME_XLSX)
    }

    async fn extract(&self, file: &FileRecord, path: &Path) -> Result<ExtractionResult> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let mime = file.mime_type.clone();
        let text = tokio::task::spawn_blocking(move || extract_ooxml(&bytes, &mime)).await??;
        Ok(ExtractionResult::from_text(text, None))
    }
}

/// Text of a DOCX, PPTX or XLSX package.
pub fn extract_ooxml(bytes: &[u8], mime_type: &str) -> Result<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;

    let parts: Vec<String> = match mime_type {
        MIME_DOCX => vec!["word/document.xml".to_string()],
        MIME_PPTX => numbered_parts(&archive, "ppt/slides/slide"),
        MIME_XLSX => vec!["xl/sharedStrings.xml".to_string()],
        other => bail!("unsupported office type: {}", other),
    };

    let mut out = String::new();
    for part in parts {
        let xml = read_entry_bounded(&mut archive, &part)?;
        let text = collect_text_runs(&xml)?;
        if !out.is_empty() && !text.is_empty() {
            out.push('\n');
        }
        out.push_str(text.trim_end());
    }
    Ok(out)
}

/// `prefix1.xml`, `prefix2.xml`, ... in numeric order.
fn numbered_parts(archive: &zip::ZipArchive<std::io::Cursor<&[u8]>>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn read_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>> {
    let entry = archive
        .by_name(name)
        .with_context(|| format!("{} not found", name))?;
    let mut out = Vec::new();
    entry.take(MAX_XML_ENTRY_BYTES).read_to_end(&mut out)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        bail!("ZIP entry {} exceeds size limit", name);
    }
    Ok(out)
}

/// Concatenate every `<*:t>` run; paragraphs (`p`) and shared-string items
/// (`si`) end with a newline.
fn collect_text_runs(xml: &[u8]) -> Result<String> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_run = false;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => in_run = true,
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_run = false,
                b"p" | b"si" => {
                    if !out.ends_with('\n') && !out.is_empty() {
                        out.push('\n');
                    }
                }
                _ => {}
            },
            Event::Text(te) if in_run => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileStatus;
    use std::io::Write;
    use tempfile::TempDir;

    fn record(path: &Path, filename: &str, file_type: FileType, mime: &str) -> FileRecord {
        FileRecord {
            id: "f1".to_string(),
            filename: filename.to_string(),
            storage_path: path.to_string_lossy().into_owned(),
            thumbnail_path: None,
            file_type,
            size_bytes: 0,
            mime_type: mime.to_string(),
            content_hash: None,
            status: FileStatus::Processing,
            retry_count: 0,
            error_message: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn docx_bytes(body: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(body.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[tokio::test]
    async fn test_code_file_gets_language() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stored.bin");
        std::fs::write(&path, "fn main() {}\n").unwrap();

        let registry = ExtractorRegistry::with_builtins();
        let result = registry
            .dispatch(&record(&path, "main.rs", FileType::Code, "text/x-rust"))
            .await;
        assert_eq!(result.content, "fn main() {}\n");
        assert_eq!(result.word_count, 3);
        assert_eq!(result.language.as_deref(), Some("rust"));
    }

    #[tokio::test]
    async fn test_missing_file_degrades_to_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gone.txt");
        let registry = ExtractorRegistry::with_builtins();
        let result = registry
            .dispatch(&record(&path, "gone.txt", FileType::Text, "text/plain"))
            .await;
        assert_eq!(result, ExtractionResult::empty());
    }

    #[tokio::test]
    async fn test_unregistered_type_degrades_to_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("photo.jpg");
        std::fs::write(&path, [0xff, 0xd8, 0xff]).unwrap();
        let registry = ExtractorRegistry::with_builtins();
        assert!(!registry.has_extractor(FileType::Image));
        let result = registry
            .dispatch(&record(&path, "photo.jpg", FileType::Image, "image/jpeg"))
            .await;
        assert!(result.content.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_pdf_degrades_to_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.pdf");
        std::fs::write(&path, b"not a pdf").unwrap();
        let registry = ExtractorRegistry::with_builtins();
        let result = registry
            .dispatch(&record(&path, "broken.pdf", FileType::Pdf, "application/pdf"))
            .await;
        assert!(result.content.is_empty());
    }

    #[tokio::test]
    async fn test_docx_runs_are_extracted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.docx");
        let xml = r#"<?xml version="1.0"?>
            <w:document xmlns:w="w"><w:body>
              <w:p><w:r><w:t>Quarterly</w:t></w:r><w:r><w:t xml:space="preserve"> report</w:t></w:r></w:p>
              <w:p><w:r><w:t>Revenue &amp; costs</w:t></w:r></w:p>
            </w:body></w:document>"#;
        std::fs::write(&path, docx_bytes(xml)).unwrap();

        let registry = ExtractorRegistry::with_builtins();
        let result = registry
            .dispatch(&record(&path, "doc.docx", FileType::Other, MIME_DOCX))
            .await;
        assert_eq!(result.content, "Quarterly report\nRevenue & costs");
    }

    #[test]
    fn test_office_extractor_only_accepts_ooxml() {
        assert!(OfficeExtractor.accepts(MIME_XLSX));
        assert!(!OfficeExtractor.accepts("application/zip"));
    }
}
