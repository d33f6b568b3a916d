//! Overlapping word-window chunker.
//!
//! Splits extracted text on whitespace into windows of `window` tokens that
//! advance by `window - overlap` tokens. Windows shorter than `min_tokens`
//! are dropped as too sparse to retrieve on, except the first one, so a
//! short but non-empty document still yields a single chunk.
//!
//! Chunk identifiers are positional: [`chunk_point_id`] derives a UUIDv5
//! from the file id and chunk index, so re-chunking identical text produces
//! identical identifiers.

use uuid::Uuid;

/// Namespace for chunk point identifiers.
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x6b6e_6f77_6c65_6467_6568_6172_6e65_7373);

/// Split text into overlapping word windows.
///
/// `overlap` must be smaller than `window`; config validation enforces this,
/// and a degenerate step is clamped to 1 here.
pub fn chunk_words(text: &str, window: usize, overlap: usize, min_tokens: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() || window == 0 {
        return Vec::new();
    }

    let step = window.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < words.len() {
        let end = (start + window).min(words.len());
        let slice = &words[start..end];

        if start == 0 || slice.len() >= min_tokens {
            chunks.push(slice.join(" "));
        }

        if end == words.len() {
            break;
        }
        start += step;
    }

    chunks
}

/// Deterministic vector point id for chunk `index` of `file_id`.
pub fn chunk_point_id(file_id: &str, index: usize) -> String {
    let name = format!("{}:{}", file_id, index);
    Uuid::new_v5(&CHUNK_NAMESPACE, name.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        assert!(chunk_words("", 500, 50, 100).is_empty());
        assert!(chunk_words("  \n\t ", 500, 50, 100).is_empty());
    }

    #[test]
    fn test_short_document_keeps_first_window() {
        let chunks = chunk_words("just a few words", 500, 50, 100);
        assert_eq!(chunks, vec!["just a few words"]);
    }

    #[test]
    fn test_windows_overlap_by_configured_amount() {
        let text = words(1000);
        let chunks = chunk_words(&text, 500, 50, 100);
        // starts at 0, 450, 900; the last window has exactly 100 words
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].starts_with("w0 "));
        assert!(chunks[1].starts_with("w450 "));
        assert!(chunks[0].ends_with(" w499"));
        assert!(chunks[2].starts_with("w900 "));
        assert_eq!(chunks[2].split_whitespace().count(), 100);
    }

    #[test]
    fn test_sparse_tail_window_dropped() {
        let text = words(960);
        let chunks = chunk_words(&text, 500, 50, 100);
        // the window at 900 has only 60 words
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].ends_with(" w949"));
    }

    #[test]
    fn test_exact_fit_stops_after_last_word() {
        let text = words(500);
        let chunks = chunk_words(&text, 500, 50, 100);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_deterministic_output_and_ids() {
        let text = words(2000);
        let a = chunk_words(&text, 500, 50, 100);
        let b = chunk_words(&text, 500, 50, 100);
        assert_eq!(a, b);

        let ids_a: Vec<String> = (0..a.len()).map(|i| chunk_point_id("file-1", i)).collect();
        let ids_b: Vec<String> = (0..b.len()).map(|i| chunk_point_id("file-1", i)).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn test_point_ids_distinct_per_file_and_index() {
        assert_ne!(chunk_point_id("a", 0), chunk_point_id("a", 1));
        assert_ne!(chunk_point_id("a", 0), chunk_point_id("b", 0));
        assert!(Uuid::parse_str(&chunk_point_id("a", 0)).is_ok());
    }
}
