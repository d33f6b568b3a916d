//! Full-text mirror of each file's searchable fields (SQLite FTS5).
//!
//! One row per file in `files_fts`. FTS5 has no `ON CONFLICT` update, so a
//! row is always replaced by delete + insert, and always on the caller's
//! transaction so the mirror never disagrees with the relational rows.
//!
//! Keyword scores come from FTS5 `bm25()` (lower is better) and are mapped
//! into `[0, 1]` with `1 / (1 + e^rank)`.

use anyhow::Result;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::store::DisplayMetadata;

/// Maximum characters of extracted text copied into the mirror row.
pub const MIRROR_TEXT_CAP: i64 = 50_000;

/// Separator used when tags are concatenated in SQL.
pub(crate) const TAG_SEPARATOR: char = '\u{1f}';

/// Optional constraints on keyword results.
#[derive(Debug, Clone, Default)]
pub struct LexicalFilters<'a> {
    pub file_type: Option<&'a str>,
    pub category: Option<&'a str>,
}

/// A keyword match with its normalized score.
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub file: DisplayMetadata,
    pub score: f64,
    pub snippet: String,
}

/// Rebuild the mirror row for `file_id` from the current relational state.
///
/// Must run on the same connection (transaction) that changed the metadata
/// or tags. A missing file simply leaves no row behind.
pub async fn refresh_row(conn: &mut SqliteConnection, file_id: &str) -> Result<()> {
    delete_row(&mut *conn, file_id).await?;

    sqlx::query(
        r#"
        INSERT INTO files_fts (file_id, filename, title, summary, category, tags, content)
        SELECT f.id,
               f.filename,
               COALESCE(m.title, ''),
               COALESCE(m.summary, ''),
               COALESCE(m.category, ''),
               COALESCE((SELECT group_concat(tag, ' ')
                         FROM (SELECT tag FROM tags WHERE file_id = f.id ORDER BY id)), ''),
               substr(COALESCE(m.extracted_text, ''), 1, ?)
        FROM files f
        LEFT JOIN file_metadata m ON m.file_id = f.id
        WHERE f.id = ?
        "#,
    )
    .bind(MIRROR_TEXT_CAP)
    .bind(file_id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn delete_row(conn: &mut SqliteConnection, file_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM files_fts WHERE file_id = ?")
        .bind(file_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Turn free text into an FTS5 expression: every token is a required
/// prefix term. Returns `None` when nothing searchable remains.
pub fn build_match_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|token| {
            token
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{}\"*", token))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

/// Map an FTS5 rank (lower is better, usually negative) into `[0, 1]`.
pub fn rank_to_score(rank: f64) -> f64 {
    1.0 / (1.0 + rank.exp())
}

/// Keyword search over `complete` files only.
pub async fn keyword_search(
    pool: &SqlitePool,
    query: &str,
    filters: &LexicalFilters<'_>,
    limit: i64,
) -> Result<Vec<LexicalHit>> {
    let match_query = match build_match_query(query) {
        Some(q) => q,
        None => return Ok(Vec::new()),
    };

    let rows = sqlx::query(
        r#"
        SELECT f.id, f.filename, f.file_type,
               COALESCE(m.title, f.filename) AS title,
               COALESCE(m.category, 'Other') AS category,
               COALESCE((SELECT group_concat(tag, char(31))
                         FROM (SELECT tag FROM tags WHERE file_id = f.id ORDER BY id)), '') AS tags,
               bm25(files_fts, 0.0, 3.0, 4.0, 2.0, 1.0, 2.0, 1.0) AS rank,
               snippet(files_fts, 6, '', '', '...', 24) AS snippet
        FROM files_fts
        JOIN files f ON f.id = files_fts.file_id
        LEFT JOIN file_metadata m ON m.file_id = f.id
        WHERE files_fts MATCH ?
          AND f.status = 'complete'
          AND (? IS NULL OR f.file_type = ?)
          AND (? IS NULL OR m.category = ? COLLATE NOCASE)
        ORDER BY rank
        LIMIT ?
        "#,
    )
    .bind(&match_query)
    .bind(filters.file_type)
    .bind(filters.file_type)
    .bind(filters.category)
    .bind(filters.category)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut hits = Vec::with_capacity(rows.len());
    for row in &rows {
        let rank: f64 = row.get("rank");
        let file_type: String = row.get("file_type");
        let tags: String = row.get("tags");
        hits.push(LexicalHit {
            file: DisplayMetadata {
                file_id: row.get("id"),
                filename: row.get("filename"),
                file_type: file_type.parse()?,
                title: row.get("title"),
                category: row.get("category"),
                tags: split_tags(&tags),
            },
            score: rank_to_score(rank),
            snippet: row.get("snippet"),
        });
    }

    Ok(hits)
}

pub(crate) fn split_tags(joined: &str) -> Vec<String> {
    joined
        .split(TAG_SEPARATOR)
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}
