//! Full-text index engine.
//!
//! The vault treats the index as a derived, rebuildable cache keyed by
//! document id. [`IndexEngine`] is the seam the rest of the crate talks to;
//! [`SqliteIndex`] implements it on SQLite FTS5 (BM25 ranking, built-in
//! `snippet()` highlighting).
//!
//! ```text
//! documents      (doc_id PK, source_path, content, updated_at)
//! documents_fts  FTS5(doc_id UNINDEXED, source_path UNINDEXED, content)
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::{Result, VaultError};

/// Markers wrapped around matched terms in highlighted snippets.
pub const HIGHLIGHT_OPEN: &str = ">>>";
pub const HIGHLIGHT_CLOSE: &str = "<<<";

/// One ranked hit from the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub doc_id: String,
    pub source_path: String,
    /// Higher is better.
    pub score: f64,
    /// Highlighted excerpt, when the engine produced one with a match inside.
    pub snippet: Option<String>,
    /// Stored text of the document.
    pub content: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════
// Engine trait
// ═══════════════════════════════════════════════════════════════════════

/// Storage and ranking backend for extracted text.
///
/// `upsert` must be idempotent per `doc_id`: a second call replaces the
/// first. Tokenization and scoring are the engine's business.
#[async_trait]
pub trait IndexEngine: Send + Sync {
    async fn upsert(&self, doc_id: &str, source_path: &str, text: &str) -> Result<()>;

    /// Ranked hits for free text, best first, at most `limit`.
    async fn query(&self, text: &str, limit: usize) -> Result<Vec<IndexHit>>;

    async fn doc_ids(&self) -> Result<HashSet<String>>;

    async fn count(&self) -> Result<usize>;

    /// Remove every document.
    async fn clear(&self) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// SQLite FTS5
// ═══════════════════════════════════════════════════════════════════════

pub struct SqliteIndex {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteIndex {
    /// Open (creating if needed) the index at `path`.
    ///
    /// Any failure here is [`VaultError::IndexUnavailable`]; callers must not
    /// fall back to a degraded search.
    pub async fn open(path: &Path) -> Result<Self> {
        let unavailable = |reason: String| VaultError::IndexUnavailable {
            path: path.to_path_buf(),
            reason,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| unavailable(e.to_string()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let index = Self {
            pool,
            path: path.to_path_buf(),
        };
        index
            .migrate()
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        Ok(index)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn migrate(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                doc_id TEXT PRIMARY KEY,
                source_path TEXT NOT NULL,
                content TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // FTS5 CREATE is not idempotent natively, so check first.
        let fts_exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
        )
        .fetch_one(&self.pool)
        .await?;

        if !fts_exists {
            sqlx::query(
                r#"
                CREATE VIRTUAL TABLE documents_fts USING fts5(
                    doc_id UNINDEXED,
                    source_path UNINDEXED,
                    content
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl IndexEngine for SqliteIndex {
    async fn upsert(&self, doc_id: &str, source_path: &str, text: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM documents_fts WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO documents (doc_id, source_path, content, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(doc_id) DO UPDATE SET
                source_path = excluded.source_path,
                content = excluded.content,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(doc_id)
        .bind(source_path)
        .bind(text)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO documents_fts (doc_id, source_path, content) VALUES (?, ?, ?)")
            .bind(doc_id)
            .bind(source_path)
            .bind(text)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, text: &str, limit: usize) -> Result<Vec<IndexHit>> {
        let Some(fts) = fts_query(text) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT doc_id, source_path, content, rank,
                   snippet(documents_fts, 2, '>>>', '<<<', '...', 32) AS snippet
            FROM documents_fts
            WHERE documents_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&fts)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let hits = rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                let snippet: Option<String> = row.get("snippet");
                IndexHit {
                    doc_id: row.get("doc_id"),
                    source_path: row.get("source_path"),
                    score: -rank, // negate so higher = better
                    snippet: snippet.filter(|s| s.contains(HIGHLIGHT_OPEN)),
                    content: row.get("content"),
                }
            })
            .collect();

        Ok(hits)
    }

    async fn doc_ids(&self) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT doc_id FROM documents")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM documents_fts")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Turn free text into an FTS5 query: every alphanumeric run becomes a
/// quoted term, terms are implicitly AND-ed. Operators and punctuation in the
/// input are never interpreted. `None` when no term remains.
pub fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(fts_query("grand jury").as_deref(), Some("\"grand\" \"jury\""));
        assert_eq!(
            fts_query("NEAR(a b) OR \"x\" -y*").as_deref(),
            Some("\"NEAR\" \"a\" \"b\" \"OR\" \"x\" \"y\"")
        );
        assert_eq!(fts_query("  ...  ").as_deref(), None);
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let index = SqliteIndex::open(&dir.path().join("index.sqlite"))
            .await
            .unwrap();

        index.upsert("report", "/in/report.pdf", "first draft about budgets").await.unwrap();
        index.upsert("report", "/in/report.pdf", "final version about budgets").await.unwrap();

        assert_eq!(index.count().await.unwrap(), 1);
        let hits = index.query("budgets", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "report");
        assert!(hits[0].content.as_deref().unwrap().starts_with("final"));
        assert!(index.query("draft", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn query_ranks_and_highlights() {
        let dir = TempDir::new().unwrap();
        let index = SqliteIndex::open(&dir.path().join("index.sqlite"))
            .await
            .unwrap();

        index.upsert("a", "a.txt", "ferry schedule ferry ferry harbor").await.unwrap();
        index.upsert("b", "b.txt", "a single mention of the ferry among many other words here").await.unwrap();
        index.upsert("c", "c.txt", "nothing relevant").await.unwrap();

        let hits = index.query("ferry", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc_id, "a");
        assert!(hits[0].score >= hits[1].score);
        assert!(hits[0].snippet.as_deref().unwrap().contains(">>>ferry<<<"));

        assert_eq!(index.query("ferry", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clear_and_membership() {
        let dir = TempDir::new().unwrap();
        let index = SqliteIndex::open(&dir.path().join("index.sqlite"))
            .await
            .unwrap();
        index.upsert("x", "x.txt", "alpha").await.unwrap();
        assert!(index.doc_ids().await.unwrap().contains("x"));

        index.clear().await.unwrap();
        assert!(index.doc_ids().await.unwrap().is_empty());
        assert_eq!(index.count().await.unwrap(), 0);
        assert!(index.query("alpha", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unopenable_path_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "not a directory").unwrap();

        match SqliteIndex::open(&blocker.join("index.sqlite")).await {
            Err(VaultError::IndexUnavailable { .. }) => {}
            Err(other) => panic!("expected IndexUnavailable, got {}", other),
            Ok(_) => panic!("expected IndexUnavailable, got an open index"),
        }
    }
}
