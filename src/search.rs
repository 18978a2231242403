//! Query engine: index hits joined with manifest provenance.
//!
//! A search asks the engine for up to `search.candidate_limit` ranked hits,
//! joins each hit to the latest manifest record for its document id, drops
//! hits whose provenance fails the filters, and truncates to the requested
//! limit. Filters only decide inclusion; order is the engine's ranking.

use std::sync::Arc;

use crate::config::SearchConfig;
use crate::error::Result;
use crate::index::{IndexEngine, IndexHit};
use crate::manifest::Manifest;
use crate::models::{IngestKind, ProvenanceRecord, SearchResult};

/// Provenance constraints applied after scoring. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    pub case: Option<String>,
    pub kind: Option<IngestKind>,
    pub tenant: Option<String>,
    /// Every listed tag must be present on the record.
    pub tags: Vec<String>,
    pub collection: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.case.is_none()
            && self.kind.is_none()
            && self.tenant.is_none()
            && self.tags.is_empty()
            && self.collection.is_none()
    }

    /// Whether a hit with this provenance passes. A hit with no manifest
    /// record passes only when no filter is set.
    pub fn matches(&self, record: Option<&ProvenanceRecord>) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(record) = record else {
            return false;
        };

        if self.case.is_some() && record.case != self.case {
            return false;
        }
        if let Some(kind) = self.kind {
            if record.kind.known() != Some(kind) {
                return false;
            }
        }
        if self.tenant.is_some() && record.tenant != self.tenant {
            return false;
        }
        if self.collection.is_some() && record.collection != self.collection {
            return false;
        }
        self.tags.iter().all(|t| record.tags.contains(t))
    }
}

pub struct QueryEngine {
    engine: Arc<dyn IndexEngine>,
    manifest: Arc<Manifest>,
    config: SearchConfig,
}

impl QueryEngine {
    pub fn new(engine: Arc<dyn IndexEngine>, manifest: Arc<Manifest>, config: SearchConfig) -> Self {
        Self {
            engine,
            manifest,
            config,
        }
    }

    /// Ranked, filtered, snippet-annotated results. `limit` defaults to
    /// `search.limit`.
    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: Option<usize>,
    ) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let limit = limit.unwrap_or(self.config.limit);
        let candidates = self.config.candidate_limit.max(limit);

        let hits = self.engine.query(query, candidates).await?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let latest = self.manifest.latest_by_doc_id()?;

        let mut results = Vec::new();
        for hit in hits {
            let record = latest.get(&hit.doc_id);
            if !filters.matches(record) {
                continue;
            }
            results.push(self.annotate(hit, record));
            if results.len() >= limit {
                break;
            }
        }

        tracing::debug!(query, results = results.len(), "search");
        Ok(results)
    }

    fn annotate(&self, hit: IndexHit, record: Option<&ProvenanceRecord>) -> SearchResult {
        let snippet = match hit.snippet {
            Some(s) => s,
            None => hit
                .content
                .as_deref()
                .map(|c| snippet_prefix(c, self.config.snippet_chars))
                .unwrap_or_default(),
        };

        SearchResult {
            doc_id: hit.doc_id,
            source: hit.source_path,
            score: hit.score,
            case: record.and_then(|r| r.case.clone()),
            kind: record.map(|r| r.kind.to_string()),
            tenant: record.and_then(|r| r.tenant.clone()),
            tags: record.map(|r| r.tags.clone()).unwrap_or_default(),
            collection: record.and_then(|r| r.collection.clone()),
            source_url: record.and_then(|r| r.source_url.clone()),
            snippet,
        }
    }
}

/// First `max_chars` characters of `content`, whitespace collapsed.
pub fn snippet_prefix(content: &str, max_chars: usize) -> String {
    let mut out = String::new();
    let mut count = 0;
    for word in content.split_whitespace() {
        let sep = usize::from(!out.is_empty());
        let len = word.chars().count();
        if count + sep + len > max_chars {
            let room = max_chars.saturating_sub(count + sep);
            if room > 0 {
                if sep == 1 {
                    out.push(' ');
                }
                out.extend(word.chars().take(room));
            }
            break;
        }
        if sep == 1 {
            out.push(' ');
        }
        out.push_str(word);
        count += sep + len;
    }
    out
}

/// Human-readable result listing.
pub fn format_results(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "No results.\n".to_string();
    }
    let mut out = String::new();
    for (i, r) in results.iter().enumerate() {
        out.push_str(&format!(
            "{}. [{:.2}] {} ({})\n",
            i + 1,
            r.score,
            r.doc_id,
            r.kind.as_deref().unwrap_or("unknown")
        ));
        out.push_str(&format!("    source: {}\n", r.source));
        if let Some(ref case) = r.case {
            out.push_str(&format!("    case: {}\n", case));
        }
        if let Some(ref tenant) = r.tenant {
            out.push_str(&format!("    tenant: {}\n", tenant));
        }
        if !r.tags.is_empty() {
            out.push_str(&format!("    tags: {}\n", r.tags.join(", ")));
        }
        if let Some(ref collection) = r.collection {
            out.push_str(&format!("    collection: {}\n", collection));
        }
        out.push_str(&format!(
            "    excerpt: \"{}\"\n\n",
            r.snippet.replace('\n', " ").trim()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SqliteIndex;
    use tempfile::TempDir;

    fn record(artifact: &str, kind: IngestKind, case: Option<&str>) -> ProvenanceRecord {
        let mut r = ProvenanceRecord::new(kind);
        r.artifact_path = Some(artifact.to_string());
        r.case = case.map(|c| c.to_string());
        if kind.is_remote() {
            r.source_url = Some(format!("https://example.com/{}", artifact));
        }
        r
    }

    async fn engine_with(
        dir: &TempDir,
        docs: &[(&str, &str)],
        records: Vec<ProvenanceRecord>,
    ) -> QueryEngine {
        let index = SqliteIndex::open(&dir.path().join("index.sqlite"))
            .await
            .unwrap();
        for (id, text) in docs {
            index.upsert(id, &format!("{}.pdf", id), text).await.unwrap();
        }
        let manifest = Manifest::new(dir.path().join("manifest.jsonl"));
        for r in records {
            manifest.append(r).unwrap();
        }
        QueryEngine::new(Arc::new(index), Arc::new(manifest), SearchConfig::default())
    }

    #[test]
    fn prefix_is_char_safe_and_bounded() {
        assert_eq!(snippet_prefix("alpha  beta\n gamma", 10), "alpha beta");
        assert_eq!(snippet_prefix("über straße", 7), "über st");
        assert_eq!(snippet_prefix("short", 300), "short");
        assert_eq!(snippet_prefix("", 10), "");
        assert!(snippet_prefix(&"x".repeat(1000), 300).chars().count() == 300);
    }

    #[test]
    fn filters_require_all_fields() {
        let mut r = record("ocr/a.txt", IngestKind::LocalFile, Some("c1"));
        r.tags = vec!["court".into(), "2019".into()];
        r.tenant = Some("t1".into());

        assert!(SearchFilters::default().matches(Some(&r)));
        assert!(SearchFilters::default().matches(None));

        let f = SearchFilters {
            case: Some("c1".into()),
            tags: vec!["court".into()],
            ..Default::default()
        };
        assert!(f.matches(Some(&r)));
        assert!(!f.matches(None));

        let f = SearchFilters {
            tags: vec!["court".into(), "2020".into()],
            ..Default::default()
        };
        assert!(!f.matches(Some(&r)));

        let f = SearchFilters {
            kind: Some(IngestKind::WebHtml),
            ..Default::default()
        };
        assert!(!f.matches(Some(&r)));

        let f = SearchFilters {
            tenant: Some("t2".into()),
            ..Default::default()
        };
        assert!(!f.matches(Some(&r)));
    }

    #[tokio::test]
    async fn joins_manifest_and_filters_after_ranking() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(
            &dir,
            &[
                ("a", "harbor harbor harbor permit"),
                ("b", "harbor permit renewal notice with extra words"),
                ("c", "harbor"),
            ],
            vec![
                record("ocr/a.txt", IngestKind::LocalFile, Some("alpha")),
                record("ocr/b.txt", IngestKind::WebHtml, Some("beta")),
                record("ocr/c.txt", IngestKind::LocalFile, Some("beta")),
            ],
        )
        .await;

        let all = engine
            .search("harbor", &SearchFilters::default(), None)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].case.as_deref(), Some("alpha"));

        let beta = engine
            .search(
                "harbor",
                &SearchFilters {
                    case: Some("beta".into()),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        let ids: Vec<&str> = beta.iter().map(|r| r.doc_id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&"a"));
        // Relative order among survivors is the unfiltered order.
        let unfiltered: Vec<&str> = all
            .iter()
            .map(|r| r.doc_id.as_str())
            .filter(|id| *id != "a")
            .collect();
        assert_eq!(ids, unfiltered);

        let web = engine
            .search(
                "harbor",
                &SearchFilters {
                    kind: Some(IngestKind::WebHtml),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(web.len(), 1);
        assert_eq!(web[0].doc_id, "b");
        assert_eq!(web[0].source_url.as_deref(), Some("https://example.com/ocr/b.txt"));

        let limited = engine
            .search("harbor", &SearchFilters::default(), Some(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn empty_query_returns_nothing() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(&dir, &[("a", "text")], vec![]).await;
        assert!(engine
            .search("   ", &SearchFilters::default(), None)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn falls_back_to_prefix_without_highlight() {
        let engine = QueryEngine::new(
            Arc::new(NoIndex),
            Arc::new(Manifest::new("/nonexistent/manifest.jsonl")),
            SearchConfig {
                snippet_chars: 12,
                ..SearchConfig::default()
            },
        );
        let hit = IndexHit {
            doc_id: "d".into(),
            source_path: "d.pdf".into(),
            score: 1.0,
            snippet: None,
            content: Some("The quick brown fox".into()),
        };
        let result = engine.annotate(hit, None);
        assert_eq!(result.snippet, "The quick br");
        assert!(result.case.is_none());
    }

    struct NoIndex;

    #[async_trait::async_trait]
    impl IndexEngine for NoIndex {
        async fn upsert(&self, _doc_id: &str, _source: &str, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn query(&self, _text: &str, _limit: usize) -> Result<Vec<IndexHit>> {
            Ok(Vec::new())
        }
        async fn doc_ids(&self) -> Result<std::collections::HashSet<String>> {
            Ok(Default::default())
        }
        async fn count(&self) -> Result<usize> {
            Ok(0)
        }
        async fn clear(&self) -> Result<()> {
            Ok(())
        }
    }
}
