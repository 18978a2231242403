//! Ingestion orchestration.
//!
//! [`Vault`] is the explicit context every operation runs against: config,
//! HTTP fetcher, extraction collaborator, manifest and index synchronizer.
//! It is built once by the caller and shared (`Arc<Vault>`) across workers.
//!
//! A single ingestion runs:
//!
//! ```text
//! source ─┬─ http(s) URL ── fetch ── store download (+ sidecar) ─┐
//!         └─ local path ── resolve against input_dir ────────────┴─ extract
//!    ── write <artifact_dir>/<doc_id>.txt ── manifest append ── index upsert
//! ```
//!
//! The manifest append happens before the index upsert. A crash between the
//! two leaves a record without an index entry, which `check` reports and
//! `reindex` repairs.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use globset::{Glob, GlobSetBuilder};
use tokio_util::sync::CancellationToken;
use url::Url;
use walkdir::WalkDir;

use crate::config::Config;
use crate::crawl::{CrawlHandler, CrawlOptions, CrawlSummary, CrawledPage, Crawler};
use crate::error::{Result, VaultError};
use crate::extract::{classify, content_type_for_path, ContentClass, Extractor, TextExtractor};
use crate::fetch::{
    parse_http_url, safe_filename, sanitize_component, sha256_hex, store_download, FetchedResource,
    Fetcher,
};
use crate::index::{IndexEngine, SqliteIndex};
use crate::manifest::Manifest;
use crate::models::{IngestKind, IngestLabels, ProvenanceRecord};
use crate::search::QueryEngine;
use crate::sync::{index_source, DocumentLock, IndexSynchronizer, Inconsistency, RebuildReport};

/// Default include pattern when bulk-ingesting a directory.
pub const DEFAULT_BULK_INCLUDE: &str = "**/*.pdf";

/// Result of one successful ingestion.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub doc_id: String,
    pub artifact_path: PathBuf,
    /// The `id` of the appended manifest record.
    pub provenance_id: String,
    pub kind: IngestKind,
    pub record: ProvenanceRecord,
}

/// How an ingestion request was classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Url(Url),
    Local(PathBuf),
}

/// A source is a URL when it parses with an `http` or `https` scheme;
/// anything else is a filesystem path, relative paths taken from `input_dir`.
pub fn classify_source(source: &str, input_dir: &Path) -> SourceRef {
    let trimmed = source.trim();
    if let Ok(url) = Url::parse(trimmed) {
        if url.scheme() == "http" || url.scheme() == "https" {
            return SourceRef::Url(url);
        }
    }
    let path = Path::new(trimmed);
    if path.is_absolute() {
        SourceRef::Local(path.to_path_buf())
    } else {
        SourceRef::Local(input_dir.join(path))
    }
}

/// Document id for a local file: its sanitized stem. A `..` inside the stem
/// is harmless in a plain file name, so it is flattened rather than refused.
pub fn local_doc_id(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_string_lossy().replace("..", "_");
    sanitize_component(&stem)
}

/// Ingest kind for a remote content class.
pub fn kind_for_class(class: ContentClass) -> IngestKind {
    match class {
        ContentClass::Pdf => IngestKind::UrlFetch,
        ContentClass::Docx => IngestKind::WebDocx,
        ContentClass::Csv => IngestKind::WebCsv,
        ContentClass::Html => IngestKind::WebHtml,
        ContentClass::Text => IngestKind::WebText,
    }
}

pub struct Vault {
    config: Config,
    fetcher: Fetcher,
    extractor: Arc<dyn Extractor>,
    manifest: Arc<Manifest>,
    sync: IndexSynchronizer,
}

impl Vault {
    /// Open the vault described by `config`: create its directories, open the
    /// SQLite index and build the HTTP client.
    pub async fn open(config: Config) -> Result<Self> {
        let index = SqliteIndex::open(&config.index.path).await?;
        Self::with_engine(config, Arc::new(index))
    }

    /// Build a vault around an already-open index engine.
    pub fn with_engine(config: Config, engine: Arc<dyn IndexEngine>) -> Result<Self> {
        config.ensure_dirs()?;
        let fetcher = Fetcher::new(&config.fetch)?;
        let manifest = Arc::new(Manifest::new(config.paths.manifest.clone()));
        Ok(Self {
            config,
            fetcher,
            extractor: Arc::new(TextExtractor),
            manifest,
            sync: IndexSynchronizer::new(engine),
        })
    }

    /// Replace the extraction collaborator (e.g. an OCR-backed one).
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn synchronizer(&self) -> &IndexSynchronizer {
        &self.sync
    }

    pub fn query_engine(&self) -> QueryEngine {
        QueryEngine::new(
            Arc::clone(self.sync.engine()),
            Arc::clone(&self.manifest),
            self.config.search.clone(),
        )
    }

    /// Ingest a URL or local path.
    pub async fn ingest(&self, source: &str, labels: &IngestLabels) -> Result<IngestOutcome> {
        match classify_source(source, &self.config.paths.input_dir) {
            SourceRef::Url(url) => self.ingest_url(url.as_str(), labels).await,
            SourceRef::Local(path) => self.ingest_resolved(path, labels).await,
        }
    }

    /// Ingest a local file. Relative paths resolve against `input_dir`.
    pub async fn ingest_local(&self, path: &Path, labels: &IngestLabels) -> Result<IngestOutcome> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.paths.input_dir.join(path)
        };
        self.ingest_resolved(path, labels).await
    }

    async fn ingest_resolved(&self, path: PathBuf, labels: &IngestLabels) -> Result<IngestOutcome> {
        if !path.is_file() {
            return Err(VaultError::NotFound { path });
        }
        let path = std::fs::canonicalize(&path)?;

        let doc_id = local_doc_id(&path).ok_or_else(|| VaultError::InvalidSource {
            source_ref: path.display().to_string(),
            reason: "cannot derive a document id from the file name".to_string(),
        })?;
        let held = self.sync.lock_document(&doc_id).await;

        let bytes = tokio::fs::read(&path).await?;
        let content_type = content_type_for_path(&path).unwrap_or("application/octet-stream");
        let text = self.extract(&path, content_type).await?;

        let mut record = ProvenanceRecord::new(IngestKind::LocalFile).with_labels(labels);
        record.source_path = Some(path.display().to_string());
        record.content_hash = Some(sha256_hex(&bytes));
        record.content_type = Some(content_type.to_string());
        record.size_bytes = Some(bytes.len() as u64);

        self.commit(&held, record, &text).await
    }

    /// Fetch a URL and ingest the response.
    pub async fn ingest_url(&self, url: &str, labels: &IngestLabels) -> Result<IngestOutcome> {
        let resource = self.fetcher.fetch(url).await?;
        self.ingest_fetched(&resource, labels).await
    }

    /// Ingest bytes that were already fetched, e.g. by the crawler.
    pub async fn ingest_fetched(
        &self,
        resource: &FetchedResource,
        labels: &IngestLabels,
    ) -> Result<IngestOutcome> {
        let url = parse_http_url(&resource.url)?;
        let mime = resource.mime();
        let class = classify(mime.as_deref(), url.path())?;
        let kind = kind_for_class(class);

        // Same name `store_download` derives, known before anything is written.
        let filename = safe_filename(&url, mime.as_deref());
        let doc_id = Path::new(&filename)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| VaultError::InvalidSource {
                source_ref: resource.url.clone(),
                reason: "cannot derive a document id from the URL".to_string(),
            })?;
        let held = self.sync.lock_document(&doc_id).await;

        let stored = store_download(
            resource,
            &self.config.paths.input_dir,
            None,
            self.config.paths.provenance_sidecars,
        )?;

        let text = self.extract(&stored.path, class.mime()).await?;

        let mut record = ProvenanceRecord::new(kind).with_labels(labels);
        record.source_url = Some(resource.url.clone());
        record.content_hash = Some(resource.content_hash.clone());
        record.content_type = Some(mime.unwrap_or_else(|| class.mime().to_string()));
        record.size_bytes = Some(resource.size_bytes());

        self.commit(&held, record, &text).await
    }

    async fn extract(&self, path: &Path, content_type: &str) -> Result<String> {
        let extractor = Arc::clone(&self.extractor);
        let path = path.to_path_buf();
        let content_type = content_type.to_string();
        let text = tokio::task::spawn_blocking(move || extractor.extract(&path, &content_type))
            .await??;
        Ok(text)
    }

    /// Write the artifact, append provenance, then upsert the index.
    async fn commit(
        &self,
        held: &DocumentLock<'_>,
        mut record: ProvenanceRecord,
        text: &str,
    ) -> Result<IngestOutcome> {
        let doc_id = held.doc_id().to_string();
        let artifact = self.config.paths.artifact_dir.join(format!("{}.txt", doc_id));
        tokio::fs::create_dir_all(&self.config.paths.artifact_dir).await?;
        tokio::fs::write(&artifact, text).await?;
        let artifact = std::fs::canonicalize(&artifact)?;

        record.doc_id = Some(doc_id.clone());
        record.artifact_path = Some(artifact.display().to_string());

        let record = self.manifest.append(record)?;
        let kind = record.kind.known().ok_or_else(|| {
            VaultError::InvalidRecord(format!("unknown kind '{}'", record.kind))
        })?;

        self.sync
            .upsert_locked(held, &index_source(&record, &artifact), text)
            .await?;

        tracing::info!(
            doc_id = %doc_id,
            kind = %kind,
            case = record.case.as_deref().unwrap_or(""),
            artifact = %artifact.display(),
            "ingested"
        );

        Ok(IngestOutcome {
            doc_id,
            artifact_path: artifact,
            provenance_id: record.id.clone().unwrap_or_default(),
            kind,
            record,
        })
    }

    /// Clear the index and rebuild it from the manifest.
    pub async fn rebuild_index(&self) -> Result<RebuildReport> {
        self.sync.rebuild_from_manifest(&self.manifest).await
    }

    /// Manifest records the index does not back.
    pub async fn check(&self) -> Result<Vec<Inconsistency>> {
        self.sync.check(&self.manifest).await
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Batches
// ═══════════════════════════════════════════════════════════════════════

/// Counters for a batch of ingestions.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub processed: usize,
    pub ok: usize,
    pub failed: usize,
    /// `(source, error)` for each failure, in completion order.
    pub failures: Vec<(String, String)>,
}

impl BatchSummary {
    pub fn record(&mut self, source: &str, result: &Result<IngestOutcome>) {
        self.processed += 1;
        match result {
            Ok(_) => self.ok += 1,
            Err(e) => self.record_failure(source, e),
        }
    }

    fn record_failure(&mut self, source: &str, error: &dyn std::fmt::Display) {
        self.failed += 1;
        self.failures.push((source.to_string(), error.to_string()));
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

impl std::fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "processed={} ok={} failed={}",
            self.processed, self.ok, self.failed
        )
    }
}

#[derive(Debug, Clone)]
pub struct BulkOptions {
    /// Ingestions in flight at once.
    pub concurrency: usize,
    /// Stop scheduling new items after the first failure.
    pub fail_fast: bool,
}

/// Ingest many sources with bounded concurrency. Per-item failures are
/// logged and counted, never propagated. After cancellation, sources not yet
/// started are counted as failed with [`VaultError::Cancelled`].
pub async fn bulk_ingest(
    vault: Arc<Vault>,
    sources: Vec<String>,
    labels: IngestLabels,
    options: BulkOptions,
    cancel: CancellationToken,
) -> BatchSummary {
    let concurrency = options.concurrency.max(1);
    let labels = Arc::new(labels);
    let mut summary = BatchSummary::default();
    let mut tasks = tokio::task::JoinSet::new();
    let mut stop = false;

    tracing::info!(items = sources.len(), concurrency, "bulk ingest starting");

    let mut pending = sources.into_iter();
    loop {
        while !stop && tasks.len() < concurrency {
            let Some(source) = pending.next() else {
                break;
            };
            if cancel.is_cancelled() {
                summary.record(&source, &Err(VaultError::Cancelled));
                for source in pending.by_ref() {
                    summary.record(&source, &Err(VaultError::Cancelled));
                }
                stop = true;
                break;
            }
            let vault = Arc::clone(&vault);
            let labels = Arc::clone(&labels);
            tasks.spawn(async move {
                let result = vault.ingest(&source, &labels).await;
                (source, result)
            });
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        match joined {
            Ok((source, result)) => {
                if let Err(ref e) = result {
                    tracing::warn!(source = %source, class = e.class(), error = %e, "ingest failed");
                    if options.fail_fast {
                        stop = true;
                    }
                }
                summary.record(&source, &result);
            }
            Err(e) => {
                tracing::warn!(error = %e, "ingest task aborted");
                summary.processed += 1;
                summary.record_failure("<task>", &e);
                if options.fail_fast {
                    stop = true;
                }
            }
        }
    }

    tracing::info!(
        processed = summary.processed,
        ok = summary.ok,
        failed = summary.failed,
        "bulk ingest finished"
    );
    summary
}

/// Sources listed one per line; blank lines and `#` comments are ignored.
pub fn read_source_list(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => VaultError::NotFound {
            path: path.to_path_buf(),
        },
        _ => VaultError::Io(e),
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Absolute paths of files under `dir` matching any `include` glob (relative
/// to `dir`), sorted.
pub fn collect_directory(dir: &Path, include: &[String]) -> Result<Vec<String>> {
    let dir = std::fs::canonicalize(dir).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => VaultError::NotFound {
            path: dir.to_path_buf(),
        },
        _ => VaultError::Io(e),
    })?;

    let mut builder = GlobSetBuilder::new();
    for pattern in include {
        let glob = Glob::new(pattern).map_err(|e| VaultError::InvalidSource {
            source_ref: pattern.clone(),
            reason: e.to_string(),
        })?;
        builder.add(glob);
    }
    let globs = builder.build().map_err(|e| VaultError::InvalidSource {
        source_ref: include.join(","),
        reason: e.to_string(),
    })?;

    let mut files = Vec::new();
    for entry in WalkDir::new(&dir).follow_links(false) {
        let entry = entry.map_err(|e| VaultError::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(&dir).unwrap_or(entry.path());
        if globs.is_match(rel) {
            files.push(entry.path().display().to_string());
        }
    }
    files.sort();
    Ok(files)
}

// ═══════════════════════════════════════════════════════════════════════
// Crawl and ingest
// ═══════════════════════════════════════════════════════════════════════

/// Crawl handler that ingests every fetched page from the bytes the crawler
/// already downloaded.
pub struct IngestHandler<'a> {
    vault: &'a Vault,
    labels: IngestLabels,
    summary: Mutex<BatchSummary>,
}

impl<'a> IngestHandler<'a> {
    pub fn new(vault: &'a Vault, labels: IngestLabels) -> Self {
        Self {
            vault,
            labels,
            summary: Mutex::new(BatchSummary::default()),
        }
    }

    pub fn into_summary(self) -> BatchSummary {
        match self.summary.into_inner() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut BatchSummary)) {
        let mut guard = match self.summary.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }
}

#[async_trait::async_trait]
impl CrawlHandler for IngestHandler<'_> {
    async fn on_document(&self, page: &CrawledPage) -> Result<()> {
        let resource = match &page.fetched {
            Ok(resource) => resource,
            Err(e) => {
                self.update(|s| {
                    s.processed += 1;
                    s.record_failure(&page.url, e);
                });
                return Ok(());
            }
        };

        let result = self.vault.ingest_fetched(resource, &self.labels).await;
        self.update(|s| s.record(&page.url, &result));
        result.map(|_| ())
    }
}

/// Crawl from `seeds` and ingest every page fetched.
pub async fn crawl_and_ingest(
    vault: &Vault,
    seeds: &[String],
    options: CrawlOptions,
    labels: IngestLabels,
    cancel: &CancellationToken,
) -> Result<(CrawlSummary, BatchSummary)> {
    let crawler = Crawler::new(vault.fetcher().clone(), options);
    let handler = IngestHandler::new(vault, labels);
    let crawl = crawler.crawl(seeds, &handler, cancel).await?;
    let mut batch = handler.into_summary();
    for _ in 0..crawl.invalid_seeds {
        batch.processed += 1;
        batch.failed += 1;
    }
    Ok((crawl, batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn classify_urls_and_paths() {
        let input = Path::new("/vault/input");
        assert!(matches!(
            classify_source("https://example.com/a.pdf", input),
            SourceRef::Url(_)
        ));
        assert_eq!(
            classify_source("docs/report.pdf", input),
            SourceRef::Local(PathBuf::from("/vault/input/docs/report.pdf"))
        );
        assert_eq!(
            classify_source("/abs/report.pdf", input),
            SourceRef::Local(PathBuf::from("/abs/report.pdf"))
        );
        // Non-http schemes are not fetched.
        assert!(matches!(
            classify_source("ftp://example.com/a.pdf", input),
            SourceRef::Local(_)
        ));
    }

    #[test]
    fn kinds_per_content_class() {
        assert_eq!(kind_for_class(ContentClass::Pdf), IngestKind::UrlFetch);
        assert_eq!(kind_for_class(ContentClass::Html), IngestKind::WebHtml);
        assert_eq!(kind_for_class(ContentClass::Csv), IngestKind::WebCsv);
        assert_eq!(kind_for_class(ContentClass::Docx), IngestKind::WebDocx);
        assert_eq!(kind_for_class(ContentClass::Text), IngestKind::WebText);
    }

    #[test]
    fn source_list_skips_comments() {
        let dir = TempDir::new().unwrap();
        let list = dir.path().join("urls.txt");
        std::fs::write(&list, "# seeds\nhttps://a.test/x.pdf\n\n  local.pdf  \n#https://skip\n").unwrap();
        assert_eq!(
            read_source_list(&list).unwrap(),
            vec!["https://a.test/x.pdf".to_string(), "local.pdf".to_string()]
        );
        assert!(matches!(
            read_source_list(&dir.path().join("missing.txt")),
            Err(VaultError::NotFound { .. })
        ));
    }

    #[test]
    fn directory_walk_applies_globs() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.pdf"), "x").unwrap();
        std::fs::write(dir.path().join("sub/b.pdf"), "x").unwrap();
        std::fs::write(dir.path().join("sub/c.txt"), "x").unwrap();

        let pdfs = collect_directory(dir.path(), &[DEFAULT_BULK_INCLUDE.to_string()]).unwrap();
        assert_eq!(pdfs.len(), 2);
        assert!(pdfs.iter().all(|p| p.ends_with(".pdf")));

        let all = collect_directory(dir.path(), &["**/*.pdf".into(), "**/*.txt".into()]).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|p| Path::new(p).is_absolute()));

        assert!(matches!(
            collect_directory(&dir.path().join("nope"), &["**/*".into()]),
            Err(VaultError::NotFound { .. })
        ));
    }

    #[test]
    fn local_doc_ids_from_file_stems() {
        assert_eq!(local_doc_id(Path::new("/in/report.pdf")).as_deref(), Some("report"));
        assert_eq!(local_doc_id(Path::new("/in/a..b.pdf")).as_deref(), Some("a_b"));
        assert_eq!(
            local_doc_id(Path::new("/in/Annual Report 2024.pdf")).as_deref(),
            Some("Annual_Report_2024")
        );
        assert!(local_doc_id(Path::new("/in/___.txt")).is_none());
    }

    #[test]
    fn summary_display() {
        let mut s = BatchSummary::default();
        s.record(
            "a",
            &Err(VaultError::NotFound {
                path: PathBuf::from("a"),
            }),
        );
        assert_eq!(s.to_string(), "processed=1 ok=0 failed=1");
        assert!(s.has_failures());
        assert_eq!(s.failures[0].0, "a");
    }
}
