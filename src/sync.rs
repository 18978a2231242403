//! Keeps the index consistent with the manifest.
//!
//! Work on one document id is serialized through a per-id async lock. An
//! ingestion holds the [`DocumentLock`] from storing its download until the
//! index upsert, so two concurrent ingestions of one document cannot
//! interleave their file writes or their delete and insert. The manifest
//! stays the source of truth:
//! [`IndexSynchronizer::rebuild_from_manifest`] reconstructs the index from it
//! and [`IndexSynchronizer::check`] reports where the two disagree.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::index::IndexEngine;
use crate::manifest::{dedupe, Manifest};
use crate::models::ProvenanceRecord;

pub struct IndexSynchronizer {
    engine: Arc<dyn IndexEngine>,
    doc_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Exclusive hold on one document id, from [`IndexSynchronizer::lock_document`].
pub struct DocumentLock<'a> {
    sync: &'a IndexSynchronizer,
    doc_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl DocumentLock<'_> {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }
}

impl Drop for DocumentLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.sync.locks();
        drop(self.guard.take());
        // Only the map and this handle left: nobody holds or waits on it.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.doc_id);
        }
    }
}

/// Outcome of [`IndexSynchronizer::rebuild_from_manifest`].
#[derive(Debug, Clone, Default)]
pub struct RebuildReport {
    pub records: usize,
    pub indexed: usize,
    /// Records whose artifact file no longer exists.
    pub missing: Vec<ProvenanceRecord>,
    pub failed: usize,
}

/// A manifest record that is not backed by the index.
#[derive(Debug, Clone)]
pub struct Inconsistency {
    pub record: ProvenanceRecord,
    pub problem: Problem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Problem {
    /// `artifact_path` does not exist on disk.
    MissingArtifact,
    /// The artifact exists but its document id is absent from the index.
    NotIndexed,
    /// The record has no artifact path at all.
    NoArtifact,
}

impl Problem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Problem::MissingArtifact => "missing_artifact",
            Problem::NotIndexed => "not_indexed",
            Problem::NoArtifact => "no_artifact",
        }
    }
}

impl IndexSynchronizer {
    pub fn new(engine: Arc<dyn IndexEngine>) -> Self {
        Self {
            engine,
            doc_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<dyn IndexEngine> {
        &self.engine
    }

    fn locks(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        match self.doc_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Wait for exclusive access to `doc_id`. Released on drop.
    pub async fn lock_document(&self, doc_id: &str) -> DocumentLock<'_> {
        let lock = Arc::clone(self.locks().entry(doc_id.to_string()).or_default());
        let guard = Arc::clone(&lock).lock_owned().await;
        DocumentLock {
            sync: self,
            doc_id: doc_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    /// Replace the index entry for `doc_id`.
    pub async fn upsert(&self, doc_id: &str, source_path: &str, text: &str) -> Result<()> {
        let held = self.lock_document(doc_id).await;
        self.upsert_locked(&held, source_path, text).await
    }

    /// Replace the index entry for a document the caller already holds.
    pub async fn upsert_locked(
        &self,
        held: &DocumentLock<'_>,
        source_path: &str,
        text: &str,
    ) -> Result<()> {
        self.engine.upsert(&held.doc_id, source_path, text).await?;
        tracing::debug!(doc_id = %held.doc_id, "index upsert");
        Ok(())
    }

    /// Clear the index and re-upsert every deduplicated record whose artifact
    /// exists. When several records share a document id the last one wins,
    /// matching what a replay of the original ingestions would leave behind.
    pub async fn rebuild_from_manifest(&self, manifest: &Manifest) -> Result<RebuildReport> {
        let (records, _) = dedupe(manifest.records()?);
        let mut report = RebuildReport {
            records: records.len(),
            ..RebuildReport::default()
        };

        self.engine.clear().await?;

        for record in records {
            let (Some(doc_id), Some(artifact)) = (record.document_id(), record.artifact_path.clone())
            else {
                continue;
            };
            let path = manifest.resolve(&artifact);
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(doc_id = %doc_id, artifact = %path.display(), "artifact missing, skipped");
                    report.missing.push(record);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(doc_id = %doc_id, artifact = %path.display(), error = %e, "artifact unreadable");
                    report.failed += 1;
                    continue;
                }
            };

            self.upsert(&doc_id, &index_source(&record, &path), &text).await?;
            report.indexed += 1;
        }

        tracing::info!(
            records = report.records,
            indexed = report.indexed,
            missing = report.missing.len(),
            "index rebuilt from manifest"
        );
        Ok(report)
    }

    /// Records whose artifact is missing or whose document is not indexed.
    pub async fn check(&self, manifest: &Manifest) -> Result<Vec<Inconsistency>> {
        let indexed = self.engine.doc_ids().await?;
        let (records, _) = dedupe(manifest.records()?);

        let mut problems = Vec::new();
        for record in records {
            let problem = match record.artifact_path.as_deref() {
                None => Some(Problem::NoArtifact),
                Some(p) if !manifest.resolve(p).exists() => Some(Problem::MissingArtifact),
                Some(_) => match record.document_id() {
                    Some(id) if indexed.contains(&id) => None,
                    _ => Some(Problem::NotIndexed),
                },
            };
            if let Some(problem) = problem {
                problems.push(Inconsistency { record, problem });
            }
        }
        Ok(problems)
    }
}

/// The `source_path` stored with an index entry: the original location of the
/// document (URL for remote kinds), else the artifact itself.
pub fn index_source(record: &ProvenanceRecord, artifact: &Path) -> String {
    record
        .source_url
        .clone()
        .or_else(|| record.source_path.clone())
        .unwrap_or_else(|| artifact.display().to_string())
}
