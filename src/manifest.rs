//! Append-only provenance ledger.
//!
//! One JSON object per line, UTF-8. During normal operation [`Manifest::append`]
//! is the only mutator; appends from concurrent ingestions are serialized by
//! an in-process lock and each record is written with a single `write_all`.
//!
//! The file is only ever rewritten by the explicit maintenance path
//! ([`Manifest::cleanup_file`]), which copies the current ledger to
//! `<manifest>.bak`, writes the cleaned records to a temporary sibling and
//! renames it over the original.
//!
//! Scanning is tolerant: blank lines are ignored and malformed lines are
//! skipped with a warning, never failing the scan.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Lines, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

use crate::error::{Result, VaultError};
use crate::models::{IngestKind, ProvenanceRecord, RecordKind};

pub struct Manifest {
    path: PathBuf,
    writer: Mutex<()>,
}

impl Manifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `<manifest>.bak`, the pre-cleanup copy.
    pub fn backup_path(&self) -> PathBuf {
        sibling(&self.path, "bak")
    }

    /// Resolve a stored path. Relative paths are relative to the directory
    /// holding the manifest.
    pub fn resolve(&self, stored: &str) -> PathBuf {
        let p = Path::new(stored);
        if p.is_absolute() {
            return p.to_path_buf();
        }
        match self.path.parent() {
            Some(dir) => dir.join(p),
            None => p.to_path_buf(),
        }
    }

    /// Append one record and return it as written.
    ///
    /// Assigns `timestamp` (always) and `id` (when absent). Records with a
    /// kind outside [`IngestKind`] are rejected.
    pub fn append(&self, mut record: ProvenanceRecord) -> Result<ProvenanceRecord> {
        validate_for_append(&record)?;

        record.timestamp = Some(Utc::now());
        if record.id.is_none() {
            record.id = Some(uuid::Uuid::new_v4().to_string());
        }

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = lock(&self.writer);
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;

        tracing::debug!(
            id = record.id.as_deref().unwrap_or(""),
            kind = %record.kind,
            "manifest append"
        );
        Ok(record)
    }

    /// Lazily iterate records in file order. A missing manifest yields nothing.
    ///
    /// Each call reopens the file, so scans can be restarted at will.
    pub fn scan(&self) -> Result<ManifestScan> {
        let lines = match File::open(&self.path) {
            Ok(f) => Some(BufReader::new(f).lines()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(ManifestScan {
            lines,
            line_no: 0,
            malformed: 0,
        })
    }

    /// All well-formed records, in file order.
    pub fn records(&self) -> Result<Vec<ProvenanceRecord>> {
        Ok(self.scan()?.collect())
    }

    /// The last record for each document id.
    pub fn latest_by_doc_id(&self) -> Result<HashMap<String, ProvenanceRecord>> {
        let mut latest = HashMap::new();
        for record in self.scan()? {
            if let Some(id) = record.document_id() {
                latest.insert(id, record);
            }
        }
        Ok(latest)
    }

    /// Every record for `doc_id`, oldest first.
    pub fn find(&self, doc_id: &str) -> Result<Vec<ProvenanceRecord>> {
        Ok(self
            .scan()?
            .filter(|r| r.document_id().as_deref() == Some(doc_id))
            .collect())
    }

    /// Replace the ledger with `records`.
    ///
    /// The current file is copied to [`backup_path`](Self::backup_path), the
    /// new content goes to a temporary sibling that is synced and then renamed
    /// over the manifest. An interruption leaves either the old or the new
    /// file in place, never a partial one.
    pub fn rewrite(&self, records: &[ProvenanceRecord]) -> Result<Option<PathBuf>> {
        let _guard = lock(&self.writer);

        let backup = if self.path.exists() {
            let backup = self.backup_path();
            std::fs::copy(&self.path, &backup)?;
            Some(backup)
        } else {
            None
        };

        let tmp = sibling(&self.path, "tmp");
        {
            let mut out = std::io::BufWriter::new(File::create(&tmp)?);
            for record in records {
                serde_json::to_writer(&mut out, record)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        Ok(backup)
    }

    /// The maintenance pass: drop legacy anomalies, optionally drop records
    /// whose artifact is gone, then dedupe. Rewrites the file unless
    /// `dry_run` is set or nothing changed.
    pub fn cleanup_file(&self, options: &CleanupOptions) -> Result<CleanupReport> {
        let mut scan = self.scan()?;
        let records: Vec<ProvenanceRecord> = scan.by_ref().collect();
        let malformed = scan.malformed();
        let loaded = records.len();

        let (records, anomalies) = cleanup(records);

        let (records, missing) = if options.drop_missing {
            let (kept, missing): (Vec<_>, Vec<_>) = records.into_iter().partition(|r| {
                r.artifact_path
                    .as_deref()
                    .map_or(true, |p| self.resolve(p).exists())
            });
            for record in &missing {
                tracing::warn!(
                    artifact_path = record.artifact_path.as_deref().unwrap_or(""),
                    kind = %record.kind,
                    "dropping record with missing artifact"
                );
            }
            (kept, missing.len())
        } else {
            (records, 0)
        };

        let (records, duplicates) = dedupe(records);

        let mut report = CleanupReport {
            loaded,
            malformed_skipped: malformed,
            kept: records.len(),
            dropped_anomalies: anomalies.len(),
            dropped_missing: missing,
            dropped_duplicates: duplicates,
            backup: None,
            written: false,
        };

        let changed = report.kept != loaded || malformed > 0;
        if options.dry_run || !changed {
            return Ok(report);
        }

        report.backup = self.rewrite(&records)?;
        report.written = true;
        tracing::info!(
            kept = report.kept,
            dropped_anomalies = report.dropped_anomalies,
            dropped_duplicates = report.dropped_duplicates,
            dropped_missing = report.dropped_missing,
            "manifest rewritten"
        );
        Ok(report)
    }
}

fn lock(m: &Mutex<()>) -> std::sync::MutexGuard<'_, ()> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Boundary checks for new records.
pub fn validate_for_append(record: &ProvenanceRecord) -> Result<()> {
    let kind = match &record.kind {
        RecordKind::Known(k) => *k,
        RecordKind::Legacy(s) => {
            return Err(VaultError::InvalidRecord(format!("unknown kind '{}'", s)));
        }
    };

    if kind.is_remote() {
        if record.source_url.is_none() {
            return Err(VaultError::InvalidRecord(format!(
                "{} record requires source_url",
                kind
            )));
        }
        if record.source_path.is_some() {
            return Err(VaultError::InvalidRecord(format!(
                "{} record must not carry both source_path and source_url",
                kind
            )));
        }
    } else if kind == IngestKind::LocalFile && record.source_url.is_some() {
        return Err(VaultError::InvalidRecord(
            "local_file record must not carry source_url".to_string(),
        ));
    }

    Ok(())
}

/// Lazy record iterator returned by [`Manifest::scan`].
pub struct ManifestScan {
    lines: Option<Lines<BufReader<File>>>,
    line_no: usize,
    malformed: usize,
}

impl ManifestScan {
    /// Lines skipped so far because they did not parse.
    pub fn malformed(&self) -> usize {
        self.malformed
    }
}

impl Iterator for ManifestScan {
    type Item = ProvenanceRecord;

    fn next(&mut self) -> Option<ProvenanceRecord> {
        let lines = self.lines.as_mut()?;
        loop {
            let line = match lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(line = self.line_no + 1, error = %e, "manifest read failed, stopping scan");
                    self.lines = None;
                    return None;
                }
            };
            self.line_no += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<ProvenanceRecord>(trimmed) {
                Ok(record) => return Some(record),
                Err(e) => {
                    self.malformed += 1;
                    let err = VaultError::MalformedRecord {
                        line: self.line_no,
                        reason: e.to_string(),
                    };
                    tracing::warn!("{}", err);
                }
            }
        }
    }
}

/// Keep the first record per identity tuple. Returns the kept records and
/// the number of duplicates dropped.
pub fn dedupe(records: Vec<ProvenanceRecord>) -> (Vec<ProvenanceRecord>, usize) {
    let mut seen = HashSet::new();
    let mut dropped = 0;
    let kept = records
        .into_iter()
        .filter(|r| {
            if seen.insert(r.identity()) {
                true
            } else {
                dropped += 1;
                false
            }
        })
        .collect();
    (kept, dropped)
}

/// Drop legacy mislabeled records.
///
/// A record is an anomaly when its `case` is null, its `kind` is not a known
/// [`IngestKind`], and another record sharing its artifact or source path has
/// a case. Two passes: the first maps each path identity to the cases seen
/// for it, the second applies the predicate. Every dropped record is logged.
pub fn cleanup(records: Vec<ProvenanceRecord>) -> (Vec<ProvenanceRecord>, Vec<ProvenanceRecord>) {
    let mut cases_by_identity: HashMap<String, HashSet<String>> = HashMap::new();
    for record in &records {
        if let Some(case) = &record.case {
            for key in identity_keys(record) {
                cases_by_identity
                    .entry(key)
                    .or_default()
                    .insert(case.clone());
            }
        }
    }

    let mut kept = Vec::with_capacity(records.len());
    let mut dropped = Vec::new();
    for record in records {
        let anomalous = record.case.is_none()
            && record.kind.known().is_none()
            && identity_keys(&record)
                .iter()
                .any(|k| cases_by_identity.get(k).is_some_and(|c| !c.is_empty()));

        if anomalous {
            tracing::warn!(
                kind = %record.kind,
                artifact_path = record.artifact_path.as_deref().unwrap_or(""),
                source_path = record.source_path.as_deref().unwrap_or(""),
                source_url = record.source_url.as_deref().unwrap_or(""),
                "dropping legacy kind/case anomaly"
            );
            dropped.push(record);
        } else {
            kept.push(record);
        }
    }
    (kept, dropped)
}

fn identity_keys(record: &ProvenanceRecord) -> Vec<String> {
    let mut keys = Vec::with_capacity(2);
    if let Some(p) = record.artifact_path.as_deref().filter(|p| !p.is_empty()) {
        keys.push(format!("artifact:{}", p));
    }
    if let Some(p) = record.source_path.as_deref().filter(|p| !p.is_empty()) {
        keys.push(format!("source:{}", p));
    }
    keys
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupOptions {
    pub dry_run: bool,
    pub drop_missing: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub loaded: usize,
    pub malformed_skipped: usize,
    pub kept: usize,
    pub dropped_anomalies: usize,
    pub dropped_duplicates: usize,
    pub dropped_missing: usize,
    pub backup: Option<PathBuf>,
    pub written: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn local(artifact: &str, case: Option<&str>) -> ProvenanceRecord {
        let mut r = ProvenanceRecord::new(IngestKind::LocalFile);
        r.artifact_path = Some(artifact.to_string());
        r.case = case.map(|c| c.to_string());
        r
    }

    fn parse(line: &str) -> ProvenanceRecord {
        serde_json::from_str(line).unwrap()
    }

    #[test]
    fn append_then_scan_in_order() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::new(dir.path().join("data/manifest.jsonl"));

        for i in 0..5 {
            let written = manifest.append(local(&format!("ocr/d{}.txt", i), None)).unwrap();
            assert!(written.id.is_some());
            assert!(written.timestamp.is_some());
        }

        let records = manifest.records().unwrap();
        assert_eq!(records.len(), 5);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r.document_id().unwrap(), format!("d{}", i));
        }
        // Restartable.
        assert_eq!(manifest.scan().unwrap().count(), 5);
    }

    #[test]
    fn append_rejects_unknown_kind() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::new(dir.path().join("m.jsonl"));
        let record = parse(r#"{"kind":"case_x","case":null,"artifact_path":"a.txt"}"#);
        assert!(matches!(
            manifest.append(record),
            Err(VaultError::InvalidRecord(_))
        ));
        assert!(!manifest.path().exists());
    }

    #[test]
    fn append_checks_source_fields() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::new(dir.path().join("m.jsonl"));

        let mut remote = ProvenanceRecord::new(IngestKind::WebHtml);
        assert!(manifest.append(remote.clone()).is_err());
        remote.source_url = Some("https://example.com/".into());
        remote.source_path = Some("/in/example.html".into());
        assert!(manifest.append(remote.clone()).is_err());
        remote.source_path = None;
        assert!(manifest.append(remote).is_ok());

        let mut local = ProvenanceRecord::new(IngestKind::LocalFile);
        local.source_url = Some("https://example.com/".into());
        assert!(manifest.append(local).is_err());
    }

    #[test]
    fn missing_manifest_scans_empty() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::new(dir.path().join("nope.jsonl"));
        assert_eq!(manifest.scan().unwrap().count(), 0);
    }

    #[test]
    fn scan_skips_malformed_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"kind":"local_file","artifact_path":"a.txt"}"#,
                "\n{not json\n\n",
                r#"["array"]"#,
                "\n",
                r#"{"kind":"url_fetch","source_url":"https://x.test/b.pdf","artifact_path":"b.txt"}"#,
                "\n",
            ),
        )
        .unwrap();

        let manifest = Manifest::new(&path);
        let mut scan = manifest.scan().unwrap();
        let records: Vec<_> = scan.by_ref().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(scan.malformed(), 2);
        assert_eq!(records[1].kind, RecordKind::Known(IngestKind::UrlFetch));
    }

    #[test]
    fn dedupe_keeps_first_of_each_tuple() {
        let a = local("a.txt", Some("c1"));
        let mut a_later = a.clone();
        a_later.content_hash = Some("different but same identity".into());
        let b = local("b.txt", Some("c1"));
        let a_other_case = local("a.txt", Some("c2"));

        let (kept, dropped) = dedupe(vec![
            a.clone(),
            b.clone(),
            a_later,
            a_other_case.clone(),
            b.clone(),
        ]);
        assert_eq!(dropped, 2);
        assert_eq!(kept, vec![a, b, a_other_case]);
    }

    #[test]
    fn cleanup_drops_kind_as_case_anomaly() {
        let anomaly = parse(r#"{"kind":"case_x","case":null,"artifact_path":"a.txt"}"#);
        let good = parse(r#"{"kind":"local_file","case":"case_x","artifact_path":"a.txt"}"#);

        let (kept, dropped) = cleanup(vec![anomaly.clone(), good.clone()]);
        assert_eq!(kept, vec![good]);
        assert_eq!(dropped, vec![anomaly]);
    }

    #[test]
    fn cleanup_keeps_unmatched_legacy_and_known_kinds() {
        // Legacy kind, but no cased sibling.
        let lonely = parse(r#"{"kind":"case_y","case":null,"artifact_path":"z.txt"}"#);
        // Known kind with null case next to a cased sibling is not an anomaly.
        let plain = parse(r#"{"kind":"local_file","case":null,"artifact_path":"a.txt"}"#);
        let cased = parse(r#"{"kind":"local_file","case":"c","artifact_path":"a.txt"}"#);
        // Legacy kind that has its own case is kept.
        let legacy_cased = parse(r#"{"kind":"case_x","case":"c","artifact_path":"a.txt"}"#);

        let (kept, dropped) = cleanup(vec![lonely, plain, cased, legacy_cased]);
        assert_eq!(kept.len(), 4);
        assert!(dropped.is_empty());
    }

    #[test]
    fn cleanup_matches_on_source_path_too() {
        let anomaly = parse(r#"{"kind":"epstein_1320","case":null,"pdf":"in/p.pdf","txt":"ocr/p_old.txt"}"#);
        let good = parse(r#"{"kind":"local_file","case":"epstein","pdf":"in/p.pdf","txt":"ocr/p.txt"}"#);
        let (kept, dropped) = cleanup(vec![anomaly, good]);
        assert_eq!(kept.len(), 1);
        assert_eq!(dropped.len(), 1);
    }

    #[test]
    fn cleanup_file_rewrites_with_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.jsonl");
        let original = concat!(
            r#"{"kind":"case_x","case":null,"artifact_path":"a.txt"}"#,
            "\n",
            r#"{"kind":"local_file","case":"case_x","artifact_path":"a.txt","ocr_engine":"tesseract"}"#,
            "\n",
            r#"{"kind":"local_file","case":"case_x","artifact_path":"a.txt"}"#,
            "\ngarbage\n",
        );
        std::fs::write(&path, original).unwrap();
        let manifest = Manifest::new(&path);

        let report = manifest
            .cleanup_file(&CleanupOptions {
                dry_run: true,
                drop_missing: false,
            })
            .unwrap();
        assert_eq!(report.kept, 1);
        assert!(!report.written);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);

        let report = manifest.cleanup_file(&CleanupOptions::default()).unwrap();
        assert_eq!(report.loaded, 3);
        assert_eq!(report.malformed_skipped, 1);
        assert_eq!(report.dropped_anomalies, 1);
        assert_eq!(report.dropped_duplicates, 1);
        assert_eq!(report.kept, 1);
        assert!(report.written);

        let backup = report.backup.unwrap();
        assert_eq!(backup, dir.path().join("manifest.jsonl.bak"));
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), original);
        assert!(!dir.path().join("manifest.jsonl.tmp").exists());

        let records = manifest.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].case.as_deref(), Some("case_x"));
        // Unknown fields survive the rewrite.
        assert_eq!(records[0].extra.get("ocr_engine").unwrap(), "tesseract");
    }

    #[test]
    fn cleanup_file_drop_missing() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("ocr")).unwrap();
        std::fs::write(dir.path().join("ocr/present.txt"), "x").unwrap();

        let manifest = Manifest::new(dir.path().join("manifest.jsonl"));
        manifest.append(local("ocr/present.txt", None)).unwrap();
        manifest.append(local("ocr/gone.txt", None)).unwrap();

        let report = manifest
            .cleanup_file(&CleanupOptions {
                dry_run: false,
                drop_missing: true,
            })
            .unwrap();
        assert_eq!(report.dropped_missing, 1);
        let records = manifest.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].document_id().as_deref(), Some("present"));
    }

    #[test]
    fn clean_manifest_is_left_untouched() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::new(dir.path().join("manifest.jsonl"));
        manifest.append(local("a.txt", None)).unwrap();
        let report = manifest.cleanup_file(&CleanupOptions::default()).unwrap();
        assert!(!report.written);
        assert!(!manifest.backup_path().exists());
    }

    #[test]
    fn latest_record_per_document() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::new(dir.path().join("manifest.jsonl"));
        manifest.append(local("ocr/r.txt", Some("old"))).unwrap();
        manifest.append(local("ocr/r.txt", Some("new"))).unwrap();
        manifest.append(local("ocr/s.txt", None)).unwrap();

        let latest = manifest.latest_by_doc_id().unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["r"].case.as_deref(), Some("new"));
        assert_eq!(manifest.find("r").unwrap().len(), 2);
    }
}
