//! Manifest inspection: listings, per-document views and per-case totals.
//!
//! Everything here reads the manifest only. Used by `vault list-manifest`,
//! `vault show` and `vault cases`.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::Result;
use crate::manifest::Manifest;
use crate::models::{IngestKind, ProvenanceRecord};
use crate::search::snippet_prefix;

/// Label used for records without a case.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Records in file order, optionally narrowed by case and kind.
pub fn list_records(
    manifest: &Manifest,
    case: Option<&str>,
    kind: Option<IngestKind>,
) -> Result<Vec<ProvenanceRecord>> {
    Ok(manifest
        .records()?
        .into_iter()
        .filter(|r| case.is_none() || r.case.as_deref() == case)
        .filter(|r| kind.is_none() || r.kind.known() == kind)
        .collect())
}

/// One line per record: timestamp, kind, case, document id, source.
pub fn format_listing(records: &[ProvenanceRecord]) -> String {
    if records.is_empty() {
        return "No manifest records.\n".to_string();
    }
    let mut out = String::new();
    out.push_str(&format!(
        "{:<20} {:<12} {:<20} {:<28} {}\n",
        "TIMESTAMP", "KIND", "CASE", "DOC", "SOURCE"
    ));
    for r in records {
        let ts = r
            .timestamp
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let source = r
            .source_url
            .as_deref()
            .or(r.source_path.as_deref())
            .unwrap_or("-");
        out.push_str(&format!(
            "{:<20} {:<12} {:<20} {:<28} {}\n",
            ts,
            r.kind.as_str(),
            r.case.as_deref().unwrap_or("-"),
            r.document_id().unwrap_or_else(|| "-".to_string()),
            source
        ));
    }
    out
}

/// Everything the manifest knows about one document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    pub doc_id: String,
    /// All records for the document, oldest first.
    pub records: Vec<ProvenanceRecord>,
    /// Start of the latest artifact, when it can be read.
    pub excerpt: Option<String>,
}

/// `None` when no record carries `doc_id`.
pub fn show_document(
    manifest: &Manifest,
    doc_id: &str,
    excerpt_chars: usize,
) -> Result<Option<DocumentView>> {
    let records = manifest.find(doc_id)?;
    let Some(latest) = records.last() else {
        return Ok(None);
    };

    let excerpt = latest
        .artifact_path
        .as_deref()
        .map(|p| manifest.resolve(p))
        .and_then(|p| std::fs::read_to_string(p).ok())
        .map(|text| snippet_prefix(&text, excerpt_chars));

    Ok(Some(DocumentView {
        doc_id: doc_id.to_string(),
        records,
        excerpt,
    }))
}

pub fn format_document(view: &DocumentView) -> String {
    let mut out = format!("Document {}\n", view.doc_id);
    for (i, r) in view.records.iter().enumerate() {
        out.push_str(&format!("\n  record {} of {}\n", i + 1, view.records.len()));
        let field = |name: &str, value: Option<&str>| -> String {
            match value {
                Some(v) => format!("    {:<13} {}\n", name, v),
                None => String::new(),
            }
        };
        out.push_str(&field("id:", r.id.as_deref()));
        out.push_str(&field("kind:", Some(r.kind.as_str())));
        out.push_str(&field("case:", r.case.as_deref()));
        out.push_str(&field("tenant:", r.tenant.as_deref()));
        out.push_str(&field("collection:", r.collection.as_deref()));
        if !r.tags.is_empty() {
            out.push_str(&field("tags:", Some(&r.tags.join(", "))));
        }
        out.push_str(&field("source_url:", r.source_url.as_deref()));
        out.push_str(&field("source_path:", r.source_path.as_deref()));
        out.push_str(&field("artifact:", r.artifact_path.as_deref()));
        out.push_str(&field("content_type:", r.content_type.as_deref()));
        out.push_str(&field("sha256:", r.content_hash.as_deref()));
        if let Some(ts) = r.timestamp {
            out.push_str(&field("timestamp:", Some(&ts.to_rfc3339())));
        }
    }
    match view.excerpt {
        Some(ref excerpt) => out.push_str(&format!("\n  excerpt:\n    {}\n", excerpt)),
        None => out.push_str("\n  excerpt: (artifact unavailable)\n"),
    }
    out
}

/// Record count for one case, broken down by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseTotals {
    pub case: String,
    pub total: usize,
    pub kinds: BTreeMap<String, usize>,
}

/// Totals per case, sorted by case name. Records without a case are
/// grouped under [`UNCATEGORIZED`].
pub fn case_totals(records: &[ProvenanceRecord]) -> Vec<CaseTotals> {
    let mut by_case: BTreeMap<String, CaseTotals> = BTreeMap::new();
    for r in records {
        let case = r
            .case
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(UNCATEGORIZED);
        let entry = by_case.entry(case.to_string()).or_insert_with(|| CaseTotals {
            case: case.to_string(),
            total: 0,
            kinds: BTreeMap::new(),
        });
        entry.total += 1;
        *entry.kinds.entry(r.kind.as_str().to_string()).or_insert(0) += 1;
    }
    by_case.into_values().collect()
}

pub fn format_cases(totals: &[CaseTotals]) -> String {
    if totals.is_empty() {
        return "No manifest records.\n".to_string();
    }
    let mut out = format!("  {:<28} {:>6}   {}\n", "CASE", "DOCS", "KINDS");
    out.push_str(&format!("  {}\n", "-".repeat(60)));
    for t in totals {
        let kinds: Vec<String> = t.kinds.iter().map(|(k, n)| format!("{}={}", k, n)).collect();
        out.push_str(&format!("  {:<28} {:>6}   {}\n", t.case, t.total, kinds.join(" ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rec(kind: IngestKind, case: Option<&str>, artifact: &str) -> ProvenanceRecord {
        let mut r = ProvenanceRecord::new(kind);
        r.case = case.map(str::to_string);
        r.artifact_path = Some(artifact.to_string());
        if kind.is_remote() {
            r.source_url = Some(format!("https://example.com/{}", artifact));
        } else {
            r.source_path = Some(format!("/in/{}", artifact));
        }
        r
    }

    #[test]
    fn totals_group_uncategorized() {
        let records = vec![
            rec(IngestKind::LocalFile, Some("harbor"), "a.txt"),
            rec(IngestKind::WebHtml, Some("harbor"), "b.txt"),
            rec(IngestKind::WebHtml, Some("harbor"), "c.txt"),
            rec(IngestKind::UrlFetch, None, "d.txt"),
        ];
        let totals = case_totals(&records);
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].case, "harbor");
        assert_eq!(totals[0].total, 3);
        assert_eq!(totals[0].kinds.get("web_html"), Some(&2));
        assert_eq!(totals[1].case, UNCATEGORIZED);
        assert!(format_cases(&totals).contains("local_file=1 web_html=2"));
    }

    #[test]
    fn listing_filters_by_case_and_kind() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::new(dir.path().join("manifest.jsonl"));
        manifest.append(rec(IngestKind::LocalFile, Some("a"), "one.txt")).unwrap();
        manifest.append(rec(IngestKind::WebHtml, Some("a"), "two.txt")).unwrap();
        manifest.append(rec(IngestKind::WebHtml, Some("b"), "three.txt")).unwrap();

        assert_eq!(list_records(&manifest, None, None).unwrap().len(), 3);
        assert_eq!(list_records(&manifest, Some("a"), None).unwrap().len(), 2);
        let web_a = list_records(&manifest, Some("a"), Some(IngestKind::WebHtml)).unwrap();
        assert_eq!(web_a.len(), 1);
        assert_eq!(web_a[0].document_id().as_deref(), Some("two"));

        let listing = format_listing(&web_a);
        assert!(listing.contains("web_html"));
        assert!(listing.contains("https://example.com/two.txt"));
    }

    #[test]
    fn show_includes_excerpt() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("memo.txt");
        std::fs::write(&artifact, "Harbor   permit\nrenewal notice").unwrap();
        let manifest = Manifest::new(dir.path().join("manifest.jsonl"));
        manifest
            .append(rec(IngestKind::LocalFile, Some("x"), &artifact.display().to_string()))
            .unwrap();

        let view = show_document(&manifest, "memo", 14).unwrap().unwrap();
        assert_eq!(view.records.len(), 1);
        assert_eq!(view.excerpt.as_deref(), Some("Harbor permit"));
        assert!(format_document(&view).contains("kind:"));

        assert!(show_document(&manifest, "absent", 10).unwrap().is_none());
    }
}
