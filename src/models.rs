//! Core data models shared by the ingestion, manifest and query layers.
//!
//! A [`ProvenanceRecord`] is one line of the manifest. Its `kind` is typed:
//! records written by this crate always carry a known [`IngestKind`], while
//! older ledgers may contain free-form kinds that only the cleanup pass
//! interprets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Origin and content class of an ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestKind {
    LocalFile,
    UrlFetch,
    WebHtml,
    WebDocx,
    WebCsv,
    WebText,
    TestRecord,
}

impl IngestKind {
    pub const ALL: [IngestKind; 7] = [
        IngestKind::LocalFile,
        IngestKind::UrlFetch,
        IngestKind::WebHtml,
        IngestKind::WebDocx,
        IngestKind::WebCsv,
        IngestKind::WebText,
        IngestKind::TestRecord,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IngestKind::LocalFile => "local_file",
            IngestKind::UrlFetch => "url_fetch",
            IngestKind::WebHtml => "web_html",
            IngestKind::WebDocx => "web_docx",
            IngestKind::WebCsv => "web_csv",
            IngestKind::WebText => "web_text",
            IngestKind::TestRecord => "test_record",
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, IngestKind::LocalFile | IngestKind::TestRecord)
    }
}

impl fmt::Display for IngestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IngestKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown kind '{}'. Expected one of: {}",
                    s,
                    IngestKind::ALL
                        .iter()
                        .map(|k| k.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
    }
}

/// Kind as stored on disk. `Legacy` holds values written by older tooling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKind {
    Known(IngestKind),
    Legacy(String),
}

impl RecordKind {
    pub fn as_str(&self) -> &str {
        match self {
            RecordKind::Known(k) => k.as_str(),
            RecordKind::Legacy(s) => s.as_str(),
        }
    }

    pub fn known(&self) -> Option<IngestKind> {
        match self {
            RecordKind::Known(k) => Some(*k),
            RecordKind::Legacy(_) => None,
        }
    }
}

impl From<IngestKind> for RecordKind {
    fn from(kind: IngestKind) -> Self {
        RecordKind::Known(kind)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable manifest entry describing how a document entered the vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub kind: RecordKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(default, alias = "pdf")]
    pub source_path: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default, alias = "txt")]
    pub artifact_path: Option<String>,
    #[serde(default)]
    pub case: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Fields this version does not interpret; kept for round trips.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProvenanceRecord {
    pub fn new(kind: IngestKind) -> Self {
        Self {
            id: None,
            kind: RecordKind::Known(kind),
            doc_id: None,
            source_path: None,
            source_url: None,
            artifact_path: None,
            case: None,
            tenant: None,
            tags: Vec::new(),
            collection: None,
            timestamp: None,
            content_hash: None,
            content_type: None,
            size_bytes: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_labels(mut self, labels: &IngestLabels) -> Self {
        self.case = labels.case.clone();
        self.tenant = labels.tenant.clone();
        self.tags = labels.tags.clone();
        self.collection = labels.collection.clone();
        self
    }

    /// Document identity: the explicit `doc_id`, else the artifact stem.
    pub fn document_id(&self) -> Option<String> {
        if let Some(ref id) = self.doc_id {
            return Some(id.clone());
        }
        self.artifact_path
            .as_deref()
            .and_then(|p| document_id_for(Path::new(p)))
    }

    /// The `(kind, case, artifact_path, source_url)` tuple used by dedupe.
    pub fn identity(&self) -> IdentityTuple {
        IdentityTuple {
            kind: self.kind.as_str().to_string(),
            case: self.case.clone(),
            artifact_path: self.artifact_path.clone(),
            source_url: self.source_url.clone(),
        }
    }
}

/// Deduplication key of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityTuple {
    pub kind: String,
    pub case: Option<String>,
    pub artifact_path: Option<String>,
    pub source_url: Option<String>,
}

/// Stem of an extracted-text artifact name.
pub fn document_id_for(artifact: &Path) -> Option<String> {
    artifact
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
}

/// Caller-supplied grouping labels attached to an ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestLabels {
    pub case: Option<String>,
    pub tenant: Option<String>,
    pub tags: Vec<String>,
    pub collection: Option<String>,
}

impl IngestLabels {
    pub fn case(case: impl Into<String>) -> Self {
        Self {
            case: Some(case.into()),
            ..Self::default()
        }
    }
}

/// Audit file written next to each fetched download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceSidecar {
    pub source_url: String,
    pub stored_filename: String,
    pub downloaded_at: DateTime<Utc>,
    pub content_hash: String,
    pub content_type: Option<String>,
    pub size_bytes: u64,
}

/// A search hit joined with manifest metadata.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub doc_id: String,
    pub source: String,
    pub score: f64,
    pub case: Option<String>,
    pub kind: Option<String>,
    pub tenant: Option<String>,
    pub tags: Vec<String>,
    pub collection: Option<String>,
    pub source_url: Option<String>,
    pub snippet: String,
}
