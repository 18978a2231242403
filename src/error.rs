//! Typed errors for the vault library.
//!
//! Library operations return [`VaultError`]; the `vault` binary wraps them in
//! `anyhow` at the edge. Fetch and extraction failures have their own enums
//! so batch callers can count them per class.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// A local source did not resolve to an existing file.
    #[error("source not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// Remote retrieval failed (transport, status, or size limit).
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The extraction collaborator could not produce text.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// A manifest line failed to parse. Scans recover from this locally.
    #[error("malformed manifest record on line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    /// The index engine could not be opened.
    #[error("index unavailable at {}: {reason}", path.display())]
    IndexUnavailable { path: PathBuf, reason: String },

    /// An index query or upsert failed after the engine was opened.
    #[error("index error: {0}")]
    Index(String),

    /// The ingestion request could not be classified or named.
    #[error("invalid source '{source_ref}': {reason}")]
    InvalidSource { source_ref: String, reason: String },

    /// A record was rejected at the manifest boundary.
    #[error("invalid provenance record: {0}")]
    InvalidRecord(String),

    /// The item was not started because the batch was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while fetching a remote resource.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection, TLS, timeout or body read failure.
    #[error("failed to fetch {url}: {reason}")]
    Transport { url: String, reason: String },

    /// The server answered with a non-2xx status.
    #[error("failed to fetch {url}: HTTP {status}")]
    Status { url: String, status: u16 },

    /// The body exceeded the configured download cap.
    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: u64 },

    /// The URL could not be parsed or uses a scheme other than http(s).
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Errors raised by the extraction collaborator.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),

    #[error("could not read {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },

    /// Extraction succeeded but produced no text (e.g. a scanned PDF).
    #[error("no text extracted from {}", path.display())]
    Empty { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, VaultError>;

impl VaultError {
    /// Short class label used in batch summaries and logs.
    pub fn class(&self) -> &'static str {
        match self {
            VaultError::NotFound { .. } => "not_found",
            VaultError::Fetch(_) => "fetch",
            VaultError::Extraction(_) => "extraction",
            VaultError::MalformedRecord { .. } => "malformed_record",
            VaultError::IndexUnavailable { .. } => "index_unavailable",
            VaultError::Index(_) => "index",
            VaultError::InvalidSource { .. } => "invalid_source",
            VaultError::InvalidRecord(_) => "invalid_record",
            VaultError::Cancelled => "cancelled",
            VaultError::Io(_) => "io",
            VaultError::Json(_) => "json",
        }
    }
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(e: tokio::task::JoinError) -> Self {
        VaultError::Io(std::io::Error::other(e.to_string()))
    }
}

impl From<sqlx::Error> for VaultError {
    fn from(e: sqlx::Error) -> Self {
        VaultError::Index(e.to_string())
    }
}
