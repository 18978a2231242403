//! Remote retrieval.
//!
//! [`Fetcher`] wraps a shared `reqwest::Client` configured with a per-request
//! timeout and an explicit redirect bound. Each call to [`Fetcher::fetch`]
//! makes exactly one logical request; retry policy belongs to the caller.
//!
//! Downloads are named from the URL with [`safe_filename`], which never
//! yields a path separator or a `..` component since the URL is untrusted.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use url::Url;

use crate::config::FetchConfig;
use crate::error::{FetchError, Result, VaultError};
use crate::models::ProvenanceSidecar;

/// Longest file name produced by [`safe_filename`], extension included.
const MAX_FILENAME_CHARS: usize = 150;

/// Bytes and metadata of one successful fetch.
#[derive(Debug, Clone)]
pub struct FetchedResource {
    /// URL as requested.
    pub url: String,
    /// URL after redirects.
    pub final_url: String,
    pub bytes: Vec<u8>,
    /// Declared `Content-Type` header, verbatim.
    pub content_type: Option<String>,
    /// SHA-256 of `bytes`, lowercase hex.
    pub content_hash: String,
}

impl FetchedResource {
    /// Lowercased media type without parameters (`text/html; charset=utf-8` → `text/html`).
    pub fn mime(&self) -> Option<String> {
        self.content_type.as_deref().map(mime_essence)
    }

    pub fn is_html(&self) -> bool {
        matches!(self.mime().as_deref(), Some("text/html") | Some("application/xhtml+xml"))
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// A download written to disk.
#[derive(Debug, Clone)]
pub struct StoredDownload {
    pub path: PathBuf,
    pub sidecar: Option<PathBuf>,
}

/// HTTP retrieval with a bounded timeout, redirect count and body size.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    user_agent: String,
    max_bytes: u64,
}

impl Fetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| FetchError::Transport {
                url: String::new(),
                reason: format!("could not build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            user_agent: config.user_agent.clone(),
            max_bytes: config.max_bytes,
        })
    }

    /// The shared client, reused for robots.txt and discovery requests.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Download `url` once. Non-2xx statuses are errors, never documents.
    pub async fn fetch(&self, url: &str) -> std::result::Result<FetchedResource, FetchError> {
        let parsed = parse_http_url(url)?;
        tracing::debug!(url = %parsed, "fetching");

        let mut response = self
            .client
            .get(parsed.clone())
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    limit: self.max_bytes,
                });
            }
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| FetchError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        })? {
            if (bytes.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(FetchError::TooLarge {
                    url: url.to_string(),
                    limit: self.max_bytes,
                });
            }
            bytes.extend_from_slice(&chunk);
        }

        let content_hash = sha256_hex(&bytes);
        tracing::info!(
            url = %url,
            bytes = bytes.len(),
            content_type = content_type.as_deref().unwrap_or("unknown"),
            "fetched"
        );

        Ok(FetchedResource {
            url: url.to_string(),
            final_url,
            bytes,
            content_type,
            content_hash,
        })
    }
}

/// Write a fetched resource into `dir`, optionally with a `.meta.json` sidecar.
///
/// `name` overrides the URL-derived name; it is sanitized the same way.
pub fn store_download(
    resource: &FetchedResource,
    dir: &Path,
    name: Option<&str>,
    sidecar: bool,
) -> Result<StoredDownload> {
    std::fs::create_dir_all(dir)?;

    let filename = match name {
        Some(n) => sanitize_component(n).ok_or_else(|| VaultError::InvalidSource {
            source_ref: n.to_string(),
            reason: "file name is empty after sanitizing".to_string(),
        })?,
        None => {
            let url = parse_http_url(&resource.url)?;
            safe_filename(&url, resource.mime().as_deref())
        }
    };

    let path = dir.join(&filename);
    std::fs::write(&path, &resource.bytes)?;

    let sidecar_path = if sidecar {
        let meta = ProvenanceSidecar {
            source_url: resource.url.clone(),
            stored_filename: filename.clone(),
            downloaded_at: Utc::now(),
            content_hash: resource.content_hash.clone(),
            content_type: resource.content_type.clone(),
            size_bytes: resource.size_bytes(),
        };
        let meta_path = dir.join(format!("{}.meta.json", filename));
        std::fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)?;
        Some(meta_path)
    } else {
        None
    };

    Ok(StoredDownload {
        path,
        sidecar: sidecar_path,
    })
}

/// Parse `s` and require an `http` or `https` scheme.
pub fn parse_http_url(s: &str) -> std::result::Result<Url, FetchError> {
    let url = Url::parse(s.trim()).map_err(|e| FetchError::InvalidUrl {
        url: s.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(FetchError::InvalidUrl {
            url: s.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

/// Derive a file name for a download.
///
/// Uses the last path segment when it looks like a file (has an extension),
/// otherwise a slug of host and path. A missing extension is filled in from
/// the media type.
pub fn safe_filename(url: &Url, mime: Option<&str>) -> String {
    let last = url
        .path_segments()
        .and_then(|segs| segs.filter(|s| !s.is_empty()).last())
        .map(|seg| {
            urlencoding::decode(seg)
                .map(|d| d.into_owned())
                .unwrap_or_else(|_| seg.to_string())
        });

    let from_segment = last
        .filter(|seg| !is_traversal(seg))
        .and_then(|seg| sanitize_component(&seg))
        .filter(|name| name.contains('.'));

    let mut name = match from_segment {
        Some(n) => n,
        None => {
            let slug = url_slug(url);
            if slug.is_empty() {
                "download".to_string()
            } else {
                slug
            }
        }
    };

    if !name.contains('.') {
        if let Some(ext) = mime.and_then(extension_for_mime) {
            name.push('.');
            name.push_str(ext);
        }
    }

    truncate_name(name)
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_` and drop leading dots.
/// Returns `None` when nothing usable remains.
pub fn sanitize_component(raw: &str) -> Option<String> {
    if is_traversal(raw) {
        return None;
    }
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim_matches('_').to_string();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.' || c == '_') {
        None
    } else {
        Some(truncate_name(cleaned))
    }
}

fn is_traversal(seg: &str) -> bool {
    seg.contains("..") || seg.contains('/') || seg.contains('\\') || seg.contains('\0')
}

/// `https://Example.com/Docs/Annual Report/` → `example_com_docs_annual_report`.
pub fn url_slug(url: &Url) -> String {
    let base = format!("{}{}", url.host_str().unwrap_or(""), url.path()).to_lowercase();
    let mut slug = String::with_capacity(base.len());
    let mut last_sep = false;
    for c in base.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_sep = false;
        } else if !last_sep {
            slug.push('_');
            last_sep = true;
        }
    }
    slug.trim_matches('_').to_string()
}

fn truncate_name(name: String) -> String {
    if name.chars().count() <= MAX_FILENAME_CHARS {
        return name;
    }
    match name.rfind('.') {
        Some(dot) if name.len() - dot <= 10 => {
            let ext = &name[dot..];
            let stem: String = name[..dot]
                .chars()
                .take(MAX_FILENAME_CHARS - ext.len())
                .collect();
            format!("{}{}", stem, ext)
        }
        _ => name.chars().take(MAX_FILENAME_CHARS).collect(),
    }
}

/// `text/HTML; charset=UTF-8` → `text/html`.
pub fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    match mime_essence(mime).as_str() {
        "application/pdf" => Some("pdf"),
        "text/html" | "application/xhtml+xml" => Some("html"),
        "text/csv" => Some("csv"),
        "text/plain" => Some("txt"),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => Some("docx"),
        _ => None,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn filename_from_last_segment() {
        assert_eq!(
            safe_filename(&url("https://example.com/files/p463.pdf"), None),
            "p463.pdf"
        );
        assert_eq!(
            safe_filename(&url("https://example.com/files/My%20Report.pdf"), None),
            "My_Report.pdf"
        );
    }

    #[test]
    fn filename_slug_for_pages() {
        assert_eq!(
            safe_filename(&url("https://Example.com/news/local/"), Some("text/html")),
            "example_com_news_local.html"
        );
        assert_eq!(
            safe_filename(&url("https://example.com/"), None),
            "example_com"
        );
    }

    #[test]
    fn filename_rejects_encoded_traversal() {
        let name = safe_filename(&url("https://evil.test/a/%2e%2e%2f%2e%2e%2fetc%2fpasswd"), None);
        assert!(!name.contains(".."));
        assert!(!name.contains('/'));
        let name = safe_filename(&url("https://evil.test/..%5c..%5cboot.ini"), None);
        assert!(!name.contains(".."));
        assert!(!name.contains('\\'));
    }

    #[test]
    fn sanitize_component_cases() {
        assert_eq!(sanitize_component("report.pdf").as_deref(), Some("report.pdf"));
        assert_eq!(sanitize_component(".hidden.txt").as_deref(), Some("hidden.txt"));
        assert_eq!(sanitize_component("a b:c.txt").as_deref(), Some("a_b_c.txt"));
        assert!(sanitize_component("..").is_none());
        assert!(sanitize_component("../x").is_none());
        assert!(sanitize_component("///").is_none());
    }

    #[test]
    fn long_names_keep_extension() {
        let long = format!("https://example.com/{}.pdf", "a".repeat(400));
        let name = safe_filename(&url(&long), None);
        assert!(name.ends_with(".pdf"));
        assert!(name.chars().count() <= MAX_FILENAME_CHARS);
    }

    #[test]
    fn rejects_non_http_scheme() {
        assert!(matches!(
            parse_http_url("file:///etc/passwd"),
            Err(FetchError::InvalidUrl { .. })
        ));
        assert!(parse_http_url("https://example.com/x").is_ok());
    }

    #[test]
    fn mime_essence_strips_params() {
        assert_eq!(mime_essence("Text/HTML; charset=UTF-8"), "text/html");
    }

    #[test]
    fn hash_is_content_addressed() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn store_writes_sidecar() {
        let dir = tempfile::TempDir::new().unwrap();
        let resource = FetchedResource {
            url: "https://example.com/docs/p1.pdf".into(),
            final_url: "https://example.com/docs/p1.pdf".into(),
            bytes: b"%PDF-1.4".to_vec(),
            content_type: Some("application/pdf".into()),
            content_hash: sha256_hex(b"%PDF-1.4"),
        };
        let stored = store_download(&resource, dir.path(), None, true).unwrap();
        assert_eq!(stored.path, dir.path().join("p1.pdf"));
        let meta: ProvenanceSidecar =
            serde_json::from_str(&std::fs::read_to_string(stored.sidecar.unwrap()).unwrap())
                .unwrap();
        assert_eq!(meta.stored_filename, "p1.pdf");
        assert_eq!(meta.size_bytes, 8);
        assert_eq!(meta.content_hash, resource.content_hash);
    }
}
