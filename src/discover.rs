//! Search-provider discovery.
//!
//! Providers turn a free-text query into candidate document URLs. Each one
//! returns `Result<Vec<DiscoveredLink>, ProviderError>`; [`metasearch`]
//! merges them, so an outage at one provider costs results, never the run.

use std::collections::HashSet;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::config::DiscoveryConfig;
use crate::fetch::Fetcher;

const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";
const DUCKDUCKGO_ENDPOINT: &str = "https://html.duckduckgo.com/html/";

/// A candidate URL found by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredLink {
    pub provider: String,
    pub title: String,
    pub url: String,
    pub snippet: String,
    /// 1-based position in the provider's own results.
    pub rank: usize,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no search providers configured")]
    NoProviders,

    #[error("{provider} request failed: {reason}")]
    Request { provider: String, reason: String },

    #[error("{provider} returned HTTP {status}")]
    Status { provider: String, status: u16 },

    #[error("could not parse {provider} response: {reason}")]
    Parse { provider: String, reason: String },
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, max_results: usize)
        -> Result<Vec<DiscoveredLink>, ProviderError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Brave Search API
// ═══════════════════════════════════════════════════════════════════════

pub struct BraveProvider {
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: Option<BraveWeb>,
}

#[derive(Debug, Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    description: String,
}

impl BraveProvider {
    pub fn new(api_key: String, client: reqwest::Client) -> Self {
        Self { api_key, client }
    }

    /// Build from the environment variable named by `key_env`, if it is set.
    pub fn from_env(key_env: &str, client: reqwest::Client) -> Option<Self> {
        std::env::var(key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(|k| Self::new(k, client))
    }
}

#[async_trait]
impl SearchProvider for BraveProvider {
    fn name(&self) -> &str {
        "brave"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<DiscoveredLink>, ProviderError> {
        let url = format!(
            "{}?q={}&count={}",
            BRAVE_ENDPOINT,
            urlencoding::encode(query),
            max_results
        );
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                provider: self.name().to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ProviderError::Status {
                provider: self.name().to_string(),
                status: response.status().as_u16(),
            });
        }

        let body = response.text().await.map_err(|e| ProviderError::Request {
            provider: self.name().to_string(),
            reason: e.to_string(),
        })?;
        let mut links = parse_brave_response(&body)?;
        links.truncate(max_results);
        Ok(links)
    }
}

pub fn parse_brave_response(body: &str) -> Result<Vec<DiscoveredLink>, ProviderError> {
    let parsed: BraveResponse = serde_json::from_str(body).map_err(|e| ProviderError::Parse {
        provider: "brave".to_string(),
        reason: e.to_string(),
    })?;

    Ok(parsed
        .web
        .map(|w| w.results)
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, r)| DiscoveredLink {
            provider: "brave".to_string(),
            title: r.title,
            url: r.url,
            snippet: r.description,
            rank: i + 1,
        })
        .collect())
}

// ═══════════════════════════════════════════════════════════════════════
// DuckDuckGo HTML
// ═══════════════════════════════════════════════════════════════════════

/// Scrapes the JavaScript-free DuckDuckGo results page. The markup is not a
/// stable API; a layout change shows up as zero results, not an error.
pub struct DuckDuckGoProvider {
    client: reqwest::Client,
}

impl DuckDuckGoProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoProvider {
    fn name(&self) -> &str {
        "duckduckgo"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<DiscoveredLink>, ProviderError> {
        let url = format!("{}?q={}", DUCKDUCKGO_ENDPOINT, urlencoding::encode(query));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::Request {
                provider: self.name().to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ProviderError::Status {
                provider: self.name().to_string(),
                status: response.status().as_u16(),
            });
        }

        let html = response.text().await.map_err(|e| ProviderError::Request {
            provider: self.name().to_string(),
            reason: e.to_string(),
        })?;
        let mut links = parse_duckduckgo_html(&html);
        links.truncate(max_results);
        Ok(links)
    }
}

/// Result links from a DuckDuckGo HTML page. Redirect links
/// (`/l/?uddg=<target>`) are unwrapped; other DuckDuckGo-internal links are
/// skipped.
pub fn parse_duckduckgo_html(html: &str) -> Vec<DiscoveredLink> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let Ok(base) = Url::parse(DUCKDUCKGO_ENDPOINT) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for anchor in document.select(&selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Some(target) = unwrap_duckduckgo_link(&base, href) else {
            continue;
        };
        if !seen.insert(target.clone()) {
            continue;
        }
        let title = anchor.text().collect::<Vec<_>>().join(" ");
        links.push(DiscoveredLink {
            provider: "duckduckgo".to_string(),
            title: title.split_whitespace().collect::<Vec<_>>().join(" "),
            url: target,
            snippet: String::new(),
            rank: links.len() + 1,
        });
    }
    links
}

fn unwrap_duckduckgo_link(base: &Url, href: &str) -> Option<String> {
    let url = base.join(href.trim()).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let internal = host == "duckduckgo.com" || host.ends_with(".duckduckgo.com");

    let target = if internal {
        let (_, target) = url.query_pairs().find(|(k, _)| k == "uddg")?;
        Url::parse(&target).ok()?
    } else {
        url
    };

    match target.scheme() {
        "http" | "https" => {}
        _ => return None,
    }
    let target_host = target.host_str()?.to_ascii_lowercase();
    if target_host == "duckduckgo.com" || target_host.ends_with(".duckduckgo.com") {
        return None;
    }
    Some(target.to_string())
}

// ═══════════════════════════════════════════════════════════════════════
// Metasearch
// ═══════════════════════════════════════════════════════════════════════

/// Providers enabled by `config`. Brave is included only when its key
/// variable is set.
pub fn providers_from_config(
    config: &DiscoveryConfig,
    fetcher: &Fetcher,
) -> Vec<Box<dyn SearchProvider>> {
    let mut providers: Vec<Box<dyn SearchProvider>> = Vec::new();
    match BraveProvider::from_env(&config.brave_api_key_env, fetcher.client().clone()) {
        Some(brave) => providers.push(Box::new(brave)),
        None => tracing::debug!(env = %config.brave_api_key_env, "brave provider disabled, key not set"),
    }
    if config.duckduckgo {
        providers.push(Box::new(DuckDuckGoProvider::new(fetcher.client().clone())));
    }
    providers
}

/// Query every provider and merge results, de-duplicated by URL with the
/// first occurrence kept. A failing provider is logged and skipped.
pub async fn metasearch(
    providers: &[Box<dyn SearchProvider>],
    query: &str,
    limit: usize,
) -> Result<Vec<DiscoveredLink>, ProviderError> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }
    if providers.is_empty() {
        return Err(ProviderError::NoProviders);
    }

    let per_provider = (limit / providers.len()).max(5);
    let mut seen = HashSet::new();
    let mut merged = Vec::new();

    for provider in providers {
        let results = match provider.search(query, per_provider).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(provider = provider.name(), error = %e, "search provider failed");
                continue;
            }
        };
        tracing::debug!(provider = provider.name(), results = results.len(), "provider results");

        for link in results {
            if !link.url.starts_with("http") || !seen.insert(link.url.clone()) {
                continue;
            }
            merged.push(link);
            if merged.len() >= limit {
                return Ok(merged);
            }
        }
    }
    Ok(merged)
}
