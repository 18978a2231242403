//! Polite breadth-first crawler.
//!
//! The frontier is a FIFO of `(url, depth)` pairs with a visited set, so a URL
//! is processed at most once however many pages link to it. Before each fetch
//! the crawler consults the per-origin robots cache (disallowed URLs are
//! neither fetched nor reported) and waits on the per-origin throttle.
//! Every fetched URL, including failed fetches, is handed to a
//! [`CrawlHandler`]; handler errors are logged and counted but never stop
//! the crawl.
//!
//! Cancellation is checked once per frontier pop, and an in-flight throttle
//! wait or fetch is abandoned as soon as the token fires.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::CrawlConfig;
use crate::error::{FetchError, Result};
use crate::fetch::{parse_http_url, FetchedResource, Fetcher};
use crate::robots::{origin_key, RobotsCache};
use crate::throttle::DomainThrottle;

/// Traversal bounds.
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub max_depth: usize,
    pub same_domain_only: bool,
    /// Minimum spacing between request starts to one origin.
    pub delay: Duration,
    /// Stop after this many fetch attempts.
    pub max_pages: Option<usize>,
}

impl From<&CrawlConfig> for CrawlOptions {
    fn from(config: &CrawlConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            same_domain_only: config.same_domain_only,
            delay: config.delay(),
            max_pages: config.max_pages,
        }
    }
}

/// One visited URL as seen by the handler.
#[derive(Debug)]
pub struct CrawledPage {
    pub url: String,
    pub depth: usize,
    /// Body of an HTML response; `None` for other content or failed fetches.
    pub html: Option<String>,
    pub fetched: std::result::Result<FetchedResource, FetchError>,
}

/// Per-document callback.
#[async_trait]
pub trait CrawlHandler: Send + Sync {
    async fn on_document(&self, page: &CrawledPage) -> Result<()>;
}

/// Counters reported at the end of a crawl.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    pub visited: usize,
    pub fetched: usize,
    pub fetch_failed: usize,
    pub skipped_robots: usize,
    pub handler_failed: usize,
    pub invalid_seeds: usize,
    pub cancelled: bool,
}

impl CrawlSummary {
    /// Items that should make a batch exit non-zero.
    pub fn failed(&self) -> usize {
        self.fetch_failed + self.handler_failed + self.invalid_seeds
    }
}

pub struct Crawler {
    fetcher: Fetcher,
    robots: RobotsCache,
    throttle: DomainThrottle,
    options: CrawlOptions,
}

impl Crawler {
    pub fn new(fetcher: Fetcher, options: CrawlOptions) -> Self {
        let robots = RobotsCache::new(fetcher.client().clone());
        let throttle = DomainThrottle::new(options.delay);
        Self {
            fetcher,
            robots,
            throttle,
            options,
        }
    }

    pub async fn crawl(
        &self,
        seeds: &[String],
        handler: &dyn CrawlHandler,
        cancel: &CancellationToken,
    ) -> Result<CrawlSummary> {
        let mut summary = CrawlSummary::default();
        let mut frontier: VecDeque<(Url, usize)> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();

        for seed in seeds {
            match parse_http_url(seed) {
                Ok(mut url) => {
                    url.set_fragment(None);
                    frontier.push_back((url, 0));
                }
                Err(e) => {
                    tracing::warn!(seed = %seed, error = %e, "skipping invalid seed");
                    summary.invalid_seeds += 1;
                }
            }
        }

        tracing::info!(
            seeds = frontier.len(),
            max_depth = self.options.max_depth,
            same_domain_only = self.options.same_domain_only,
            "crawl starting"
        );

        while let Some((url, depth)) = frontier.pop_front() {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            if let Some(max) = self.options.max_pages {
                if summary.fetched + summary.fetch_failed >= max {
                    tracing::info!(max_pages = max, "page cap reached");
                    break;
                }
            }
            if !visited.insert(url.to_string()) {
                continue;
            }
            summary.visited += 1;

            let robots = tokio::select! {
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                robots = self.robots.robots_for(&url) => robots,
            };
            if !robots.is_allowed(self.fetcher.user_agent(), &path_and_query(&url)) {
                tracing::info!(url = %url, "disallowed by robots.txt");
                summary.skipped_robots += 1;
                continue;
            }

            let origin = origin_key(&url);
            let min_delay = robots
                .crawl_delay(self.fetcher.user_agent())
                .unwrap_or(Duration::ZERO);

            let fetched = tokio::select! {
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                fetched = async {
                    self.throttle.wait_at_least(&origin, min_delay).await;
                    self.fetcher.fetch(url.as_str()).await
                } => fetched,
            };

            let html = match &fetched {
                Ok(resource) => {
                    summary.fetched += 1;
                    html_body(resource)
                }
                Err(e) => {
                    tracing::warn!(url = %url, depth, error = %e, "fetch failed");
                    summary.fetch_failed += 1;
                    None
                }
            };

            let page = CrawledPage {
                url: url.to_string(),
                depth,
                html,
                fetched,
            };

            if let Err(e) = handler.on_document(&page).await {
                tracing::warn!(url = %page.url, error = %e, "document handler failed");
                summary.handler_failed += 1;
            }

            let (Some(html), Ok(resource)) = (&page.html, &page.fetched) else {
                continue;
            };
            if depth >= self.options.max_depth {
                continue;
            }

            // Relative links resolve against the post-redirect location.
            let base = Url::parse(&resource.final_url).unwrap_or_else(|_| url.clone());
            let mut enqueued = 0usize;
            for link in extract_links(html, &base) {
                if self.options.same_domain_only && !same_site(&url, &link) {
                    continue;
                }
                if visited.contains(link.as_str()) {
                    continue;
                }
                frontier.push_back((link, depth + 1));
                enqueued += 1;
            }
            tracing::debug!(url = %page.url, depth, enqueued, "expanded links");
        }

        tracing::info!(
            visited = summary.visited,
            fetched = summary.fetched,
            fetch_failed = summary.fetch_failed,
            skipped_robots = summary.skipped_robots,
            cancelled = summary.cancelled,
            "crawl finished"
        );

        Ok(summary)
    }
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

/// The body of `resource` when it is an HTML document.
///
/// Servers often omit or mislabel `Content-Type`, so an absent header falls
/// back to sniffing the first bytes.
pub fn html_body(resource: &FetchedResource) -> Option<String> {
    if resource.is_html() {
        return Some(resource.text());
    }
    if resource.content_type.is_none() && looks_like_html(&resource.bytes) {
        return Some(resource.text());
    }
    None
}

fn looks_like_html(bytes: &[u8]) -> bool {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_ascii_lowercase();
    let head = head.trim_start_matches('\u{feff}').trim_start();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

/// Absolute `http(s)` links in document order, fragments removed, duplicates
/// dropped.
pub fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let document = Html::parse_document(html);
    let selector = match Selector::parse("a[href]") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for href in document
        .select(&selector)
        .filter_map(|el| el.value().attr("href"))
    {
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let Ok(mut link) = base.join(href) else {
            continue;
        };
        if link.scheme() != "http" && link.scheme() != "https" {
            continue;
        }
        link.set_fragment(None);
        if seen.insert(link.to_string()) {
            links.push(link);
        }
    }
    links
}

/// Whether two URLs share a site, treating `www.` as insignificant.
///
/// This is a host comparison, not a public-suffix lookup: `a.example.com`
/// and `b.example.com` are different sites.
pub fn same_site(a: &Url, b: &Url) -> bool {
    match (a.host_str(), b.host_str()) {
        (Some(x), Some(y)) => site_host(x) == site_host(y),
        _ => false,
    }
}

fn site_host(host: &str) -> String {
    let host = host.to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => host,
    }
}
