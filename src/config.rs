//! TOML configuration.
//!
//! ```toml
//! [paths]
//! input_dir = "./input"
//! artifact_dir = "./ocr"
//! manifest = "./data/manifest.jsonl"
//!
//! [index]
//! path = "./output/index.sqlite"
//!
//! [fetch]
//! timeout_secs = 60
//! max_redirects = 5
//!
//! [crawl]
//! max_depth = 1
//! delay_secs = 2.0
//! ```
//!
//! Every section is optional; missing fields take the defaults below.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "ProvenanceVaultBot/0.1";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    #[serde(default = "default_true")]
    pub provenance_sidecars: bool,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            artifact_dir: default_artifact_dir(),
            manifest: default_manifest(),
            provenance_sidecars: true,
        }
    }
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("./input")
}
fn default_artifact_dir() -> PathBuf {
    PathBuf::from("./ocr")
}
fn default_manifest() -> PathBuf {
    PathBuf::from("./data/manifest.jsonl")
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: default_index_path(),
        }
    }
}

fn default_index_path() -> PathBuf {
    PathBuf::from("./output/index.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            max_redirects: default_max_redirects(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    60
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
fn default_max_redirects() -> usize {
    5
}
fn default_max_bytes() -> u64 {
    100 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_true")]
    pub same_domain_only: bool,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: f64,
    #[serde(default)]
    pub max_pages: Option<usize>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            same_domain_only: true,
            delay_secs: default_delay_secs(),
            max_pages: None,
        }
    }
}

impl CrawlConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.delay_secs)
    }
}

fn default_max_depth() -> usize {
    1
}
fn default_delay_secs() -> f64 {
    2.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            candidate_limit: default_candidate_limit(),
            snippet_chars: default_snippet_chars(),
        }
    }
}

fn default_limit() -> usize {
    20
}
fn default_candidate_limit() -> usize {
    500
}
fn default_snippet_chars() -> usize {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    #[serde(default = "default_brave_key_env")]
    pub brave_api_key_env: String,
    #[serde(default = "default_true")]
    pub duckduckgo: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            brave_api_key_env: default_brave_key_env(),
            duckduckgo: true,
        }
    }
}

fn default_brave_key_env() -> String {
    "BRAVE_SEARCH_API_KEY".to_string()
}

impl Config {
    /// Default layout under `root`: `input/`, `ocr/`, `data/manifest.jsonl`
    /// and `output/index.sqlite`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            paths: PathsConfig {
                input_dir: root.join("input"),
                artifact_dir: root.join("ocr"),
                manifest: root.join("data").join("manifest.jsonl"),
                provenance_sidecars: true,
            },
            index: IndexConfig {
                path: root.join("output").join("index.sqlite"),
            },
            fetch: FetchConfig::default(),
            crawl: CrawlConfig::default(),
            search: SearchConfig::default(),
            ingest: IngestConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }

    /// Create the input, artifact and manifest directories.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.paths.input_dir)?;
        std::fs::create_dir_all(&self.paths.artifact_dir)?;
        if let Some(parent) = self.paths.manifest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.index.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch.timeout_secs == 0 {
            anyhow::bail!("fetch.timeout_secs must be > 0");
        }
        if self.search.limit < 1 {
            anyhow::bail!("search.limit must be >= 1");
        }
        if self.search.candidate_limit < self.search.limit {
            anyhow::bail!("search.candidate_limit must be >= search.limit");
        }
        if !self.crawl.delay_secs.is_finite() || self.crawl.delay_secs < 0.0 {
            anyhow::bail!("crawl.delay_secs must be a non-negative number");
        }
        if self.ingest.concurrency < 1 {
            anyhow::bail!("ingest.concurrency must be >= 1");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

/// Config path used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "./config/vault.toml";

/// Load `path` when given. Otherwise load [`DEFAULT_CONFIG_PATH`] if it
/// exists, else fall back to the default layout under the current directory.
pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
    if let Some(path) = path {
        return load_config(path);
    }
    let default = Path::new(DEFAULT_CONFIG_PATH);
    if default.exists() {
        return load_config(default);
    }
    tracing::debug!("no config file, using default layout under the current directory");
    Ok(Config::rooted_at(Path::new(".")))
}
