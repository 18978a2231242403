//! # Provenance Vault CLI (`vault`)
//!
//! The `vault` binary drives ingestion, crawling, search and manifest
//! maintenance against the layout described by a TOML config file.
//!
//! ## Usage
//!
//! ```bash
//! vault --config ./config/vault.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vault init` | Create the vault directories and the index |
//! | `vault ingest-url <url>` | Fetch and ingest one URL |
//! | `vault ingest-file <path>` | Ingest one local file |
//! | `vault bulk-ingest <list\|dir>` | Ingest a list file or a directory |
//! | `vault crawl <seed>...` | Crawl politely and ingest every page |
//! | `vault harvest "<query>"` | Discover URLs via search providers and ingest them |
//! | `vault reindex` | Rebuild the index from the manifest |
//! | `vault search <terms>...` | Ranked search with provenance filters |
//! | `vault list-manifest` | List manifest records |
//! | `vault show <doc_id>` | Show a document's provenance |
//! | `vault cases` | Per-case totals |
//! | `vault check` | Report manifest records the index does not back |
//! | `vault cleanup-manifest` | Drop anomalies and duplicates from the manifest |
//!
//! Command output goes to stdout; logs go to stderr (`RUST_LOG` or
//! `--verbose` to adjust).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use provenance_vault::config::{self, Config};
use provenance_vault::crawl::CrawlOptions;
use provenance_vault::discover::{metasearch, providers_from_config};
use provenance_vault::ingest::{
    bulk_ingest, collect_directory, crawl_and_ingest, read_source_list, BatchSummary,
    BulkOptions, Vault, DEFAULT_BULK_INCLUDE,
};
use provenance_vault::manifest::{CleanupOptions, Manifest};
use provenance_vault::models::{IngestKind, IngestLabels};
use provenance_vault::overview;
use provenance_vault::search::{format_results, SearchFilters};

/// Provenance Vault: fetch, crawl and ingest sources into an append-only
/// provenance ledger with a synchronized full-text index.
#[derive(Parser)]
#[command(
    name = "vault",
    about = "Provenance Vault: polite fetching and crawling into a provenance ledger with full-text search",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/vault.toml` when it exists, otherwise the default
    /// layout under the current directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Grouping labels recorded with every ingestion.
#[derive(Args, Debug, Clone, Default)]
struct LabelArgs {
    /// Case the documents belong to.
    #[arg(long)]
    case: Option<String>,

    /// Tenant owning the documents.
    #[arg(long)]
    tenant: Option<String>,

    /// Tag to attach (repeatable).
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Collection the documents belong to.
    #[arg(long)]
    collection: Option<String>,
}

impl From<LabelArgs> for IngestLabels {
    fn from(args: LabelArgs) -> Self {
        IngestLabels {
            case: args.case,
            tenant: args.tenant,
            tags: args.tags,
            collection: args.collection,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create the input, artifact and manifest directories and the index.
    ///
    /// Idempotent.
    Init,

    /// Fetch one URL and ingest it.
    IngestUrl {
        url: String,
        #[command(flatten)]
        labels: LabelArgs,
    },

    /// Ingest one local file. Relative paths resolve against `paths.input_dir`.
    IngestFile {
        path: PathBuf,
        #[command(flatten)]
        labels: LabelArgs,
    },

    /// Ingest every source in a list file (one per line) or every matching
    /// file under a directory.
    BulkIngest {
        /// List file or directory.
        source: PathBuf,

        /// Include glob for directory sources (repeatable). Defaults to `**/*.pdf`.
        #[arg(long = "include")]
        include: Vec<String>,

        /// Ingestions in flight at once. Defaults to `ingest.concurrency`.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Stop scheduling new items after the first failure.
        #[arg(long)]
        fail_fast: bool,

        #[command(flatten)]
        labels: LabelArgs,
    },

    /// Crawl from one or more seeds and ingest every fetched page.
    Crawl {
        #[arg(required = true)]
        seeds: Vec<String>,

        /// Link depth to follow from the seeds.
        #[arg(long)]
        max_depth: Option<usize>,

        /// Seconds between requests to one origin.
        #[arg(long)]
        delay: Option<f64>,

        /// Stop after this many fetches.
        #[arg(long)]
        max_pages: Option<usize>,

        /// Follow links to other sites.
        #[arg(long)]
        any_domain: bool,

        #[command(flatten)]
        labels: LabelArgs,
    },

    /// Find URLs for a query through the configured search providers and
    /// ingest them.
    Harvest {
        query: String,

        /// Maximum number of URLs to ingest.
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Print the discovered URLs without ingesting.
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        labels: LabelArgs,
    },

    /// Clear the index and rebuild it from the manifest.
    Reindex,

    /// Ranked full-text search with provenance filters.
    Search {
        #[arg(required = true)]
        terms: Vec<String>,

        #[arg(long)]
        case: Option<String>,

        #[arg(long)]
        kind: Option<IngestKind>,

        #[arg(long)]
        tenant: Option<String>,

        /// Required tag (repeatable; all must match).
        #[arg(long = "tag")]
        tags: Vec<String>,

        #[arg(long)]
        collection: Option<String>,

        /// Maximum number of results. Defaults to `search.limit`.
        #[arg(long)]
        limit: Option<usize>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List manifest records in file order.
    ListManifest {
        #[arg(long)]
        case: Option<String>,

        #[arg(long)]
        kind: Option<IngestKind>,

        /// Print records as JSON lines.
        #[arg(long)]
        json: bool,
    },

    /// Show every record for a document plus an artifact excerpt.
    Show {
        doc_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Per-case record totals with a kind breakdown.
    Cases {
        #[arg(long)]
        json: bool,
    },

    /// Report manifest records whose artifact is missing or not indexed.
    Check,

    /// Drop legacy anomalies and duplicate records from the manifest.
    ///
    /// Writes `<manifest>.bak` before replacing the file.
    CleanupManifest {
        /// Report what would be dropped without writing.
        #[arg(long)]
        dry_run: bool,

        /// Also drop records whose artifact file no longer exists.
        #[arg(long)]
        drop_missing: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let cfg = config::load_or_default(cli.config.as_deref())?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping after in-flight work");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Init => {
            Vault::open(cfg.clone()).await?;
            println!("Vault initialized.");
            println!("  input:     {}", cfg.paths.input_dir.display());
            println!("  artifacts: {}", cfg.paths.artifact_dir.display());
            println!("  manifest:  {}", cfg.paths.manifest.display());
            println!("  index:     {}", cfg.index.path.display());
        }
        Commands::IngestUrl { url, labels } => {
            let vault = Vault::open(cfg).await?;
            let outcome = vault.ingest_url(&url, &labels.into()).await?;
            println!(
                "ingested {} ({}) -> {}",
                outcome.doc_id,
                outcome.kind,
                outcome.artifact_path.display()
            );
            println!("provenance id: {}", outcome.provenance_id);
        }
        Commands::IngestFile { path, labels } => {
            let vault = Vault::open(cfg).await?;
            let outcome = vault.ingest_local(&path, &labels.into()).await?;
            println!(
                "ingested {} ({}) -> {}",
                outcome.doc_id,
                outcome.kind,
                outcome.artifact_path.display()
            );
            println!("provenance id: {}", outcome.provenance_id);
        }
        Commands::BulkIngest {
            source,
            include,
            concurrency,
            fail_fast,
            labels,
        } => {
            let sources = if source.is_dir() {
                let include = if include.is_empty() {
                    vec![DEFAULT_BULK_INCLUDE.to_string()]
                } else {
                    include
                };
                collect_directory(&source, &include)?
            } else {
                read_source_list(&source)?
            };
            let options = BulkOptions {
                concurrency: concurrency.unwrap_or(cfg.ingest.concurrency),
                fail_fast,
            };
            let vault = Arc::new(Vault::open(cfg).await?);
            let summary = bulk_ingest(vault, sources, labels.into(), options, cancel).await;
            finish_batch(&summary);
        }
        Commands::Crawl {
            seeds,
            max_depth,
            delay,
            max_pages,
            any_domain,
            labels,
        } => {
            let mut options = CrawlOptions::from(&cfg.crawl);
            if let Some(depth) = max_depth {
                options.max_depth = depth;
            }
            if let Some(secs) = delay {
                if !secs.is_finite() || secs < 0.0 {
                    bail!("--delay must be a non-negative number of seconds");
                }
                options.delay = std::time::Duration::from_secs_f64(secs);
            }
            if max_pages.is_some() {
                options.max_pages = max_pages;
            }
            if any_domain {
                options.same_domain_only = false;
            }

            let vault = Vault::open(cfg).await?;
            let (crawl, summary) =
                crawl_and_ingest(&vault, &seeds, options, labels.into(), &cancel).await?;
            println!(
                "crawl: visited={} fetched={} fetch_failed={} robots_skipped={}{}",
                crawl.visited,
                crawl.fetched,
                crawl.fetch_failed,
                crawl.skipped_robots,
                if crawl.cancelled { " (cancelled)" } else { "" }
            );
            finish_batch(&summary);
        }
        Commands::Harvest {
            query,
            limit,
            dry_run,
            labels,
        } => {
            let vault = Arc::new(Vault::open(cfg).await?);
            let providers = providers_from_config(&vault.config().discovery, vault.fetcher());
            let links = metasearch(&providers, &query, limit)
                .await
                .context("discovery failed")?;
            for link in &links {
                println!("[{}] {} -> {}", link.provider, link.title, link.url);
            }
            if dry_run || links.is_empty() {
                println!("{} URL(s) discovered.", links.len());
                return Ok(());
            }

            let options = BulkOptions {
                concurrency: vault.config().ingest.concurrency,
                fail_fast: false,
            };
            let sources = links.into_iter().map(|l| l.url).collect();
            let summary = bulk_ingest(vault, sources, labels.into(), options, cancel).await;
            finish_batch(&summary);
        }
        Commands::Reindex => {
            let vault = Vault::open(cfg).await?;
            let report = vault.rebuild_index().await?;
            println!(
                "reindexed {} of {} records ({} missing artifacts, {} unreadable)",
                report.indexed,
                report.records,
                report.missing.len(),
                report.failed
            );
            for record in &report.missing {
                println!(
                    "  missing: {}",
                    record.artifact_path.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Search {
            terms,
            case,
            kind,
            tenant,
            tags,
            collection,
            limit,
            json,
        } => {
            let vault = Vault::open(cfg).await?;
            let filters = SearchFilters {
                case,
                kind,
                tenant,
                tags,
                collection,
            };
            let results = vault
                .query_engine()
                .search(&terms.join(" "), &filters, limit)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print!("{}", format_results(&results));
            }
        }
        Commands::ListManifest { case, kind, json } => {
            let manifest = Manifest::new(cfg.paths.manifest.clone());
            let records = overview::list_records(&manifest, case.as_deref(), kind)?;
            if json {
                for r in &records {
                    println!("{}", serde_json::to_string(r)?);
                }
            } else {
                print!("{}", overview::format_listing(&records));
            }
        }
        Commands::Show { doc_id, json } => {
            let manifest = Manifest::new(cfg.paths.manifest.clone());
            let Some(view) = overview::show_document(&manifest, &doc_id, cfg.search.snippet_chars)?
            else {
                bail!("document not found: {}", doc_id);
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print!("{}", overview::format_document(&view));
            }
        }
        Commands::Cases { json } => {
            let manifest = Manifest::new(cfg.paths.manifest.clone());
            let totals = overview::case_totals(&manifest.records()?);
            if json {
                println!("{}", serde_json::to_string_pretty(&totals)?);
            } else {
                print!("{}", overview::format_cases(&totals));
            }
        }
        Commands::Check => {
            let vault = Vault::open(cfg).await?;
            let problems = vault.check().await?;
            if problems.is_empty() {
                println!("manifest and index are consistent");
            } else {
                for p in &problems {
                    println!(
                        "{:<18} {:<28} {}",
                        p.problem.as_str(),
                        p.record.document_id().unwrap_or_else(|| "-".to_string()),
                        p.record.artifact_path.as_deref().unwrap_or("-")
                    );
                }
                println!("{} inconsistent record(s); run `vault reindex` to repair", problems.len());
                std::process::exit(1);
            }
        }
        Commands::CleanupManifest {
            dry_run,
            drop_missing,
        } => {
            run_cleanup(&cfg, CleanupOptions { dry_run, drop_missing })?;
        }
    }

    Ok(())
}

fn run_cleanup(cfg: &Config, options: CleanupOptions) -> anyhow::Result<()> {
    let manifest = Manifest::new(cfg.paths.manifest.clone());
    let report = manifest.cleanup_file(&options)?;

    println!("Loaded {} records from {}", report.loaded, manifest.path().display());
    if report.malformed_skipped > 0 {
        println!("Skipped {} malformed line(s)", report.malformed_skipped);
    }
    println!("Dropped {} anomalous record(s)", report.dropped_anomalies);
    if options.drop_missing {
        println!("Dropped {} record(s) with missing artifacts", report.dropped_missing);
    }
    println!("Dropped {} duplicate(s)", report.dropped_duplicates);
    println!("Kept {} record(s)", report.kept);

    if options.dry_run {
        println!("[dry run] manifest not modified");
    } else if report.written {
        if let Some(ref backup) = report.backup {
            println!("Backup written to {}", backup.display());
        }
        println!("Manifest rewritten");
    } else {
        println!("Nothing to change");
    }
    Ok(())
}

/// Print a batch summary and exit non-zero when any item failed.
fn finish_batch(summary: &BatchSummary) {
    for (source, error) in &summary.failures {
        println!("  failed: {} ({})", source, error);
    }
    println!("{}", summary);
    if summary.has_failures() {
        std::process::exit(1);
    }
}
