//! # Provenance Vault
//!
//! A local-first document vault. Sources (URLs, local files, crawled sites,
//! search-discovered links) are fetched politely, reduced to plain-text
//! artifacts, recorded in an append-only provenance ledger, and indexed for
//! ranked full-text search with provenance-aware filters.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────┐   ┌───────────┐   ┌──────────────┐
//! │ Resolver   │──▶│ Extract  │──▶│ Manifest  │──▶│ Index (FTS5) │
//! │ URL / path │   │ PDF/HTML │   │  JSONL    │   │  SQLite      │
//! └─────┬──────┘   └──────────┘   └─────┬─────┘   └──────┬───────┘
//!       │                               │                │
//! ┌─────┴──────┐                        └──────┬─────────┘
//! │ Crawler    │                               ▼
//! │ robots +   │                        ┌──────────────┐
//! │ throttle   │                        │ Query engine │
//! └────────────┘                        └──────────────┘
//! ```
//!
//! The manifest is the source of truth; the index is a cache that can be
//! rebuilt from it at any time.
//!
//! ## Quick Start
//!
//! ```bash
//! vault init
//! vault ingest-url https://example.gov/report.pdf --case harbor
//! vault crawl https://example.gov/notices/ --case harbor --max-depth 1
//! vault search "permit renewal" --case harbor
//! vault cleanup-manifest --dry-run
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Provenance records, labels, search results |
//! | [`fetch`] | HTTP retrieval and download storage |
//! | [`robots`] | robots.txt parsing and per-origin cache |
//! | [`throttle`] | Per-origin request spacing |
//! | [`crawl`] | Breadth-first polite crawler |
//! | [`extract`] | Content classification and text extraction |
//! | [`manifest`] | Append-only JSONL ledger, dedupe and cleanup |
//! | [`index`] | Index engine trait and SQLite FTS5 engine |
//! | [`sync`] | Manifest-to-index synchronization |
//! | [`search`] | Ranked search joined with provenance |
//! | [`ingest`] | Ingestion orchestration and batches |
//! | [`discover`] | Search-provider discovery |
//! | [`overview`] | Manifest listings and per-case totals |

pub mod config;
pub mod crawl;
pub mod discover;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod index;
pub mod ingest;
pub mod manifest;
pub mod models;
pub mod overview;
pub mod robots;
pub mod search;
pub mod sync;
pub mod throttle;

pub use error::{Result, VaultError};
