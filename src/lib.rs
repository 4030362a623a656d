//! # Campus KB
//!
//! A deduplicated, content-addressed knowledge base for one institutional
//! website, with token-budgeted retrieval for LLM prompts.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │ SourceFetcher│──▶│ Normalizer  │──▶│ ContentHash  │──▶│ SQLite   │
//! │ pages / PDFs │   │ canonical   │   │ SHA-256      │   │ dedup on │
//! └──────────────┘   └─────────────┘   └──────────────┘   │ upsert   │
//!        ▲                                                └────┬─────┘
//!        │ RefreshScheduler (manual / timer)                   │
//!        └─────────────────────────────────────────────────────┤
//!                                                              ▼
//!                                    ┌──────────┐        ┌───────────┐
//!                                    │ CLI (kb) │◀──────▶│ Retriever │
//!                                    │   HTTP   │        │  budget   │
//!                                    └──────────┘        └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`hash`] | Content fingerprints |
//! | [`normalize`] | Canonical text form |
//! | [`extract`] | HTML and PDF text extraction |
//! | [`fetch`] | HTTP fetching with retries and rate limiting |
//! | [`sitemap`] | Source enumeration |
//! | [`store`] | Knowledge store trait, in-memory and SQLite backends |
//! | [`scheduler`] | Refresh runs and the refresh timer |
//! | [`retrieve`] | Scoring and token-budgeted selection |
//! | [`manual`] | Loading local files as manual entries |
//! | [`server`] | HTTP API |
//! | [`get`] | Entry lookup and listing |
//! | [`stats`] | Store statistics and compaction |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod get;
pub mod hash;
pub mod manual;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod retrieve;
pub mod scheduler;
pub mod server;
pub mod sitemap;
pub mod stats;
pub mod store;
