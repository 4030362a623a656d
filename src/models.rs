//! Core data models used throughout the knowledge base.
//!
//! These types represent the documents, stored entries, and excerpts that
//! flow through the ingestion and retrieval pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::hash::ContentHash;

/// Where an entry's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Page,
    Pdf,
    Manual,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Page => "page",
            SourceType::Pdf => "pdf",
            SourceType::Manual => "manual",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "page" | "web" => Ok(SourceType::Page),
            "pdf" => Ok(SourceType::Pdf),
            "manual" => Ok(SourceType::Manual),
            other => Err(format!(
                "unknown source type '{}'. Must be page, pdf, or manual.",
                other
            )),
        }
    }
}

/// One stored unit of content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeEntry {
    /// UUID assigned at first insert, never reused.
    pub id: String,
    pub source_type: SourceType,
    /// Origin URL; empty for manually loaded content.
    pub source_url: String,
    pub title: String,
    /// Normalized display text.
    pub content: String,
    pub content_hash: ContentHash,
    pub last_updated: DateTime<Utc>,
    /// Last time a refresh confirmed this source.
    pub last_checked: DateTime<Utc>,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    /// Set on suppressed duplicates: the active entry holding the same hash.
    pub duplicate_of: Option<String>,
}

impl KnowledgeEntry {
    pub fn key(&self) -> EntryKey {
        EntryKey::for_source(self.source_type, &self.source_url, &self.title)
    }
}

/// Identity of the upstream source an entry tracks. One stored row per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Url(String),
    /// Manual entries have no URL and are keyed by their title (filename).
    Manual(String),
}

impl EntryKey {
    pub fn for_source(source_type: SourceType, source_url: &str, title: &str) -> Self {
        if source_type == SourceType::Manual || source_url.is_empty() {
            EntryKey::Manual(title.to_string())
        } else {
            EntryKey::Url(source_url.to_string())
        }
    }
}

/// Normalized, fingerprinted content offered to the store by an ingestion step.
#[derive(Debug, Clone)]
pub struct EntryCandidate {
    pub source_type: SourceType,
    pub source_url: String,
    pub title: String,
    pub content: String,
    pub content_hash: ContentHash,
    /// When the content was observed; becomes `last_updated` on write.
    pub observed_at: DateTime<Utc>,
}

impl EntryCandidate {
    pub fn key(&self) -> EntryKey {
        EntryKey::for_source(self.source_type, &self.source_url, &self.title)
    }
}

/// Document as returned by a [`SourceFetcher`](crate::fetch::SourceFetcher),
/// before normalization.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub url: String,
    pub source_type: SourceType,
    pub title: String,
    /// Extracted plain text. PDF pages are separated by `[page N]` markers.
    pub text: String,
    /// Same-site PDF links found on an HTML page.
    pub linked_pdfs: Vec<String>,
}

/// Restricts [`list_active`](crate::store::KnowledgeStore::list_active).
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub source_type: Option<SourceType>,
    pub url_prefix: Option<String>,
}

impl EntryFilter {
    pub fn matches(&self, entry: &KnowledgeEntry) -> bool {
        self.source_type.map_or(true, |t| entry.source_type == t)
            && self
                .url_prefix
                .as_deref()
                .map_or(true, |p| entry.source_url.starts_with(p))
    }
}

/// A ranked, budgeted piece of an entry handed to prompt construction.
#[derive(Debug, Clone, Serialize)]
pub struct Excerpt {
    pub entry_id: String,
    pub title: String,
    pub source_url: String,
    pub source_type: SourceType,
    pub text: String,
    /// `text` was cut to the excerpt length limit.
    pub truncated: bool,
    pub score: f64,
    pub tokens: usize,
    pub last_updated: DateTime<Utc>,
}
