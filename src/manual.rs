//! Manually curated content loaded from a local directory.
//!
//! `kb load <dir>` walks the directory and stores every `.txt`, `.md`,
//! `.pdf` and `.json` file as `manual` entries. Manual entries have no
//! source URL, are keyed by title, and are never deactivated by a refresh.
//!
//! JSON files may hold a string, an object, or an array of either. An
//! object contributes its `content` field, or all of its top-level string
//! values joined by newlines; its title is the `title` (or `source`) field
//! when present. Array items without a title are named `<file>#<n>`.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::ExtractionError;
use crate::extract;
use crate::hash::fingerprint;
use crate::models::{EntryCandidate, SourceType};
use crate::normalize::{DocumentNormalizer, Normalized};
use crate::store::sqlite::SqliteStore;
use crate::store::{KnowledgeStore, UpsertOutcome};

const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "md", "pdf", "json"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualDocument {
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub files: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub duplicates_suppressed: usize,
    /// Empty documents.
    pub skipped: usize,
    /// Files that could not be read or parsed.
    pub failed: usize,
}

/// Documents contained in one file, or `None` for unsupported extensions.
pub fn read_file(path: &Path) -> Result<Option<Vec<ManualDocument>>, ExtractionError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        return Ok(None);
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let bytes =
        std::fs::read(path).map_err(|e| ExtractionError::CorruptDocument(e.to_string()))?;

    let docs = match ext.as_str() {
        "pdf" => vec![ManualDocument {
            title: file_name,
            text: extract::extract_pdf_pages(&bytes)?,
        }],
        "json" => {
            let value: Value = serde_json::from_slice(&bytes)
                .map_err(|e| ExtractionError::CorruptDocument(e.to_string()))?;
            json_documents(&file_name, &value)
        }
        _ => vec![ManualDocument {
            title: file_name,
            text: String::from_utf8_lossy(&bytes).into_owned(),
        }],
    };
    Ok(Some(docs))
}

fn json_documents(file_name: &str, value: &Value) -> Vec<ManualDocument> {
    match value {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| json_document(item, || format!("{}#{}", file_name, i + 1)))
            .collect(),
        other => json_document(other, || file_name.to_string())
            .into_iter()
            .collect(),
    }
}

fn json_document(value: &Value, default_title: impl FnOnce() -> String) -> Option<ManualDocument> {
    match value {
        Value::String(s) => Some(ManualDocument {
            title: default_title(),
            text: s.clone(),
        }),
        Value::Object(map) => {
            let title = ["title", "source"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str))
                .map(str::to_string)
                .unwrap_or_else(default_title);
            let text = match map.get("content").and_then(Value::as_str) {
                Some(content) => content.to_string(),
                None => map
                    .iter()
                    .filter(|(k, _)| k.as_str() != "title" && k.as_str() != "source")
                    .filter_map(|(_, v)| v.as_str())
                    .collect::<Vec<_>>()
                    .join("\n"),
            };
            Some(ManualDocument { title, text })
        }
        _ => None,
    }
}

/// Load every supported file under `dir` into `store`.
pub async fn load_directory(
    dir: &Path,
    store: &dyn KnowledgeStore,
    normalizer: &DocumentNormalizer,
    now: DateTime<Utc>,
) -> Result<LoadSummary> {
    if !dir.is_dir() {
        anyhow::bail!("Not a directory: {}", dir.display());
    }

    let mut summary = LoadSummary::default();
    let mut paths: Vec<_> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    paths.sort();

    for path in paths {
        let docs = match read_file(&path) {
            Ok(Some(docs)) => docs,
            Ok(None) => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not load file");
                summary.failed += 1;
                continue;
            }
        };
        summary.files += 1;

        for doc in docs {
            let text = match normalizer.normalize(&doc.text) {
                Normalized::Document(text) => text,
                Normalized::Empty => {
                    debug!(title = %doc.title, "empty manual document skipped");
                    summary.skipped += 1;
                    continue;
                }
            };
            let candidate = EntryCandidate {
                source_type: SourceType::Manual,
                source_url: String::new(),
                title: doc.title,
                content_hash: fingerprint(&text.hashable_text),
                content: text.display_text,
                observed_at: now,
            };
            match store.upsert(&candidate).await? {
                UpsertOutcome::Created { .. } => summary.created += 1,
                UpsertOutcome::Updated { .. } => summary.updated += 1,
                UpsertOutcome::Unchanged { .. } => summary.unchanged += 1,
                UpsertOutcome::DuplicateSuppressed { duplicate_of, .. } => {
                    warn!(title = %candidate.title, %duplicate_of, "duplicate content suppressed");
                    summary.duplicates_suppressed += 1;
                }
            }
        }
    }

    Ok(summary)
}

/// `kb load <dir>`.
pub async fn run_load(config: &Config, dir: &Path) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let normalizer = DocumentNormalizer::new(&config.normalize.boilerplate);
    let result = load_directory(dir, &store, &normalizer, Utc::now())
        .await
        .with_context(|| format!("Failed to load {}", dir.display()));
    store.close().await;
    let summary = result?;

    println!("load {}", dir.display());
    println!("  files:      {}", summary.files);
    println!("  created:    {}", summary.created);
    println!("  updated:    {}", summary.updated);
    println!("  unchanged:  {}", summary.unchanged);
    println!("  duplicates: {}", summary.duplicates_suppressed);
    println!("  skipped:    {}", summary.skipped);
    println!("  failed:     {}", summary.failed);
    println!("ok");
    Ok(())
}
