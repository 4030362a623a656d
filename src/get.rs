//! Entry lookup and listing.
//!
//! `kb get <id>` prints one entry in full, whatever its state. `kb list`
//! prints the active entries, optionally filtered by source type or URL
//! prefix.

use anyhow::{bail, Result};
use futures::StreamExt;

use crate::config::Config;
use crate::models::{EntryFilter, KnowledgeEntry, SourceType};
use crate::store::sqlite::SqliteStore;
use crate::store::KnowledgeStore;

/// Fetch an entry by id, active or not.
pub async fn get_entry(store: &dyn KnowledgeStore, id: &str) -> Result<KnowledgeEntry> {
    match store.get(id).await? {
        Some(entry) => Ok(entry),
        None => bail!("entry not found: {}", id),
    }
}

/// CLI entry point: print one entry.
pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let entry = get_entry(&store, id).await;
    store.close().await;
    let entry = entry?;

    println!("--- Entry ---");
    println!("id:           {}", entry.id);
    println!("title:        {}", entry.title);
    println!("source_type:  {}", entry.source_type);
    if !entry.source_url.is_empty() {
        println!("source_url:   {}", entry.source_url);
    }
    println!("content_hash: {}", entry.content_hash);
    println!("last_updated: {}", entry.last_updated.format("%Y-%m-%dT%H:%M:%SZ"));
    println!("last_checked: {}", entry.last_checked.format("%Y-%m-%dT%H:%M:%SZ"));
    println!("active:       {}", entry.is_active);
    if let Some(at) = entry.deactivated_at {
        println!("deactivated:  {}", at.format("%Y-%m-%dT%H:%M:%SZ"));
    }
    if let Some(ref holder) = entry.duplicate_of {
        println!("duplicate_of: {}", holder);
    }
    println!();

    println!("--- Content ---");
    println!("{}", entry.content);
    Ok(())
}

/// CLI entry point: list active entries.
pub async fn run_list(
    config: &Config,
    source_type: Option<SourceType>,
    url_prefix: Option<String>,
) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let filter = EntryFilter {
        source_type,
        url_prefix,
    };

    println!("{:<36}  {:<6}  {:<10}  TITLE / URL", "ID", "TYPE", "UPDATED");
    let mut count = 0usize;
    let mut entries = store.list_active(filter);
    let mut failure = None;
    while let Some(entry) = entries.next().await {
        match entry {
            Ok(e) => {
                count += 1;
                let location = if e.source_url.is_empty() {
                    e.title.clone()
                } else {
                    format!("{} <{}>", e.title, e.source_url)
                };
                println!(
                    "{:<36}  {:<6}  {:<10}  {}",
                    e.id,
                    e.source_type.as_str(),
                    e.last_updated.format("%Y-%m-%d"),
                    location
                );
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    drop(entries);
    store.close().await;

    if let Some(e) = failure {
        return Err(e.into());
    }
    println!("{} active entries", count);
    Ok(())
}
