//! Knowledge-base overview and maintenance.
//!
//! `kb stats` prints entry counts by state and source type and how long ago
//! the last refresh confirmed anything. `kb compact` erases entries that have
//! been inactive for longer than the retention window.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::store::sqlite::SqliteStore;
use crate::store::KnowledgeStore;

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let stats = store.stats().await;
    store.close().await;
    let stats = stats?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Campus KB: Knowledge Base Stats");
    println!("================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Active:      {}", stats.active);
    println!("    pages:     {}", stats.active_pages);
    println!("    pdfs:      {}", stats.active_pdfs);
    println!("    manual:    {}", stats.active_manual);
    println!("  Inactive:    {}", stats.inactive);
    println!("    duplicates: {}", stats.suppressed_duplicates);
    println!();
    let refreshed = match stats.last_refresh {
        Some(at) => format_relative(at, Utc::now()),
        None => "never".to_string(),
    };
    println!("  Last refresh: {}", refreshed);
    println!();
    Ok(())
}

/// `kb compact`: erase entries inactive for longer than the retention window.
pub async fn run_compact(config: &Config, retention_days: Option<u32>) -> Result<()> {
    let days = retention_days.unwrap_or(config.store.retention_days);
    let store = SqliteStore::open(config).await?;
    let erased = store
        .compact(chrono::Duration::days(days as i64), Utc::now())
        .await;
    store.close().await;

    println!("compact (retention {} days)", days);
    println!("  erased: {}", erased?);
    println!("ok");
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" style rendering; absolute date past 30 days or in the future.
fn format_relative(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - at).num_seconds();
    if delta < 0 || delta >= 86400 * 30 {
        return at.format("%Y-%m-%d %H:%M").to_string();
    }

    let (n, unit) = match delta {
        0..=59 => return "just now".to_string(),
        60..=3599 => (delta / 60, "min"),
        3600..=86399 => (delta / 3600, "hour"),
        _ => (delta / 86400, "day"),
    };
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}
