//! In-memory [`KnowledgeStore`] for tests and throwaway runs.
//!
//! Entries live in a `BTreeMap` keyed by id behind a `std::sync::RwLock`,
//! so listings come out in id order like the SQLite backend. Every upsert
//! takes the write lock for its whole plan-and-apply step.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::StoreError;
use crate::models::{EntryCandidate, EntryFilter, KnowledgeEntry, SourceType};

use super::{plan_restores, plan_upsert, KnowledgeStore, StoreStats, UpsertOutcome};

pub struct InMemoryStore {
    entries: RwLock<BTreeMap<String, KnowledgeEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, KnowledgeEntry>>, StoreError> {
        self.entries
            .read()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, KnowledgeEntry>>, StoreError> {
        self.entries
            .write()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    /// Every stored row, active or not. Test helper.
    pub fn snapshot(&self) -> Vec<KnowledgeEntry> {
        self.read()
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryStore {
    async fn upsert(&self, candidate: &EntryCandidate) -> Result<UpsertOutcome, StoreError> {
        let mut entries = self.write()?;
        let key = candidate.key();
        let existing = entries.values().find(|e| e.key() == key);
        let holder = entries
            .values()
            .find(|e| e.is_active && e.content_hash == candidate.content_hash);

        let plan = plan_upsert(candidate, existing, holder);
        entries.insert(plan.row.id.clone(), plan.row);
        Ok(plan.outcome)
    }

    async fn deactivate_missing(
        &self,
        seen_urls: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut entries = self.write()?;
        let mut count = 0;
        for entry in entries.values_mut() {
            if entry.is_active
                && entry.source_type != SourceType::Manual
                && !seen_urls.contains(&entry.source_url)
            {
                entry.is_active = false;
                entry.deactivated_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn restore_orphaned_duplicates(
        &self,
        seen_urls: &HashSet<String>,
    ) -> Result<Vec<String>, StoreError> {
        let mut entries = self.write()?;
        let mut active_by_hash: HashMap<_, _> = entries
            .values()
            .filter(|e| e.is_active)
            .map(|e| (e.content_hash.clone(), e.id.clone()))
            .collect();
        let suppressed: Vec<KnowledgeEntry> = entries
            .values()
            .filter(|e| {
                !e.is_active && e.duplicate_of.is_some() && seen_urls.contains(&e.source_url)
            })
            .cloned()
            .collect();

        let mut restored = Vec::new();
        for row in plan_restores(&mut active_by_hash, suppressed) {
            if row.is_active {
                restored.push(row.id.clone());
            }
            entries.insert(row.id.clone(), row);
        }
        Ok(restored)
    }

    fn list_active(&self, filter: EntryFilter) -> BoxStream<'_, Result<KnowledgeEntry, StoreError>> {
        let snapshot: Vec<Result<KnowledgeEntry, StoreError>> = match self.read() {
            Ok(entries) => entries
                .values()
                .filter(|e| e.is_active && filter.matches(e))
                .cloned()
                .map(Ok)
                .collect(),
            Err(e) => vec![Err(e)],
        };
        stream::iter(snapshot).boxed()
    }

    async fn compact(
        &self,
        retention: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let cutoff = now - retention;
        let mut entries = self.write()?;
        let before = entries.len();
        entries.retain(|_, e| e.is_active || e.deactivated_at.map_or(true, |at| at >= cutoff));
        Ok((before - entries.len()) as u64)
    }

    async fn get(&self, id: &str) -> Result<Option<KnowledgeEntry>, StoreError> {
        Ok(self.read()?.get(id).cloned())
    }

    async fn get_by_url(&self, url: &str) -> Result<Option<KnowledgeEntry>, StoreError> {
        if url.is_empty() {
            return Ok(None);
        }
        Ok(self
            .read()?
            .values()
            .find(|e| e.source_url == url)
            .cloned())
    }

    async fn last_refresh(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .read()?
            .values()
            .filter(|e| e.is_active && e.source_type != SourceType::Manual)
            .map(|e| e.last_checked)
            .max())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let entries = self.read()?;
        let mut stats = StoreStats::default();
        for e in entries.values() {
            if e.is_active {
                stats.active += 1;
                match e.source_type {
                    SourceType::Page => stats.active_pages += 1,
                    SourceType::Pdf => stats.active_pdfs += 1,
                    SourceType::Manual => stats.active_manual += 1,
                }
                if e.source_type != SourceType::Manual {
                    stats.last_refresh = stats.last_refresh.max(Some(e.last_checked));
                }
            } else {
                stats.inactive += 1;
                if e.duplicate_of.is_some() {
                    stats.suppressed_duplicates += 1;
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::fingerprint;
    use crate::store::collect_active;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn page(url: &str, body: &str, secs: i64) -> EntryCandidate {
        EntryCandidate {
            source_type: SourceType::Page,
            source_url: url.to_string(),
            title: format!("Title of {url}"),
            content: body.to_string(),
            content_hash: fingerprint(&body.to_lowercase()),
            observed_at: at(secs),
        }
    }

    #[tokio::test]
    async fn upsert_then_list() {
        let store = InMemoryStore::new();
        store.upsert(&page("https://x.edu/a", "alpha", 0)).await.unwrap();
        store.upsert(&page("https://x.edu/b", "beta", 0)).await.unwrap();
        let active = collect_active(&store, EntryFilter::default()).await.unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn duplicate_content_keeps_single_active_entry() {
        let store = InMemoryStore::new();
        store.upsert(&page("https://x.edu/a", "same", 0)).await.unwrap();
        let outcome = store.upsert(&page("https://x.edu/b", "same", 1)).await.unwrap();
        assert!(matches!(outcome, UpsertOutcome::DuplicateSuppressed { .. }));

        let active = collect_active(&store, EntryFilter::default()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].source_url, "https://x.edu/a");
        assert_eq!(store.stats().await.unwrap().suppressed_duplicates, 1);
    }

    #[tokio::test]
    async fn deactivate_missing_spares_manual_entries() {
        let store = InMemoryStore::new();
        store.upsert(&page("https://x.edu/a", "alpha", 0)).await.unwrap();
        let manual = EntryCandidate {
            source_type: SourceType::Manual,
            source_url: String::new(),
            title: "handbook.md".into(),
            content: "handbook".into(),
            content_hash: fingerprint("handbook"),
            observed_at: at(0),
        };
        store.upsert(&manual).await.unwrap();

        let gone = store.deactivate_missing(&HashSet::new(), at(10)).await.unwrap();
        assert_eq!(gone, 1);
        let active = collect_active(&store, EntryFilter::default()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].source_type, SourceType::Manual);
    }

    #[tokio::test]
    async fn moved_content_comes_back_at_its_new_url() {
        let store = InMemoryStore::new();
        store.upsert(&page("https://x.edu/old", "moved text", 0)).await.unwrap();
        let copy = store.upsert(&page("https://x.edu/new", "moved text", 1)).await.unwrap();

        let seen: HashSet<String> = ["https://x.edu/new".to_string()].into_iter().collect();
        store.deactivate_missing(&seen, at(2)).await.unwrap();
        let restored = store.restore_orphaned_duplicates(&seen).await.unwrap();
        assert_eq!(restored, vec![copy.id().to_string()]);

        let active = collect_active(&store, EntryFilter::default()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].source_url, "https://x.edu/new");
        assert_eq!(active[0].duplicate_of, None);
    }

    #[tokio::test]
    async fn last_refresh_ignores_manual_entries() {
        let store = InMemoryStore::new();
        let manual = EntryCandidate {
            source_type: SourceType::Manual,
            source_url: String::new(),
            title: "hours.txt".into(),
            content: "hours".into(),
            content_hash: fingerprint("hours"),
            observed_at: at(0),
        };
        store.upsert(&manual).await.unwrap();
        assert_eq!(store.last_refresh().await.unwrap(), None);

        store.upsert(&page("https://x.edu/a", "alpha", 30)).await.unwrap();
        assert_eq!(store.last_refresh().await.unwrap(), Some(at(30)));
    }

    #[tokio::test]
    async fn compact_respects_retention() {
        let store = InMemoryStore::new();
        store.upsert(&page("https://x.edu/old", "old", 0)).await.unwrap();
        store.upsert(&page("https://x.edu/new", "new", 0)).await.unwrap();
        let mut keep = HashSet::new();
        keep.insert("https://x.edu/new".to_string());
        store.deactivate_missing(&keep, at(0)).await.unwrap();

        let erased = store
            .compact(chrono::Duration::days(30), at(31 * 86_400))
            .await
            .unwrap();
        assert_eq!(erased, 1);
        assert!(store.get_by_url("https://x.edu/old").await.unwrap().is_none());
        assert!(store.get_by_url("https://x.edu/new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn filter_by_type_and_prefix() {
        let store = InMemoryStore::new();
        store.upsert(&page("https://x.edu/fees/a", "fees a", 0)).await.unwrap();
        store.upsert(&page("https://x.edu/dates", "dates", 0)).await.unwrap();
        let filter = EntryFilter {
            source_type: Some(SourceType::Page),
            url_prefix: Some("https://x.edu/fees".into()),
        };
        let hits = collect_active(&store, filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_url, "https://x.edu/fees/a");
    }
}
