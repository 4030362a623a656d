//! Storage abstraction for the knowledge base.
//!
//! The [`KnowledgeStore`] trait is the single place the "no duplicate active
//! content" guarantee is enforced: callers offer [`EntryCandidate`]s and the
//! store decides whether each one creates, updates, confirms, or is
//! suppressed as a duplicate. Both backends share that decision through
//! [`plan_upsert`], so they cannot drift apart.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert`](KnowledgeStore::upsert) | Offer normalized content for a source |
//! | [`deactivate_missing`](KnowledgeStore::deactivate_missing) | Retire sources not seen in a run |
//! | [`restore_orphaned_duplicates`](KnowledgeStore::restore_orphaned_duplicates) | Bring back copies whose holder went away |
//! | [`list_active`](KnowledgeStore::list_active) | Lazily stream active entries |
//! | [`compact`](KnowledgeStore::compact) | Erase long-inactive entries |
//! | [`get`](KnowledgeStore::get) / [`get_by_url`](KnowledgeStore::get_by_url) | Point lookups |
//! | [`last_refresh`](KnowledgeStore::last_refresh) | Newest confirmation time |
//! | [`stats`](KnowledgeStore::stats) | Counts for `kb stats` |
//!
//! Implementations must be `Send + Sync`; every mutation is atomic per entry.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::error::StoreError;
use crate::hash::ContentHash;
use crate::models::{EntryCandidate, EntryFilter, KnowledgeEntry};

/// What an [`upsert`](KnowledgeStore::upsert) did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New entry, or a previously inactive entry for the same source brought back.
    Created { id: String },
    /// Content of an active entry replaced in place.
    Updated { id: String },
    /// Same content as the active entry; only the confirmation time moved.
    Unchanged { id: String },
    /// Content already held by another active entry. The candidate is stored
    /// inactive and points at the holder.
    DuplicateSuppressed { id: String, duplicate_of: String },
}

impl UpsertOutcome {
    pub fn id(&self) -> &str {
        match self {
            UpsertOutcome::Created { id }
            | UpsertOutcome::Updated { id }
            | UpsertOutcome::Unchanged { id }
            | UpsertOutcome::DuplicateSuppressed { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub active: u64,
    pub inactive: u64,
    pub suppressed_duplicates: u64,
    pub active_pages: u64,
    pub active_pdfs: u64,
    pub active_manual: u64,
    pub last_refresh: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Offer content for the candidate's source key.
    async fn upsert(&self, candidate: &EntryCandidate) -> Result<UpsertOutcome, StoreError>;

    /// Deactivate every active page/pdf entry whose URL is not in `seen_urls`.
    /// Manual entries are never touched. Returns the number deactivated.
    async fn deactivate_missing(
        &self,
        seen_urls: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Re-check suppressed duplicates whose URL is in `seen_urls` against
    /// the current active rows. A row whose content no active entry holds
    /// any more is reactivated; one whose content moved to a different
    /// active entry is re-pointed at it. Returns the ids reactivated.
    async fn restore_orphaned_duplicates(
        &self,
        seen_urls: &HashSet<String>,
    ) -> Result<Vec<String>, StoreError>;

    /// Active entries matching `filter`, ordered by id. Each call starts a
    /// fresh listing.
    fn list_active(&self, filter: EntryFilter) -> BoxStream<'_, Result<KnowledgeEntry, StoreError>>;

    /// Permanently erase entries inactive since before `now - retention`.
    async fn compact(
        &self,
        retention: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<KnowledgeEntry>, StoreError>;

    async fn get_by_url(&self, url: &str) -> Result<Option<KnowledgeEntry>, StoreError>;

    /// Most recent `last_checked` among active page and pdf entries.
    /// Manual entries say nothing about when the site was last read.
    async fn last_refresh(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Drain [`KnowledgeStore::list_active`] into a vector.
pub async fn collect_active(
    store: &dyn KnowledgeStore,
    filter: EntryFilter,
) -> Result<Vec<KnowledgeEntry>, StoreError> {
    store.list_active(filter).try_collect().await
}

/// How a backend should persist a planned upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    /// Only `last_checked` changed.
    Touch,
    Insert,
    /// Rewrite every column of an existing row.
    Update,
}

#[derive(Debug, Clone)]
pub(crate) struct UpsertPlan {
    pub outcome: UpsertOutcome,
    pub write: WriteKind,
    /// The row as it must look after the write.
    pub row: KnowledgeEntry,
}

/// Decide what offering `candidate` does to the store.
///
/// `existing` is the row for the candidate's key in any state. `hash_holder`
/// is an active row carrying the candidate's hash, if any; it may be
/// `existing` itself.
pub(crate) fn plan_upsert(
    candidate: &EntryCandidate,
    existing: Option<&KnowledgeEntry>,
    hash_holder: Option<&KnowledgeEntry>,
) -> UpsertPlan {
    let other_holder = hash_holder
        .filter(|h| existing.map_or(true, |e| e.id != h.id))
        .map(|h| h.id.clone());

    match existing {
        Some(entry) if entry.is_active => {
            if entry.content_hash == candidate.content_hash {
                UpsertPlan {
                    outcome: UpsertOutcome::Unchanged {
                        id: entry.id.clone(),
                    },
                    write: WriteKind::Touch,
                    row: touched(entry, candidate),
                }
            } else if let Some(holder) = other_holder {
                UpsertPlan {
                    outcome: UpsertOutcome::DuplicateSuppressed {
                        id: entry.id.clone(),
                        duplicate_of: holder.clone(),
                    },
                    write: WriteKind::Update,
                    row: rewritten(entry, candidate, Some(holder)),
                }
            } else {
                UpsertPlan {
                    outcome: UpsertOutcome::Updated {
                        id: entry.id.clone(),
                    },
                    write: WriteKind::Update,
                    row: rewritten(entry, candidate, None),
                }
            }
        }
        Some(entry) => match other_holder {
            Some(holder)
                if entry.content_hash == candidate.content_hash
                    && entry.duplicate_of.as_deref() == Some(holder.as_str()) =>
            {
                UpsertPlan {
                    outcome: UpsertOutcome::DuplicateSuppressed {
                        id: entry.id.clone(),
                        duplicate_of: holder,
                    },
                    write: WriteKind::Touch,
                    row: touched(entry, candidate),
                }
            }
            Some(holder) => UpsertPlan {
                outcome: UpsertOutcome::DuplicateSuppressed {
                    id: entry.id.clone(),
                    duplicate_of: holder.clone(),
                },
                write: WriteKind::Update,
                row: rewritten(entry, candidate, Some(holder)),
            },
            None => UpsertPlan {
                outcome: UpsertOutcome::Created {
                    id: entry.id.clone(),
                },
                write: WriteKind::Update,
                row: rewritten(entry, candidate, None),
            },
        },
        None => {
            let id = Uuid::new_v4().to_string();
            let row = KnowledgeEntry {
                id: id.clone(),
                source_type: candidate.source_type,
                source_url: candidate.source_url.clone(),
                title: candidate.title.clone(),
                content: candidate.content.clone(),
                content_hash: candidate.content_hash.clone(),
                last_updated: candidate.observed_at,
                last_checked: candidate.observed_at,
                is_active: other_holder.is_none(),
                deactivated_at: other_holder.as_ref().map(|_| candidate.observed_at),
                duplicate_of: other_holder.clone(),
            };
            let outcome = match other_holder {
                Some(holder) => UpsertOutcome::DuplicateSuppressed {
                    id,
                    duplicate_of: holder,
                },
                None => UpsertOutcome::Created { id },
            };
            UpsertPlan {
                outcome,
                write: WriteKind::Insert,
                row,
            }
        }
    }
}

/// Re-evaluate suppressed rows after a run's writes and deactivations.
///
/// `active_by_hash` maps the hash of every active row to its id and is
/// updated as rows are reactivated, so two copies of the same orphaned
/// content bring back only one. Returns the rows that changed.
pub(crate) fn plan_restores(
    active_by_hash: &mut HashMap<ContentHash, String>,
    suppressed: Vec<KnowledgeEntry>,
) -> Vec<KnowledgeEntry> {
    let mut changed = Vec::new();
    for mut row in suppressed {
        match active_by_hash.get(&row.content_hash) {
            Some(holder) if row.duplicate_of.as_deref() == Some(holder.as_str()) => {}
            Some(holder) => {
                row.duplicate_of = Some(holder.clone());
                changed.push(row);
            }
            None => {
                row.is_active = true;
                row.deactivated_at = None;
                row.duplicate_of = None;
                active_by_hash.insert(row.content_hash.clone(), row.id.clone());
                changed.push(row);
            }
        }
    }
    changed
}

fn touched(entry: &KnowledgeEntry, candidate: &EntryCandidate) -> KnowledgeEntry {
    let mut row = entry.clone();
    row.last_checked = row.last_checked.max(candidate.observed_at);
    row
}

/// Replace content in place. `duplicate_of` set means the row ends up inactive.
fn rewritten(
    entry: &KnowledgeEntry,
    candidate: &EntryCandidate,
    duplicate_of: Option<String>,
) -> KnowledgeEntry {
    let is_active = duplicate_of.is_none();
    KnowledgeEntry {
        id: entry.id.clone(),
        source_type: candidate.source_type,
        source_url: candidate.source_url.clone(),
        title: candidate.title.clone(),
        content: candidate.content.clone(),
        content_hash: candidate.content_hash.clone(),
        last_updated: entry.last_updated.max(candidate.observed_at),
        last_checked: entry.last_checked.max(candidate.observed_at),
        is_active,
        deactivated_at: if is_active {
            None
        } else {
            entry.deactivated_at.or(Some(candidate.observed_at))
        },
        duplicate_of,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::fingerprint;
    use crate::models::SourceType;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn candidate(url: &str, body: &str, secs: i64) -> EntryCandidate {
        EntryCandidate {
            source_type: SourceType::Page,
            source_url: url.to_string(),
            title: url.to_string(),
            content: body.to_string(),
            content_hash: fingerprint(&body.to_lowercase()),
            observed_at: at(secs),
        }
    }

    fn stored(c: &EntryCandidate) -> KnowledgeEntry {
        plan_upsert(c, None, None).row
    }

    #[test]
    fn first_sight_creates_active_entry() {
        let c = candidate("/a", "alpha", 0);
        let plan = plan_upsert(&c, None, None);
        assert!(matches!(plan.outcome, UpsertOutcome::Created { .. }));
        assert_eq!(plan.write, WriteKind::Insert);
        assert!(plan.row.is_active);
    }

    #[test]
    fn same_hash_is_unchanged_touch() {
        let first = stored(&candidate("/a", "alpha", 0));
        let again = candidate("/a", "alpha", 60);
        let plan = plan_upsert(&again, Some(&first), Some(&first));
        assert_eq!(plan.outcome, UpsertOutcome::Unchanged { id: first.id.clone() });
        assert_eq!(plan.write, WriteKind::Touch);
        assert_eq!(plan.row.last_updated, first.last_updated);
        assert_eq!(plan.row.last_checked, at(60));
    }

    #[test]
    fn changed_content_updates_in_place() {
        let first = stored(&candidate("/a", "alpha", 0));
        let changed = candidate("/a", "alpha two", 60);
        let plan = plan_upsert(&changed, Some(&first), None);
        assert_eq!(plan.outcome, UpsertOutcome::Updated { id: first.id.clone() });
        assert_eq!(plan.row.content, "alpha two");
        assert_eq!(plan.row.last_updated, at(60));
    }

    #[test]
    fn cross_source_duplicate_is_suppressed_not_dropped() {
        let holder = stored(&candidate("/a", "alpha", 0));
        let copy = candidate("/a-copy", "alpha", 1);
        let plan = plan_upsert(&copy, None, Some(&holder));
        match plan.outcome {
            UpsertOutcome::DuplicateSuppressed { duplicate_of, .. } => {
                assert_eq!(duplicate_of, holder.id)
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!plan.row.is_active);
        assert_eq!(plan.row.deactivated_at, Some(at(1)));
    }

    #[test]
    fn update_colliding_with_other_source_deactivates() {
        let holder = stored(&candidate("/a", "alpha", 0));
        let b = stored(&candidate("/b", "beta", 0));
        let changed = candidate("/b", "alpha", 10);
        let plan = plan_upsert(&changed, Some(&b), Some(&holder));
        assert!(matches!(plan.outcome, UpsertOutcome::DuplicateSuppressed { .. }));
        assert!(!plan.row.is_active);
    }

    #[test]
    fn inactive_row_is_reactivated_with_same_id() {
        let mut gone = stored(&candidate("/a", "alpha", 0));
        gone.is_active = false;
        gone.deactivated_at = Some(at(5));
        let back = candidate("/a", "alpha", 10);
        let plan = plan_upsert(&back, Some(&gone), None);
        assert_eq!(plan.outcome, UpsertOutcome::Created { id: gone.id.clone() });
        assert!(plan.row.is_active);
        assert_eq!(plan.row.deactivated_at, None);
    }

    #[test]
    fn repeated_suppression_only_touches() {
        let holder = stored(&candidate("/a", "alpha", 0));
        let copy = plan_upsert(&candidate("/a-copy", "alpha", 1), None, Some(&holder)).row;
        let plan = plan_upsert(&candidate("/a-copy", "alpha", 20), Some(&copy), Some(&holder));
        assert_eq!(plan.write, WriteKind::Touch);
        assert!(matches!(plan.outcome, UpsertOutcome::DuplicateSuppressed { .. }));
    }

    fn suppressed_copy(holder: &KnowledgeEntry, url: &str, body: &str) -> KnowledgeEntry {
        plan_upsert(&candidate(url, body, 1), None, Some(holder)).row
    }

    #[test]
    fn orphaned_copy_is_reactivated() {
        let holder = stored(&candidate("/a", "alpha", 0));
        let copy = suppressed_copy(&holder, "/a-new", "alpha");

        let mut active = HashMap::new();
        let changed = plan_restores(&mut active, vec![copy.clone()]);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].id, copy.id);
        assert!(changed[0].is_active);
        assert_eq!(changed[0].duplicate_of, None);
        assert_eq!(changed[0].deactivated_at, None);
        assert_eq!(active.get(&copy.content_hash), Some(&copy.id));
    }

    #[test]
    fn copy_with_live_holder_is_left_alone() {
        let holder = stored(&candidate("/a", "alpha", 0));
        let copy = suppressed_copy(&holder, "/a-copy", "alpha");

        let mut active = HashMap::from([(holder.content_hash.clone(), holder.id.clone())]);
        assert!(plan_restores(&mut active, vec![copy]).is_empty());
    }

    #[test]
    fn copy_is_repointed_when_content_moved_to_another_entry() {
        let holder = stored(&candidate("/a", "alpha", 0));
        let copy = suppressed_copy(&holder, "/a-copy", "alpha");
        let other = stored(&candidate("/c", "alpha", 5));

        let mut active = HashMap::from([(other.content_hash.clone(), other.id.clone())]);
        let changed = plan_restores(&mut active, vec![copy]);
        assert_eq!(changed.len(), 1);
        assert!(!changed[0].is_active);
        assert_eq!(changed[0].duplicate_of.as_deref(), Some(other.id.as_str()));
    }

    #[test]
    fn only_one_of_two_orphaned_copies_comes_back() {
        let holder = stored(&candidate("/a", "alpha", 0));
        let first = suppressed_copy(&holder, "/b", "alpha");
        let second = suppressed_copy(&holder, "/c", "alpha");

        let mut active = HashMap::new();
        let changed = plan_restores(&mut active, vec![first.clone(), second]);
        assert_eq!(changed.iter().filter(|r| r.is_active).count(), 1);
        assert!(changed[0].is_active);
        assert_eq!(changed[1].duplicate_of.as_deref(), Some(first.id.as_str()));
    }

    #[test]
    fn last_updated_never_moves_backwards() {
        let first = stored(&candidate("/a", "alpha", 100));
        let stale_clock = candidate("/a", "alpha changed", 50);
        let plan = plan_upsert(&stale_clock, Some(&first), None);
        assert_eq!(plan.row.last_updated, at(100));
    }
}
