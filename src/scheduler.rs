//! Refresh runs: fetch every source, normalize, fingerprint, write.
//!
//! A [`RefreshScheduler`] owns the pipeline and a run lock. A run moves
//! through [`RunState::Fetching`], [`RunState::Normalizing`],
//! [`RunState::Diffing`] and [`RunState::Writing`], then back to
//! [`RunState::Idle`]. Only one run may be past `Idle` at a time; a second
//! [`trigger`](RefreshScheduler::trigger) gets [`RunOutcome::AlreadyRunning`]
//! and is not queued.
//!
//! Per-source failures are counted in the [`RefreshSummary`] and never abort
//! a run. Enumeration and store failures do.
//!
//! ```text
//! enumerate ─▶ fetch (N workers) ─▶ linked PDFs ─▶ normalize ─▶ fingerprint
//!                                                                    │
//!        deactivate_missing(seen) ◀── upsert in enumeration order ◀──┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{FetchError, RefreshError, StoreError};
use crate::fetch::{HttpFetcher, SourceFetcher};
use crate::hash::fingerprint;
use crate::models::{EntryCandidate, EntryFilter, RawDocument, SourceType};
use crate::normalize::{DocumentNormalizer, Normalized};
use crate::sitemap::{self, SourceEnumerator};
use crate::store::sqlite::SqliteStore;
use crate::store::{KnowledgeStore, UpsertOutcome};

/// Source of the current time. Tests drive runs with a fixed clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    Fetching = 1,
    Normalizing = 2,
    Diffing = 3,
    Writing = 4,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RunState::Fetching,
            2 => RunState::Normalizing,
            3 => RunState::Diffing,
            4 => RunState::Writing,
            _ => RunState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Skip sources confirmed within `min_recheck`.
    Incremental,
    /// Refetch everything.
    Full,
}

#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    pub workers: usize,
    /// Ceiling on one source's fetch, retries included.
    pub fetch_deadline: Duration,
    pub min_recheck: chrono::Duration,
    pub refresh_after: chrono::Duration,
    pub min_content_chars: usize,
    pub follow_pdf_links: bool,
    pub max_linked_pdfs: usize,
}

impl RefreshPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.fetch.workers.max(1),
            fetch_deadline: config.fetch.deadline(),
            min_recheck: chrono::Duration::seconds(config.refresh.min_recheck_secs as i64),
            refresh_after: chrono::Duration::seconds(config.refresh.refresh_after_secs as i64),
            min_content_chars: config.normalize.min_content_chars,
            follow_pdf_links: config.site.follow_pdf_links,
            max_linked_pdfs: config.site.max_linked_pdfs,
        }
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            workers: 4,
            fetch_deadline: Duration::from_secs(120),
            min_recheck: chrono::Duration::hours(1),
            refresh_after: chrono::Duration::hours(6),
            min_content_chars: 100,
            follow_pdf_links: true,
            max_linked_pdfs: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuppressedEvent {
    pub url: String,
    pub id: String,
    pub duplicate_of: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedSource {
    pub url: String,
    pub kind: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    SuccessWithWarnings,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub trigger: Trigger,
    pub mode: RunMode,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deactivated: u64,
    pub duplicates_suppressed: usize,
    pub failed: usize,
    /// Fresh sources not refetched, plus documents too short to store.
    pub skipped: usize,
    pub suppressed: Vec<SuppressedEvent>,
    pub failures: Vec<FailedSource>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
}

impl RefreshSummary {
    fn new(trigger: Trigger, mode: RunMode, started_at: DateTime<Utc>) -> Self {
        Self {
            trigger,
            mode,
            created: 0,
            updated: 0,
            unchanged: 0,
            deactivated: 0,
            duplicates_suppressed: 0,
            failed: 0,
            skipped: 0,
            suppressed: Vec::new(),
            failures: Vec::new(),
            started_at,
            finished_at: started_at,
            status: RunStatus::Success,
        }
    }

    /// Sources written to the store in any form.
    pub fn processed(&self) -> usize {
        self.created + self.updated + self.unchanged + self.duplicates_suppressed
    }

    fn record_failure(&mut self, err: &FetchError) {
        self.failed += 1;
        self.failures.push(FailedSource {
            url: err.url().to_string(),
            kind: err.kind().to_string(),
            error: err.to_string(),
        });
    }

    fn record_upsert(&mut self, url: &str, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created { .. } => self.created += 1,
            UpsertOutcome::Updated { .. } => self.updated += 1,
            UpsertOutcome::Unchanged { .. } => self.unchanged += 1,
            UpsertOutcome::DuplicateSuppressed { id, duplicate_of } => {
                warn!(url, %id, %duplicate_of, "duplicate content suppressed");
                self.duplicates_suppressed += 1;
                self.suppressed.push(SuppressedEvent {
                    url: url.to_string(),
                    id,
                    duplicate_of,
                });
            }
        }
    }

    /// A suppressed copy came back because its holder went away.
    fn record_restored(&mut self, id: &str) {
        info!(%id, "suppressed copy reactivated");
        if let Some(pos) = self.suppressed.iter().position(|e| e.id == id) {
            self.suppressed.remove(pos);
            self.duplicates_suppressed -= 1;
        }
        self.created += 1;
    }

    fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = finished_at;
        self.status = if self.failed > 0 {
            RunStatus::SuccessWithWarnings
        } else {
            RunStatus::Success
        };
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(RefreshSummary),
    AlreadyRunning,
}

/// Holds the run lock; the state returns to `Idle` when dropped, whether the
/// run finished, failed, or panicked.
struct RunGuard<'a> {
    state: &'a AtomicU8,
}

impl<'a> RunGuard<'a> {
    fn acquire(state: &'a AtomicU8) -> Option<Self> {
        state
            .compare_exchange(
                RunState::Idle as u8,
                RunState::Fetching as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| Self { state })
    }

    fn enter(&self, next: RunState) {
        debug!(state = ?next, "refresh state");
        self.state.store(next as u8, Ordering::Release);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.state.store(RunState::Idle as u8, Ordering::Release);
    }
}

type FetchResult = (String, Result<RawDocument, FetchError>);

pub struct RefreshScheduler {
    store: Arc<dyn KnowledgeStore>,
    fetcher: Arc<dyn SourceFetcher>,
    enumerator: Arc<dyn SourceEnumerator>,
    normalizer: DocumentNormalizer,
    clock: Arc<dyn Clock>,
    policy: RefreshPolicy,
    state: AtomicU8,
}

impl RefreshScheduler {
    pub fn new(
        store: Arc<dyn KnowledgeStore>,
        fetcher: Arc<dyn SourceFetcher>,
        enumerator: Arc<dyn SourceEnumerator>,
        normalizer: DocumentNormalizer,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            store,
            fetcher,
            enumerator,
            normalizer,
            clock: Arc::new(SystemClock),
            policy,
            state: AtomicU8::new(RunState::Idle as u8),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Wire the HTTP fetcher and the configured enumerator to `store`.
    pub fn from_config(config: &Config, store: Arc<dyn KnowledgeStore>) -> Result<Self> {
        let fetcher = Arc::new(HttpFetcher::from_config(config)?);
        let enumerator = sitemap::from_config(fetcher.clone(), &config.site);
        Ok(Self::new(
            store,
            fetcher,
            enumerator,
            DocumentNormalizer::new(&config.normalize.boilerplate),
            RefreshPolicy::from_config(config),
        ))
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Start a run now unless one is already in progress.
    pub async fn trigger(&self, trigger: Trigger, mode: RunMode) -> Result<RunOutcome, RefreshError> {
        let Some(guard) = RunGuard::acquire(&self.state) else {
            info!(?trigger, "refresh already running, trigger rejected");
            return Ok(RunOutcome::AlreadyRunning);
        };
        let summary = self.run(&guard, trigger, mode).await?;
        Ok(RunOutcome::Completed(summary))
    }

    /// True when the store is empty or its newest confirmation is older
    /// than `refresh_after`.
    pub async fn is_due(&self) -> Result<bool, StoreError> {
        Ok(match self.store.last_refresh().await? {
            None => true,
            Some(last) => self.clock.now() - last >= self.policy.refresh_after,
        })
    }

    /// Check every `interval` and run an incremental refresh when due.
    /// Returns once `shutdown` flips to true or its sender is dropped.
    pub async fn run_scheduled(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.is_due().await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(error = %e, "could not read last refresh time");
                    continue;
                }
            }

            match self.trigger(Trigger::Timer, RunMode::Incremental).await {
                Ok(RunOutcome::Completed(_)) => {}
                Ok(RunOutcome::AlreadyRunning) => debug!("timer tick skipped, run in progress"),
                Err(e) => error!(error = %e, "scheduled refresh failed"),
            }
        }
        info!("refresh timer stopped");
    }

    async fn run(
        &self,
        guard: &RunGuard<'_>,
        trigger: Trigger,
        mode: RunMode,
    ) -> Result<RefreshSummary, RefreshError> {
        let started_at = self.clock.now();
        let mut summary = RefreshSummary::new(trigger, mode, started_at);
        info!(?trigger, ?mode, "refresh started");

        let urls = self.enumerator.enumerate().await?;
        info!(sources = urls.len(), "sources enumerated");

        let mut seen: HashSet<String> = HashSet::new();
        let fresh = match mode {
            RunMode::Incremental => self.fresh_sources(started_at).await?,
            RunMode::Full => HashMap::new(),
        };

        guard.enter(RunState::Fetching);
        let to_fetch = self.skip_fresh(&urls, &fresh, &mut seen, &mut summary);
        let mut fetched = self.fetch_all(&to_fetch).await;

        if self.policy.follow_pdf_links {
            let (linked, truncated) = self.linked_pdfs(&fetched, &urls);
            // Links are only known for pages fetched this run. If any page
            // was skipped, failed transiently or had its links cut off, the
            // PDFs already stored cannot be judged unlinked.
            let links_complete = to_fetch.len() == urls.len()
                && !truncated
                && fetched
                    .iter()
                    .all(|(_, r)| r.as_ref().err().map_or(true, |e| !e.is_transient()));
            if !links_complete {
                let kept = self.keep_stored_pdfs(&mut seen).await?;
                debug!(kept, "page links incomplete, stored PDFs kept");
            }
            if !linked.is_empty() {
                debug!(count = linked.len(), "fetching linked PDFs");
                let pdfs = self.skip_fresh(&linked, &fresh, &mut seen, &mut summary);
                fetched.extend(self.fetch_all(&pdfs).await);
            }
        }

        guard.enter(RunState::Normalizing);
        let mut documents = Vec::new();
        for (url, result) in fetched {
            match result {
                Ok(doc) => match self.normalizer.normalize(&doc.text) {
                    Normalized::Document(text)
                        if text.display_text.chars().count() >= self.policy.min_content_chars =>
                    {
                        documents.push((doc, text));
                    }
                    _ => {
                        debug!(url = %url, "document empty or too short, skipped");
                        summary.skipped += 1;
                    }
                },
                Err(e) => {
                    warn!(url = %url, kind = e.kind(), error = %e, "source failed");
                    if e.is_transient() {
                        seen.insert(url);
                    }
                    summary.record_failure(&e);
                }
            }
        }

        guard.enter(RunState::Diffing);
        let observed_at = self.clock.now();
        let candidates: Vec<EntryCandidate> = documents
            .into_iter()
            .map(|(doc, text)| EntryCandidate {
                source_type: doc.source_type,
                source_url: doc.url,
                title: doc.title,
                content_hash: fingerprint(&text.hashable_text),
                content: text.display_text,
                observed_at,
            })
            .collect();

        guard.enter(RunState::Writing);
        for candidate in &candidates {
            seen.insert(candidate.source_url.clone());
            let outcome = self.store.upsert(candidate).await?;
            summary.record_upsert(&candidate.source_url, outcome);
        }
        summary.deactivated = self.store.deactivate_missing(&seen, self.clock.now()).await?;
        for id in self.store.restore_orphaned_duplicates(&seen).await? {
            summary.record_restored(&id);
        }

        summary.finish(self.clock.now());
        info!(
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            deactivated = summary.deactivated,
            duplicates = summary.duplicates_suppressed,
            failed = summary.failed,
            skipped = summary.skipped,
            "refresh finished"
        );
        Ok(summary)
    }

    /// Active page/pdf entries confirmed within `min_recheck` of `now`.
    async fn fresh_sources(
        &self,
        now: DateTime<Utc>,
    ) -> Result<HashMap<String, SourceType>, StoreError> {
        let mut fresh = HashMap::new();
        let mut entries = self.store.list_active(EntryFilter::default());
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if entry.source_type != SourceType::Manual
                && now - entry.last_checked < self.policy.min_recheck
            {
                fresh.insert(entry.source_url, entry.source_type);
            }
        }
        Ok(fresh)
    }

    /// Mark every active PDF entry seen. Returns how many there were.
    async fn keep_stored_pdfs(&self, seen: &mut HashSet<String>) -> Result<usize, StoreError> {
        let filter = EntryFilter {
            source_type: Some(SourceType::Pdf),
            url_prefix: None,
        };
        let mut count = 0;
        let mut entries = self.store.list_active(filter);
        while let Some(entry) = entries.next().await {
            seen.insert(entry?.source_url);
            count += 1;
        }
        Ok(count)
    }

    /// URLs that still need fetching. Fresh ones are marked seen and skipped.
    fn skip_fresh(
        &self,
        urls: &[String],
        fresh: &HashMap<String, SourceType>,
        seen: &mut HashSet<String>,
        summary: &mut RefreshSummary,
    ) -> Vec<String> {
        let mut out = Vec::with_capacity(urls.len());
        for url in urls {
            if fresh.contains_key(url) {
                seen.insert(url.clone());
                summary.skipped += 1;
            } else {
                out.push(url.clone());
            }
        }
        out
    }

    /// Fetch with bounded parallelism; results come back in input order.
    async fn fetch_all(&self, urls: &[String]) -> Vec<FetchResult> {
        let mut results: Vec<(usize, FetchResult)> = stream::iter(urls.iter().cloned().enumerate())
            .map(|(i, url)| async move {
                let result =
                    match tokio::time::timeout(self.policy.fetch_deadline, self.fetcher.fetch(&url))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(FetchError::Timeout { url: url.clone() }),
                    };
                (i, (url, result))
            })
            .buffer_unordered(self.policy.workers)
            .collect()
            .await;
        results.sort_by_key(|(i, _)| *i);
        results.into_iter().map(|(_, r)| r).collect()
    }

    /// Distinct PDF links from fetched pages, excluding enumerated sources.
    /// The flag is true when `max_linked_pdfs` cut the list short.
    fn linked_pdfs(&self, fetched: &[FetchResult], enumerated: &[String]) -> (Vec<String>, bool) {
        let mut known: HashSet<&str> = enumerated.iter().map(String::as_str).collect();
        let mut out = Vec::new();
        for doc in fetched.iter().filter_map(|(_, r)| r.as_ref().ok()) {
            for link in &doc.linked_pdfs {
                if !known.insert(link.as_str()) {
                    continue;
                }
                if out.len() >= self.policy.max_linked_pdfs {
                    return (out, true);
                }
                out.push(link.clone());
            }
        }
        (out, false)
    }
}

/// `kb refresh`: one run against the configured site.
pub async fn run_refresh(config: &Config, full: bool) -> Result<()> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let scheduler = RefreshScheduler::from_config(config, store.clone())?;
    let mode = if full { RunMode::Full } else { RunMode::Incremental };

    let outcome = scheduler.trigger(Trigger::Manual, mode).await;
    store.close().await;

    match outcome? {
        RunOutcome::Completed(summary) => print_summary(&summary),
        RunOutcome::AlreadyRunning => println!("refresh already running"),
    }
    Ok(())
}

/// `kb schedule`: run the refresh timer until Ctrl-C.
pub async fn run_schedule(config: &Config) -> Result<()> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let scheduler = Arc::new(RefreshScheduler::from_config(config, store.clone())?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let interval = Duration::from_secs(config.refresh.check_interval_secs);
    println!(
        "refresh timer: checking every {}s, refreshing when older than {}s",
        config.refresh.check_interval_secs, config.refresh.refresh_after_secs
    );
    let timer = tokio::spawn(scheduler.run_scheduled(interval, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    let _ = shutdown_tx.send(true);
    timer.await?;
    store.close().await;
    Ok(())
}

pub fn print_summary(summary: &RefreshSummary) {
    println!("refresh ({:?}, {:?})", summary.trigger, summary.mode);
    println!("  created:    {}", summary.created);
    println!("  updated:    {}", summary.updated);
    println!("  unchanged:  {}", summary.unchanged);
    println!("  deactivated: {}", summary.deactivated);
    println!("  duplicates: {}", summary.duplicates_suppressed);
    println!("  skipped:    {}", summary.skipped);
    println!("  failed:     {}", summary.failed);
    for event in &summary.suppressed {
        println!("    duplicate {} -> {}", event.url, event.duplicate_of);
    }
    for failure in &summary.failures {
        println!("    failed {} ({}): {}", failure.url, failure.kind, failure.error);
    }
    let took = summary.finished_at - summary.started_at;
    println!("  took: {}s", took.num_seconds());
    match summary.status {
        RunStatus::Success => println!("ok"),
        RunStatus::SuccessWithWarnings => println!("ok (with warnings)"),
    }
}
