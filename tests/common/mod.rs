//! Synthetic collaborators for driving refresh runs without a network.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use campus_kb::error::{EnumerationError, FetchError};
use campus_kb::fetch::SourceFetcher;
use campus_kb::models::{RawDocument, SourceType};
use campus_kb::normalize::DocumentNormalizer;
use campus_kb::scheduler::{Clock, RefreshPolicy, RefreshScheduler};
use campus_kb::sitemap::SourceEnumerator;
use campus_kb::store::KnowledgeStore;

pub const SITE: &str = "https://www.example.edu";

pub fn url(path: &str) -> String {
    format!("{}{}", SITE, path)
}

/// An HTML page document with `body` as its extracted text.
pub fn page(path: &str, title: &str, body: &str) -> RawDocument {
    RawDocument {
        url: url(path),
        source_type: SourceType::Page,
        title: title.to_string(),
        text: body.to_string(),
        linked_pdfs: Vec::new(),
    }
}

pub fn pdf(path: &str, body: &str) -> RawDocument {
    RawDocument {
        url: url(path),
        source_type: SourceType::Pdf,
        title: path.rsplit('/').next().unwrap_or(path).to_string(),
        text: format!("[page 1]\n{}", body),
        linked_pdfs: Vec::new(),
    }
}

enum Response {
    Document(RawDocument),
    Failure(FetchError),
    /// Sleep before answering with the document.
    Slow(Duration, RawDocument),
    /// Wait for [`FakeFetcher::release`] before answering.
    Gated(RawDocument),
}

/// Serves canned documents by URL. Unknown URLs are 404s.
#[derive(Default)]
pub struct FakeFetcher {
    responses: Mutex<HashMap<String, Response>>,
    calls: AtomicUsize,
    gate: Notify,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, doc: RawDocument) {
        self.set(doc.url.clone(), Response::Document(doc));
    }

    pub fn fail(&self, url: &str, err: FetchError) {
        self.set(url.to_string(), Response::Failure(err));
    }

    pub fn serve_slowly(&self, doc: RawDocument, delay: Duration) {
        self.set(doc.url.clone(), Response::Slow(delay, doc));
    }

    pub fn serve_gated(&self, doc: RawDocument) {
        self.set(doc.url.clone(), Response::Gated(doc));
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set(&self, url: String, response: Response) {
        self.responses.lock().unwrap().insert(url, response);
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<RawDocument, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let planned = {
            let responses = self.responses.lock().unwrap();
            match responses.get(url) {
                Some(Response::Document(doc)) => Ok((None, false, doc.clone())),
                Some(Response::Failure(err)) => Err(err.clone()),
                Some(Response::Slow(delay, doc)) => Ok((Some(*delay), false, doc.clone())),
                Some(Response::Gated(doc)) => Ok((None, true, doc.clone())),
                None => Err(FetchError::NotFound {
                    url: url.to_string(),
                    status: 404,
                }),
            }
        };
        let (delay, gated, doc) = planned?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if gated {
            self.gate.notified().await;
        }
        Ok(doc)
    }
}

/// Source list that tests can change between runs.
#[derive(Default)]
pub struct FakeSources {
    urls: Mutex<Vec<String>>,
}

impl FakeSources {
    pub fn new(paths: &[&str]) -> Arc<Self> {
        let sources = Arc::new(Self::default());
        sources.set(paths);
        sources
    }

    pub fn set(&self, paths: &[&str]) {
        *self.urls.lock().unwrap() = paths.iter().map(|p| url(p)).collect();
    }
}

#[async_trait]
impl SourceEnumerator for FakeSources {
    async fn enumerate(&self) -> Result<Vec<String>, EnumerationError> {
        let urls = self.urls.lock().unwrap().clone();
        if urls.is_empty() {
            return Err(EnumerationError::Empty);
        }
        Ok(urls)
    }
}

/// A clock that only moves when told to.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn at(secs: i64) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(DateTime::from_timestamp(secs, 0).unwrap()),
        })
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Policy for tests: short documents allowed, nothing counts as fresh.
pub fn test_policy() -> RefreshPolicy {
    RefreshPolicy {
        workers: 4,
        fetch_deadline: Duration::from_secs(5),
        min_recheck: chrono::Duration::zero(),
        refresh_after: chrono::Duration::hours(6),
        min_content_chars: 0,
        follow_pdf_links: true,
        max_linked_pdfs: 20,
    }
}

pub fn scheduler(
    store: Arc<dyn KnowledgeStore>,
    fetcher: Arc<FakeFetcher>,
    sources: Arc<FakeSources>,
    policy: RefreshPolicy,
) -> RefreshScheduler {
    RefreshScheduler::new(
        store,
        fetcher,
        sources,
        DocumentNormalizer::default(),
        policy,
    )
}
