//! Retrieval of raw documents from the target site.
//!
//! [`SourceFetcher`] is the seam the refresh scheduler depends on; tests
//! swap in synthetic fetchers. [`HttpFetcher`] is the real implementation:
//!
//! - every request carries a timeout (`[fetch] timeout_secs`);
//! - HTTP 429, 5xx, timeouts and connection errors are retried up to
//!   `[fetch] max_retries` times with exponential backoff;
//! - other 4xx responses fail immediately (401/403 as `Forbidden`, the
//!   rest as `NotFound`);
//! - redirects are followed only while they stay on an allowed host;
//! - requests to one host are spaced at least `[fetch] min_delay_ms` apart,
//!   across all workers sharing the fetcher.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{Config, FetchConfig, SiteConfig};
use crate::error::{ExtractionError, FetchError};
use crate::extract::{self, DocumentKind};
use crate::models::{RawDocument, SourceType};

const MAX_REDIRECTS: usize = 10;

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch one source and extract its text.
    async fn fetch(&self, url: &str) -> Result<RawDocument, FetchError>;
}

/// Body of a successful GET, before extraction.
#[derive(Debug, Clone)]
pub struct FetchedBytes {
    /// URL after redirects.
    pub final_url: Url,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// True when `url` is http(s) on one of `allowed_hosts` (lower-cased).
pub fn is_on_site(allowed_hosts: &[String], url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
        && url
            .host_str()
            .is_some_and(|h| allowed_hosts.iter().any(|a| a.eq_ignore_ascii_case(h)))
}

/// Reserves per-host request slots `min_delay` apart.
struct HostRateLimiter {
    min_delay: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl HostRateLimiter {
    fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    async fn wait(&self, host: &str) {
        if self.min_delay.is_zero() {
            return;
        }
        let slot = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = slots
                .get(host)
                .copied()
                .filter(|t| *t > now)
                .unwrap_or(now);
            slots.insert(host.to_string(), slot + self.min_delay);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

pub struct HttpFetcher {
    client: reqwest::Client,
    allowed_hosts: Vec<String>,
    max_retries: u32,
    backoff_base: Duration,
    limiter: HostRateLimiter,
}

impl HttpFetcher {
    pub fn new(site: &SiteConfig, fetch: &FetchConfig) -> Result<Self> {
        let allowed_hosts = site.effective_allowed_hosts();
        let redirect_hosts = allowed_hosts.clone();
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if is_on_site(&redirect_hosts, attempt.url()) {
                attempt.follow()
            } else {
                let target = attempt.url().to_string();
                attempt.error(format!("off-site redirect to {target}"))
            }
        });

        let client = reqwest::Client::builder()
            .timeout(fetch.timeout())
            .user_agent(fetch.user_agent.clone())
            .redirect(policy)
            .build()?;

        Ok(Self {
            client,
            allowed_hosts,
            max_retries: fetch.max_retries,
            backoff_base: fetch.backoff_base(),
            limiter: HostRateLimiter::new(fetch.min_delay()),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.site, &config.fetch)
    }

    pub fn allowed_hosts(&self) -> &[String] {
        &self.allowed_hosts
    }

    /// GET `url` with retry and backoff. Does no extraction.
    pub async fn get_bytes(&self, url: &str) -> Result<FetchedBytes, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::Forbidden {
            url: url.to_string(),
            reason: format!("not a valid URL: {e}"),
        })?;
        if !is_on_site(&self.allowed_hosts, &parsed) {
            return Err(FetchError::Forbidden {
                url: url.to_string(),
                reason: "host is not part of the site".to_string(),
            });
        }
        let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // base, 2x base, 4x base, ... capped at 32x
                let delay = self.backoff_base * (1u32 << (attempt - 1).min(5));
                debug!(url, attempt, ?delay, "retrying fetch");
                tokio::time::sleep(delay).await;
            }

            self.limiter.wait(&host).await;
            let resp = self.client.get(parsed.clone()).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let final_url = response.url().clone();
                        let content_type = response
                            .headers()
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        match response.bytes().await {
                            Ok(body) => {
                                debug!(url, %status, bytes = body.len(), "fetched");
                                return Ok(FetchedBytes {
                                    final_url,
                                    content_type,
                                    body: body.to_vec(),
                                });
                            }
                            Err(e) => {
                                let err = classify_reqwest_error(url, &e);
                                if !err.is_transient() {
                                    return Err(err);
                                }
                                last_err = Some(err);
                                continue;
                            }
                        }
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(FetchError::NetworkFailure {
                            url: url.to_string(),
                            message: format!("HTTP {status}"),
                        });
                        continue;
                    }

                    return Err(match status.as_u16() {
                        401 | 403 => FetchError::Forbidden {
                            url: url.to_string(),
                            reason: format!("HTTP {status}"),
                        },
                        code => FetchError::NotFound {
                            url: url.to_string(),
                            status: code,
                        },
                    });
                }
                Err(e) => {
                    let err = classify_reqwest_error(url, &e);
                    if !err.is_transient() {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| FetchError::NetworkFailure {
            url: url.to_string(),
            message: "fetch failed after retries".to_string(),
        }))
    }
}

fn classify_reqwest_error(url: &str, err: &reqwest::Error) -> FetchError {
    if err.is_redirect() {
        return FetchError::Forbidden {
            url: url.to_string(),
            reason: error_chain(err),
        };
    }
    if err.is_timeout() {
        return FetchError::Timeout {
            url: url.to_string(),
        };
    }
    FetchError::NetworkFailure {
        url: url.to_string(),
        message: error_chain(err),
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<RawDocument, FetchError> {
        let fetched = self.get_bytes(url).await?;
        let extraction_failed = |source: ExtractionError| FetchError::Extraction {
            url: url.to_string(),
            source,
        };

        let kind = extract::classify(fetched.content_type.as_deref(), &fetched.final_url)
            .map_err(extraction_failed)?;

        match kind {
            DocumentKind::Pdf => {
                let title = extract::title_from_url(&fetched.final_url);
                let body = fetched.body;
                let text = tokio::task::spawn_blocking(move || extract::extract_pdf_pages(&body))
                    .await
                    .map_err(|e| ExtractionError::CorruptDocument(e.to_string()))
                    .and_then(|r| r)
                    .map_err(extraction_failed)?;
                Ok(RawDocument {
                    url: url.to_string(),
                    source_type: SourceType::Pdf,
                    title,
                    text,
                    linked_pdfs: Vec::new(),
                })
            }
            DocumentKind::Html => {
                let html = String::from_utf8_lossy(&fetched.body);
                let page = extract::extract_html(&html, &fetched.final_url)
                    .map_err(extraction_failed)?;
                let linked_pdfs = page
                    .pdf_links
                    .into_iter()
                    .filter(|link| {
                        Url::parse(link).is_ok_and(|u| is_on_site(&self.allowed_hosts, &u))
                    })
                    .collect();
                Ok(RawDocument {
                    url: url.to_string(),
                    source_type: SourceType::Page,
                    title: page.title,
                    text: page.text,
                    linked_pdfs,
                })
            }
            DocumentKind::PlainText => Ok(RawDocument {
                url: url.to_string(),
                source_type: SourceType::Page,
                title: extract::title_from_url(&fetched.final_url),
                text: String::from_utf8_lossy(&fetched.body).into_owned(),
                linked_pdfs: Vec::new(),
            }),
        }
    }
}
