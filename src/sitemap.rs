//! Source enumeration: the fixed set of URLs a refresh run visits.
//!
//! [`StaticSources`] returns the configured `[site] urls`. [`SitemapSources`]
//! reads the site's sitemap (following one level of `<sitemapindex>`),
//! keeps on-site URLs whose path mentions one of `[site] keywords`, and
//! caps the list at `[site] max_urls`. When no sitemap URL matches a
//! keyword, the static list is used instead.
//!
//! Any failure to read the sitemap is fatal for the run, and so is an empty
//! result: a run that visits nothing would deactivate the whole store.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Url;
use tracing::{debug, warn};

use crate::config::SiteConfig;
use crate::error::EnumerationError;
use crate::fetch::{is_on_site, HttpFetcher};

#[async_trait]
pub trait SourceEnumerator: Send + Sync {
    /// Ordered, de-duplicated source URLs. Never empty on success.
    async fn enumerate(&self) -> Result<Vec<String>, EnumerationError>;
}

pub struct StaticSources {
    urls: Vec<String>,
}

impl StaticSources {
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl SourceEnumerator for StaticSources {
    async fn enumerate(&self) -> Result<Vec<String>, EnumerationError> {
        let urls = dedup(self.urls.iter().map(|u| u.trim().to_string()));
        if urls.is_empty() {
            return Err(EnumerationError::Empty);
        }
        Ok(urls)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SitemapKind {
    UrlSet,
    Index,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Sitemap {
    kind: SitemapKind,
    locs: Vec<String>,
}

pub struct SitemapSources {
    fetcher: Arc<HttpFetcher>,
    sitemap_url: String,
    keywords: Vec<String>,
    fallback: Vec<String>,
    max_urls: usize,
}

impl SitemapSources {
    pub fn new(fetcher: Arc<HttpFetcher>, sitemap_url: impl Into<String>, site: &SiteConfig) -> Self {
        Self {
            fetcher,
            sitemap_url: sitemap_url.into(),
            keywords: site.keywords.iter().map(|k| k.to_lowercase()).collect(),
            fallback: site.urls.clone(),
            max_urls: site.max_urls,
        }
    }

    async fn load(&self, url: &str) -> Result<Sitemap, EnumerationError> {
        let fetched = self
            .fetcher
            .get_bytes(url)
            .await
            .map_err(EnumerationError::Unreachable)?;
        parse_sitemap(&fetched.body, url)
    }

    fn wanted(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        if !is_on_site(self.fetcher.allowed_hosts(), &parsed) {
            return false;
        }
        let lower = url.to_lowercase();
        self.keywords.is_empty() || self.keywords.iter().any(|k| lower.contains(k.as_str()))
    }
}

#[async_trait]
impl SourceEnumerator for SitemapSources {
    async fn enumerate(&self) -> Result<Vec<String>, EnumerationError> {
        let root = self.load(&self.sitemap_url).await?;

        let locs = match root.kind {
            SitemapKind::UrlSet => root.locs,
            SitemapKind::Index => {
                let mut locs = Vec::new();
                for child in &root.locs {
                    let on_site =
                        Url::parse(child).is_ok_and(|u| is_on_site(self.fetcher.allowed_hosts(), &u));
                    if !on_site {
                        debug!(child = %child, "skipping off-site child sitemap");
                        continue;
                    }
                    let sitemap = self.load(child).await?;
                    if sitemap.kind == SitemapKind::Index {
                        warn!(child = %child, "ignoring nested sitemap index");
                        continue;
                    }
                    locs.extend(sitemap.locs);
                }
                locs
            }
        };

        let total = locs.len();
        let mut urls = dedup(locs.into_iter().filter(|u| self.wanted(u)));
        urls.truncate(self.max_urls);
        debug!(total, kept = urls.len(), "filtered sitemap");

        if urls.is_empty() {
            warn!(
                sitemap = %self.sitemap_url,
                "no sitemap URL matched the keyword filter, using configured urls"
            );
            urls = dedup(self.fallback.iter().map(|u| u.trim().to_string()));
            urls.truncate(self.max_urls);
        }

        if urls.is_empty() {
            return Err(EnumerationError::Empty);
        }
        Ok(urls)
    }
}

/// Pick the enumerator the configuration asks for.
pub fn from_config(fetcher: Arc<HttpFetcher>, site: &SiteConfig) -> Arc<dyn SourceEnumerator> {
    match &site.sitemap_url {
        Some(sitemap_url) => Arc::new(SitemapSources::new(fetcher, sitemap_url.clone(), site)),
        None => Arc::new(StaticSources::new(site.urls.iter().cloned())),
    }
}

fn dedup(urls: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.into_iter()
        .filter(|u| !u.is_empty() && seen.insert(u.clone()))
        .collect()
}

/// Parse a `<urlset>` or `<sitemapindex>` document, ignoring namespaces.
fn parse_sitemap(xml: &[u8], url: &str) -> Result<Sitemap, EnumerationError> {
    let malformed = |message: String| EnumerationError::Malformed {
        url: url.to_string(),
        message,
    };

    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut kind = None;
    let mut locs = Vec::new();
    let mut in_loc = false;
    let mut current = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"urlset" if kind.is_none() => kind = Some(SitemapKind::UrlSet),
                b"sitemapindex" if kind.is_none() => kind = Some(SitemapKind::Index),
                b"loc" => {
                    in_loc = true;
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Text(t)) if in_loc => {
                let text = t.unescape().map_err(|e| malformed(e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::CData(c)) if in_loc => {
                current.push_str(&String::from_utf8_lossy(&c.into_inner()));
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"loc" => {
                in_loc = false;
                let loc = current.trim();
                if !loc.is_empty() {
                    locs.push(loc.to_string());
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(malformed(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    let kind = kind.ok_or_else(|| malformed("no <urlset> or <sitemapindex> element".to_string()))?;
    Ok(Sitemap { kind, locs })
}
