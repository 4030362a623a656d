use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::normalize::DEFAULT_BOILERPLATE;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub site: SiteConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    pub base_url: String,
    /// When unset, the static `urls` list is the whole source set.
    #[serde(default)]
    pub sitemap_url: Option<String>,
    /// Static source list, and the fallback when no sitemap URL matches `keywords`.
    #[serde(default)]
    pub urls: Vec<String>,
    /// Hosts that count as on-site. Defaults to the host of `base_url`.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
    #[serde(default = "default_max_urls")]
    pub max_urls: usize,
    #[serde(default = "default_follow_pdf_links")]
    pub follow_pdf_links: bool,
    #[serde(default = "default_max_linked_pdfs")]
    pub max_linked_pdfs: usize,
}

fn default_keywords() -> Vec<String> {
    [
        "student",
        "enrol",
        "course",
        "program",
        "study",
        "academic",
        "fee",
        "deadline",
        "campus",
        "international",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_max_urls() -> usize {
    50
}
fn default_follow_pdf_links() -> bool {
    true
}
fn default_max_linked_pdfs() -> usize {
    20
}

impl SiteConfig {
    /// Hosts on-site fetches and redirects may target.
    pub fn effective_allowed_hosts(&self) -> Vec<String> {
        if !self.allowed_hosts.is_empty() {
            return self
                .allowed_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect();
        }
        reqwest::Url::parse(&self.base_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .into_iter()
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Minimum delay between two requests to the same host.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Hard ceiling on one source's fetch, retries included.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            min_delay_ms: default_min_delay_ms(),
            deadline_secs: default_deadline_secs(),
            workers: default_workers(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    15
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_min_delay_ms() -> u64 {
    500
}
fn default_deadline_secs() -> u64 {
    120
}
fn default_workers() -> usize {
    4
}
fn default_user_agent() -> String {
    format!("campus-kb/{}", env!("CARGO_PKG_VERSION"))
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizeConfig {
    #[serde(default = "default_boilerplate")]
    pub boilerplate: Vec<String>,
    /// Documents shorter than this after normalization are not stored.
    #[serde(default = "default_min_content_chars")]
    pub min_content_chars: usize,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            boilerplate: default_boilerplate(),
            min_content_chars: default_min_content_chars(),
        }
    }
}

fn default_boilerplate() -> Vec<String> {
    DEFAULT_BOILERPLATE.iter().map(|s| s.to_string()).collect()
}
fn default_min_content_chars() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RefreshConfig {
    /// Incremental runs skip sources confirmed more recently than this.
    #[serde(default = "default_min_recheck_secs")]
    pub min_recheck_secs: u64,
    /// The timer triggers a run once the newest confirmation is older than this.
    #[serde(default = "default_refresh_after_secs")]
    pub refresh_after_secs: u64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            min_recheck_secs: default_min_recheck_secs(),
            refresh_after_secs: default_refresh_after_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

fn default_min_recheck_secs() -> u64 {
    3600
}
fn default_refresh_after_secs() -> u64 {
    6 * 3600
}
fn default_check_interval_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
    #[serde(default = "default_max_excerpt_chars")]
    pub max_excerpt_chars: usize,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            chars_per_token: default_chars_per_token(),
            max_excerpt_chars: default_max_excerpt_chars(),
            max_results: default_max_results(),
        }
    }
}

fn default_token_budget() -> usize {
    1500
}
fn default_chars_per_token() -> usize {
    4
}
fn default_max_excerpt_chars() -> usize {
    500
}
fn default_max_results() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Inactive entries older than this are erased by `kb compact`.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

fn default_retention_days() -> u32 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let base = reqwest::Url::parse(&config.site.base_url)
        .with_context(|| format!("site.base_url is not a URL: {}", config.site.base_url))?;
    if base.host_str().is_none() {
        anyhow::bail!("site.base_url must include a host");
    }

    if config.site.sitemap_url.is_none() && config.site.urls.is_empty() {
        anyhow::bail!("site.sitemap_url or site.urls must be set");
    }

    if config.site.max_urls == 0 {
        anyhow::bail!("site.max_urls must be > 0");
    }

    if config.fetch.workers == 0 {
        anyhow::bail!("fetch.workers must be > 0");
    }

    if config.fetch.timeout_secs == 0 || config.fetch.deadline_secs == 0 {
        anyhow::bail!("fetch.timeout_secs and fetch.deadline_secs must be > 0");
    }

    if config.retrieval.chars_per_token == 0 {
        anyhow::bail!("retrieval.chars_per_token must be > 0");
    }

    if config.retrieval.max_results == 0 {
        anyhow::bail!("retrieval.max_results must be >= 1");
    }

    if config.refresh.check_interval_secs == 0 {
        anyhow::bail!("refresh.check_interval_secs must be > 0");
    }

    Ok(())
}
