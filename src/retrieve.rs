//! Query-time selection of excerpts under a token budget.
//!
//! Every active entry is scored by term frequency: the number of content
//! words equal to a query term, divided by the number of content words.
//! Entries are ranked by score (ties: most recently updated, then id),
//! cut to `max_excerpt_chars`, costed by a [`TokenCounter`], and taken
//! greedily while the running total fits the budget. An entry that does not
//! fit is skipped; a smaller one after it may still fit.
//!
//! The retriever only reads the store and may observe it mid-refresh.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use serde::Serialize;

use crate::config::{Config, RetrievalConfig};
use crate::error::StoreError;
use crate::models::{EntryFilter, Excerpt, KnowledgeEntry};
use crate::store::sqlite::SqliteStore;
use crate::store::KnowledgeStore;

/// Lower-cased alphanumeric runs. Used for both queries and content.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Distinct query terms in first-seen order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(query).filter(|t| seen.insert(t.clone())).collect()
}

pub trait Scorer: Send + Sync {
    /// Relevance in `[0, 1]`. Zero means the entry is not returned.
    fn score(&self, entry: &KnowledgeEntry, terms: &[String]) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TermFrequencyScorer;

impl Scorer for TermFrequencyScorer {
    fn score(&self, entry: &KnowledgeEntry, terms: &[String]) -> f64 {
        if terms.is_empty() {
            return 0.0;
        }
        let terms: HashSet<&str> = terms.iter().map(String::as_str).collect();
        let mut total_words = 0usize;
        let mut term_matches = 0usize;
        for word in tokenize(&entry.title).chain(tokenize(&entry.content)) {
            total_words += 1;
            if terms.contains(word.as_str()) {
                term_matches += 1;
            }
        }
        if total_words == 0 {
            0.0
        } else {
            term_matches as f64 / total_words as f64
        }
    }
}

pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

/// `ceil(chars / chars_per_token)`.
#[derive(Debug, Clone, Copy)]
pub struct ApproxTokenCounter {
    pub chars_per_token: usize,
}

impl Default for ApproxTokenCounter {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl TokenCounter for ApproxTokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        let per = self.chars_per_token.max(1);
        text.chars().count().div_ceil(per)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalOutcome {
    pub excerpts: Vec<Excerpt>,
    pub tokens_used: usize,
    /// Matching entries left out because they did not fit the budget.
    pub excluded_by_budget: usize,
}

pub struct Retriever {
    store: Arc<dyn KnowledgeStore>,
    scorer: Box<dyn Scorer>,
    counter: Box<dyn TokenCounter>,
    max_excerpt_chars: usize,
    max_results: usize,
}

impl Retriever {
    pub fn new(store: Arc<dyn KnowledgeStore>) -> Self {
        Self::from_config(&RetrievalConfig::default(), store)
    }

    pub fn from_config(config: &RetrievalConfig, store: Arc<dyn KnowledgeStore>) -> Self {
        Self {
            store,
            scorer: Box::new(TermFrequencyScorer),
            counter: Box::new(ApproxTokenCounter {
                chars_per_token: config.chars_per_token,
            }),
            max_excerpt_chars: config.max_excerpt_chars,
            max_results: config.max_results,
        }
    }

    pub fn with_scorer(mut self, scorer: Box<dyn Scorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_token_counter(mut self, counter: Box<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub async fn retrieve(&self, query: &str, token_budget: usize) -> Result<Vec<Excerpt>, StoreError> {
        Ok(self.retrieve_with_report(query, token_budget).await?.excerpts)
    }

    pub async fn retrieve_with_report(
        &self,
        query: &str,
        token_budget: usize,
    ) -> Result<RetrievalOutcome, StoreError> {
        let terms = query_terms(query);
        if token_budget == 0 || terms.is_empty() {
            return Ok(RetrievalOutcome::default());
        }

        let mut scored = Vec::new();
        let mut entries = self.store.list_active(EntryFilter::default());
        while let Some(entry) = entries.next().await {
            let entry = entry?;
            let score = self.scorer.score(&entry, &terms);
            if score > 0.0 {
                scored.push((score, entry));
            }
        }

        scored.sort_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.last_updated.cmp(&a.last_updated))
                .then(a.id.cmp(&b.id))
        });

        let mut outcome = RetrievalOutcome::default();
        for (score, entry) in scored {
            if outcome.excerpts.len() >= self.max_results {
                break;
            }
            let (text, truncated) = truncate_chars(&entry.content, self.max_excerpt_chars);
            let tokens = self.counter.count_tokens(text);
            if outcome.tokens_used + tokens > token_budget {
                outcome.excluded_by_budget += 1;
                continue;
            }
            outcome.tokens_used += tokens;
            outcome.excerpts.push(Excerpt {
                text: text.to_string(),
                truncated,
                entry_id: entry.id,
                title: entry.title,
                source_url: entry.source_url,
                source_type: entry.source_type,
                score,
                tokens,
                last_updated: entry.last_updated,
            });
        }
        Ok(outcome)
    }
}

/// First `max_chars` characters of `text`, and whether anything was cut.
fn truncate_chars(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => (&text[..byte], true),
        None => (text, false),
    }
}

/// Render excerpts as the attributed knowledge block for a prompt.
pub fn format_for_prompt(excerpts: &[Excerpt]) -> String {
    let mut out = String::new();
    for excerpt in excerpts {
        let source = if excerpt.source_url.is_empty() {
            "manual"
        } else {
            excerpt.source_url.as_str()
        };
        let ellipsis = if excerpt.truncated { "..." } else { "" };
        let _ = write!(
            out,
            "\n--- {} ---\nSource: {}\nContent: {}{}\n",
            excerpt.title, source, excerpt.text, ellipsis
        );
    }
    out
}

/// `kb retrieve`: print the excerpts a prompt would receive.
pub async fn run_retrieve(
    config: &Config,
    query: &str,
    budget: Option<usize>,
    json: bool,
) -> Result<()> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let retriever = Retriever::from_config(&config.retrieval, store.clone());
    let budget = budget.unwrap_or(config.retrieval.token_budget);

    let outcome = retriever.retrieve_with_report(query, budget).await;
    store.close().await;
    let outcome = outcome?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    if outcome.excerpts.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, excerpt) in outcome.excerpts.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} / {}",
            i + 1,
            excerpt.score,
            excerpt.source_type,
            excerpt.title
        );
        println!("    updated: {}", excerpt.last_updated.format("%Y-%m-%d"));
        if !excerpt.source_url.is_empty() {
            println!("    url: {}", excerpt.source_url);
        }
        println!("    tokens: {}", excerpt.tokens);
        println!("    excerpt: \"{}\"", excerpt.text.trim());
        println!("    id: {}", excerpt.entry_id);
        println!();
    }
    println!(
        "{} tokens of {} used, {} excluded by budget",
        outcome.tokens_used, budget, outcome.excluded_by_budget
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::fingerprint;
    use crate::models::{EntryCandidate, SourceType};
    use crate::store::memory::InMemoryStore;
    use chrono::{TimeZone, Utc};

    async fn store_with(entries: &[(&str, &str, i64)]) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        for (url, body, secs) in entries {
            store
                .upsert(&EntryCandidate {
                    source_type: SourceType::Page,
                    source_url: url.to_string(),
                    title: String::new(),
                    content: body.to_string(),
                    content_hash: fingerprint(&body.to_lowercase()),
                    observed_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
                })
                .await
                .unwrap();
        }
        store
    }

    #[test]
    fn query_terms_are_deduplicated_and_lowercased() {
        assert_eq!(query_terms("Census DATE, census date?"), vec!["census", "date"]);
        assert!(query_terms("  ?! ").is_empty());
    }

    #[test]
    fn approx_counter_rounds_up() {
        let counter = ApproxTokenCounter::default();
        assert_eq!(counter.count_tokens(""), 0);
        assert_eq!(counter.count_tokens("abcd"), 1);
        assert_eq!(counter.count_tokens("abcde"), 2);
        assert_eq!(counter.count_tokens("ééééé"), 2);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), ("hé", true));
        assert_eq!(truncate_chars("hi", 5), ("hi", false));
    }

    #[tokio::test]
    async fn ranks_by_term_frequency() {
        let store = store_with(&[
            ("https://x.edu/a", "fees and more words here too", 0),
            ("https://x.edu/b", "fees are due", 0),
            ("https://x.edu/c", "library hours", 0),
        ])
        .await;
        let retriever = Retriever::new(store);
        let excerpts = retriever.retrieve("fees", 1000).await.unwrap();
        let urls: Vec<_> = excerpts.iter().map(|e| e.source_url.as_str()).collect();
        assert_eq!(urls, vec!["https://x.edu/b", "https://x.edu/a"]);
    }

    #[tokio::test]
    async fn ties_prefer_recent_updates() {
        let store = store_with(&[
            ("https://x.edu/old", "exam timetable", 0),
            ("https://x.edu/new", "timetable exam", 100),
        ])
        .await;
        let excerpts = Retriever::new(store).retrieve("exam", 1000).await.unwrap();
        assert_eq!(excerpts[0].source_url, "https://x.edu/new");
    }

    #[tokio::test]
    async fn greedy_selection_skips_entries_that_do_not_fit() {
        let big = format!("visa {}", "x".repeat(200));
        let store = store_with(&[
            ("https://x.edu/big", &big, 10),
            ("https://x.edu/small", "visa rules apply", 0),
        ])
        .await;
        // big ranks first (1 of 2 words) but does not fit; small (1 of 3) does.
        let outcome = Retriever::new(store)
            .retrieve_with_report("visa", 10)
            .await
            .unwrap();
        assert_eq!(outcome.excerpts.len(), 1);
        assert_eq!(outcome.excerpts[0].source_url, "https://x.edu/small");
        assert_eq!(outcome.excluded_by_budget, 1);
        assert!(outcome.tokens_used <= 10);
    }

    #[tokio::test]
    async fn zero_budget_and_empty_store_return_nothing() {
        let store = store_with(&[("https://x.edu/a", "enrolment", 0)]).await;
        let retriever = Retriever::new(store);
        assert!(retriever.retrieve("enrolment", 0).await.unwrap().is_empty());

        let empty = Retriever::new(Arc::new(InMemoryStore::new()));
        assert!(empty.retrieve("enrolment", 100).await.unwrap().is_empty());
    }

    #[test]
    fn prompt_block_carries_attribution() {
        let excerpt = Excerpt {
            entry_id: "id-1".into(),
            title: "Fees".into(),
            source_url: "https://x.edu/fees".into(),
            source_type: SourceType::Page,
            text: "Pay by census date".into(),
            truncated: true,
            score: 0.5,
            tokens: 5,
            last_updated: Utc::now(),
        };
        let block = format_for_prompt(&[excerpt]);
        assert!(block.contains("--- Fees ---"));
        assert!(block.contains("Source: https://x.edu/fees"));
        assert!(block.contains("Content: Pay by census date..."));
    }
}
