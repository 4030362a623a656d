//! Error taxonomy for the ingestion and retrieval pipeline.
//!
//! Per-source failures ([`FetchError`], [`ExtractionError`]) are caught by the
//! refresh scheduler, counted, and reported in the run summary. Store and
//! enumeration failures abort a run ([`RefreshError`]). Running out of token
//! budget during retrieval is not an error at all.

use thiserror::Error;

/// Failure to retrieve a single source document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("{url} not found (HTTP {status})")]
    NotFound { url: String, status: u16 },

    #[error("access to {url} refused: {reason}")]
    Forbidden { url: String, reason: String },

    #[error("network failure fetching {url}: {message}")]
    NetworkFailure { url: String, message: String },

    #[error("could not extract text from {url}: {source}")]
    Extraction {
        url: String,
        #[source]
        source: ExtractionError,
    },
}

impl FetchError {
    /// The URL the failed request was for.
    pub fn url(&self) -> &str {
        match self {
            FetchError::Timeout { url }
            | FetchError::NotFound { url, .. }
            | FetchError::Forbidden { url, .. }
            | FetchError::NetworkFailure { url, .. }
            | FetchError::Extraction { url, .. } => url,
        }
    }

    /// Transient failures may succeed on a later attempt; the content they
    /// would have returned is assumed to still exist upstream.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout { .. } | FetchError::NetworkFailure { .. }
        )
    }

    /// Short machine-readable label, used in summaries and JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout { .. } => "timeout",
            FetchError::NotFound { .. } => "not_found",
            FetchError::Forbidden { .. } => "forbidden",
            FetchError::NetworkFailure { .. } => "network_failure",
            FetchError::Extraction { .. } => "corrupt_document",
        }
    }
}

/// Failure to turn fetched bytes into plain text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("corrupt document: {0}")]
    CorruptDocument(String),

    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
}

/// Failure of the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("entry not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::ConstraintViolation(db.message().to_string())
            }
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// Failure to produce the list of source locations for a run.
#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("sitemap unreachable: {0}")]
    Unreachable(#[source] FetchError),

    #[error("sitemap {url} is malformed: {message}")]
    Malformed { url: String, message: String },

    #[error("source enumeration produced no URLs")]
    Empty,
}

/// Fatal failure of a refresh run. Anything already written per-entry stays.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("refresh could not complete: {0}")]
    Enumeration(#[from] EnumerationError),

    #[error("refresh could not complete: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let timeout = FetchError::Timeout {
            url: "https://example.edu/a".into(),
        };
        let missing = FetchError::NotFound {
            url: "https://example.edu/b".into(),
            status: 404,
        };
        assert!(timeout.is_transient());
        assert!(!missing.is_transient());
        assert_eq!(missing.url(), "https://example.edu/b");
        assert_eq!(timeout.kind(), "timeout");
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
