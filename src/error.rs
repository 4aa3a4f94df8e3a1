//! Custom error types for ragweave

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why enumerating a whole source failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumerationKind {
    Authentication,
    RateLimit,
    NotFound,
    Other,
}

impl EnumerationKind {
    /// Classify an HTTP status from a repository host
    pub fn from_status(status: u16, rate_limit_exhausted: bool) -> Self {
        match status {
            429 => EnumerationKind::RateLimit,
            403 if rate_limit_exhausted => EnumerationKind::RateLimit,
            401 | 403 => EnumerationKind::Authentication,
            404 => EnumerationKind::NotFound,
            _ => EnumerationKind::Other,
        }
    }
}

impl std::fmt::Display for EnumerationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnumerationKind::Authentication => write!(f, "authentication"),
            EnumerationKind::RateLimit => write!(f, "rate limit"),
            EnumerationKind::NotFound => write!(f, "not found"),
            EnumerationKind::Other => write!(f, "other"),
        }
    }
}

/// Normalized model backend failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Only rate limits and outages are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_) | ProviderError::Unavailable(_)
        )
    }

    /// Map a non-success HTTP status to a provider error
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => ProviderError::RateLimited(body),
            401 | 403 => ProviderError::Unauthenticated(body),
            408 | 500..=599 => ProviderError::Unavailable(format!("HTTP {}: {}", status, body)),
            _ => ProviderError::InvalidRequest(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            ProviderError::InvalidRequest(err.to_string())
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}

/// Main error type for ragweave operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Fetch failed for {origin}: {reason}")]
    FetchFailed { origin: String, reason: String },

    #[error("Enumeration failed for {location} ({kind}): {reason}")]
    EnumerationFailed {
        location: String,
        kind: EnumerationKind,
        reason: String,
    },

    #[error("Invalid content in {origin}: {reason}")]
    ChunkInvalid { origin: String, reason: String },

    #[error("Embedding failed: {0}")]
    Embedding(ProviderError),

    #[error("Completion failed: {0}")]
    Completion(ProviderError),

    #[error("Store write conflict: {0}")]
    StoreWriteConflict(String),

    #[error("Store unreachable: {0}")]
    StoreUnreachable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable tag used in ingestion summaries and JSON output
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Database(_) => "store_error",
            Error::FetchFailed { .. } => "fetch_failed",
            Error::EnumerationFailed { .. } => "enumeration_failed",
            Error::ChunkInvalid { .. } => "chunk_invalid",
            Error::Embedding(_) => "embedding_failed",
            Error::Completion(_) => "completion_failed",
            Error::StoreWriteConflict(_) => "store_write_conflict",
            Error::StoreUnreachable(_) => "store_unreachable",
            Error::Query(_) => "query_failed",
            Error::Io(_)
            | Error::Http(_)
            | Error::UrlParse(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::Other(_) => "internal",
        }
    }

    /// Errors that abort a whole run instead of one document
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::EnumerationFailed { .. } | Error::StoreUnreachable(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6)
                let busy = matches!(db.code().as_deref(), Some("5") | Some("6"))
                    || db.message().contains("database is locked");
                if busy {
                    Error::StoreWriteConflict(db.message().to_string())
                } else {
                    Error::Database(err)
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_) => Error::StoreUnreachable(err.to_string()),
            _ => Error::Database(err),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

/// Result type alias for ragweave
pub type Result<T> = std::result::Result<T, Error>;
