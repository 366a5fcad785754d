//! Error types for vct-ingest
//!
//! One crate-wide [`Error`] plus the stage-specific errors that the pipeline
//! needs to tell apart. Every error maps to an [`ErrorClass`], which is what
//! the scheduler uses to decide between retrying, backing off, or dropping a
//! target.

use thiserror::Error;

/// Failure taxonomy shared by every pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network timeout or navigation failure; retried with backoff
    Transient,
    /// Rate limit or anti-bot response; retried with aggressive backoff
    Blocked,
    /// Page layout no longer matches the extraction rules; not retried
    SchemaMismatch,
    /// A referenced entity has not been ingested yet; queued
    UnresolvedReference,
    /// Record violates a store invariant; rejected per unit
    IngestConflict,
    /// Upstream permanently removed the entity or refused the request
    Terminal,
}

impl ErrorClass {
    /// Whether a target that failed with this class should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Blocked)
    }
}

/// Errors raised while fetching a page
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Timed out after {timeout_ms}ms: {url}")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("Navigation failed for {url}: {reason}")]
    NavigationFailed { url: String, reason: String },

    #[error("Blocked by {url}: {reason}")]
    Blocked { url: String, reason: String },

    #[error("HTTP {status}: {url}")]
    Http { url: String, status: u16 },

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl FetchError {
    /// Only navigation-level failures are worth an immediate retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout { .. } | FetchError::NavigationFailed { .. }
        )
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::Timeout { .. } | FetchError::NavigationFailed { .. } => {
                ErrorClass::Transient
            }
            FetchError::Blocked { .. } => ErrorClass::Blocked,
            FetchError::Http { status, .. } => match status {
                404 | 410 => ErrorClass::Terminal,
                s if *s >= 500 => ErrorClass::Transient,
                _ => ErrorClass::Terminal,
            },
            FetchError::Snapshot(_) => ErrorClass::Transient,
        }
    }
}

/// Errors raised by extraction rules
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("Schema mismatch ({rule}): missing {anchor}")]
    SchemaMismatch { rule: String, anchor: String },

    #[error("No extraction rule for source '{source_id}' and kind '{kind}'")]
    NoRule { source_id: String, kind: String },

    #[error("Invalid selector '{0}'")]
    Selector(String),
}

impl ExtractError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ExtractError::SchemaMismatch { .. } => ErrorClass::SchemaMismatch,
            ExtractError::NoRule { .. } | ExtractError::Selector(_) => ErrorClass::Terminal,
        }
    }
}

/// Errors raised while committing a single unit
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Ingest conflict for {entity}: {reason}")]
    Conflict { entity: String, reason: String },

    #[error("Dependency {dependency} of {entity} failed to ingest")]
    DependencyFailed { entity: String, dependency: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl IngestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IngestError::Conflict { .. } | IngestError::DependencyFailed { .. } => {
                ErrorClass::IngestConflict
            }
            IngestError::Database(_) => ErrorClass::Transient,
            IngestError::Json(_) | IngestError::Storage(_) => ErrorClass::IngestConflict,
        }
    }
}

/// Main error type for vct-ingest operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

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

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Not initialized: run 'vct-ingest init' first")]
    NotInitialized,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Fetch(e) => e.class(),
            Error::Extract(e) => e.class(),
            Error::Ingest(e) => e.class(),
            Error::Database(_) | Error::Io(_) | Error::Http(_) => ErrorClass::Transient,
            _ => ErrorClass::Terminal,
        }
    }
}

impl From<Error> for IngestError {
    fn from(e: Error) -> Self {
        match e {
            Error::Database(e) => IngestError::Database(e),
            Error::Json(e) => IngestError::Json(e),
            Error::Ingest(e) => e,
            other => IngestError::Storage(other.to_string()),
        }
    }
}

/// Result type alias for vct-ingest
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_classes() {
        let timeout = FetchError::Timeout {
            url: "https://www.vlr.gg/1".to_string(),
            timeout_ms: 10,
        };
        assert!(timeout.is_transient());
        assert_eq!(timeout.class(), ErrorClass::Transient);

        let blocked = FetchError::Blocked {
            url: "https://www.vlr.gg/1".to_string(),
            reason: "HTTP 429".to_string(),
        };
        assert!(!blocked.is_transient());
        assert_eq!(blocked.class(), ErrorClass::Blocked);
        assert!(blocked.class().is_retryable());

        let gone = FetchError::Http {
            url: "https://www.vlr.gg/1".to_string(),
            status: 404,
        };
        assert_eq!(gone.class(), ErrorClass::Terminal);
        assert!(!gone.class().is_retryable());
    }

    #[test]
    fn test_schema_mismatch_is_not_retryable() {
        let err: Error = ExtractError::SchemaMismatch {
            rule: "vlr/match@1".to_string(),
            anchor: "div.vm-stats".to_string(),
        }
        .into();
        assert_eq!(err.class(), ErrorClass::SchemaMismatch);
        assert!(!err.class().is_retryable());
    }
}
