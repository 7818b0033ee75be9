//! Error taxonomy for the ingestion and transformation core.
//!
//! Fetch and validation errors are caught per unit of work and recorded in the
//! download tracker; storage errors bubble up to the caller of the failing
//! operation; transform errors are contained to one parameter family.
//! Archive errors are per file, except a missing or unreadable archive root.

use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

use crate::models::Parameter;

// ---

/// Failure talking to the upstream weather API.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} timed out")]
    Timeout {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("could not build the HTTP client")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} returned HTTP {status}")]
    HttpStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("API returned code {code} for {url}: {message}")]
    Api {
        url: String,
        code: i64,
        message: String,
    },

    #[error("response from {url} has no `data` object")]
    MissingData { url: String },
}

impl FetchError {
    /// Client errors other than rate limiting will not go away on retry.
    pub fn is_retryable(&self) -> bool {
        // ---
        match self {
            FetchError::HttpStatus { status, .. } => {
                !status.is_client_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            FetchError::Client(_) => false,
            _ => true,
        }
    }
}

/// A fetched document does not match the schema of its parameter.
#[derive(Debug, Error)]
#[error("{parameter} payload for {date} failed validation: {message}")]
pub struct ValidationError {
    pub parameter: Parameter,
    pub date: NaiveDate,
    pub message: String,
}

/// Failure reading from or writing to the backing store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error("failed to encode value for column `{column}`")]
    Encode {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("illegal download state transition for {parameter} on {date}: {from} -> {to}")]
    IllegalTransition {
        parameter: String,
        date: NaiveDate,
        from: String,
        to: String,
    },

    #[error("unrecognized value `{value}` in column `{column}`")]
    Decode { column: &'static str, value: String },
}

impl StorageError {
    /// Whether the failure is a connectivity problem that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        // ---
        matches!(
            self,
            StorageError::Database(
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            )
        )
    }
}

/// A raw record or one of its rows could not be transformed.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{parameter} record for {date} does not match its payload shape: {source}")]
    Shape {
        parameter: String,
        date: NaiveDate,
        #[source]
        source: serde_json::Error,
    },

    #[error("{parameter} record for {date}: {message}")]
    Record {
        parameter: String,
        date: NaiveDate,
        message: String,
    },

    #[error("cannot coerce `{value}` at {field} to {expected}")]
    Coerce {
        field: String,
        value: String,
        expected: &'static str,
    },
}

/// Failure reading or writing the local document archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive I/O failed at {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archived file {} is not valid JSON", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Umbrella error for pipeline entry points.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl Error {
    /// Whether re-invoking the same unit of work could succeed without an
    /// upstream fix.
    pub fn is_retryable(&self) -> bool {
        // ---
        match self {
            Error::Fetch(e) => e.is_retryable(),
            Error::Validation(_) => false,
            Error::Storage(e) => e.is_transient(),
            Error::Transform(_) => false,
            Error::Archive(_) => false,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Storage(StorageError::Database(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
