use std::path::PathBuf;

use thiserror::Error;

/// Failures of the persisted credential and snapshot files.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed data in {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to replace {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Malformed {
            path: path.into(),
            source,
        }
    }
}

/// Portal-side failures, raised by the scraper glue.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("grade page did not match the expected layout: {0}")]
    Schema(String),

    #[error("{0}")]
    Other(String),
}

/// Everything a monitoring cycle can fail with. None of these end the process.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("no usable credential is stored")]
    CredentialUnavailable,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("interactive login not completed within {0:?}")]
    LoginTimedOut(std::time::Duration),

    #[error("fetching grades failed: {0}")]
    FetchFailed(String),

    #[error("grade page schema mismatch: {0}")]
    ParseSchemaMismatch(String),

    #[error("notification failed: {0}")]
    NotifyFailed(String),

    #[error("persisting state failed: {0}")]
    PersistenceFailed(#[from] StoreError),
}

impl From<PortalError> for WatchError {
    fn from(error: PortalError) -> Self {
        match error {
            PortalError::Schema(detail) => Self::ParseSchemaMismatch(detail),
            other => Self::FetchFailed(other.to_string()),
        }
    }
}
