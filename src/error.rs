use std::error::Error;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("a task named `{name}` already exists")]
    DuplicateTask { name: String },
    #[error("no task named `{name}`")]
    UnknownTask { name: String },
    #[error("task `{name}` needs an interval of at least one second")]
    InvalidInterval { name: String },
}

/// Failure talking to a download backend. Always scoped to one backend and
/// one call; callers degrade the result for the cycle instead of aborting.
#[derive(Debug, Error)]
pub enum DownloaderError {
    #[error("{backend} is unavailable: {source}")]
    BackendUnavailable {
        backend: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    #[error("timeout while connecting to {backend}")]
    Timeout { backend: String },
    #[error("{backend} refused the request: {reason}")]
    Rejected { backend: String, reason: String },
    #[error("unable to read credentials for {backend}")]
    Credentials {
        backend: String,
        #[source]
        source: io::Error,
    },
}

impl DownloaderError {
    pub(crate) fn unavailable(
        backend: &str,
        source: impl Into<Box<dyn Error + Send + Sync>>,
    ) -> Self {
        DownloaderError::BackendUnavailable {
            backend: backend.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn rejected(backend: &str, reason: impl Into<String>) -> Self {
        DownloaderError::Rejected {
            backend: backend.to_string(),
            reason: reason.into(),
        }
    }
}

/// Any of these aborts the config write; the previous snapshot stays active.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write config file {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config file is invalid")]
    Parse(#[from] toml::de::Error),
    #[error("config could not be serialized")]
    Serialize(#[from] toml::ser::Error),
    #[error("malformed config: `{section}.{field}` {reason}")]
    Malformed {
        section: &'static str,
        field: &'static str,
        reason: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unable to open store {path:?}: {detail}")]
    Open { path: PathBuf, detail: String },
    #[error("store operation `{operation}` failed: {detail}")]
    Store {
        operation: &'static str,
        detail: String,
    },
    #[error("stored value for `{key}` is corrupt: {detail}")]
    Corrupt { key: String, detail: String },
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("no {kind} found for `{key}`")]
    NotFound { kind: &'static str, key: String },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Downloader(#[from] DownloaderError),
}
