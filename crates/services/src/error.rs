//! Shared error types for the services crate.

use thiserror::Error;

use ide_core::model::LessonId;
use storage::http::HttpInitError;
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

/// Tagged failures of the synchronizer. None of them is fatal to a session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// User or student lookup failed; the session runs as a guest.
    #[error("identity lookup failed: {0}")]
    IdentityLookupFailed(#[source] StorageError),
    /// The progress record could not be fetched or created.
    #[error("progress record could not be resolved: {0}")]
    ResolutionFailed(#[source] StorageError),
    /// The record exists but the write was rejected.
    #[error("progress update failed: {0}")]
    PersistFailed(#[source] StorageError),
    /// The local mirror could not be written.
    #[error("local storage failed: {0}")]
    LocalStorageFailed(#[source] StorageError),
}

/// Errors emitted by `SessionController::mount_session`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MountError {
    #[error("course content could not be loaded: {0}")]
    Content(#[from] StorageError),
    #[error("course has no lessons")]
    EmptyCourse,
    #[error("no async runtime is available to run session tasks")]
    NoRuntime,
}

/// Errors emitted by an active `SessionHandle`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionError {
    #[error("lesson {0} is not part of this course")]
    UnknownLesson(LessonId),
    #[error("session is closed")]
    Closed,
}

/// Errors emitted while reading `SyncConfig`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid API URL: {0}")]
    InvalidApiUrl(String),
    #[error("{key} must be a positive integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
}

/// Errors emitted while bootstrapping app services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppServicesError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Http(#[from] HttpInitError),
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
}
