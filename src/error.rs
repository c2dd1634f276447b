use std::result::Result as StdResult;
use thiserror::Error;

/// Failures produced while cloning from the sync source.
///
/// The first fatal error of an attempt is stored in
/// [`SyncSharedData`](crate::SyncSharedData) and observed by every cloner, so
/// the type is cheap to clone and comparable; adapter implementations flatten
/// their underlying errors into these variants at the boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloneError {
    /// A connection-level failure talking to the sync source. Stages retry
    /// these after reconnecting.
    #[error("network error: {message}")]
    Network { message: String },
    /// The sync source rejected our credentials at connect time.
    #[error("failed to authenticate to {source_uri}: {message}")]
    AuthenticationFailed { source_uri: String, message: String },
    /// A malformed reply from the sync source.
    #[error("failed to parse {what}: {message}")]
    FailedToParse { what: String, message: String },
    /// The sync source listed the same collection name twice for one database.
    #[error("duplicate collection name '{name}' in database '{db}'")]
    DuplicateCollectionName { db: String, name: String },
    /// Local storage failed; never retried.
    #[error("storage error: {message}")]
    Storage { message: String },
    /// A command failed on the sync source for a non-network reason.
    #[error("command failed on the sync source with code {code}: {message}")]
    UpstreamCommand { code: i32, message: String },
    /// The attempt was stopped from outside, e.g. at shutdown.
    #[error("initial sync attempt aborted: {message}")]
    Aborted { message: String },
}

impl CloneError {
    /// True for errors a cloner stage may retry after reconnecting.
    pub fn is_network(&self) -> bool {
        matches!(self, CloneError::Network { .. })
    }

    pub(crate) fn parse(what: impl Into<String>, message: impl Into<String>) -> CloneError {
        CloneError::FailedToParse {
            what: what.into(),
            message: message.into(),
        }
    }

    pub(crate) fn storage(message: impl Into<String>) -> CloneError {
        CloneError::Storage {
            message: message.into(),
        }
    }
}

pub type Result<T> = StdResult<T, CloneError>;
