//! Error types shared by the project store, object storage and pipeline.
//!
//! Client-facing conditions (`Validation`, `Conflict`, `Auth`, `Integrity`,
//! `NotFound`) carry enough context to be surfaced verbatim. Store and storage
//! failures are infrastructure errors and are only logged and propagated.

use crate::project::ProjectStatus;

pub type Result<T> = std::result::Result<T, Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad pipeline definition or user input.
    #[error("{0}")]
    Validation(String),

    /// Operation attempted while the project is in the wrong status.
    #[error("Unexpected status {} for project {project_id} (expected {expected})", display_status(.actual))]
    Conflict {
        project_id: String,
        expected: ProjectStatus,
        actual: Option<ProjectStatus>,
    },

    #[error("invalid or missing project token")]
    Auth,

    /// Uploaded bytes do not match the declared size. The partial object is gone.
    #[error("uploaded size mismatch: expected {expected} bytes, received {actual}")]
    Integrity { expected: u64, actual: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    /// Validation or geocoding failure inside a job.
    #[error("{0}")]
    Processing(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn display_status(status: &Option<ProjectStatus>) -> String {
    status.map_or_else(|| "none".to_string(), |s| s.to_string())
}

impl Error {
    pub fn conflict(
        project_id: &str,
        expected: ProjectStatus,
        actual: Option<ProjectStatus>,
    ) -> Self {
        Self::Conflict {
            project_id: project_id.to_string(),
            expected,
            actual,
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True for the conditions a client caused and may act on.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Conflict { .. }
                | Self::Auth
                | Self::Integrity { .. }
                | Self::NotFound(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Store {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => Self::NotFound(path),
            other => Self::storage_with_source(other.to_string(), other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(io) => io,
            other => std::io::Error::other(other),
        }
    }
}
