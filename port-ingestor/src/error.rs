use std::io;
use std::path::PathBuf;
use std::time;

use port_common::repository::RepositoryError;
use port_common::stream::DecodeError;
use thiserror::Error;

/// Enumeration of errors raised while checking a source selection, before anything is read.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("both a file path and a stream were provided, only one is allowed")]
    ConflictingSources,
    #[error("either a file path or a stream must be provided")]
    MissingSource,
}

/// Enumeration of errors that abort an ingestion run.
/// Only the first one observed during a run is returned to the caller.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("invalid source: {0}")]
    Validation(#[from] ValidationError),
    #[error("failed to open {}: {error}", path.display())]
    OpenSource { path: PathBuf, error: io::Error },
    #[error("failed to decode document: {0}")]
    Decode(#[from] DecodeError),
    #[error("error getting record with key {key}: {error}")]
    Get { key: String, error: RepositoryError },
    #[error("error creating record with key {key}: {error}")]
    Create { key: String, error: RepositoryError },
    #[error("error updating record with key {key}: {error}")]
    Update { key: String, error: RepositoryError },
    #[error("ingestion was cancelled")]
    Cancelled,
    #[error("ingestion did not complete within {0:?}")]
    DeadlineExceeded(time::Duration),
    #[error("an ingestion task did not run to completion: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

impl IngestError {
    /// The pipeline stage the error originated from, used to label logs and metrics.
    pub fn stage(&self) -> &'static str {
        match self {
            IngestError::Validation(_) => "validation",
            IngestError::OpenSource { .. } => "source",
            IngestError::Decode(_) => "decode",
            IngestError::Get { .. } | IngestError::Create { .. } | IngestError::Update { .. } => {
                "repository"
            }
            IngestError::Cancelled | IngestError::DeadlineExceeded(_) => "cancelled",
            IngestError::TaskFailed(_) => "task",
        }
    }

    /// The key of the record being upserted when the error happened, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            IngestError::Get { key, .. }
            | IngestError::Create { key, .. }
            | IngestError::Update { key, .. } => Some(key),
            _ => None,
        }
    }
}
