//! Ingestion error taxonomy
//!
//! Every failure surfaced by [`MediaIngestor`](super::ingest::MediaIngestor)
//! is tagged with the pipeline stage it came from, so callers can tell a
//! payload they should fix from an infrastructure problem they should retry.

use serde::Serialize;
use thiserror::Error;

use super::classify::ValidationError;
use super::context::Interrupted;
use super::fetch::FetchError;
use super::normalize::ProcessingError;
use super::store::StoreError;

/// Pipeline stage at which an ingestion failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Validation,
    Download,
    Normalization,
    Storage,
}

impl IngestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStage::Validation => "validation",
            IngestStage::Download => "download",
            IngestStage::Normalization => "normalization",
            IngestStage::Storage => "storage",
        }
    }
}

impl std::fmt::Display for IngestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("download failed: {0}")]
    Download(#[from] FetchError),

    #[error("normalization failed: {0}")]
    Normalization(#[from] ProcessingError),

    #[error("storage failed: {0}")]
    Storage(#[from] StoreError),
}

impl IngestError {
    pub fn stage(&self) -> IngestStage {
        match self {
            IngestError::Validation(_) => IngestStage::Validation,
            IngestError::Download(_) => IngestStage::Download,
            IngestError::Normalization(_) => IngestStage::Normalization,
            IngestError::Storage(_) => IngestStage::Storage,
        }
    }

    /// Whether the caller can fix the problem by sending different input.
    ///
    /// Storage failures are never the caller's fault.
    pub fn is_user_correctable(&self) -> bool {
        !matches!(self, IngestError::Storage(_))
    }

    /// Whether the same request may succeed if repeated
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Validation(_) | IngestError::Normalization(_) => false,
            IngestError::Download(e) => e.is_transient() || matches!(e, FetchError::Interrupted(_)),
            IngestError::Storage(e) => !matches!(
                e,
                StoreError::InvalidKey(_) | StoreError::CorruptIndex { .. }
            ),
        }
    }

    /// The interruption behind this error, if it was cancelled or timed out
    pub fn interruption(&self) -> Option<Interrupted> {
        match self {
            IngestError::Download(FetchError::Interrupted(i))
            | IngestError::Storage(StoreError::Interrupted(i)) => Some(*i),
            _ => None,
        }
    }
}
