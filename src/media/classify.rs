//! Format validation by content sniffing
//!
//! The media type of a payload is always derived from its leading bytes
//! (magic numbers). Filenames, extensions and caller- or server-declared
//! content types are never trusted for classification; remote metadata is
//! only used as a cheap pre-flight filter before a download starts.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// MIME type reported when no signature matches
pub const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// Errors raised when a payload is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("file too large: {actual} bytes (max {limit})")]
    TooLarge { actual: u64, limit: u64 },

    #[error("unsupported file format: {detected}")]
    UnsupportedFormat { detected: String },

    #[error("remote content type not allowed: {content_type}")]
    RemoteContentType { content_type: String },

    #[error("remote content too large: {reported} bytes (max {limit})")]
    RemoteTooLarge { reported: u64, limit: u64 },
}

/// Broad family of a classified payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Other,
}

impl MediaKind {
    /// Determine the family from a MIME type string.
    pub fn from_mime(mime: &str) -> Self {
        let lower = mime.to_ascii_lowercase();
        if lower.starts_with("image/") {
            MediaKind::Image
        } else if lower.starts_with("audio/") {
            MediaKind::Audio
        } else if lower.starts_with("video/") {
            MediaKind::Video
        } else {
            MediaKind::Other
        }
    }
}

/// The sniffed type of a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaClassification {
    /// Detected MIME type (e.g. `image/png`)
    pub mime_type: String,

    /// Family derived from the MIME type
    pub kind: MediaKind,

    /// Canonical file extension for the detected type, without the dot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
}

impl MediaClassification {
    /// Classify `bytes` by their magic number.
    pub fn sniff(bytes: &[u8]) -> Self {
        match infer::get(bytes) {
            Some(kind) => Self {
                mime_type: kind.mime_type().to_string(),
                kind: MediaKind::from_mime(kind.mime_type()),
                extension: Some(kind.extension().to_string()),
            },
            None => Self {
                mime_type: FALLBACK_MIME_TYPE.to_string(),
                kind: MediaKind::Other,
                extension: None,
            },
        }
    }

    pub fn as_str(&self) -> &str {
        &self.mime_type
    }

    pub fn is_image(&self) -> bool {
        self.kind == MediaKind::Image
    }
}

impl std::fmt::Display for MediaClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.mime_type)
    }
}

/// Size limit and allow-list applied to every payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatPolicy {
    /// Maximum payload size in bytes (inclusive)
    pub max_size: u64,

    /// MIME type prefixes that are accepted (e.g. `image/`, `audio/mpeg`)
    pub allowed_prefixes: Vec<String>,
}

impl FormatPolicy {
    pub fn new(max_size: u64, allowed_prefixes: Vec<String>) -> Self {
        Self {
            max_size,
            allowed_prefixes,
        }
    }

    /// Whether `mime_type` matches one of the allowed prefixes
    pub fn is_allowed(&self, mime_type: &str) -> bool {
        let lower = mime_type.to_ascii_lowercase();
        self.allowed_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && lower.starts_with(&prefix.to_ascii_lowercase()))
    }

    /// Validate a payload and return its classification.
    ///
    /// `declared_size` is informational only: the actual byte length is
    /// what gets checked against the limit.
    pub fn validate(
        &self,
        bytes: &[u8],
        declared_size: Option<u64>,
    ) -> Result<MediaClassification, ValidationError> {
        let actual = bytes.len() as u64;

        if let Some(declared) = declared_size {
            if declared != actual {
                tracing::debug!(declared, actual, "declared size does not match payload");
            }
        }

        if actual > self.max_size {
            return Err(ValidationError::TooLarge {
                actual,
                limit: self.max_size,
            });
        }

        let classification = MediaClassification::sniff(bytes);
        if !self.is_allowed(&classification.mime_type) {
            return Err(ValidationError::UnsupportedFormat {
                detected: classification.mime_type,
            });
        }

        Ok(classification)
    }

    /// Validate metadata reported by a remote server before downloading.
    ///
    /// A missing Content-Type is rejected. A missing Content-Length passes;
    /// the download itself is bounded by the same limit.
    pub fn validate_remote(&self, remote: &RemoteMetadata) -> Result<(), ValidationError> {
        let content_type = remote.essence().unwrap_or_default();
        if !self.is_allowed(&content_type) {
            return Err(ValidationError::RemoteContentType { content_type });
        }

        if let Some(reported) = remote.content_length {
            if reported > self.max_size {
                return Err(ValidationError::RemoteTooLarge {
                    reported,
                    limit: self.max_size,
                });
            }
        }

        Ok(())
    }
}

/// Headers reported by a remote server in response to a metadata request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMetadata {
    /// Raw Content-Type header, if present
    pub content_type: Option<String>,

    /// Content-Length header, if present
    pub content_length: Option<u64>,
}

impl RemoteMetadata {
    /// Content type lower-cased with parameters (`; charset=...`) removed
    pub fn essence(&self) -> Option<String> {
        self.content_type.as_deref().map(|raw| {
            raw.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }
}
