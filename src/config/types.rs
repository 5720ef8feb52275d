//! Typed configuration structures
//!
//! Every section and field has a default, so an empty file (or no file)
//! yields a working local configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::logging::{LogFormat, LogOutput};
use crate::media::fetch::FetchConfig;
use crate::media::ingest::{default_allowed_formats, IngestSettings, DEFAULT_BUCKET, DEFAULT_MAX_FILE_SIZE};
use crate::media::normalize::{DEFAULT_MAX_HEIGHT, DEFAULT_MAX_WIDTH};
use crate::media::store::S3Settings;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct Config {
    /// Validation and normalization limits
    pub media: MediaConfig,

    /// Destination object store
    pub storage: StorageConfig,

    /// Remote ingestion network policy
    pub fetch: FetchConfig,

    /// Log output
    pub logging: LoggingConfig,
}

impl Config {
    /// Pipeline settings derived from this configuration
    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings::default()
            .with_max_file_size(self.media.max_file_size)
            .with_allowed_formats(self.media.allowed_formats.clone())
            .with_image_bounds(self.media.image_max_width, self.media.image_max_height)
            .with_bucket(self.storage.bucket.clone())
            .with_fetch(self.fetch.clone())
            .with_persist_index(self.storage.persist_index)
    }
}

/// Media configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediaConfig {
    /// Maximum payload size in bytes
    pub max_file_size: u64,

    /// Accepted MIME type prefixes
    pub allowed_formats: Vec<String>,

    /// Images wider than this are resized
    pub image_max_width: u32,

    /// Images taller than this are resized
    pub image_max_height: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed_formats: default_allowed_formats(),
            image_max_width: DEFAULT_MAX_WIDTH,
            image_max_height: DEFAULT_MAX_HEIGHT,
        }
    }
}

/// Which object store implementation to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    #[default]
    Filesystem,
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Destination bucket (a subdirectory of `root` for the filesystem backend)
    pub bucket: String,

    /// AWS region (S3 backend)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible services
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Use path-style addressing (most S3-compatible services need this)
    pub force_path_style: bool,

    /// Base URL objects are served from; overrides the default S3 URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,

    /// Root directory (filesystem backend)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Mirror the dedup index into the bucket
    pub persist_index: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            bucket: DEFAULT_BUCKET.to_string(),
            region: None,
            endpoint: None,
            force_path_style: false,
            public_base_url: None,
            root: None,
            persist_index: true,
        }
    }
}

impl StorageConfig {
    pub fn s3_settings(&self) -> S3Settings {
        S3Settings {
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            force_path_style: self.force_path_style,
            public_base_url: self.public_base_url.clone(),
        }
    }

    /// Filesystem root, defaulting to the platform data directory
    pub fn root_or_default(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mediagate")
        })
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Default filter when neither MEDIAGATE_LOG nor RUST_LOG is set
    pub level: String,

    pub format: LogFormat,

    pub output: LogOutput,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            output: LogOutput::default(),
        }
    }
}
