//! Media ingestion pipeline
//!
//! Accepts raw bytes or a remote URL and turns them into a
//! [`MediaDescriptor`] pointing at a published, content-addressed object:
//!
//! - **classify**: magic-number sniffing, allow-list and size limit
//! - **normalize**: image embed-resize; audio and video pass through
//! - **digest**: SHA-256 content identity
//! - **dedup**: write-once digest index with per-digest single-flight
//! - **store**: object store capability (S3, filesystem, memory) and uploader
//! - **fetch** / **ssrf**: pre-flight check and bounded download with
//!   destination filtering
//! - **ingest**: the orchestrator tying the stages together
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mediagate::media::{IngestContext, IngestSettings, MediaIngestor, MemoryObjectStore, RawMediaInput};
//!
//! let ingestor = MediaIngestor::new(IngestSettings::default(), Arc::new(MemoryObjectStore::new()));
//! let descriptor = ingestor
//!     .ingest_bytes(RawMediaInput::new(bytes, "photo.jpg"), &IngestContext::background())
//!     .await?;
//! println!("{} -> {}", descriptor.digest, descriptor.url);
//! ```

pub mod classify;
pub mod context;
pub mod dedup;
pub mod digest;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod normalize;
pub mod ssrf;
pub mod store;

pub use classify::{
    FormatPolicy, MediaClassification, MediaKind, RemoteMetadata, ValidationError,
    FALLBACK_MIME_TYPE,
};
pub use context::{IngestContext, Interrupted};
pub use dedup::{index_key, DedupIndex, KeyedLocks, MediaDescriptor, INDEX_PREFIX};
pub use digest::{ContentDigest, DigestParseError};
pub use error::{IngestError, IngestStage};
pub use fetch::{filename_from_url, FetchConfig, FetchError, RemoteFetcher};
pub use ingest::{IngestSettings, MediaIngestor, RawMediaInput};
pub use normalize::{ContentNormalizer, NormalizeConfig, NormalizedMedia, ProcessingError};
pub use ssrf::{UrlPolicy, UrlPolicyError};
pub use store::{
    object_key, FsObjectStore, MemoryObjectStore, ObjectStore, S3ObjectStore, S3Settings,
    StoreError, Uploader,
};
