//! Ingestion orchestrator
//!
//! [`MediaIngestor`] runs the pipeline for both input modes:
//!
//! ```text
//! bytes ──► validate ──► normalize ──► digest ──► lookup ──┬──► descriptor
//!                                                          └──► lock ► lookup ► upload ► record
//! url ──► pre-flight ──► download ──► (bytes path)
//! ```
//!
//! Uploads are single-flight per digest: concurrent ingestions of content
//! that normalizes to the same bytes queue on a per-digest lock, and all but
//! the first find the descriptor in the index once they get the lock. If the
//! first upload fails, the next waiter performs its own.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{Instrument, Level};

use super::classify::{FormatPolicy, MediaClassification, RemoteMetadata};
use super::context::IngestContext;
use super::dedup::{DedupIndex, KeyedLocks, MediaDescriptor};
use super::digest::ContentDigest;
use super::error::IngestError;
use super::fetch::{FetchConfig, RemoteFetcher};
use super::normalize::{
    ContentNormalizer, NormalizeConfig, NormalizedMedia, ProcessingError, DEFAULT_MAX_DECODE_ALLOC,
    DEFAULT_MAX_HEIGHT, DEFAULT_MAX_WIDTH,
};
use super::store::{filename_extension, ObjectStore, StoreError, Uploader};
use crate::metrics::{IngestMetrics, MetricsSnapshot};

/// Default maximum payload size (10 MiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Default destination bucket
pub const DEFAULT_BUCKET: &str = "media";

/// MIME prefixes accepted by default
pub fn default_allowed_formats() -> Vec<String> {
    vec!["image/".into(), "audio/".into(), "video/".into()]
}

/// A payload handed to the pipeline by a caller
#[derive(Debug, Clone)]
pub struct RawMediaInput {
    pub bytes: Vec<u8>,

    /// Filename as declared by the caller; used only for the key extension
    pub filename: String,

    /// Size as declared by the caller; never trusted
    pub declared_size: Option<u64>,
}

impl RawMediaInput {
    pub fn new(bytes: impl Into<Vec<u8>>, filename: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            filename: filename.into(),
            declared_size: None,
        }
    }

    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }
}

/// Everything the pipeline needs besides the object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSettings {
    pub max_file_size: u64,
    pub allowed_formats: Vec<String>,
    pub image_max_width: u32,
    pub image_max_height: u32,
    pub max_decode_alloc: u64,
    pub bucket: String,
    pub fetch: FetchConfig,

    /// Mirror index entries into the bucket so dedup survives restarts
    pub persist_index: bool,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed_formats: default_allowed_formats(),
            image_max_width: DEFAULT_MAX_WIDTH,
            image_max_height: DEFAULT_MAX_HEIGHT,
            max_decode_alloc: DEFAULT_MAX_DECODE_ALLOC,
            bucket: DEFAULT_BUCKET.to_string(),
            fetch: FetchConfig::default(),
            persist_index: true,
        }
    }
}

impl IngestSettings {
    pub fn with_max_file_size(mut self, max: u64) -> Self {
        self.max_file_size = max;
        self
    }

    pub fn with_allowed_formats(mut self, formats: Vec<String>) -> Self {
        self.allowed_formats = formats;
        self
    }

    pub fn with_image_bounds(mut self, max_width: u32, max_height: u32) -> Self {
        self.image_max_width = max_width;
        self.image_max_height = max_height;
        self
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn with_fetch(mut self, fetch: FetchConfig) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_persist_index(mut self, persist: bool) -> Self {
        self.persist_index = persist;
        self
    }

    fn format_policy(&self) -> FormatPolicy {
        FormatPolicy::new(self.max_file_size, self.allowed_formats.clone())
    }

    fn normalize_config(&self) -> NormalizeConfig {
        NormalizeConfig::default()
            .with_bounds(self.image_max_width, self.image_max_height)
            .with_max_decode_alloc(self.max_decode_alloc)
    }
}

/// The media ingestion pipeline
pub struct MediaIngestor {
    policy: FormatPolicy,
    normalizer: ContentNormalizer,
    fetcher: RemoteFetcher,
    uploader: Uploader,
    index: DedupIndex,
    locks: KeyedLocks<ContentDigest>,
    metrics: IngestMetrics,
}

impl MediaIngestor {
    pub fn new(settings: IngestSettings, store: Arc<dyn ObjectStore>) -> Self {
        let index = if settings.persist_index {
            DedupIndex::persistent(Arc::clone(&store), settings.bucket.clone())
        } else {
            DedupIndex::in_memory()
        };

        tracing::debug!(
            backend = store.backend_name(),
            bucket = %settings.bucket,
            max_file_size = settings.max_file_size,
            persist_index = settings.persist_index,
            "media ingestor ready"
        );

        Self {
            policy: settings.format_policy(),
            normalizer: ContentNormalizer::new(settings.normalize_config()),
            fetcher: RemoteFetcher::new(settings.fetch.clone()),
            uploader: Uploader::new(store, settings.bucket),
            index,
            locks: KeyedLocks::new(),
            metrics: IngestMetrics::new(),
        }
    }

    pub fn policy(&self) -> &FormatPolicy {
        &self.policy
    }

    pub fn index(&self) -> &DedupIndex {
        &self.index
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Ingest a payload supplied directly by the caller.
    pub async fn ingest_bytes(
        &self,
        input: RawMediaInput,
        ctx: &IngestContext,
    ) -> Result<MediaDescriptor, IngestError> {
        let span = tracing::info_span!(
            "ingest",
            source = "bytes",
            filename = %input.filename,
            size = input.bytes.len(),
        );
        self.observe(self.process(input, ctx)).instrument(span).await
    }

    /// Fetch `url` and ingest its body.
    ///
    /// The server's reported type and length are checked before the body is
    /// requested. The downloaded bytes are then validated like any other
    /// payload.
    pub async fn ingest_url(
        &self,
        url: &str,
        ctx: &IngestContext,
    ) -> Result<MediaDescriptor, IngestError> {
        let span = tracing::info_span!("ingest", source = "url", url = %url);
        self.observe(async {
            self.preflight(url, ctx).await?;

            let downloaded = self
                .fetcher
                .download(url, self.policy.max_size, ctx)
                .await?;
            tracing::debug!(
                filename = %downloaded.filename,
                size = downloaded.bytes.len(),
                "remote payload downloaded"
            );

            let mut input = RawMediaInput::new(downloaded.bytes.to_vec(), downloaded.filename);
            input.declared_size = downloaded.declared_size;
            self.process(input, ctx).await
        })
        .instrument(span)
        .await
    }

    /// Run only the pre-flight check for `url` and report what the server
    /// advertised.
    pub async fn check_url(
        &self,
        url: &str,
        ctx: &IngestContext,
    ) -> Result<RemoteMetadata, IngestError> {
        self.preflight(url, ctx)
            .instrument(tracing::info_span!("check_url", url = %url))
            .await
    }

    async fn preflight(&self, url: &str, ctx: &IngestContext) -> Result<RemoteMetadata, IngestError> {
        let metadata = self.fetcher.preflight(url, ctx).await?;
        self.policy.validate_remote(&metadata)?;
        Ok(metadata)
    }

    async fn process(
        &self,
        input: RawMediaInput,
        ctx: &IngestContext,
    ) -> Result<MediaDescriptor, IngestError> {
        let RawMediaInput {
            bytes,
            filename,
            declared_size,
        } = input;

        let classification = self.policy.validate(&bytes, declared_size)?;
        tracing::debug!(mime_type = %classification, "payload classified");

        let normalized = self.normalize(bytes, &classification).await?;
        if normalized.transformed {
            self.metrics.images_resized.inc();
        }

        let digest = ContentDigest::of(&normalized.bytes);
        let extension = filename_extension(&filename).or_else(|| classification.extension.clone());
        tracing::debug!(digest = %digest.short(), size = normalized.len(), "payload hashed");

        if let Some(existing) = self.index.lookup(&digest).await? {
            return Ok(self.reuse(existing));
        }

        let flight = ctx
            .guard(self.locks.lock(digest))
            .await
            .map_err(StoreError::from)?;

        // Another ingestion may have published while this one waited.
        if let Some(existing) = self.index.lookup(&digest).await? {
            return Ok(self.reuse(existing));
        }

        let size = normalized.len() as u64;
        // An interrupted upload keeps the flight lock until its object is gone.
        let (published, _flight) = self
            .uploader
            .upload(
                Bytes::from(normalized.bytes),
                &digest,
                extension.as_deref(),
                &classification.mime_type,
                ctx,
                flight,
            )
            .await?;
        self.metrics.uploads.inc();
        self.metrics.bytes_uploaded.add(size);

        let descriptor = MediaDescriptor {
            url: published.url,
            key: published.key,
            digest,
            classification,
            size,
        };

        match self.index.record(descriptor.clone()).await {
            Ok(recorded) => Ok(recorded),
            Err(e) => {
                // Nothing references the object without its index entry.
                self.uploader.discard(&descriptor.key).await;
                Err(e.into())
            }
        }
    }

    async fn normalize(
        &self,
        bytes: Vec<u8>,
        classification: &MediaClassification,
    ) -> Result<NormalizedMedia, IngestError> {
        let normalizer = self.normalizer.clone();
        let classification = classification.clone();
        let normalized = tokio::task::spawn_blocking(move || {
            normalizer.normalize(bytes, &classification)
        })
        .await
        .map_err(|e| ProcessingError::Task(e.to_string()))??;
        Ok(normalized)
    }

    fn reuse(&self, existing: MediaDescriptor) -> MediaDescriptor {
        self.metrics.deduplicated.inc();
        tracing::debug!(digest = %existing.digest.short(), key = %existing.key, "duplicate content, upload skipped");
        existing
    }

    /// Count, time and log one ingestion.
    async fn observe<F>(&self, fut: F) -> Result<MediaDescriptor, IngestError>
    where
        F: Future<Output = Result<MediaDescriptor, IngestError>>,
    {
        self.metrics.requests.inc();
        self.metrics.in_flight.inc();
        let started = Instant::now();

        let result = fut.await;

        self.metrics.in_flight.dec();
        self.metrics.latency.observe_duration(started.elapsed());

        match &result {
            Ok(descriptor) => {
                self.metrics.succeeded.inc();
                tracing::info!(
                    digest = %descriptor.digest.short(),
                    url = %descriptor.url,
                    size = descriptor.size,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "media ingested"
                );
            }
            Err(e) => {
                self.metrics.record_failure(e.stage());
                if failure_level(e) == Level::ERROR {
                    tracing::error!(stage = %e.stage(), error = %e, "media ingestion failed");
                } else {
                    tracing::warn!(stage = %e.stage(), error = %e, "media rejected");
                }
            }
        }

        result
    }
}

/// Operational failures log at error; rejections and interruptions the
/// caller caused log at warn.
fn failure_level(e: &IngestError) -> Level {
    if e.interruption().is_some() || e.is_user_correctable() {
        Level::WARN
    } else {
        Level::ERROR
    }
}
