//! Object storage
//!
//! [`ObjectStore`] is the put/get capability the pipeline publishes into.
//! Three backends are provided:
//!
//! - **S3ObjectStore**: any S3-compatible service through `aws-sdk-s3`
//! - **FsObjectStore**: a local directory, one subdirectory per bucket,
//!   written through a temp file and an atomic rename
//! - **MemoryObjectStore**: in-process map, for tests and dry runs
//!
//! [`Uploader`] sits on top of a store: it derives the content-addressed key
//! for a digest and turns a successful put into a public URL.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::context::{IngestContext, Interrupted};
use super::digest::ContentDigest;

/// Longest extension kept from a declared filename
const MAX_EXTENSION_LEN: usize = 10;

/// Errors raised by object store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("put {key} failed: {reason}")]
    Put { key: String, reason: String },

    #[error("get {key} failed: {reason}")]
    Get { key: String, reason: String },

    #[error("delete {key} failed: {reason}")]
    Delete { key: String, reason: String },

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("corrupt index entry {key}: {reason}")]
    CorruptIndex { key: String, reason: String },

    #[error("storage operation interrupted: {0}")]
    Interrupted(#[from] Interrupted),
}

/// Put/get capability over a bucketed object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `bucket/key`, replacing any existing object.
    ///
    /// Implementations must not expose a partially written object.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError>;

    /// Fetch an object, or `None` if it does not exist.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Remove an object. Removing a missing object is not an error.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError>;

    /// Publicly dereferenceable URL of `bucket/key`
    fn public_url(&self, bucket: &str, key: &str) -> String;

    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;
}

/// Default public URL for an S3 bucket
pub fn s3_public_url(bucket: &str, key: &str) -> String {
    format!("https://{}.s3.amazonaws.com/{}", bucket, key)
}

fn join_url(base: &str, bucket: &str, key: &str) -> String {
    format!("{}/{}/{}", base.trim_end_matches('/'), bucket, key)
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Extension (without the dot) taken from a declared filename, if usable
pub fn filename_extension(filename: &str) -> Option<String> {
    let ext = Path::new(filename).extension()?.to_str()?;
    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Object key for `digest`: `YYYY/MM/DD/<hex><.ext>`
pub fn object_key(digest: &ContentDigest, extension: Option<&str>, date: NaiveDate) -> String {
    let partition = date.format("%Y/%m/%d");
    match extension {
        Some(ext) if !ext.is_empty() => format!("{}/{}.{}", partition, digest, ext),
        _ => format!("{}/{}", partition, digest),
    }
}

/// Publishes normalized bytes under content-addressed keys
#[derive(Clone)]
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

/// Location of a published object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub key: String,
    pub url: String,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Upload `bytes` under the key derived from `digest` and today's date.
    ///
    /// See [`Uploader::upload_to`] for how `hold` is treated.
    pub async fn upload<H>(
        &self,
        bytes: Bytes,
        digest: &ContentDigest,
        extension: Option<&str>,
        content_type: &str,
        ctx: &IngestContext,
        hold: H,
    ) -> Result<(Published, H), StoreError>
    where
        H: Send + 'static,
    {
        let key = object_key(digest, extension, Utc::now().date_naive());
        self.upload_to(bytes, key, content_type, ctx, hold).await
    }

    /// Upload `bytes` under an explicit key.
    ///
    /// The put runs on its own task so it always settles, even when `ctx`
    /// stops the wait. On interruption the object is deleted once the put
    /// has settled, and `hold` (typically the digest's flight lock) is
    /// dropped only after that delete. Otherwise `hold` is handed back.
    pub async fn upload_to<H>(
        &self,
        bytes: Bytes,
        key: String,
        content_type: &str,
        ctx: &IngestContext,
        hold: H,
    ) -> Result<(Published, H), StoreError>
    where
        H: Send + 'static,
    {
        ctx.check()?;

        let size = bytes.len();
        let mut put = {
            let store = Arc::clone(&self.store);
            let bucket = self.bucket.clone();
            let key = key.clone();
            let content_type = content_type.to_string();
            tokio::spawn(async move {
                store
                    .put_object(&bucket, &key, bytes, &content_type)
                    .await
            })
        };

        match ctx.guard(&mut put).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => {
                return Err(StoreError::Put {
                    key,
                    reason: format!("upload task failed: {}", e),
                })
            }
            Err(interrupted) => {
                self.discard_when_settled(put, key, hold);
                return Err(interrupted.into());
            }
        }

        let url = self.store.public_url(&self.bucket, &key);
        tracing::debug!(
            backend = self.store.backend_name(),
            bucket = %self.bucket,
            key = %key,
            size,
            "object published"
        );
        Ok((Published { key, url }, hold))
    }

    /// Delete `key` after an abandoned put finishes, whatever its outcome.
    fn discard_when_settled<H>(
        &self,
        put: JoinHandle<Result<(), StoreError>>,
        key: String,
        hold: H,
    ) where
        H: Send + 'static,
    {
        let uploader = self.clone();
        tokio::spawn(async move {
            // A failed put may still have committed server-side.
            let _ = put.await;
            uploader.discard(&key).await;
            tracing::debug!(key = %key, "interrupted upload cleaned up");
            drop(hold);
        });
    }

    /// Best-effort removal of an object whose publish could not be completed
    pub async fn discard(&self, key: &str) {
        if let Err(e) = self.store.delete_object(&self.bucket, key).await {
            tracing::warn!(key = %key, error = %e, "failed to discard unreferenced object");
        }
    }
}

// ---------------------------------------------------------------------------
// S3
// ---------------------------------------------------------------------------

/// Connection settings for an S3-compatible endpoint
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    pub public_base_url: Option<String>,
}

/// Object store backed by `aws-sdk-s3`
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    public_base_url: Option<String>,
}

impl S3ObjectStore {
    /// Build a client from the ambient AWS configuration (env, profile, IMDS).
    pub async fn from_env(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if settings.force_path_style {
            builder = builder.force_path_style(true);
        }

        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            public_base_url: settings.public_base_url.clone(),
        }
    }

    pub fn from_client(client: aws_sdk_s3::Client, public_base_url: Option<String>) -> Self {
        Self {
            client,
            public_base_url,
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(aws_sdk_s3::primitives::ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StoreError::Put {
                key: key.to_string(),
                reason: format!("{}", aws_sdk_s3::error::DisplayErrorContext(&e)),
            })?;
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Bytes>, StoreError> {
        let response = self.client.get_object().bucket(bucket).key(key).send().await;

        let output = match response {
            Ok(output) => output,
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    return Ok(None);
                }
                return Err(StoreError::Get {
                    key: key.to_string(),
                    reason: format!("{}", aws_sdk_s3::error::DisplayErrorContext(&e)),
                });
            }
        };

        let collected = output.body.collect().await.map_err(|e| StoreError::Get {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(collected.into_bytes()))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::Delete {
                key: key.to_string(),
                reason: format!("{}", aws_sdk_s3::error::DisplayErrorContext(&e)),
            })?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        match &self.public_base_url {
            Some(base) => join_url(base, bucket, key),
            None => s3_public_url(bucket, key),
        }
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Object store backed by a local directory
pub struct FsObjectStore {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl FsObjectStore {
    /// Create the store, creating `root` if it does not exist.
    pub async fn new(root: PathBuf, public_base_url: Option<String>) -> Result<Self, StoreError> {
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::Put {
                key: root.display().to_string(),
                reason: format!("failed to create root directory: {}", e),
            })?;
        Ok(Self {
            root,
            public_base_url,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `bucket/key` under the root, refusing anything that escapes it.
    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(bucket).join(key);
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if bucket.is_empty() || key.is_empty() || escapes {
            return Err(StoreError::InvalidKey(format!("{}/{}", bucket, key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        _content_type: &str,
    ) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key)?;
        let put_err = |reason: String| StoreError::Put {
            key: key.to_string(),
            reason,
        };

        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| put_err(format!("failed to create directory: {}", e)))?;

        // Write to a sibling temp file, then rename so readers never see a
        // half-written object.
        let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        if let Err(e) = fs::write(&tmp, &body).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(put_err(format!("failed to write: {}", e)));
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(put_err(format!("failed to rename: {}", e)));
        }
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Bytes>, StoreError> {
        let path = self.object_path(bucket, key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Get {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Delete {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        match &self.public_base_url {
            Some(base) => join_url(base, bucket, key),
            None => format!("file://{}", self.root.join(bucket).join(key).display()),
        }
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// A stored object with its content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
}

/// Object store held in process memory
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<(String, String), StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys present in `bucket`, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError> {
        self.objects.write().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.object(bucket, key).map(|o| o.body))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.objects
            .write()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        s3_public_url(bucket, key)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 7).unwrap()
    }

    #[test]
    fn test_object_key_layout() {
        let digest = ContentDigest::of(b"abc");
        assert_eq!(
            object_key(&digest, Some("jpg"), date()),
            format!("2024/03/07/{}.jpg", digest)
        );
        assert_eq!(
            object_key(&digest, None, date()),
            format!("2024/03/07/{}", digest)
        );
    }

    #[test]
    fn test_object_key_is_deterministic() {
        let digest = ContentDigest::of(b"same bytes");
        assert_eq!(
            object_key(&digest, Some("png"), date()),
            object_key(&ContentDigest::of(b"same bytes"), Some("png"), date())
        );
    }

    #[test]
    fn test_filename_extension() {
        assert_eq!(filename_extension("photo.JPG").as_deref(), Some("jpg"));
        assert_eq!(filename_extension("a/b/song.mp3").as_deref(), Some("mp3"));
        assert_eq!(filename_extension("README"), None);
        assert_eq!(filename_extension(".hidden"), None);
        assert_eq!(filename_extension("x.tar.gz").as_deref(), Some("gz"));
        assert_eq!(filename_extension("evil.p/h"), None);
        assert_eq!(filename_extension("weird.j p g"), None);
        assert_eq!(filename_extension("long.abcdefghijklmnop"), None);
    }

    #[test]
    fn test_s3_public_url() {
        assert_eq!(
            s3_public_url("media", "2024/01/01/x.png"),
            "https://media.s3.amazonaws.com/2024/01/01/x.png"
        );
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryObjectStore::new();
        store
            .put_object("b", "k", Bytes::from_static(b"data"), "image/png")
            .await
            .unwrap();
        assert_eq!(
            store.get_object("b", "k").await.unwrap(),
            Some(Bytes::from_static(b"data"))
        );
        assert_eq!(store.object("b", "k").unwrap().content_type, "image/png");
        store.delete_object("b", "k").await.unwrap();
        assert!(store.get_object("b", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_store_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf(), None)
            .await
            .unwrap();

        store
            .put_object("media", "2024/01/02/abc.png", Bytes::from_static(b"png"), "image/png")
            .await
            .unwrap();
        assert!(dir.path().join("media/2024/01/02/abc.png").exists());
        assert_eq!(
            store.get_object("media", "2024/01/02/abc.png").await.unwrap(),
            Some(Bytes::from_static(b"png"))
        );

        store.delete_object("media", "2024/01/02/abc.png").await.unwrap();
        assert!(store
            .get_object("media", "2024/01/02/abc.png")
            .await
            .unwrap()
            .is_none());
        // Deleting again is fine.
        store.delete_object("media", "2024/01/02/abc.png").await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_store_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf(), None)
            .await
            .unwrap();
        store
            .put_object("b", "k.bin", Bytes::from_static(b"1"), "application/octet-stream")
            .await
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join("b"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["k.bin".to_string()]);
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().to_path_buf(), None)
            .await
            .unwrap();
        let result = store
            .put_object("b", "../../etc/passwd", Bytes::from_static(b"x"), "text/plain")
            .await;
        assert!(matches!(result, Err(StoreError::InvalidKey(_))));
        let result = store.get_object("", "k").await;
        assert!(matches!(result, Err(StoreError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_fs_store_public_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(
            dir.path().to_path_buf(),
            Some("https://cdn.example.com/".into()),
        )
        .await
        .unwrap();
        assert_eq!(
            store.public_url("media", "a/b.png"),
            "https://cdn.example.com/media/a/b.png"
        );
    }

    #[tokio::test]
    async fn test_uploader_publishes_under_digest_key() {
        let store = Arc::new(MemoryObjectStore::new());
        let uploader = Uploader::new(store.clone(), "media");
        let digest = ContentDigest::of(b"payload");

        let (published, ()) = uploader
            .upload(
                Bytes::from_static(b"payload"),
                &digest,
                Some("mp3"),
                "audio/mpeg",
                &IngestContext::background(),
                (),
            )
            .await
            .unwrap();

        assert!(published.key.ends_with(&format!("{}.mp3", digest)));
        assert_eq!(published.url, s3_public_url("media", &published.key));
        assert_eq!(store.keys("media"), vec![published.key.clone()]);
    }

    #[tokio::test]
    async fn test_uploader_respects_cancellation() {
        let store = Arc::new(MemoryObjectStore::new());
        let uploader = Uploader::new(store.clone(), "media");
        let ctx = IngestContext::background();
        ctx.cancel();

        let result = uploader
            .upload_to(Bytes::from_static(b"x"), "k".into(), "image/png", &ctx, ())
            .await;
        assert_eq!(result, Err(StoreError::Interrupted(Interrupted::Cancelled)));
        assert!(store.is_empty());
    }

    /// Commits immediately but acknowledges late.
    struct SlowAckStore {
        inner: MemoryObjectStore,
        ack_delay: std::time::Duration,
    }

    #[async_trait]
    impl ObjectStore for SlowAckStore {
        async fn put_object(
            &self,
            bucket: &str,
            key: &str,
            body: Bytes,
            content_type: &str,
        ) -> Result<(), StoreError> {
            self.inner.put_object(bucket, key, body, content_type).await?;
            tokio::time::sleep(self.ack_delay).await;
            Ok(())
        }

        async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Bytes>, StoreError> {
            self.inner.get_object(bucket, key).await
        }

        async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
            self.inner.delete_object(bucket, key).await
        }

        fn public_url(&self, bucket: &str, key: &str) -> String {
            self.inner.public_url(bucket, key)
        }

        fn backend_name(&self) -> &'static str {
            "slow-ack"
        }
    }

    #[tokio::test]
    async fn test_interrupted_upload_is_removed_before_hold_is_released() {
        let store = Arc::new(SlowAckStore {
            inner: MemoryObjectStore::new(),
            ack_delay: std::time::Duration::from_millis(200),
        });
        let uploader = Uploader::new(store.clone(), "media");
        let ctx = IngestContext::with_timeout(std::time::Duration::from_millis(30));
        let (hold, released) = tokio::sync::oneshot::channel::<()>();

        let result = uploader
            .upload_to(Bytes::from_static(b"x"), "a/b.bin".into(), "audio/mpeg", &ctx, hold)
            .await;
        assert!(matches!(
            result,
            Err(StoreError::Interrupted(Interrupted::DeadlineExceeded))
        ));
        // The put committed before the deadline fired.
        assert_eq!(store.inner.len(), 1);

        // The hold is dropped only after the cleanup delete.
        assert!(released.await.is_err());
        assert!(store.inner.is_empty());
    }
}
