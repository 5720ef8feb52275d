//! Deduplication index
//!
//! Maps a [`ContentDigest`] to the descriptor of the object that was
//! published for it. Entries are write-once: the first publish of a digest
//! wins and is never replaced.
//!
//! The index is held in memory and, when a store is attached, mirrored to
//! `_index/<hex>.json` objects in the same bucket so a fresh process can
//! recover entries written by an earlier one. Lookups that miss in memory
//! fall through to the store.
//!
//! [`KeyedLocks`] provides the per-digest single-flight lock that keeps two
//! concurrent ingestions of identical content from both uploading.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use super::classify::MediaClassification;
use super::digest::ContentDigest;
use super::store::{ObjectStore, StoreError};

/// Key prefix for persisted index entries
pub const INDEX_PREFIX: &str = "_index";

const INDEX_CONTENT_TYPE: &str = "application/json";

/// Everything a caller needs to reference a published object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaDescriptor {
    /// Public URL of the object
    pub url: String,

    /// Object key inside the bucket
    pub key: String,

    /// SHA-256 of the stored bytes
    pub digest: ContentDigest,

    /// Sniffed type of the original payload
    pub classification: MediaClassification,

    /// Size of the stored bytes
    pub size: u64,
}

/// Key of the persisted index entry for `digest`
pub fn index_key(digest: &ContentDigest) -> String {
    format!("{}/{}.json", INDEX_PREFIX, digest)
}

/// Digest → descriptor map with optional persistence
pub struct DedupIndex {
    entries: RwLock<HashMap<ContentDigest, MediaDescriptor>>,
    backing: Option<(Arc<dyn ObjectStore>, String)>,
}

impl DedupIndex {
    /// Index that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            backing: None,
        }
    }

    /// Index mirrored to `_index/` objects in `bucket`
    pub fn persistent(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            backing: Some((store, bucket.into())),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.backing.is_some()
    }

    /// Number of entries currently cached in memory
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Find the descriptor previously recorded for `digest`.
    pub async fn lookup(
        &self,
        digest: &ContentDigest,
    ) -> Result<Option<MediaDescriptor>, StoreError> {
        if let Some(found) = self.entries.read().get(digest) {
            return Ok(Some(found.clone()));
        }

        let Some((store, bucket)) = &self.backing else {
            return Ok(None);
        };

        let key = index_key(digest);
        let Some(raw) = store.get_object(bucket, &key).await? else {
            return Ok(None);
        };

        let descriptor: MediaDescriptor =
            serde_json::from_slice(&raw).map_err(|e| StoreError::CorruptIndex {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        if descriptor.digest != *digest {
            return Err(StoreError::CorruptIndex {
                key,
                reason: format!("entry belongs to {}", descriptor.digest),
            });
        }

        tracing::debug!(digest = %digest.short(), "index entry loaded from store");
        let mut entries = self.entries.write();
        Ok(Some(entries.entry(*digest).or_insert(descriptor).clone()))
    }

    /// Record the descriptor for its digest.
    ///
    /// Returns the descriptor that is authoritative afterwards: if the digest
    /// was already present the existing entry is kept and returned.
    pub async fn record(&self, descriptor: MediaDescriptor) -> Result<MediaDescriptor, StoreError> {
        if let Some(existing) = self.entries.read().get(&descriptor.digest) {
            return Ok(existing.clone());
        }

        if let Some((store, bucket)) = &self.backing {
            let body = serde_json::to_vec(&descriptor).map_err(|e| StoreError::Put {
                key: index_key(&descriptor.digest),
                reason: e.to_string(),
            })?;
            store
                .put_object(
                    bucket,
                    &index_key(&descriptor.digest),
                    Bytes::from(body),
                    INDEX_CONTENT_TYPE,
                )
                .await?;
        }

        let mut entries = self.entries.write();
        Ok(entries
            .entry(descriptor.digest)
            .or_insert(descriptor)
            .clone())
    }
}

/// Per-key async locks that are removed once nobody holds or waits on them
pub struct KeyedLocks<K> {
    locks: Arc<Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + std::hash::Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `key`.
    pub async fn lock(&self, key: K) -> KeyGuard<K> {
        let slot = {
            let mut locks = self.locks.lock();
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = slot.clone().lock_owned().await;
        KeyGuard {
            key,
            slot,
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of keys with a live lock entry
    pub fn active(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Exclusive ownership of one key; released on drop
pub struct KeyGuard<K: Eq + std::hash::Hash> {
    key: K,
    slot: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>>,
}

impl<K: Eq + std::hash::Hash> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        // Release the mutex before deciding whether the entry is still needed.
        self.guard.take();
        let mut locks = self.locks.lock();
        // One reference held by the map, one by this guard: nobody is waiting.
        if Arc::strong_count(&self.slot) == 2 {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::classify::MediaKind;
    use crate::media::store::MemoryObjectStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn descriptor(payload: &[u8], url: &str) -> MediaDescriptor {
        let digest = ContentDigest::of(payload);
        MediaDescriptor {
            url: url.to_string(),
            key: format!("2024/01/01/{}.png", digest),
            digest,
            classification: MediaClassification {
                mime_type: "image/png".into(),
                kind: MediaKind::Image,
                extension: Some("png".into()),
            },
            size: payload.len() as u64,
        }
    }

    #[tokio::test]
    async fn test_lookup_miss() {
        let index = DedupIndex::in_memory();
        assert!(index.lookup(&ContentDigest::of(b"x")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_then_lookup() {
        let index = DedupIndex::in_memory();
        let d = descriptor(b"x", "https://a/1");
        index.record(d.clone()).await.unwrap();
        assert_eq!(index.lookup(&d.digest).await.unwrap(), Some(d));
    }

    #[tokio::test]
    async fn test_record_is_write_once() {
        let index = DedupIndex::in_memory();
        let first = descriptor(b"x", "https://a/first");
        let second = descriptor(b"x", "https://a/second");

        index.record(first.clone()).await.unwrap();
        let kept = index.record(second).await.unwrap();
        assert_eq!(kept, first);
        assert_eq!(index.lookup(&first.digest).await.unwrap(), Some(first));
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_index_survives_restart() {
        let store = Arc::new(MemoryObjectStore::new());
        let d = descriptor(b"persist me", "https://a/p");

        let index = DedupIndex::persistent(store.clone(), "media");
        index.record(d.clone()).await.unwrap();
        assert!(store.object("media", &index_key(&d.digest)).is_some());

        let fresh = DedupIndex::persistent(store.clone(), "media");
        assert!(fresh.is_empty());
        assert_eq!(fresh.lookup(&d.digest).await.unwrap(), Some(d));
        assert_eq!(fresh.len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_index_rejects_corrupt_entry() {
        let store = Arc::new(MemoryObjectStore::new());
        let digest = ContentDigest::of(b"corrupt");
        store
            .put_object(
                "media",
                &index_key(&digest),
                Bytes::from_static(b"not json"),
                INDEX_CONTENT_TYPE,
            )
            .await
            .unwrap();

        let index = DedupIndex::persistent(store, "media");
        let result = index.lookup(&digest).await;
        assert!(matches!(result, Err(StoreError::CorruptIndex { .. })));
    }

    #[tokio::test]
    async fn test_persistent_index_rejects_mismatched_entry() {
        let store = Arc::new(MemoryObjectStore::new());
        let other = descriptor(b"other", "https://a/o");
        let wanted = ContentDigest::of(b"wanted");
        store
            .put_object(
                "media",
                &index_key(&wanted),
                Bytes::from(serde_json::to_vec(&other).unwrap()),
                INDEX_CONTENT_TYPE,
            )
            .await
            .unwrap();

        let index = DedupIndex::persistent(store, "media");
        assert!(matches!(
            index.lookup(&wanted).await,
            Err(StoreError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn test_index_key() {
        let digest = ContentDigest::of(b"abc");
        assert_eq!(index_key(&digest), format!("_index/{}.json", digest.to_hex()));
    }

    #[tokio::test]
    async fn test_keyed_lock_is_exclusive_per_key() {
        let locks = Arc::new(KeyedLocks::<u32>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(7).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_keyed_lock_distinct_keys_do_not_block() {
        let locks = KeyedLocks::<u32>::new();
        let _a = locks.lock(1).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(2)).await;
        assert!(b.is_ok());
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn test_keyed_lock_entry_removed_after_release() {
        let locks = KeyedLocks::<u32>::new();
        {
            let _guard = locks.lock(1).await;
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
    }
}
