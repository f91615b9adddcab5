use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{sanitize_key_component, KvStore};

/// Request extension carrying the version chosen for this request's cache key.
#[derive(Debug, Clone, Copy)]
pub struct CacheVersion(pub u64);

/// Monotonic per-cache-key version counter. Versions bust both the KV variant
/// (through the variant key hash) and the upstream query string.
///
/// Records are empty-value KV entries with the counter in metadata, keeping
/// reads cheap. Read failures surface as "absent", never as errors.
pub struct VersionService {
    store: Arc<dyn KvStore>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionRecord {
    version: u64,
    created_at: u64,
    updated_at: u64,
}

fn now_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl VersionService {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn key(cache_key: &str) -> String {
        format!("version-{}", sanitize_key_component(cache_key))
    }

    async fn read_record(&self, cache_key: &str) -> Option<VersionRecord> {
        match self.store.get(&Self::key(cache_key)).await {
            Ok(Some(entry)) => entry
                .metadata
                .and_then(|m| serde_json::from_value(m).ok()),
            Ok(None) => None,
            Err(e) => {
                warn!(cache_key, error = %e, "version read failed");
                None
            }
        }
    }

    async fn write_record(&self, cache_key: &str, record: VersionRecord) {
        let metadata = match serde_json::to_value(&record) {
            Ok(m) => m,
            Err(_) => return,
        };
        if let Err(e) = self
            .store
            .put(&Self::key(cache_key), Bytes::new(), Some(metadata), None)
            .await
        {
            warn!(cache_key, error = %e, "version write failed");
        }
    }

    /// Current version, if a record exists.
    pub async fn read(&self, cache_key: &str) -> Option<u64> {
        self.read_record(cache_key).await.map(|r| r.version)
    }

    /// Version to use for this request. Absent keys are version 1 without a
    /// write; `force_increment` bumps and persists the counter.
    pub async fn next(&self, cache_key: &str, force_increment: bool) -> u64 {
        let existing = self.read_record(cache_key).await;
        let current = existing.as_ref().map(|r| r.version).unwrap_or(1);

        if !force_increment {
            return current;
        }

        let next = current + 1;
        let now = now_epoch_secs();
        let record = VersionRecord {
            version: next,
            created_at: existing.as_ref().map(|r| r.created_at).unwrap_or(now),
            updated_at: now,
        };
        self.write_record(cache_key, record).await;
        debug!(cache_key, version = next, "version bumped");
        next
    }

    /// Persist the version used for a stored variant, creating the record on
    /// first write.
    pub async fn record(&self, cache_key: &str, version: u64) {
        match self.read_record(cache_key).await {
            Some(existing) if existing.version == version => {}
            existing => {
                let now = now_epoch_secs();
                self.write_record(
                    cache_key,
                    VersionRecord {
                        version,
                        created_at: existing.map(|r| r.created_at).unwrap_or(now),
                        updated_at: now,
                    },
                )
                .await;
            }
        }
    }

    /// Explicit reset: the next read observes version 1 again.
    pub async fn reset(&self, cache_key: &str) -> Result<(), crate::error::Error> {
        self.store.delete(&Self::key(cache_key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn service() -> VersionService {
        VersionService::new(Arc::new(MemoryKvStore::default()))
    }

    #[tokio::test]
    async fn absent_keys_read_as_one_without_writing() {
        let svc = service();
        assert_eq!(svc.read("k").await, None);
        assert_eq!(svc.next("k", false).await, 1);
        // still no record
        assert_eq!(svc.read("k").await, None);
    }

    #[tokio::test]
    async fn force_increment_is_monotonic_and_persistent() {
        let svc = service();

        let before = svc.next("k", false).await;
        let bumped = svc.next("k", true).await;
        assert!(bumped > before);
        assert_eq!(svc.read("k").await, Some(bumped));

        let again = svc.next("k", true).await;
        assert_eq!(again, bumped + 1);

        // non-forcing reads observe the stored value unchanged
        assert_eq!(svc.next("k", false).await, again);
    }

    #[tokio::test]
    async fn reset_returns_to_one() {
        let svc = service();
        svc.next("k", true).await;
        svc.reset("k").await.unwrap();
        assert_eq!(svc.next("k", false).await, 1);
    }

    #[tokio::test]
    async fn record_creates_and_updates() {
        let svc = service();
        svc.record("videos/clip.mp4?width=854", 3).await;
        assert_eq!(svc.read("videos/clip.mp4?width=854").await, Some(3));

        // idempotent when unchanged
        svc.record("videos/clip.mp4?width=854", 3).await;
        assert_eq!(svc.read("videos/clip.mp4?width=854").await, Some(3));
    }
}
