use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind};
use crate::kv::{sanitize_key_component, KvStore};

/// Entry format version, bumped when the stored shape changes.
const ENTRY_VERSION: u32 = 1;

/// Stored TTL is `floor(0.9 × presign validity)` so cached URLs always expire
/// before the signature does.
const TTL_SAFETY_FRACTION: f64 = 0.9;

const BACKOFF_MS: [u64; 3] = [200, 400, 800];
const BACKOFF_CAP_MS: u64 = 2_000;

/// A cached presigned origin URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedEntry {
    pub full_url: String,
    /// Query-string portion carrying the authorization.
    pub auth_token_only: String,
    pub original_url: String,
    pub created_at: u64,
    pub expires_at: u64,
    pub path: String,
    pub storage_type: String,
    pub auth_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub version: u32,
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl PresignedEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        original_url: impl Into<String>,
        full_url: impl Into<String>,
        path: impl Into<String>,
        storage_type: impl Into<String>,
        auth_type: impl Into<String>,
        region: Option<String>,
        service: Option<String>,
        expires_in_secs: u64,
    ) -> Self {
        let full_url = full_url.into();
        let auth_token_only = full_url
            .split_once('?')
            .map(|(_, q)| q.to_string())
            .unwrap_or_default();
        let created_at = now_epoch_secs();

        Self {
            full_url,
            auth_token_only,
            original_url: original_url.into(),
            created_at,
            expires_at: created_at + expires_in_secs,
            path: path.into(),
            storage_type: storage_type.into(),
            auth_type: auth_type.into(),
            region,
            service,
            version: ENTRY_VERSION,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= now_epoch_secs()
    }

    pub fn expires_in(&self) -> Duration {
        Duration::from_secs(self.expires_at.saturating_sub(now_epoch_secs()))
    }
}

/// TTL-bounded cache of presigned origin URLs, keyed by
/// `presigned:{storageType}:{path}:auth={type}[:region=R][:service=S]`.
#[derive(Clone)]
pub struct PresignedUrlCache {
    store: Arc<dyn KvStore>,
}

fn is_rate_limit_signal(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["429", "409", "rate limit", "conflict"]
        .iter()
        .any(|needle| lower.contains(needle))
}

impl PresignedUrlCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn cache_key(
        storage_type: &str,
        path: &str,
        auth_type: &str,
        region: Option<&str>,
        service: Option<&str>,
    ) -> String {
        let normalized_path =
            sanitize_key_component(path.trim_start_matches('/')).replace('/', "-");
        let mut key = format!(
            "presigned:{}:{}:auth={}",
            storage_type, normalized_path, auth_type
        );
        if let Some(region) = region {
            key.push_str(&format!(":region={}", region));
        }
        if let Some(service) = service {
            key.push_str(&format!(":service={}", service));
        }
        key
    }

    /// Read an entry. Expired, unreadable, or failed reads are all absent;
    /// this never errors.
    pub async fn get(&self, key: &str) -> Option<PresignedEntry> {
        let entry = match self.store.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "presigned cache read failed");
                return None;
            }
        };

        let parsed: PresignedEntry = serde_json::from_slice(&entry.value).ok()?;
        if parsed.is_expired() {
            debug!(key, "presigned entry expired");
            return None;
        }
        Some(parsed)
    }

    /// Store an entry with TTL shorter than the presign validity. Rate-limit
    /// signals retry with exponential backoff; exhaustion surfaces as
    /// `KVWriteFailure`.
    pub async fn put(&self, key: &str, entry: &PresignedEntry) -> Result<(), Error> {
        let validity = entry.expires_at.saturating_sub(entry.created_at);
        let ttl = Duration::from_secs((validity as f64 * TTL_SAFETY_FRACTION).floor() as u64);
        let value = Bytes::from(
            serde_json::to_vec(entry)
                .map_err(|e| Error::unknown(format!("presigned entry: {}", e)))?,
        );

        let mut last_error = None;
        for (attempt, backoff) in BACKOFF_MS.iter().enumerate() {
            match self
                .store
                .put(key, value.clone(), None, Some(ttl))
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if is_rate_limit_signal(&e.to_string()) => {
                    debug!(key, attempt, error = %e, "presigned write rate-limited, backing off");
                    tokio::time::sleep(Duration::from_millis((*backoff).min(BACKOFF_CAP_MS))).await;
                    last_error = Some(e);
                }
                Err(e) => {
                    return Err(Error::new(ErrorKind::KvWriteFailure(e.to_string())))
                }
            }
        }

        Err(Error::new(ErrorKind::KvWriteFailure(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "retries exhausted".to_string()),
        )))
    }

    /// Background refresh-before-expiry: when the entry is inside the
    /// threshold window, regenerate and store a replacement without blocking
    /// the caller. The still-valid entry is returned either way.
    pub fn refresh_if_expiring<F>(
        &self,
        key: &str,
        entry: PresignedEntry,
        threshold_secs: u64,
        generate: F,
    ) -> PresignedEntry
    where
        F: FnOnce() -> BoxFuture<'static, Result<PresignedEntry, Error>> + Send + 'static,
    {
        if entry.expires_in() > Duration::from_secs(threshold_secs) {
            return entry;
        }

        let cache = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            match generate().await {
                Ok(fresh) => {
                    if let Err(e) = cache.put(&key, &fresh).await {
                        warn!(key = %key, error = %e, "presigned refresh write failed");
                    } else {
                        debug!(key = %key, "presigned entry refreshed before expiry");
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "presigned regeneration failed"),
            }
        });

        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn entry(expires_in: u64) -> PresignedEntry {
        PresignedEntry::new(
            "https://bucket.s3.example.com/clip.mp4",
            "https://bucket.s3.example.com/clip.mp4?X-Amz-Signature=abc",
            "/clip.mp4",
            "remote",
            "aws-s3-presigned-url",
            Some("us-east-1".into()),
            Some("s3".into()),
            expires_in,
        )
    }

    #[test]
    fn key_grammar_is_sanitized() {
        let key = PresignedUrlCache::cache_key(
            "remote",
            "/videos/clip one.mp4",
            "aws-s3-presigned-url",
            Some("us-east-1"),
            Some("s3"),
        );
        assert_eq!(
            key,
            "presigned:remote:videos-clip-one.mp4:auth=aws-s3-presigned-url:region=us-east-1:service=s3"
        );
    }

    #[test]
    fn auth_token_is_the_query_portion() {
        let e = entry(3600);
        assert_eq!(e.auth_token_only, "X-Amz-Signature=abc");
        assert!(!e.is_expired());
    }

    #[tokio::test]
    async fn round_trip_and_expiry() {
        let cache = PresignedUrlCache::new(Arc::new(MemoryKvStore::default()));
        let key = PresignedUrlCache::cache_key("remote", "/clip.mp4", "aws-s3-presigned-url", None, None);

        let fresh = entry(3600);
        cache.put(&key, &fresh).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap().full_url, fresh.full_url);

        // an entry that is already past expiry is never surfaced
        let mut stale = entry(3600);
        stale.expires_at = now_epoch_secs() - 1;
        cache.put(&key, &stale).await.unwrap();
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn fresh_entries_are_not_refreshed() {
        let cache = PresignedUrlCache::new(Arc::new(MemoryKvStore::default()));
        let e = entry(3600);

        let returned = cache.refresh_if_expiring("k", e.clone(), 60, || {
            Box::pin(async { panic!("must not regenerate a fresh entry") })
        });
        assert_eq!(returned.full_url, e.full_url);
    }

    #[tokio::test]
    async fn near_expiry_triggers_background_refresh() {
        let cache = PresignedUrlCache::new(Arc::new(MemoryKvStore::default()));
        let key =
            PresignedUrlCache::cache_key("remote", "/clip.mp4", "aws-s3-presigned-url", None, None);
        let near = entry(30);

        let returned = cache.refresh_if_expiring(&key, near.clone(), 60, || {
            Box::pin(async { Ok(entry(3600)) })
        });
        // caller keeps the still-valid entry
        assert_eq!(returned.full_url, near.full_url);

        // the replacement lands in the store shortly after
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stored = cache.get(&key).await.unwrap();
        assert!(stored.expires_at >= near.expires_at);
    }

    #[test]
    fn rate_limit_signals() {
        assert!(is_rate_limit_signal("upstream said 429 Too Many Requests"));
        assert!(is_rate_limit_signal("write Conflict detected"));
        assert!(is_rate_limit_signal("hit the rate limit"));
        assert!(!is_rate_limit_signal("disk full"));
    }
}
