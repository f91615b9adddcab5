use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use moka::future::Cache;
use moka::Expiry;

use crate::error::{Error, ErrorKind};

pub mod variant;
pub mod version;

pub use variant::{VariantRead, VariantStore};
pub use version::VersionService;

/// Restrict a key component to a fixed character class so derived KV keys are
/// stable and printable: alphanumerics and `-_.:/` survive, anything else
/// becomes `-`.
pub fn sanitize_key_component(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// A value plus its metadata sidecar, as returned by a namespace read.
#[derive(Debug, Clone)]
pub struct KvEntry {
    pub value: Bytes,
    pub metadata: Option<serde_json::Value>,
}

/// Port over a key-value namespace. Reads return `Ok(None)` for missing keys;
/// only infrastructure failures surface as errors.
#[async_trait::async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, Error>;

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        metadata: Option<serde_json::Value>,
        ttl: Option<Duration>,
    ) -> Result<(), Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Bytes,
    metadata: Option<serde_json::Value>,
    ttl: Option<Duration>,
}

impl StoredEntry {
    fn size(&self) -> usize {
        self.value.len() + 64
    }
}

/// Per-item expiration driven by the TTL recorded on each entry.
struct PerItemExpiration;

impl Expiry<String, StoredEntry> for PerItemExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredEntry,
        _current_time: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredEntry,
        _current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process KV namespace backed by a weighted moka cache. Serves as the
/// default store and as the test double for every namespace.
#[derive(Debug)]
pub struct MemoryKvStore {
    entries: Cache<String, StoredEntry>,
}

impl MemoryKvStore {
    pub fn new(capacity: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity)
            .weigher(|_k: &String, v: &StoredEntry| v.size().try_into().unwrap_or(u32::MAX))
            .expire_after(PerItemExpiration)
            .build();

        Self { entries }
    }

    pub fn shared(capacity: u64) -> Arc<dyn KvStore> {
        Arc::new(Self::new(capacity))
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new(1 << 30)
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, Error> {
        Ok(self.entries.get(key).map(|e| KvEntry {
            value: e.value,
            metadata: e.metadata,
        }))
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        metadata: Option<serde_json::Value>,
        ttl: Option<Duration>,
    ) -> Result<(), Error> {
        self.entries
            .insert(
                key.to_string(),
                StoredEntry {
                    value,
                    metadata,
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.entries.invalidate(key).await;
        Ok(())
    }
}

/// Binding name → namespace resolution. A configured binding with no
/// registered store is a load-time configuration error.
#[derive(Default, Clone)]
pub struct KvRegistry {
    stores: HashMap<String, Arc<dyn KvStore>>,
}

impl KvRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, binding: impl Into<String>, store: Arc<dyn KvStore>) -> Self {
        self.stores.insert(binding.into(), store);
        self
    }

    pub fn resolve(&self, binding: &str) -> Result<Arc<dyn KvStore>, Error> {
        self.stores
            .get(binding)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::MissingBinding(binding.to_string())))
    }
}
