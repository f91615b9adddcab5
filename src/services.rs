use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::{EdgeCache, PresignedUrlCache};
use crate::client::storage::BucketRegistry;
use crate::client::{build_http_client, HttpClient};
use crate::config::{AppConfig, ConfigHandle, RuntimeConfig};
use crate::error::Error;
use crate::kv::{KvRegistry, KvStore, MemoryKvStore, VariantStore, VersionService};

/// Process-wide memory of upstream transformation limits, learned from
/// duration-limit errors and consulted to pre-clamp future requests.
#[derive(Default)]
pub struct TransformLimits {
    max_duration_ms: AtomicU64,
}

impl TransformLimits {
    /// Learned upper bound on `duration`, if any.
    pub fn max_duration_ms(&self) -> Option<u64> {
        match self.max_duration_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Record a bound extracted from an upstream error. The tightest bound
    /// observed wins.
    pub fn record_duration_ms(&self, ms: u64) {
        if ms == 0 {
            return;
        }
        let mut current = self.max_duration_ms.load(Ordering::Relaxed);
        loop {
            if current != 0 && current <= ms {
                return;
            }
            match self.max_duration_ms.compare_exchange_weak(
                current,
                ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Explicit context passed through the request task: every cache, store, and
/// client the pipeline touches, behind one `Arc`.
pub struct Services {
    pub config: Arc<ConfigHandle>,
    pub edge_cache: Arc<EdgeCache>,
    pub variants: Arc<VariantStore>,
    pub versions: Arc<VersionService>,
    pub presigned: PresignedUrlCache,
    pub config_store: Arc<dyn KvStore>,
    pub buckets: BucketRegistry,
    pub http: HttpClient,
    pub limits: TransformLimits,
}

impl Services {
    /// Wire services from a compiled configuration and a KV registry. Each
    /// configured namespace binding must be registered.
    pub fn build(
        app: &AppConfig,
        runtime: RuntimeConfig,
        kv: &KvRegistry,
    ) -> Result<(Arc<Self>, Arc<ConfigHandle>), Error> {
        let variants_ns = kv.resolve(&runtime.kv.variants)?;
        let config_ns = kv.resolve(&runtime.kv.configuration)?;
        let versions_ns = kv.resolve(&runtime.kv.versions)?;

        let edge_cache = Arc::new(EdgeCache::new(
            runtime.cache.edge_capacity,
            runtime.cache.bypass_params.clone(),
        ));
        let variants = Arc::new(
            VariantStore::new(variants_ns.clone()).with_refresh_policy(
                runtime.cache.refresh_age_fraction,
                runtime.cache.refresh_ttl_multiplier,
            ),
        );
        let versions = Arc::new(VersionService::new(versions_ns));
        let presigned = PresignedUrlCache::new(variants_ns);
        let buckets = BucketRegistry::from_config(&app.buckets, &runtime.security)?;

        // every objectStore source must point at a registered bucket binding
        for origin in &runtime.origins {
            for source in &origin.sources {
                if let Some(binding) = source.bucket_binding.as_deref() {
                    if !buckets.contains(binding) {
                        return Err(Error::new(crate::error::ErrorKind::MissingBinding(
                            binding.to_string(),
                        )));
                    }
                }
            }
        }

        let config = ConfigHandle::new(runtime);

        let services = Arc::new(Self {
            config: config.clone(),
            edge_cache,
            variants,
            versions,
            presigned,
            config_store: config_ns,
            buckets,
            http: build_http_client(),
            limits: TransformLimits::default(),
        });

        Ok((services, config))
    }

    /// Default in-memory wiring: one memory namespace per configured binding.
    pub fn build_in_memory(app: &AppConfig) -> Result<(Arc<Self>, Arc<ConfigHandle>), Error> {
        let runtime = RuntimeConfig::compile(app)?;
        let kv = KvRegistry::new()
            .register(runtime.kv.variants.clone(), MemoryKvStore::shared(1 << 30))
            .register(
                runtime.kv.configuration.clone(),
                MemoryKvStore::shared(1 << 20),
            )
            .register(runtime.kv.versions.clone(), MemoryKvStore::shared(1 << 20));
        Self::build(app, runtime, &kv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_keep_the_tightest_bound() {
        let limits = TransformLimits::default();
        assert_eq!(limits.max_duration_ms(), None);

        limits.record_duration_ms(30_000);
        limits.record_duration_ms(45_000);
        assert_eq!(limits.max_duration_ms(), Some(30_000));

        limits.record_duration_ms(10_000);
        assert_eq!(limits.max_duration_ms(), Some(10_000));
    }

    #[test]
    fn in_memory_wiring_resolves_all_bindings() {
        let (services, _config) = Services::build_in_memory(&AppConfig::default()).unwrap();
        assert!(services.limits.max_duration_ms().is_none());
    }
}
