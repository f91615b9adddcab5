use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{AppConfig, CacheSettings, DerivativeConfig, KvBindings, SecurityMode};
use crate::error::{Error, ErrorKind};
use crate::kv::KvStore;
use crate::origin::Origin;
use crate::path::PathPattern;
use crate::transform::TransformEndpoint;

/// Key under which the configuration store holds the dynamic config document.
pub const CONFIG_KEY: &str = "worker-config";

/// How long a loaded configuration stays fresh before a KV re-read is allowed.
const CONFIG_CACHE_TTL: Duration = Duration::from_secs(300);

const DEFAULT_BYPASS_PARAMS: &[&str] = &["nocache", "bypass", "debug"];

/// Compiled configuration generation. Patterns and origins are compiled once
/// here and shared by reference for the lifetime of the generation.
pub struct RuntimeConfig {
    pub transform: TransformEndpoint,
    pub security: SecurityMode,
    pub cache: CacheSettings,
    pub kv: KvBindings,
    pub derivatives: HashMap<String, DerivativeConfig>,
    pub patterns: Vec<Arc<PathPattern>>,
    pub origins: Vec<Arc<Origin>>,
}

impl RuntimeConfig {
    pub fn compile(cfg: &AppConfig) -> Result<Self, Error> {
        let patterns = cfg
            .patterns
            .iter()
            .map(|p| PathPattern::compile(p).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let origins = cfg
            .origins
            .iter()
            .map(|o| Origin::compile(o).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let derivatives = if cfg.derivatives.is_empty() {
            builtin_derivatives()
        } else {
            cfg.derivatives.clone()
        };

        let mut cache = cfg.cache.clone();
        if cache.bypass_params.is_empty() {
            cache.bypass_params = DEFAULT_BYPASS_PARAMS
                .iter()
                .map(|s| s.to_string())
                .collect();
        }

        Ok(Self {
            transform: TransformEndpoint::from(&cfg.transform),
            security: cfg.security.clone(),
            cache,
            kv: cfg.kv.clone(),
            derivatives,
            patterns,
            origins,
        })
    }
}

/// The built-in derivative set, used when the configuration names none.
fn builtin_derivatives() -> HashMap<String, DerivativeConfig> {
    let mut map = HashMap::new();
    let mut insert = |name: &str, width: u32, height: u32, quality: Option<&str>| {
        map.insert(
            name.to_string(),
            DerivativeConfig {
                width,
                height,
                quality: quality.map(String::from),
                ..Default::default()
            },
        );
    };

    insert("thumbnail", 320, 180, Some("low"));
    insert("mobile", 480, 270, Some("low"));
    insert("low", 640, 360, None);
    insert("medium", 854, 480, None);
    insert("high", 1280, 720, None);
    insert("hd", 1920, 1080, Some("high"));

    map
}

/// Request extension carrying the configuration generation snapshotted at
/// request entry.
#[derive(Clone)]
pub struct ConfigSnapshot(pub Arc<RuntimeConfig>);

/// Single-writer configuration cell. Requests snapshot a generation at entry
/// and keep using it until completion; swaps are atomic at handle granularity.
pub struct ConfigHandle {
    current: ArcSwap<RuntimeConfig>,
    /// Guards KV refresh: holds the time of the last completed refresh.
    refresh: Mutex<Instant>,
}

impl ConfigHandle {
    pub fn new(initial: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            current: ArcSwap::from_pointee(initial),
            refresh: Mutex::new(Instant::now()),
        })
    }

    pub fn snapshot(&self) -> Arc<RuntimeConfig> {
        self.current.load_full()
    }

    pub fn store(&self, next: RuntimeConfig) {
        self.current.store(Arc::new(next));
    }

    /// Re-read the dynamic configuration document from the configuration
    /// namespace. A single flight at a time: contended callers return
    /// immediately and keep their current snapshot, as do callers inside the
    /// freshness window.
    pub async fn refresh_from(&self, store: &dyn KvStore) -> Result<bool, Error> {
        let Ok(mut last) = self.refresh.try_lock() else {
            return Ok(false);
        };
        if last.elapsed() < CONFIG_CACHE_TTL {
            return Ok(false);
        }

        let Some(entry) = store.get(CONFIG_KEY).await? else {
            debug!("no dynamic configuration at {}", CONFIG_KEY);
            *last = Instant::now();
            return Ok(false);
        };

        let parsed: AppConfig = serde_json::from_slice(&entry.value).map_err(|e| {
            Error::new(ErrorKind::InvalidConfig(format!(
                "dynamic configuration is not valid JSON: {}",
                e
            )))
        })?;

        let compiled = RuntimeConfig::compile(&parsed)?;
        self.current.store(Arc::new(compiled));
        *last = Instant::now();
        info!("configuration refreshed from {}", CONFIG_KEY);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathPatternConfig;

    #[test]
    fn compile_injects_builtin_defaults() {
        let runtime = RuntimeConfig::compile(&AppConfig::default()).unwrap();
        assert_eq!(runtime.derivatives.get("medium").unwrap().width, 854);
        assert_eq!(
            runtime.cache.bypass_params,
            vec!["nocache", "bypass", "debug"]
        );
    }

    #[test]
    fn compile_reports_bad_patterns_at_load_time() {
        let mut cfg = AppConfig::default();
        cfg.patterns.push(PathPatternConfig {
            name: "broken".into(),
            matcher: "[".into(),
            ..Default::default()
        });
        let err = RuntimeConfig::compile(&cfg).unwrap_err();
        assert_eq!(err.kind_tag(), "SchemaViolation");
    }

    #[test]
    fn snapshots_survive_a_swap() {
        let handle = ConfigHandle::new(RuntimeConfig::compile(&AppConfig::default()).unwrap());
        let before = handle.snapshot();

        let mut cfg = AppConfig::default();
        cfg.transform.host = "other.example".into();
        handle.store(RuntimeConfig::compile(&cfg).unwrap());

        // the old snapshot still reads the old generation
        assert_eq!(before.transform.host, "");
        assert_eq!(handle.snapshot().transform.host, "other.example");
    }
}
