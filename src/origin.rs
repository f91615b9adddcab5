use std::sync::Arc;

use regex::Regex;

use crate::config::{AuthConfig, CacheTtlPolicyConfig, OriginConfig, SourceConfig, SourceType};
use crate::error::{Error, ErrorKind};

/// A compiled origin: a path matcher plus its ordered content sources.
#[derive(Debug)]
pub struct Origin {
    pub name: String,
    pub matcher: Regex,
    pub sources: Vec<Source>,
    pub ttl: Option<CacheTtlPolicyConfig>,
    pub use_ttl_by_status: bool,
}

#[derive(Debug, Clone)]
pub struct Source {
    pub source_type: SourceType,
    pub priority: i32,
    pub bucket_binding: Option<String>,
    pub url: Option<String>,
    pub auth: Option<AuthConfig>,
    pub path_transforms: Vec<crate::config::PathTransformConfig>,
}

impl Origin {
    pub fn compile(cfg: &OriginConfig) -> Result<Self, Error> {
        let matcher = Regex::new(&cfg.matcher).map_err(|e| {
            Error::new(ErrorKind::SchemaViolation(format!(
                "origin {}: invalid matcher: {}",
                cfg.name, e
            )))
        })?;

        // Iteration order is ascending priority; ties keep config order.
        let mut indexed: Vec<(usize, &SourceConfig)> = cfg.sources.iter().enumerate().collect();
        indexed.sort_by_key(|(index, source)| (source.priority, *index));

        let sources = indexed
            .into_iter()
            .map(|(_, source)| {
                match source.source_type {
                    SourceType::ObjectStore if source.bucket_binding.is_none() => {
                        return Err(Error::new(ErrorKind::InvalidConfig(format!(
                            "origin {}: objectStore source has no bucketBinding",
                            cfg.name
                        ))))
                    }
                    SourceType::Remote | SourceType::Fallback if source.url.is_none() => {
                        return Err(Error::new(ErrorKind::InvalidConfig(format!(
                            "origin {}: {} source has no url",
                            cfg.name, source.source_type
                        ))))
                    }
                    _ => {}
                }

                Ok(Source {
                    source_type: source.source_type,
                    priority: source.priority,
                    bucket_binding: source.bucket_binding.clone(),
                    url: source.url.clone(),
                    auth: source.auth.clone(),
                    path_transforms: source.path_transforms.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: cfg.name.clone(),
            matcher,
            sources,
            ttl: cfg.ttl.clone(),
            use_ttl_by_status: cfg.use_ttl_by_status,
        })
    }
}

/// First origin whose matcher admits the path.
pub fn resolve_origin(path: &str, origins: &[Arc<Origin>]) -> Option<Arc<Origin>> {
    origins
        .iter()
        .find(|origin| origin.matcher.is_match(path))
        .cloned()
}

impl Source {
    /// Apply the per-source path transform. At most one entry fires: the first
    /// whose `segment` equals the leading path segment.
    pub fn resolve_path(&self, origin_path: &str) -> String {
        let trimmed = origin_path.trim_start_matches('/');
        let Some(first_segment) = trimmed.split('/').next().filter(|s| !s.is_empty()) else {
            return origin_path.to_string();
        };

        for transform in &self.path_transforms {
            if transform.segment != first_segment {
                continue;
            }

            let rest = if transform.remove_prefix {
                trimmed
                    .strip_prefix(first_segment)
                    .unwrap_or("")
                    .trim_start_matches('/')
            } else {
                trimmed
            };

            let prefix = transform.prefix.trim_matches('/');
            let joined = match (prefix.is_empty(), rest.is_empty()) {
                (true, true) => String::new(),
                (true, false) => rest.to_string(),
                (false, true) => prefix.to_string(),
                (false, false) => format!("{}/{}", prefix, rest),
            };
            return format!("/{}", joined);
        }

        origin_path.to_string()
    }

    /// Full URL for remote and fallback sources; object-store sources address
    /// their bucket by binding instead.
    pub fn source_url(&self, resolved_path: &str) -> Option<String> {
        let base = self.url.as_deref()?;
        Some(join_url(base, resolved_path))
    }
}

/// Join a base URL and a path, normalizing duplicate slashes at the seam.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
