use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;

use crate::config::PathPatternConfig;
use crate::error::{Error, ErrorKind};
use crate::options;

/// A compiled request-path pattern. Immutable per configuration generation and
/// shared by reference across requests.
#[derive(Debug)]
pub struct PathPattern {
    pub name: String,
    pub matcher: Regex,
    pub origin_url: Option<String>,
    pub capture_groups: Vec<String>,
    pub cache_ttl: Option<u64>,
    pub quality: Option<String>,
    pub transformation_overrides: std::collections::HashMap<String, String>,
    pub auth: Option<crate::config::AuthConfig>,
}

impl PathPattern {
    /// Regex construction failure is a configuration error, reported at load
    /// time, never per request.
    pub fn compile(cfg: &PathPatternConfig) -> Result<Self, Error> {
        let matcher = Regex::new(&cfg.matcher).map_err(|e| {
            Error::new(ErrorKind::SchemaViolation(format!(
                "pattern {}: invalid matcher: {}",
                cfg.name, e
            )))
        })?;

        Ok(Self {
            name: cfg.name.clone(),
            matcher,
            origin_url: cfg.origin_url.clone(),
            capture_groups: cfg.capture_groups.clone(),
            cache_ttl: cfg.cache_ttl,
            quality: cfg.quality.clone(),
            transformation_overrides: cfg.transformation_overrides.clone(),
            auth: cfg.auth.clone(),
        })
    }
}

/// Result of matching a request path against the pattern list.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub pattern: Arc<PathPattern>,
    pub captures: BTreeMap<String, String>,
    /// Path to request from the origin, derived from the captures.
    pub origin_path: String,
}

/// First pattern whose matcher admits the path wins.
pub fn resolve(path: &str, patterns: &[Arc<PathPattern>]) -> Result<RouteMatch, Error> {
    for pattern in patterns {
        let Some(caps) = pattern.matcher.captures(path) else {
            continue;
        };

        let full = caps.get(0).map(|m| m.as_str()).unwrap_or(path);
        let mut captures = BTreeMap::new();

        if !pattern.capture_groups.is_empty() {
            for (i, name) in pattern.capture_groups.iter().enumerate() {
                if let Some(m) = caps.get(i + 1) {
                    captures.insert(name.clone(), m.as_str().to_string());
                }
            }
        } else if let Some(m) = caps.get(1) {
            if !m.as_str().is_empty() {
                captures.insert("1".to_string(), m.as_str().to_string());
            }
        }

        let origin_path = derive_origin_path(&captures, full);

        return Ok(RouteMatch {
            pattern: pattern.clone(),
            captures,
            origin_path,
        });
    }

    Err(Error::new(ErrorKind::NoMatchingPattern(path.to_string())))
}

/// Well-known capture names map to a fixed substitution schema; anything else
/// falls back to the full matched substring.
fn derive_origin_path(captures: &BTreeMap<String, String>, full_match: &str) -> String {
    if let Some(video_id) = captures.get("videoId") {
        return leading_slash(video_id);
    }

    if let (Some(category), Some(filename)) = (captures.get("category"), captures.get("filename")) {
        return format!("/{}/{}", category.trim_matches('/'), filename.trim_start_matches('/'));
    }

    if let Some(first) = captures.get("1") {
        return leading_slash(first);
    }

    leading_slash(full_match)
}

fn leading_slash(s: &str) -> String {
    if s.starts_with('/') {
        s.to_string()
    } else {
        format!("/{}", s)
    }
}

/// Query parameters that belong to the transform language are stripped from
/// the forwarded URL; everything else passes through untouched.
pub fn forwarded_query(pairs: &[(String, String)]) -> Option<String> {
    let kept: Vec<(&String, &String)> = pairs
        .iter()
        .filter(|(k, _)| !options::is_transform_param(k))
        .map(|(k, v)| (k, v))
        .collect();

    if kept.is_empty() {
        return None;
    }

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in kept {
        serializer.append_pair(k, v);
    }
    Some(serializer.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(name: &str, matcher: &str, groups: &[&str]) -> Arc<PathPattern> {
        Arc::new(
            PathPattern::compile(&PathPatternConfig {
                name: name.into(),
                matcher: matcher.into(),
                capture_groups: groups.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    #[test]
    fn first_matching_pattern_wins() {
        let patterns = vec![
            pattern("videos", r"^/videos/(.+)$", &["videoId"]),
            pattern("catch-all", r".*", &[]),
        ];

        let m = resolve("/videos/clip.mp4", &patterns).unwrap();
        assert_eq!(m.pattern.name, "videos");
        assert_eq!(m.captures.get("videoId").unwrap(), "clip.mp4");
        assert_eq!(m.origin_path, "/clip.mp4");
    }

    #[test]
    fn positional_capture_reported_as_one() {
        let patterns = vec![pattern("assets", r"^/assets/(.+)$", &[])];

        let m = resolve("/assets/promo/intro.webm", &patterns).unwrap();
        assert_eq!(m.captures.get("1").unwrap(), "promo/intro.webm");
        assert_eq!(m.origin_path, "/promo/intro.webm");
    }

    #[test]
    fn no_captures_uses_full_match() {
        let patterns = vec![pattern("flat", r"^/media/popular\.mp4$", &[])];

        let m = resolve("/media/popular.mp4", &patterns).unwrap();
        assert!(m.captures.is_empty());
        assert_eq!(m.origin_path, "/media/popular.mp4");
    }

    #[test]
    fn category_and_filename_substitution() {
        let patterns = vec![pattern(
            "categorized",
            r"^/c/([^/]+)/(.+)$",
            &["category", "filename"],
        )];

        let m = resolve("/c/trailers/2024/teaser.mp4", &patterns).unwrap();
        assert_eq!(m.origin_path, "/trailers/2024/teaser.mp4");
    }

    #[test]
    fn unmatched_path_is_fatal() {
        let patterns = vec![pattern("videos", r"^/videos/(.+)$", &["videoId"])];
        let err = resolve("/images/logo.png", &patterns).unwrap_err();
        assert_eq!(err.kind_tag(), "NoMatchingPattern");
        assert!(err.is_request_error());
    }

    #[test]
    fn invalid_matcher_is_a_schema_violation() {
        let err = PathPattern::compile(&PathPatternConfig {
            name: "broken".into(),
            matcher: "(unclosed".into(),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(err.kind_tag(), "SchemaViolation");
    }

    #[test]
    fn transform_params_are_stripped_from_forwarded_query() {
        let pairs = vec![
            ("derivative".to_string(), "medium".to_string()),
            ("width".to_string(), "640".to_string()),
            ("token".to_string(), "abc123".to_string()),
        ];
        assert_eq!(forwarded_query(&pairs).as_deref(), Some("token=abc123"));

        let only_transform = vec![("width".to_string(), "640".to_string())];
        assert_eq!(forwarded_query(&only_transform), None);
    }
}
