use crate::config::TransformEndpointConfig;
use crate::options::TransformOptions;

/// Where and how upstream transformation URLs are built.
#[derive(Debug, Clone)]
pub struct TransformEndpoint {
    pub scheme: String,
    pub host: String,
    pub base_path: String,
    pub timeout: std::time::Duration,
}

impl From<&TransformEndpointConfig> for TransformEndpoint {
    fn from(cfg: &TransformEndpointConfig) -> Self {
        Self {
            scheme: cfg.scheme.clone(),
            host: cfg.host.clone(),
            base_path: cfg.base_path.trim_end_matches('/').to_string(),
            timeout: std::time::Duration::from_secs(cfg.timeout_secs.max(1)),
        }
    }
}

impl TransformEndpoint {
    fn host_for(&self, request_host: &str) -> String {
        if self.host.is_empty() {
            request_host.to_string()
        } else {
            self.host.clone()
        }
    }
}

/// Build the upstream transformation URL:
/// `{scheme}://{host}{base}/{k=v,...}/{source-url}`.
///
/// Parameter serialization is stable: canonical order, `true`/`false` booleans,
/// decimal integers, absent fields omitted. A version greater than one appends
/// the reserved cache-busting query parameter to the final URL.
pub fn build_transform_url(
    endpoint: &TransformEndpoint,
    request_host: &str,
    opts: &TransformOptions,
    source_url: &str,
    version: Option<u64>,
) -> String {
    let params = opts
        .upstream_params()
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join(",");

    let mut url = format!(
        "{}://{}{}/{}/{}",
        endpoint.scheme,
        endpoint.host_for(request_host),
        endpoint.base_path,
        params,
        source_url
    );

    if let Some(version) = version.filter(|v| *v > 1) {
        let sep = if url.contains('?') { '&' } else { '?' };
        url.push(sep);
        url.push_str(&format!("v={}", version));
    }

    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DerivativeConfig;
    use crate::options::normalize;
    use std::collections::HashMap;

    fn endpoint() -> TransformEndpoint {
        TransformEndpoint::from(&TransformEndpointConfig {
            scheme: "https".into(),
            host: "".into(),
            base_path: "/cdn-cgi/media".into(),
            timeout_secs: 30,
        })
    }

    fn medium() -> HashMap<String, DerivativeConfig> {
        let mut map = HashMap::new();
        map.insert(
            "medium".to_string(),
            DerivativeConfig {
                width: 854,
                height: 480,
                ..Default::default()
            },
        );
        map
    }

    #[test]
    fn derivative_request_builds_the_expected_url() {
        let out = normalize(
            &[("derivative".to_string(), "medium".to_string())],
            &medium(),
        )
        .unwrap();

        let url = build_transform_url(
            &endpoint(),
            "cdn.example.com",
            &out.options,
            "https://src.example/clip.mp4",
            None,
        );
        assert_eq!(
            url,
            "https://cdn.example.com/cdn-cgi/media/width=854,height=480,mode=video/https://src.example/clip.mp4"
        );
    }

    #[test]
    fn derivative_matches_equivalent_explicit_request() {
        let via_derivative = normalize(
            &[("derivative".to_string(), "medium".to_string())],
            &medium(),
        )
        .unwrap();
        let explicit = normalize(
            &[
                ("width".to_string(), "854".to_string()),
                ("height".to_string(), "480".to_string()),
            ],
            &medium(),
        )
        .unwrap();

        let build = |opts| {
            build_transform_url(
                &endpoint(),
                "cdn.example.com",
                opts,
                "https://src.example/clip.mp4",
                None,
            )
        };
        assert_eq!(build(&via_derivative.options), build(&explicit.options));
    }

    #[test]
    fn version_appends_cache_buster() {
        let out = normalize(&[], &medium()).unwrap();
        let url = build_transform_url(
            &endpoint(),
            "cdn.example.com",
            &out.options,
            "https://src.example/clip.mp4",
            Some(3),
        );
        assert!(url.ends_with("/https://src.example/clip.mp4?v=3"));

        // version 1 is the unversioned steady state
        let url = build_transform_url(
            &endpoint(),
            "cdn.example.com",
            &out.options,
            "https://src.example/clip.mp4",
            Some(1),
        );
        assert!(!url.contains("v=1"));
    }

    #[test]
    fn configured_host_overrides_request_host() {
        let cfg = TransformEndpointConfig {
            scheme: "https".into(),
            host: "media.internal".into(),
            base_path: "/cdn-cgi/media".into(),
            timeout_secs: 30,
        };
        let ep = TransformEndpoint::from(&cfg);

        let out = normalize(&[], &medium()).unwrap();
        let url = build_transform_url(&ep, "cdn.example.com", &out.options, "https://s/e.mp4", None);
        assert!(url.starts_with("https://media.internal/cdn-cgi/media/"));
    }
}
