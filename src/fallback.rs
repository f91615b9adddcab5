use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use http::header::CACHE_CONTROL;
use http::{Method, StatusCode};
use regex::Regex;
use tracing::{debug, info, warn};
use url::Url;

use crate::client::storage::{
    authorize_fetch, fetch_following_redirects, fetch_from_storage, fetch_url,
};
use crate::config::{RuntimeConfig, SourceType};
use crate::error::Error;
use crate::options::{self, TransformOptions};
use crate::origin::join_url;
use crate::path::RouteMatch;
use crate::req::{Diagnostics, Request, Response};
use crate::services::Services;

/// Reserved cache key suffix under which fallback content is parked for later
/// retries.
const FALLBACK_CACHE_SUFFIX: &str = "__fb=1";

const FALLBACK_CACHE_TTL: Duration = Duration::from_secs(3_600);

/// Stepwise duration ladder used when the upstream error names no bound.
const DURATION_STEPS_MS: &[u64] = &[60_000, 45_000, 30_000, 15_000, 10_000, 5_000];

/// Parsed shape of a non-2xx upstream transformation response.
#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub status: StatusCode,
    pub message: String,
    pub error_type: Option<String>,
    pub invalid_parameter: Option<String>,
    pub duration_limit: bool,
    pub file_size_limit: bool,
    /// Bound extracted from `between … and VALUE UNIT`, in milliseconds plus
    /// its display form.
    pub duration_bound: Option<(u64, String)>,
}

impl UpstreamError {
    /// Read the error body and classify it.
    pub async fn from_response(resp: &mut Response) -> Self {
        let body = resp.body.store_all().await.unwrap_or_default();
        let text = String::from_utf8_lossy(&body).to_string();

        let mut error_type = None;
        let mut invalid_parameter = None;
        let mut message = text.trim().to_string();

        if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&body) {
            for field in ["error", "message"] {
                if let Some(m) = json.get(field).and_then(|v| v.as_str()) {
                    message = m.to_string();
                    break;
                }
            }
            error_type = json
                .get("errorType")
                .or_else(|| json.get("code"))
                .and_then(|v| v.as_str())
                .map(String::from);
            invalid_parameter = json
                .get("invalidParameter")
                .or_else(|| json.get("parameter"))
                .and_then(|v| v.as_str())
                .map(String::from);
        }

        let lower = message.to_lowercase();
        let duration_limit = lower.contains("duration") && lower.contains("between");
        let file_size_limit = lower.contains("file size")
            || lower.contains("too large")
            || (lower.contains("exceeds") && lower.contains("size"));

        Self {
            status: resp.status,
            duration_bound: duration_limit.then(|| extract_duration_bound(&message)).flatten(),
            message,
            error_type,
            invalid_parameter,
            duration_limit,
            file_size_limit,
        }
    }

    /// Synthesize from a transport-level failure (timeout, connect error).
    pub fn from_error(err: &Error) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: err.to_string(),
            error_type: Some(err.kind_tag().to_string()),
            invalid_parameter: None,
            duration_limit: false,
            file_size_limit: false,
            duration_bound: None,
        }
    }

    /// Structured classification driving the fallback decisions and logs.
    pub fn classify(&self) -> Error {
        let kind = if self.duration_limit {
            crate::error::ErrorKind::DurationLimit
        } else if self.file_size_limit {
            crate::error::ErrorKind::FileSizeLimit
        } else if self.status.is_client_error() {
            crate::error::ErrorKind::UpstreamClientError(self.status)
        } else {
            crate::error::ErrorKind::UpstreamServerError(self.status)
        };
        Error::new(kind).with_context("message", self.message.as_str())
    }
}

/// Extract the upper bound from an error like
/// `duration must be between 100ms and 30s`.
fn extract_duration_bound(message: &str) -> Option<(u64, String)> {
    let re = Regex::new(r"(?i)between\s+\S+\s+and\s+(\d+(?:\.\d+)?)\s*(ms|s|m)\b").ok()?;
    let caps = re.captures(message)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_lowercase();

    let floored = value.floor() as u64;
    let display = format!("{}{}", floored, unit);
    let ms = options::time_value_ms(&display)?;
    Some((ms, display))
}

/// Largest ladder step strictly below the current duration.
fn stepwise_reduction(current_ms: u64) -> Option<(u64, String)> {
    DURATION_STEPS_MS
        .iter()
        .find(|step| **step < current_ms)
        .map(|ms| (*ms, options::format_duration_ms(*ms)))
}

/// Retry hook: re-issue the transformation once with adjusted options.
pub type RetryTransform =
    Box<dyn FnOnce(TransformOptions) -> BoxFuture<'static, Result<Response, Error>> + Send>;

/// Fallback chain for failed transformations: duration-limit retry, then
/// pattern-origin fetch, then direct origin, then the storage services. The
/// first 2xx wins; every step leaves diagnostic headers on the response.
pub struct FallbackEngine {
    services: Arc<Services>,
}

impl FallbackEngine {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        req: &mut Request,
        config: &Arc<RuntimeConfig>,
        route: &RouteMatch,
        opts: &TransformOptions,
        upstream: UpstreamError,
        retry: Option<RetryTransform>,
    ) -> Response {
        Diagnostics::of(req).fallback_reason = Some(upstream.message.clone());

        let mut retry = retry;

        // Step A: duration-limit retry, or one plain retry for transient
        // server errors.
        if upstream.duration_limit {
            if let (Some(original), Some(retry_fn)) = (opts.duration.clone(), retry.take()) {
                if let Some(resp) = self
                    .duration_retry(&upstream, opts, &original, retry_fn)
                    .await
                {
                    return self.annotate(resp, req, &upstream);
                }
            }
        } else if upstream.status.is_server_error() {
            if let Some(retry_fn) = retry.take() {
                match retry_fn(opts.clone()).await {
                    Ok(resp) if resp.is_success() => {
                        debug!("transient upstream error recovered on retry");
                        let mut resp = resp;
                        resp.set_header_name("x-retry-count", "1");
                        return resp;
                    }
                    Ok(resp) => {
                        debug!(status = %resp.status, "retry still failing");
                    }
                    Err(e) => {
                        debug!(error = %e, "retry errored");
                    }
                }
            }
        }

        // Step B: pattern-matched origin with declared auth.
        let pattern_attempted =
            route.pattern.auth.is_some() && route.pattern.origin_url.is_some();
        if pattern_attempted {
            if let Some(resp) = self.pattern_origin_fetch(req, config, route).await {
                return self.annotate(resp, req, &upstream);
            }
        }

        // Step C: direct origin, only when B was not attempted.
        if !pattern_attempted {
            if let Some(resp) = self.direct_origin_fetch(req, config, route).await {
                return self.annotate(resp, req, &upstream);
            }
        }

        // Step D: storage services in configured priority order.
        if let Some(fetched) = fetch_from_storage(
            &self.services,
            &config.origins,
            &config.security,
            &route.origin_path,
            config.transform.timeout,
        )
        .await
        {
            let mut resp = fetched.response;
            resp.set_header_name("x-storage-source", &fetched.source);
            return self.annotate(resp, req, &upstream);
        }

        // Chain exhausted.
        let mut resp = Response::text(
            StatusCode::INTERNAL_SERVER_ERROR,
            "transformation failed and no fallback source succeeded\n",
        );
        resp.set_header(CACHE_CONTROL, "no-store");
        resp.set_header_name("x-original-error-status", upstream.status.as_str());
        resp
    }

    /// Step A body: adjust `duration` and re-issue exactly once.
    async fn duration_retry(
        &self,
        upstream: &UpstreamError,
        opts: &TransformOptions,
        original_duration: &str,
        retry: RetryTransform,
    ) -> Option<Response> {
        let current_ms = options::time_value_ms(original_duration)?;

        let (bound_ms, adjusted) = match &upstream.duration_bound {
            Some((ms, display)) => (*ms, display.clone()),
            None => stepwise_reduction(current_ms)?,
        };

        // Remember the limit so future requests pre-clamp before their first
        // upstream attempt.
        self.services.limits.record_duration_ms(bound_ms);

        let mut adjusted_opts = opts.clone();
        adjusted_opts.duration = Some(adjusted.clone());

        info!(
            original = original_duration,
            adjusted = %adjusted,
            "retrying transformation with reduced duration"
        );

        match retry(adjusted_opts).await {
            Ok(resp) if resp.is_success() => {
                let mut resp = resp;
                resp.set_header_name("x-duration-adjusted", "true");
                resp.set_header_name("x-original-duration", original_duration);
                resp.set_header_name("x-adjusted-duration", &adjusted);
                resp.set_header_name("x-duration-limit-applied", "true");
                resp.set_header_name("x-retry-count", "1");
                Some(resp)
            }
            Ok(resp) => {
                debug!(status = %resp.status, "duration retry still failing");
                None
            }
            Err(e) => {
                debug!(error = %e, "duration retry errored");
                None
            }
        }
    }

    /// Step B body: authenticated fetch against the pattern's origin.
    async fn pattern_origin_fetch(
        &self,
        req: &mut Request,
        config: &Arc<RuntimeConfig>,
        route: &RouteMatch,
    ) -> Option<Response> {
        let pattern = &route.pattern;
        let auth = pattern.auth.as_ref()?;
        let base = pattern.origin_url.as_deref()?;
        let object_url = join_url(base, req.path());

        let (final_url, headers) = match authorize_fetch(
            &self.services,
            &config.security,
            auth,
            &object_url,
            req.path(),
            "pattern",
        )
        .await
        {
            Ok(authorized) => authorized,
            Err(e) => {
                warn!(pattern = %pattern.name, error = %e, "pattern origin auth failed");
                return None;
            }
        };

        let resp = match fetch_url(
            &self.services.http,
            &Method::GET,
            &final_url,
            &headers,
            config.transform.timeout,
        )
        .await
        {
            Ok(resp) if resp.is_success() => resp,
            Ok(resp) => {
                debug!(status = %resp.status, "pattern origin answered non-2xx");
                return None;
            }
            Err(e) => {
                debug!(error = %e, "pattern origin fetch failed");
                return None;
            }
        };

        let mut resp = repair_content_type(resp, req.path());
        resp.set_header_name("x-pattern-fallback-applied", "true");
        resp.set_header_name("x-pattern-name", &pattern.name);
        resp.set_header_name("x-pattern-auth-type", auth.type_name());
        if let Some(domain) = Url::parse(base).ok().and_then(|u| u.host_str().map(String::from)) {
            resp.set_header_name("x-pattern-origin-domain", &domain);
        }

        Some(resp)
    }

    /// Step C body: plain fetch of the origin's fallback URL, following
    /// redirects, with the original request's method and headers.
    async fn direct_origin_fetch(
        &self,
        req: &Request,
        config: &Arc<RuntimeConfig>,
        route: &RouteMatch,
    ) -> Option<Response> {
        let origin = crate::origin::resolve_origin(&route.origin_path, &config.origins)?;
        let source = origin
            .sources
            .iter()
            .find(|s| s.source_type == SourceType::Fallback)?;
        let url = source.source_url(&source.resolve_path(&route.origin_path))?;

        let headers: Vec<(String, String)> = req
            .headers
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .filter(|(k, _)| k != "host")
            .collect();

        match fetch_following_redirects(
            &self.services.http,
            &req.method,
            &url,
            &headers,
            config.transform.timeout,
        )
        .await
        {
            Ok(resp) if resp.is_success() => {
                let mut resp = resp;
                resp.set_header_name("x-direct-source-used", "true");
                Some(resp)
            }
            Ok(resp) => {
                debug!(status = %resp.status, "direct origin answered non-2xx");
                None
            }
            Err(e) => {
                debug!(error = %e, "direct origin fetch failed");
                None
            }
        }
    }

    /// Shared response assembly for every fallback path.
    fn annotate(&self, mut resp: Response, req: &mut Request, upstream: &UpstreamError) -> Response {
        resp.set_header_name("x-fallback-applied", "true");
        resp.set_header_name("x-fallback-reason", truncate_bytes(&upstream.message, 100));
        resp.set_header_name("x-original-error-status", upstream.status.as_str());

        if let Some(error_type) = &upstream.error_type {
            resp.set_header_name("x-error-type", error_type);
            resp.set_header_name("x-original-error-type", error_type);
        }
        if let Some(param) = &upstream.invalid_parameter {
            resp.set_header_name("x-invalid-parameter", param);
        }
        if upstream.file_size_limit {
            resp.set_header_name("x-file-size-error", "true");
            resp.set_header_name("x-video-too-large", "true");
        }

        resp.set_header(CACHE_CONTROL, "no-store");
        resp.set_header_name(
            "cache-tag",
            format!("video-resizer,fallback:true,source:{}", req.path()),
        );

        self.park_fallback_content(req, &resp);

        Diagnostics::of(req).cache_status = Some("fallback".to_string());
        resp
    }

    /// Cache the fallback content under the reserved `__fb=1` key so later
    /// retries can serve it without re-fetching.
    fn park_fallback_content(&self, req: &Request, resp: &Response) {
        let Some(body) = resp.body.bytes() else {
            return;
        };
        if !resp.status.is_success() {
            return;
        }

        let orig = req.uri.to_string();
        let sep = if orig.contains('?') { '&' } else { '?' };
        let fb_uri: http::Uri = match format!("{}{}{}", orig, sep, FALLBACK_CACHE_SUFFIX).parse() {
            Ok(uri) => uri,
            Err(_) => return,
        };

        let mut parked = Response::new(resp.status);
        parked.headers = resp.headers.clone();
        parked.body = crate::req::Body::from(body.clone());
        // parked copies are retry fodder, not client responses
        parked.headers.remove(CACHE_CONTROL);

        let edge = self.services.edge_cache.clone();
        tokio::spawn(async move {
            edge.insert(&fb_uri, &parked, FALLBACK_CACHE_TTL).await;
        });
    }
}

/// Origins occasionally serve `application/octet-stream`; repair from the
/// file extension.
fn repair_content_type(mut resp: Response, path: &str) -> Response {
    let is_octet = resp
        .content_type()
        .map(|ct| ct.starts_with("application/octet-stream"))
        .unwrap_or(true);
    if !is_octet {
        return resp;
    }

    let content_type = match path.rsplit('.').next() {
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("ogg") | Some("ogv") => "video/ogg",
        Some("m4v") | Some("mp4") => "video/mp4",
        _ => "video/mp4",
    };
    resp.set_header(http::header::CONTENT_TYPE, content_type);
    resp
}

/// First `max` bytes of a string, on a char boundary, for header values.
fn truncate_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::req::Body;

    #[tokio::test]
    async fn duration_bound_extraction() {
        let mut resp = Response::new(StatusCode::BAD_REQUEST);
        resp.body = Body::from("duration must be between 100ms and 30s");
        let parsed = UpstreamError::from_response(&mut resp).await;

        assert!(parsed.duration_limit);
        assert_eq!(parsed.duration_bound, Some((30_000, "30s".to_string())));
    }

    #[tokio::test]
    async fn fractional_bounds_are_floored() {
        let mut resp = Response::new(StatusCode::BAD_REQUEST);
        resp.body = Body::from("duration must be between 1s and 46.5s");
        let parsed = UpstreamError::from_response(&mut resp).await;
        assert_eq!(parsed.duration_bound, Some((46_000, "46s".to_string())));
    }

    #[tokio::test]
    async fn json_error_fields_are_read() {
        let mut resp = Response::new(StatusCode::BAD_REQUEST);
        resp.body = Body::from(
            r#"{"error":"invalid value","errorType":"InvalidParameter","invalidParameter":"fit"}"#,
        );
        let parsed = UpstreamError::from_response(&mut resp).await;

        assert_eq!(parsed.message, "invalid value");
        assert_eq!(parsed.error_type.as_deref(), Some("InvalidParameter"));
        assert_eq!(parsed.invalid_parameter.as_deref(), Some("fit"));
    }

    #[tokio::test]
    async fn file_size_errors_are_flagged() {
        let mut resp = Response::new(StatusCode::BAD_REQUEST);
        resp.body = Body::from("input exceeds maximum file size limit");
        let parsed = UpstreamError::from_response(&mut resp).await;
        assert!(parsed.file_size_limit);
        assert!(!parsed.duration_limit);
    }

    #[test]
    fn stepwise_ladder_descends() {
        assert_eq!(stepwise_reduction(120_000), Some((60_000, "60s".into())));
        assert_eq!(stepwise_reduction(30_000), Some((15_000, "15s".into())));
        assert_eq!(stepwise_reduction(5_000), None);
    }

    #[test]
    fn content_type_repair_by_extension() {
        let mut resp = Response::new(StatusCode::OK);
        resp.set_header(http::header::CONTENT_TYPE, "application/octet-stream");
        let resp = repair_content_type(resp, "/videos/clip.webm");
        assert_eq!(resp.content_type(), Some("video/webm"));

        let mut resp = Response::new(StatusCode::OK);
        resp.set_header(http::header::CONTENT_TYPE, "video/mp4");
        let resp = repair_content_type(resp, "/videos/clip.webm");
        assert_eq!(resp.content_type(), Some("video/mp4"));
    }

    #[test]
    fn header_truncation_is_byte_bounded() {
        let long = "e".repeat(250);
        assert_eq!(truncate_bytes(&long, 100).len(), 100);
        assert_eq!(truncate_bytes("short", 100), "short");
    }
}
