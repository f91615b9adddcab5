use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::header::{
    ACCEPT_RANGES, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, ETAG, LAST_MODIFIED, RANGE,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use http_cache_semantics::CachePolicy;
use moka::future::Cache;
use moka::Expiry;
use tracing::debug;

use super::range::{parse_range, partial_response, unsatisfiable_response, RangeOutcome};
use crate::error::Error;
use crate::req::{Body, Request, Response};

/// Content-type families the edge cache will hold.
const CACHEABLE_TYPES: &[&str] = &["video/", "image/"];

pub(crate) const X_RANGE_HANDLED_BY: &str = "x-range-handled-by";
const X_CACHE_PREPARED: &str = "x-cache-prepared";

#[derive(Debug, Clone)]
struct CachedHttpResponse {
    status: StatusCode,
    headers: HeaderMap<HeaderValue>,
    body: Bytes,
    ttl: Duration,
}

impl CachedHttpResponse {
    fn to_response(&self) -> Response {
        let mut resp = Response::new(self.status);
        resp.headers = self.headers.clone();
        resp.body = Body::from(self.body.clone());
        resp
    }
}

struct PerItemExpiration;

impl Expiry<String, CachedHttpResponse> for PerItemExpiration {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedHttpResponse,
        _current_time: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Edge HTTP cache keyed by the original request URL, with 206 synthesis over
/// cached 200 bodies.
pub struct EdgeCache {
    cache: Cache<String, CachedHttpResponse>,
    bypass_params: Vec<String>,
}

impl EdgeCache {
    pub fn new(capacity: u64, bypass_params: Vec<String>) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .weigher(|_k: &String, v: &CachedHttpResponse| {
                (v.body.len() + 256).try_into().unwrap_or(u32::MAX)
            })
            .expire_after(PerItemExpiration)
            .build();

        Self {
            cache,
            bypass_params,
        }
    }

    fn key(uri: &Uri) -> String {
        uri.to_string()
    }

    /// Reads return nothing when the URL carries a bypass parameter or the
    /// request asks for revalidation.
    fn bypassed(&self, req: &Request) -> bool {
        let has_bypass_param = req
            .query_pairs()
            .iter()
            .any(|(name, _)| self.bypass_params.iter().any(|p| p == name));
        if has_bypass_param {
            return true;
        }

        req.header(CACHE_CONTROL)
            .map(|cc| cc.contains("no-cache") || cc.contains("no-store"))
            .unwrap_or(false)
    }

    pub async fn get(&self, req: &Request) -> Option<Response> {
        if self.bypassed(req) {
            return None;
        }

        let cached = self.cache.get(&Self::key(&req.uri))?;
        debug!(uri = %req.uri, "edge cache hit");

        // Conditional requests are answered before any range handling.
        let etag = cached
            .headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok());
        let last_modified = cached
            .headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok());
        if super::not_modified(&req.headers, etag, last_modified) {
            let mut resp = Response::new(StatusCode::NOT_MODIFIED);
            for name in [ETAG, LAST_MODIFIED, CACHE_CONTROL] {
                if let Some(v) = cached.headers.get(&name) {
                    resp.headers.insert(name, v.clone());
                }
            }
            return Some(resp);
        }

        let range_header = req.header(RANGE);
        if cached.status == StatusCode::OK && range_header.is_some() {
            let total = cached.body.len() as u64;
            return Some(match parse_range(range_header, total) {
                RangeOutcome::Full => cached.to_response(),
                RangeOutcome::Partial(start, end) => {
                    let mut resp = partial_response(
                        cached.to_response(),
                        cached.body.slice(start as usize..=end as usize),
                        start,
                        end,
                        total,
                    );
                    resp.set_header_name(X_RANGE_HANDLED_BY, "edge-cache");
                    resp
                }
                RangeOutcome::Unsatisfiable => unsatisfiable_response(total),
            });
        }

        Some(cached.to_response())
    }

    /// Whether the response may be stored, and for how long. Only 2xx GET
    /// responses with a cacheable content type qualify; `no-store` responses
    /// never enter the cache regardless of configured TTLs.
    pub fn storability(&self, req: &Request, resp: &Response) -> Option<Duration> {
        if req.method != Method::GET || !resp.status.is_success() {
            return None;
        }

        let cacheable_type = resp
            .content_type()
            .map(|ct| CACHEABLE_TYPES.iter().any(|family| ct.starts_with(family)))
            .unwrap_or(false);
        if !cacheable_type {
            return None;
        }

        if resp
            .header(CACHE_CONTROL)
            .map(|cc| cc.contains("no-store"))
            .unwrap_or(false)
        {
            return None;
        }

        let policy = CachePolicy::new(req, resp);
        if !policy.is_storable() {
            return None;
        }

        let ttl = policy.time_to_live(SystemTime::now());
        (ttl > Duration::ZERO).then_some(ttl)
    }

    /// Buffer the body and make the response servable from cache later:
    /// accurate `Content-Length`, synthesized validators, `Accept-Ranges`.
    pub async fn prepare(resp: &mut Response) -> Result<(), Error> {
        let body = resp.body.store_all().await?;
        let size = body.len() as u64;

        resp.set_header(CONTENT_LENGTH, size.to_string());
        resp.set_header(ACCEPT_RANGES, "bytes");

        if resp.header(ETAG).is_none() {
            let now_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            resp.set_header(ETAG, format!("\"{:x}-{}\"", size, base36(now_ms)));
        }
        if resp.header(LAST_MODIFIED).is_none() {
            resp.set_header(LAST_MODIFIED, httpdate::fmt_http_date(SystemTime::now()));
        }
        resp.set_header_name(X_CACHE_PREPARED, "true");

        Ok(())
    }

    /// Insert a prepared response, re-keyed to the original request URL. The
    /// body must already be buffered.
    pub async fn insert(&self, uri: &Uri, resp: &Response, ttl: Duration) {
        let Some(body) = resp.body.bytes() else {
            return;
        };

        // range answers must never shadow the full entry
        if resp.headers.contains_key(CONTENT_RANGE) {
            return;
        }

        let cached = CachedHttpResponse {
            status: resp.status,
            headers: resp.headers.clone(),
            body: body.clone(),
            ttl,
        };
        self.cache.insert(Self::key(uri), cached).await;
    }
}

impl http_cache_semantics::RequestLike for Request {
    fn uri(&self) -> Uri {
        self.uri.clone()
    }

    fn is_same_uri(&self, other: &Uri) -> bool {
        &self.uri == other
    }

    fn method(&self) -> &Method {
        &self.method
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

impl http_cache_semantics::ResponseLike for Response {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Lowercase base-36 rendering, used for synthesized ETags.
fn base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
