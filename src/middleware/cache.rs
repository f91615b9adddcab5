use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use http::header::{
    ACCEPT_RANGES, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED, RANGE,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use super::{Layer, NextLayer};
use crate::cache::edge::X_RANGE_HANDLED_BY;
use crate::cache::range::{
    parse_range, parse_range_raw, partial_response, unsatisfiable_response, RangeOutcome,
};
use crate::config::runtime::ConfigSnapshot;
use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::kv::variant::{StoredVariant, VariantMeta, VariantRead};
use crate::kv::version::CacheVersion;
use crate::options::{self, RequestOptions};
use crate::path::RouteMatch;
use crate::req::{Body, Diagnostics, Request, Response};
use crate::response;
use crate::services::Services;

/// Shareable response snapshot handed to coalesced followers.
type SharedParts = Arc<(StatusCode, HeaderMap<HeaderValue>, Bytes)>;
type InflightRx = watch::Receiver<Option<SharedParts>>;

/// Cache controller: variant store first, then the edge HTTP cache, then the
/// origin transformation, with per-key single-flight on the miss path and
/// background writes on success.
pub struct CacheLayer {
    services: Arc<Services>,
    inflight: Mutex<HashMap<String, InflightRx>>,
}

impl CacheLayer {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn bypassed(&self, req: &Request, config: &RuntimeConfig) -> bool {
        let has_bypass_param = req
            .query_pairs()
            .iter()
            .any(|(name, _)| config.cache.bypass_params.iter().any(|p| p == name));
        if has_bypass_param {
            return true;
        }
        req.header(CACHE_CONTROL)
            .map(|cc| cc.contains("no-cache") || cc.contains("no-store"))
            .unwrap_or(false)
    }

    /// `nocache`/`bypass` are explicit forced misses and bump the version;
    /// `debug` only skips reads.
    fn forces_version_bump(req: &Request) -> bool {
        req.query_pairs()
            .iter()
            .any(|(name, _)| name == "nocache" || name == "bypass")
    }
}

fn variant_response(variant: &StoredVariant) -> Response {
    let mut resp = Response::new(StatusCode::OK);
    resp.set_header(CONTENT_TYPE, &variant.meta.content_type);
    if let Some(etag) = &variant.meta.etag {
        resp.set_header(ETAG, etag);
    }
    if let Some(last_modified) = &variant.meta.last_modified {
        resp.set_header(LAST_MODIFIED, last_modified);
    }
    resp.set_header(ACCEPT_RANGES, "bytes");

    match variant.range {
        None => {
            resp.set_header(CONTENT_LENGTH, variant.body.len().to_string());
            resp.body = Body::from(variant.body.clone());
            resp
        }
        Some((start, end)) => {
            let mut resp = partial_response(
                resp,
                variant.body.clone(),
                start,
                end,
                variant.total_size,
            );
            resp.set_header_name(X_RANGE_HANDLED_BY, "variant-store");
            resp
        }
    }
}

/// Per-request response shaping shared by leaders and followers: range
/// synthesis over a full body, HEAD stripping, debug view.
fn shape_for_request(
    req: &mut Request,
    mut resp: Response,
    range_header: Option<&str>,
    debug_view: bool,
) -> Response {
    if resp.status == StatusCode::OK && range_header.is_some() {
        if let Some(body) = resp.body.bytes().cloned() {
            let total = body.len() as u64;
            resp = match parse_range(range_header, total) {
                RangeOutcome::Full => resp,
                RangeOutcome::Partial(start, end) => {
                    let mut partial = partial_response(
                        resp,
                        body.slice(start as usize..=end as usize),
                        start,
                        end,
                        total,
                    );
                    partial.set_header_name(X_RANGE_HANDLED_BY, "cache-controller");
                    partial
                }
                RangeOutcome::Unsatisfiable => unsatisfiable_response(total),
            };
        }
    }

    if debug_view {
        response::render_debug_page(req, &mut resp);
    }

    if req.method == Method::HEAD {
        resp.body = Body::empty();
    }

    resp
}

#[async_trait::async_trait]
impl Layer for CacheLayer {
    async fn call(&self, mut req: Request, next: &dyn NextLayer) -> Result<Response, Error> {
        if req.method != Method::GET && req.method != Method::HEAD {
            return next.call(req).await;
        }

        let config = req
            .extensions
            .get::<ConfigSnapshot>()
            .map(|c| c.0.clone())
            .unwrap_or_else(|| self.services.config.snapshot());
        let Some(route) = req.extensions.get::<RouteMatch>().cloned() else {
            return next.call(req).await;
        };
        let Some(request_options) = req.extensions.get::<RequestOptions>().cloned() else {
            return next.call(req).await;
        };

        let opts = request_options.options.clone();
        let imquery = request_options.imquery;
        let cache_key = format!("{}|{}", req.path(), opts.canonicalize());

        let version = self
            .services
            .versions
            .next(&cache_key, Self::forces_version_bump(&req))
            .await;
        req.extensions.insert(CacheVersion(version));

        let variant_key = options::variant_key(req.path(), &opts, version);
        let debug_view = response::wants_debug_view(&req);
        let bypassed = self.bypassed(&req, &config);
        let range_header = req.header(RANGE).map(String::from);

        {
            let diag = Diagnostics::of(&mut req);
            diag.pattern = Some(route.pattern.name.clone());
            diag.variant_key = Some(variant_key.clone());
            diag.version = Some(version);
        }

        if !bypassed {
            // Variant store first.
            let parsed_range = range_header.as_deref().map(parse_range_raw);
            let kv_range = match &parsed_range {
                Some(Some((start, end))) => Some((*start, end.unwrap_or(u64::MAX))),
                _ => None,
            };

            match self.services.variants.get(&variant_key, kv_range).await {
                VariantRead::Hit(variant) => {
                    debug!(key = %variant_key, "variant store hit");
                    Diagnostics::of(&mut req).cache_status = Some("variant-hit".into());

                    // a present-but-malformed Range header is unsatisfiable
                    if matches!(parsed_range, Some(None)) {
                        return Ok(unsatisfiable_response(variant.total_size));
                    }

                    if crate::cache::not_modified(
                        &req.headers,
                        variant.meta.etag.as_deref(),
                        variant.meta.last_modified.as_deref(),
                    ) {
                        let mut resp = Response::new(StatusCode::NOT_MODIFIED);
                        if let Some(etag) = &variant.meta.etag {
                            resp.set_header(ETAG, etag);
                        }
                        if let Some(lm) = &variant.meta.last_modified {
                            resp.set_header(LAST_MODIFIED, lm);
                        }
                        // 304 keeps the stored entity's Cache-Control
                        let ttl = route.pattern.cache_ttl.unwrap_or(config.cache.ttl.ok);
                        resp.set_header(CACHE_CONTROL, format!("public, max-age={}", ttl));
                        return Ok(resp);
                    }

                    let mut resp = variant_response(&variant);
                    response::finalize(&config, &route, &opts, imquery.as_ref(), req.path(), &mut resp);
                    return Ok(shape_for_request(&mut req, resp, None, debug_view));
                }
                VariantRead::Unsatisfiable(total) => {
                    return Ok(unsatisfiable_response(total));
                }
                VariantRead::CorruptMiss => {
                    warn!(key = %variant_key, "variant store corrupt entry, falling through");
                }
                VariantRead::Miss => {}
            }

            // Edge HTTP cache next, GET only.
            if req.method == Method::GET {
                if let Some(resp) = self.services.edge_cache.get(&req).await {
                    debug!(uri = %req.uri, "edge cache hit");
                    Diagnostics::of(&mut req).cache_status = Some("edge-hit".into());
                    let resp = shape_for_request(&mut req, resp, None, debug_view);
                    return Ok(resp);
                }
            }
        }

        // Origin path, coalesced per variant key within this instance.
        let mut leader_tx: Option<watch::Sender<Option<SharedParts>>> = None;
        let rx = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&variant_key) {
                Some(rx) => Some(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(variant_key.clone(), rx);
                    leader_tx = Some(tx);
                    None
                }
            }
        };

        if let Some(mut rx) = rx {
            debug!(key = %variant_key, "coalescing onto in-flight transformation");
            Diagnostics::of(&mut req).cache_status = Some("coalesced".into());

            let shared = loop {
                if let Some(shared) = rx.borrow().clone() {
                    break Some(shared);
                }
                if rx.changed().await.is_err() {
                    break None;
                }
            };

            match shared {
                Some(parts) => {
                    let (status, headers, body) = (&parts.0, &parts.1, &parts.2);
                    let mut resp = Response::new(*status);
                    resp.headers = headers.clone();
                    resp.body = Body::from(body.clone());
                    return Ok(shape_for_request(
                        &mut req,
                        resp,
                        range_header.as_deref(),
                        debug_view,
                    ));
                }
                // leader died; degrade to an independent fetch
                None => return next.call(req).await,
            }
        }

        let tx = leader_tx.take().unwrap_or_else(|| watch::channel(None).0);

        // The pipeline consumes a request; hand it a twin and keep ours for
        // the tail-end shaping below.
        let downstream = Request {
            method: req.method.clone(),
            uri: req.uri.clone(),
            headers: req.headers.clone(),
            body: std::mem::take(&mut req.body),
            extensions: std::mem::take(&mut req.extensions),
        };

        let result = next.call(downstream).await;

        // Whatever happened, unblock followers before answering our client.
        let mut resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                self.finish_inflight(&variant_key, tx, None).await;
                return Err(e);
            }
        };

        // Pull diagnostics accumulated downstream back into this request.
        if let Some(diag) = resp.extensions.remove::<Diagnostics>() {
            req.extensions.insert(diag);
        }

        if resp.is_success() {
            if let Err(e) = crate::cache::EdgeCache::prepare(&mut resp).await {
                self.finish_inflight(&variant_key, tx, None).await;
                return Err(e);
            }
        }
        response::finalize(&config, &route, &opts, imquery.as_ref(), req.path(), &mut resp);

        let shared: SharedParts = Arc::new((
            resp.status,
            resp.headers.clone(),
            resp.body.bytes().cloned().unwrap_or_default(),
        ));
        self.finish_inflight(&variant_key, tx, Some(shared)).await;

        self.write_back(&req, &config, &route, &resp, &cache_key, &variant_key, version);

        let diag = Diagnostics::of(&mut req);
        if diag.cache_status.is_none() {
            diag.cache_status = Some("miss".into());
        }

        Ok(shape_for_request(
            &mut req,
            resp,
            range_header.as_deref(),
            debug_view,
        ))
    }
}

impl CacheLayer {
    async fn finish_inflight(
        &self,
        variant_key: &str,
        tx: watch::Sender<Option<SharedParts>>,
        parts: Option<SharedParts>,
    ) {
        self.inflight.lock().await.remove(variant_key);
        if let Some(parts) = parts {
            let _ = tx.send(Some(parts));
        }
        // dropping tx wakes followers with an error when there is no result
    }

    /// Background writes: edge cache (re-keyed to the original URL) and the
    /// variant store, plus the version record. The client response is never
    /// delayed; cancellation of the request does not abort these.
    #[allow(clippy::too_many_arguments)]
    fn write_back(
        &self,
        req: &Request,
        config: &Arc<RuntimeConfig>,
        route: &RouteMatch,
        resp: &Response,
        cache_key: &str,
        variant_key: &str,
        version: u64,
    ) {
        if req.method != Method::GET || !resp.is_success() {
            return;
        }
        let Some(body) = resp.body.bytes().cloned() else {
            return;
        };

        // Edge cache write.
        if let Some(ttl) = self.services.edge_cache.storability(req, resp) {
            let edge = self.services.edge_cache.clone();
            let uri = req.uri.clone();
            let mut stored = Response::new(resp.status);
            stored.headers = resp.headers.clone();
            stored.body = Body::from(body.clone());
            tokio::spawn(async move {
                edge.insert(&uri, &stored, ttl).await;
            });
        }

        // Variant store write, manifest-last, then the version record.
        let no_store = resp
            .header(CACHE_CONTROL)
            .map(|cc| cc.contains("no-store"))
            .unwrap_or(false);
        let cacheable_type = resp
            .content_type()
            .map(|ct| ct.starts_with("video/") || ct.starts_with("image/"))
            .unwrap_or(false);
        if no_store || !cacheable_type {
            return;
        }

        let ttl_secs = route
            .pattern
            .cache_ttl
            .unwrap_or_else(|| response::ttl_for_status(&config.cache.ttl, resp.status));
        if ttl_secs == 0 {
            return;
        }

        let meta = VariantMeta {
            content_type: resp.content_type().unwrap_or("video/mp4").to_string(),
            etag: resp.header(ETAG).map(String::from),
            last_modified: resp.header(LAST_MODIFIED).map(String::from),
            tags: resp
                .headers
                .get("cache-tag")
                .and_then(|v| v.to_str().ok())
                .map(|tags| tags.split(',').map(String::from).collect())
                .unwrap_or_default(),
        };

        let variants = self.services.variants.clone();
        let versions = self.services.versions.clone();
        let variant_key = variant_key.to_string();
        let cache_key = cache_key.to_string();
        tokio::spawn(async move {
            match variants
                .put(&variant_key, body, meta, Duration::from_secs(ttl_secs))
                .await
            {
                Ok(()) => versions.record(&cache_key, version).await,
                Err(e) => warn!(key = %variant_key, error = %e, "variant write failed"),
            }
        });
    }
}
