use std::sync::Arc;

use http::Method;
use tracing::{debug, warn};

use super::storage::{authorize_fetch, fetch_url};
use super::Client;
use crate::config::runtime::ConfigSnapshot;
use crate::config::{AuthConfig, RuntimeConfig};
use crate::error::{Error, ErrorKind};
use crate::fallback::{FallbackEngine, RetryTransform, UpstreamError};
use crate::kv::version::CacheVersion;
use crate::options::{self, RequestOptions, TransformOptions};
use crate::origin::{join_url, resolve_origin};
use crate::path::{self, RouteMatch};
use crate::req::{Diagnostics, Request, Response};
use crate::services::Services;
use crate::transform::build_transform_url;

/// Terminal pipeline element: builds the upstream transformation URL, fetches
/// it, and drives the fallback chain on failure.
pub struct TransformClient {
    services: Arc<Services>,
    fallback: FallbackEngine,
}

impl TransformClient {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            fallback: FallbackEngine::new(services.clone()),
            services,
        }
    }
}

/// Resolve the source URL the transformation service will fetch: the pattern's
/// authenticated origin when declared, otherwise the first URL-bearing source
/// of the matched origin. Non-transform query parameters are forwarded;
/// presigned-URL patterns embed a signed source.
async fn prepare_source_url(
    services: &Arc<Services>,
    config: &Arc<RuntimeConfig>,
    route: &RouteMatch,
    forwarded_query: Option<&str>,
) -> Result<String, Error> {
    let mut url = match &route.pattern.origin_url {
        Some(base) => join_url(base, &route.origin_path),
        None => {
            let origin = resolve_origin(&route.origin_path, &config.origins).ok_or_else(|| {
                Error::new(ErrorKind::OriginFetchFailure(format!(
                    "no origin matches {}",
                    route.origin_path
                )))
            })?;
            origin
                .sources
                .iter()
                .find_map(|s| s.source_url(&s.resolve_path(&route.origin_path)))
                .ok_or_else(|| {
                    Error::new(ErrorKind::OriginFetchFailure(format!(
                        "origin {} has no addressable source",
                        origin.name
                    )))
                })?
        }
    };

    if let Some(query) = forwarded_query {
        let sep = if url.contains('?') { '&' } else { '?' };
        url.push(sep);
        url.push_str(query);
    }

    if let Some(auth @ AuthConfig::AwsS3PresignedUrl { .. }) = &route.pattern.auth {
        let (signed, _) = authorize_fetch(
            services,
            &config.security,
            auth,
            &url,
            &route.origin_path,
            "pattern",
        )
        .await?;
        url = signed;
    }

    Ok(url)
}

/// One transformation attempt. Owned arguments so duration retries can re-run
/// it from a `'static` closure.
pub(crate) async fn attempt_transform(
    services: Arc<Services>,
    config: Arc<RuntimeConfig>,
    route: RouteMatch,
    opts: TransformOptions,
    version: Option<u64>,
    host: String,
    forwarded_query: Option<String>,
) -> Result<Response, Error> {
    let source_url =
        prepare_source_url(&services, &config, &route, forwarded_query.as_deref()).await?;
    let url = build_transform_url(&config.transform, &host, &opts, &source_url, version);
    debug!(url = %url, "requesting transformation");
    fetch_url(
        &services.http,
        &Method::GET,
        &url,
        &[],
        config.transform.timeout,
    )
    .await
}

#[async_trait::async_trait]
impl Client for TransformClient {
    async fn send(&self, mut req: Request) -> Result<Response, Error> {
        let config = req
            .extensions
            .get::<ConfigSnapshot>()
            .map(|c| c.0.clone())
            .unwrap_or_else(|| self.services.config.snapshot());
        let route = req
            .extensions
            .get::<RouteMatch>()
            .cloned()
            .ok_or_else(|| Error::unknown("request reached the client without a route"))?;
        let request_options = req
            .extensions
            .get::<RequestOptions>()
            .cloned()
            .ok_or_else(|| Error::unknown("request reached the client without options"))?;
        let version = req.extensions.get::<CacheVersion>().map(|v| v.0);

        let mut opts = request_options.options;

        // Pre-clamp against limits learned from earlier upstream rejections.
        let mut preclamped: Option<(String, String)> = None;
        if let (Some(duration), Some(limit_ms)) = (
            opts.duration.as_deref(),
            self.services.limits.max_duration_ms(),
        ) {
            if let Some(ms) = options::time_value_ms(duration) {
                if ms > limit_ms {
                    let clamped = options::format_duration_ms(limit_ms);
                    debug!(original = duration, clamped = %clamped, "pre-clamping duration");
                    preclamped = Some((duration.to_string(), clamped.clone()));
                    opts.duration = Some(clamped);
                }
            }
        }

        let host = req
            .header(http::header::HOST)
            .map(String::from)
            .or_else(|| req.uri.authority().map(|a| a.to_string()))
            .unwrap_or_else(|| "localhost".to_string());
        let forwarded_query = path::forwarded_query(&req.query_pairs());

        let attempt = attempt_transform(
            self.services.clone(),
            config.clone(),
            route.clone(),
            opts.clone(),
            version,
            host.clone(),
            forwarded_query.clone(),
        )
        .await;

        let make_retry = || -> RetryTransform {
            let services = self.services.clone();
            let config = config.clone();
            let route = route.clone();
            let host = host.clone();
            let forwarded_query = forwarded_query.clone();
            Box::new(move |adjusted: TransformOptions| {
                Box::pin(attempt_transform(
                    services,
                    config,
                    route,
                    adjusted,
                    version,
                    host,
                    forwarded_query,
                ))
            })
        };

        let mut resp = match attempt {
            Ok(resp) if resp.is_success() => {
                let mut resp = resp;
                if let Some((original, clamped)) = preclamped {
                    resp.set_header_name("x-duration-limit-applied", "true");
                    resp.set_header_name("x-original-duration", &original);
                    resp.set_header_name("x-adjusted-duration", &clamped);
                }
                resp
            }
            Ok(mut resp) => {
                let upstream = UpstreamError::from_response(&mut resp).await;
                warn!(
                    status = %upstream.status,
                    kind = upstream.classify().kind_tag(),
                    reason = %upstream.message,
                    "transformation failed, entering fallback"
                );
                self.fallback
                    .run(&mut req, &config, &route, &opts, upstream, Some(make_retry()))
                    .await
            }
            Err(e) if e.is_request_error() => return Err(e),
            Err(e) => {
                let upstream = UpstreamError::from_error(&e);
                warn!(error = %e, "transformation fetch errored, entering fallback");
                self.fallback
                    .run(&mut req, &config, &route, &opts, upstream, Some(make_retry()))
                    .await
            }
        };

        // Hand the accumulated diagnostics back to the cache layer.
        resp.extensions.insert(Diagnostics::of(&mut req).clone());
        Ok(resp)
    }
}
