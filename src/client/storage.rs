use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aws_credential_types::{provider::SharedCredentialsProvider, Credentials as AwsCredentials};
use aws_sdk_s3::config::Region;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use http::{Method, StatusCode, Uri};
use tracing::{debug, warn};
use url::Url;

use super::HttpClient;
use crate::auth::{resolve_credentials, sigv4, static_auth_headers};
use crate::cache::presigned::PresignedEntry;
use crate::config::{AuthConfig, BucketBindingConfig, SecurityMode, SourceType};
use crate::error::{Error, ErrorKind};
use crate::origin::{resolve_origin, Origin};
use crate::req::{Body, Response};
use crate::services::Services;

/// Presign validity when the auth config does not set one.
const DEFAULT_PRESIGN_EXPIRY_SECS: u64 = 3_600;

/// Cached presigned URLs are refreshed in the background once they get this
/// close to expiry.
const PRESIGN_REFRESH_THRESHOLD_SECS: u64 = 300;

/// An S3-compatible bucket reachable through a binding name.
pub struct BucketBinding {
    pub client: aws_sdk_s3::Client,
    pub bucket: String,
}

#[derive(Default, Clone)]
pub struct BucketRegistry {
    bindings: HashMap<String, Arc<BucketBinding>>,
}

impl BucketRegistry {
    /// Build SDK clients for every configured binding. Missing credentials
    /// fail at load time under `strict`, fall back to anonymous access under
    /// `permissive`.
    pub fn from_config(
        cfgs: &HashMap<String, BucketBindingConfig>,
        security: &SecurityMode,
    ) -> Result<Self, Error> {
        let mut bindings = HashMap::new();

        for (name, cfg) in cfgs {
            let region = if cfg.region.is_empty() {
                "us-east-1".to_string()
            } else {
                cfg.region.clone()
            };

            let mut conf = aws_sdk_s3::Config::builder()
                .region(Region::new(region))
                .force_path_style(cfg.force_path_style);

            if let Some(endpoint) = &cfg.endpoint_url {
                conf = conf.endpoint_url(endpoint.as_str());
            }

            if let (Some(access_var), Some(secret_var)) =
                (&cfg.access_key_var, &cfg.secret_key_var)
            {
                match (std::env::var(access_var), std::env::var(secret_var)) {
                    (Ok(access_key), Ok(secret_key)) => {
                        let creds = AwsCredentials::from_keys(access_key, secret_key, None);
                        conf = conf.credentials_provider(SharedCredentialsProvider::new(creds));
                    }
                    _ => {
                        if matches!(security, SecurityMode::Strict) {
                            return Err(Error::new(ErrorKind::MissingCredentials(format!(
                                "{} / {}",
                                access_var, secret_var
                            ))));
                        }
                        warn!(binding = %name, "bucket credentials missing, using anonymous access");
                    }
                }
            }

            bindings.insert(
                name.clone(),
                Arc::new(BucketBinding {
                    client: aws_sdk_s3::Client::from_conf(conf.build()),
                    bucket: cfg.bucket.clone(),
                }),
            );
        }

        Ok(Self { bindings })
    }

    pub fn resolve(&self, binding: &str) -> Result<Arc<BucketBinding>, Error> {
        self.bindings
            .get(binding)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::MissingBinding(binding.to_string())))
    }

    pub fn contains(&self, binding: &str) -> bool {
        self.bindings.contains_key(binding)
    }
}

/// GET an object from a bound bucket and shape it as an HTTP response.
pub async fn fetch_bucket_object(
    binding: &BucketBinding,
    path: &str,
) -> Result<Response, Error> {
    let key = path.trim_start_matches('/');
    let output = binding
        .client
        .get_object()
        .bucket(&binding.bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| {
            Error::new(ErrorKind::OriginFetchFailure(e.to_string()))
                .with_context("bucket", &binding.bucket)
                .with_context("key", key)
        })?;

    let mut resp = Response::new(StatusCode::OK);
    resp.set_header(
        CONTENT_TYPE,
        output
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string(),
    );
    if let Some(etag) = output.e_tag() {
        resp.set_header(ETAG, etag.to_string());
    }
    if let Some(modified) = output.last_modified() {
        let secs = modified.secs().max(0) as u64;
        let when = std::time::UNIX_EPOCH + Duration::from_secs(secs);
        resp.set_header(LAST_MODIFIED, httpdate::fmt_http_date(when));
    }

    let bytes = output
        .body
        .collect()
        .await
        .map_err(|e| Error::new(ErrorKind::OriginFetchFailure(e.to_string())))?
        .into_bytes();
    resp.set_header(CONTENT_LENGTH, bytes.len().to_string());
    resp.body = Body::from(bytes);

    Ok(resp)
}

/// One HTTP fetch with a bounded timeout.
pub async fn fetch_url(
    http: &HttpClient,
    method: &Method,
    url: &str,
    headers: &[(String, String)],
    timeout: Duration,
) -> Result<Response, Error> {
    let uri: Uri = url
        .parse()
        .map_err(|_| Error::new(ErrorKind::OriginFetchFailure(format!("invalid url: {}", url))))?;

    let mut builder = hyper::Request::builder().method(method.clone()).uri(uri);
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let req = builder.body(hyper::Body::empty())?;

    let resp = tokio::time::timeout(timeout, http.request(req))
        .await
        .map_err(|_| Error::new(ErrorKind::Timeout).with_context("url", url))??;

    Ok(Response::from(resp))
}

/// Fetch following redirects, for direct-origin fallback.
pub async fn fetch_following_redirects(
    http: &HttpClient,
    method: &Method,
    url: &str,
    headers: &[(String, String)],
    timeout: Duration,
) -> Result<Response, Error> {
    const MAX_REDIRECTS: usize = 5;

    let mut current = url.to_string();
    for _ in 0..=MAX_REDIRECTS {
        let resp = fetch_url(http, method, &current, headers, timeout).await?;
        if !resp.status.is_redirection() {
            return Ok(resp);
        }
        match resp.header(http::header::LOCATION) {
            Some(location) => {
                debug!(from = %current, to = %location, "following redirect");
                current = match Url::parse(&current)
                    .ok()
                    .and_then(|base| base.join(location).ok())
                {
                    Some(resolved) => resolved.to_string(),
                    None => location.to_string(),
                };
            }
            None => return Ok(resp),
        }
    }

    Err(Error::new(ErrorKind::OriginFetchFailure(format!(
        "too many redirects from {}",
        url
    ))))
}

/// Turn an auth config into a fetchable URL plus request headers. Presigned
/// URLs go through the presign cache; header signing happens per request.
pub async fn authorize_fetch(
    services: &Arc<Services>,
    security: &SecurityMode,
    auth: &AuthConfig,
    url: &str,
    path: &str,
    storage_type: &str,
) -> Result<(String, Vec<(String, String)>), Error> {
    match auth {
        AuthConfig::AwsS3 {
            region, service, ..
        } => {
            let Some(creds) = resolve_credentials(auth, security)? else {
                return Ok((url.to_string(), Vec::new()));
            };
            let parsed = Url::parse(url).map_err(|e| {
                Error::new(ErrorKind::SigningFailure(format!("{}: {}", url, e)))
            })?;
            let headers =
                sigv4::sign_get_headers(&creds, region, service, &parsed, chrono::Utc::now())?;
            Ok((url.to_string(), headers))
        }
        AuthConfig::AwsS3PresignedUrl {
            region,
            service,
            expires_in_secs,
            ..
        } => {
            let Some(creds) = resolve_credentials(auth, security)? else {
                return Ok((url.to_string(), Vec::new()));
            };
            let expires_in = expires_in_secs.unwrap_or(DEFAULT_PRESIGN_EXPIRY_SECS);
            let key = crate::cache::PresignedUrlCache::cache_key(
                storage_type,
                path,
                auth.type_name(),
                Some(region.as_str()),
                Some(service.as_str()),
            );

            if let Some(entry) = services.presigned.get(&key).await {
                let fresh = {
                    let creds = creds.clone();
                    let region = region.clone();
                    let service = service.clone();
                    let url = url.to_string();
                    let path = path.to_string();
                    let storage_type = storage_type.to_string();
                    let auth_type = auth.type_name().to_string();
                    services.presigned.refresh_if_expiring(
                        &key,
                        entry,
                        PRESIGN_REFRESH_THRESHOLD_SECS,
                        move || {
                            Box::pin(async move {
                                let parsed = Url::parse(&url).map_err(|e| {
                                    Error::new(ErrorKind::PresignGenerationFailure(e.to_string()))
                                })?;
                                let signed = sigv4::presign_get_url(
                                    &creds,
                                    &region,
                                    &service,
                                    &parsed,
                                    expires_in,
                                    chrono::Utc::now(),
                                )?;
                                Ok(PresignedEntry::new(
                                    url,
                                    signed,
                                    path,
                                    storage_type,
                                    auth_type,
                                    Some(region),
                                    Some(service),
                                    expires_in,
                                ))
                            })
                        },
                    )
                };
                return Ok((fresh.full_url, Vec::new()));
            }

            let parsed = Url::parse(url).map_err(|e| {
                Error::new(ErrorKind::PresignGenerationFailure(format!("{}: {}", url, e)))
            })?;
            let signed = sigv4::presign_get_url(
                &creds,
                region,
                service,
                &parsed,
                expires_in,
                chrono::Utc::now(),
            )?;
            let entry = PresignedEntry::new(
                url,
                signed.clone(),
                path,
                storage_type,
                auth.type_name(),
                Some(region.clone()),
                Some(service.clone()),
                expires_in,
            );
            if let Err(e) = services.presigned.put(&key, &entry).await {
                warn!(key, error = %e, "presigned cache write failed");
            }
            Ok((signed, Vec::new()))
        }
        AuthConfig::Bearer { .. } | AuthConfig::Header { .. } => {
            Ok((url.to_string(), static_auth_headers(auth, security)?))
        }
    }
}

/// Result of a storage-service fetch, labeled for `X-Storage-Source`.
pub struct StorageFetch {
    pub response: Response,
    pub source: String,
}

/// Walk the matched origin's sources in priority order and return the first
/// 2xx response. Per-source failures are logged and skipped.
pub async fn fetch_from_storage(
    services: &Arc<Services>,
    origins: &[Arc<Origin>],
    security: &SecurityMode,
    origin_path: &str,
    timeout: Duration,
) -> Option<StorageFetch> {
    let origin = resolve_origin(origin_path, origins)?;

    for source in &origin.sources {
        let resolved = source.resolve_path(origin_path);

        let result = match source.source_type {
            SourceType::ObjectStore => {
                let Some(binding_name) = source.bucket_binding.as_deref() else {
                    continue;
                };
                match services.buckets.resolve(binding_name) {
                    Ok(binding) => fetch_bucket_object(&binding, &resolved).await,
                    Err(e) => Err(e),
                }
            }
            SourceType::Remote => {
                let Some(url) = source.source_url(&resolved) else {
                    continue;
                };
                match &source.auth {
                    Some(auth) => {
                        match authorize_fetch(
                            services,
                            security,
                            auth,
                            &url,
                            &resolved,
                            "remote",
                        )
                        .await
                        {
                            Ok((url, headers)) => {
                                fetch_url(&services.http, &Method::GET, &url, &headers, timeout)
                                    .await
                            }
                            Err(e) => Err(e),
                        }
                    }
                    None => fetch_url(&services.http, &Method::GET, &url, &[], timeout).await,
                }
            }
            SourceType::Fallback => {
                let Some(url) = source.source_url(&resolved) else {
                    continue;
                };
                fetch_url(&services.http, &Method::GET, &url, &[], timeout).await
            }
        };

        match result {
            Ok(resp) if resp.is_success() => {
                return Some(StorageFetch {
                    response: resp,
                    source: source.source_type.to_string(),
                });
            }
            Ok(resp) => {
                debug!(
                    origin = %origin.name,
                    source = %source.source_type,
                    status = %resp.status,
                    "storage source answered non-2xx, trying next"
                );
            }
            Err(e) => {
                debug!(
                    origin = %origin.name,
                    source = %source.source_type,
                    error = %e,
                    "storage source failed, trying next"
                );
            }
        }
    }

    None
}
