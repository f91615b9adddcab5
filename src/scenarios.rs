//! End-to-end request scenarios against scripted upstream servers.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ctor::ctor;
use http::header::{ACCEPT_RANGES, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use http::{HeaderName, Method, StatusCode};
use hyper::service::{make_service_fn, service_fn};

use crate::client::TransformClient;
use crate::config::runtime::ConfigSnapshot;
use crate::config::{AppConfig, AuthConfig, PathPatternConfig, RuntimeConfig};
use crate::kv::VariantRead;
use crate::middleware::{CacheLayer, Chain, Identity, RequestProcessor};
use crate::options;
use crate::req::{Request, Response};
use crate::server::http::prepare_request;
use crate::services::Services;

#[ctor]
fn prepare() {
    let _ = crate::try_init_tracing();
}

type UpstreamScript =
    Arc<dyn Fn(usize, &hyper::Request<hyper::Body>) -> hyper::Response<hyper::Body> + Send + Sync>;

/// Spawn a scripted HTTP server on an ephemeral port. The script receives the
/// zero-based call index and the request.
fn spawn_upstream(script: UpstreamScript) -> (SocketAddr, Arc<AtomicUsize>) {
    spawn_upstream_delayed(script, Duration::ZERO)
}

fn spawn_upstream_delayed(
    script: UpstreamScript,
    delay: Duration,
) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let calls_in_svc = calls.clone();
    let make_svc = make_service_fn(move |_| {
        let script = script.clone();
        let calls = calls_in_svc.clone();
        std::future::ready(Ok::<_, Infallible>(service_fn(
            move |req: hyper::Request<hyper::Body>| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                let resp = script(n, &req);
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok::<_, Infallible>(resp)
                }
            },
        )))
    });

    tokio::spawn(hyper::Server::from_tcp(listener).unwrap().serve(make_svc));
    (addr, calls)
}

fn video_body(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

fn ok_video(body: Bytes) -> hyper::Response<hyper::Body> {
    hyper::Response::builder()
        .status(200)
        .header("content-type", "video/mp4")
        .body(hyper::Body::from(body))
        .unwrap()
}

struct Proxy {
    services: Arc<Services>,
    processor: RequestProcessor<TransformClient, Chain<CacheLayer, Identity>>,
}

impl Proxy {
    fn new(app: &AppConfig) -> Self {
        let (services, _) = Services::build_in_memory(app).unwrap();
        let processor = RequestProcessor::new(
            TransformClient::new(services.clone()),
            Chain::new(CacheLayer::new(services.clone()), Identity),
        );
        Self {
            services,
            processor,
        }
    }

    fn config(&self) -> Arc<RuntimeConfig> {
        self.services.config.snapshot()
    }

    async fn get(&self, uri: &str, headers: &[(HeaderName, &str)]) -> Response {
        let mut req = Request::new(Method::GET, uri.parse().unwrap());
        for (name, value) in headers {
            req.headers
                .insert(name.clone(), value.parse().unwrap());
        }

        let config = self.config();
        req.extensions.insert(ConfigSnapshot(config.clone()));
        if let Err(e) = prepare_request(&mut req, &config) {
            return Response::from(e);
        }

        self.processor
            .call(req)
            .await
            .unwrap_or_else(Response::from)
    }

    /// Wait until the background variant write for `key` lands.
    async fn wait_for_variant(&self, key: &str) {
        for _ in 0..100 {
            if matches!(
                self.services.variants.get(key, None).await,
                VariantRead::Hit(_)
            ) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("variant {} never landed", key);
    }
}

fn base_config(upstream: SocketAddr) -> AppConfig {
    let mut app = AppConfig::default();
    app.transform.scheme = "http".into();
    app.transform.host = format!("127.0.0.1:{}", upstream.port());
    app.patterns.push(PathPatternConfig {
        name: "videos".into(),
        matcher: "^/videos/(.+)$".into(),
        capture_groups: vec!["videoId".into()],
        origin_url: Some("https://src.example".into()),
        ..Default::default()
    });
    app
}

fn variant_key_for(config: &RuntimeConfig, path: &str, pairs: &[(&str, &str)]) -> String {
    let pairs: Vec<(String, String)> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let out = options::normalize(&pairs, &config.derivatives).unwrap();
    options::variant_key(path, &out.options, 1)
}

#[tokio::test]
async fn happy_path_then_warm_hits_and_ranges() {
    let body = video_body(5000);
    let expected = body.clone();
    let (addr, calls) = spawn_upstream(Arc::new(move |_, req| {
        assert!(req.uri().path().starts_with(
            "/cdn-cgi/media/width=854,height=480,mode=video/https://src.example/clip.mp4"
        ));
        ok_video(expected.clone())
    }));

    let proxy = Proxy::new(&base_config(addr));

    // 1. cold cache: full transformation, tags, background writes
    let resp = proxy.get("/videos/clip.mp4?derivative=medium", &[]).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body.bytes().unwrap(), &body);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let tags = resp
        .headers
        .get("cache-tag")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert!(tags.contains("video-derivative-medium"));
    assert!(tags.contains("video-dimensions-854x480"));
    assert!(tags.contains("video-path-videos-clip-mp4"));

    let key = variant_key_for(
        &proxy.config(),
        "/videos/clip.mp4",
        &[("derivative", "medium")],
    );
    proxy.wait_for_variant(&key).await;

    // 2. warm variant-store hit: no new upstream fetch
    let resp = proxy.get("/videos/clip.mp4?derivative=medium", &[]).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body.bytes().unwrap(), &body);
    assert_eq!(resp.header(ACCEPT_RANGES), Some("bytes"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // 3. range over the warm variant
    let resp = proxy
        .get(
            "/videos/clip.mp4?derivative=medium",
            &[(RANGE, "bytes=1000-1999")],
        )
        .await;
    assert_eq!(resp.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.header(CONTENT_LENGTH), Some("1000"));
    assert_eq!(resp.header(CONTENT_RANGE), Some("bytes 1000-1999/5000"));
    assert_eq!(resp.body.bytes().unwrap().as_ref(), &body[1000..=1999]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duration_limit_adjusts_and_retries() {
    let (addr, calls) = spawn_upstream(Arc::new(|n, req| {
        if n == 0 {
            hyper::Response::builder()
                .status(400)
                .body(hyper::Body::from("duration must be between 100ms and 30s"))
                .unwrap()
        } else {
            assert!(
                req.uri().path().contains("duration=30s"),
                "expected clamped duration in {}",
                req.uri()
            );
            ok_video(video_body(64))
        }
    }));

    let proxy = Proxy::new(&base_config(addr));

    let resp = proxy.get("/videos/clip.mp4?duration=120s", &[]).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let header = |name: &str| {
        resp.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    assert_eq!(header("x-duration-adjusted").as_deref(), Some("true"));
    assert_eq!(header("x-original-duration").as_deref(), Some("120s"));
    assert_eq!(header("x-adjusted-duration").as_deref(), Some("30s"));
    assert_eq!(header("x-duration-limit-applied").as_deref(), Some("true"));

    // the learned limit pre-clamps the next request before its first attempt
    let resp = proxy.get("/videos/other.mp4?duration=120s", &[]).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        resp.headers
            .get("x-duration-limit-applied")
            .and_then(|v| v.to_str().ok()),
        Some("true")
    );
}

#[tokio::test]
async fn unsatisfiable_range_over_short_body() {
    let (addr, _calls) = spawn_upstream(Arc::new(|_, _| ok_video(video_body(500))));
    let proxy = Proxy::new(&base_config(addr));

    let resp = proxy.get("/videos/short.mp4", &[]).await;
    assert_eq!(resp.status, StatusCode::OK);

    let key = variant_key_for(&proxy.config(), "/videos/short.mp4", &[]);
    proxy.wait_for_variant(&key).await;

    let resp = proxy
        .get("/videos/short.mp4", &[(RANGE, "bytes=900-999")])
        .await;
    assert_eq!(resp.status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(resp.header(CONTENT_RANGE), Some("bytes */500"));
    assert!(resp.body.is_empty());
}

#[tokio::test]
async fn fallback_chain_reaches_the_presigned_pattern_origin() {
    std::env::set_var("SCEN6_AWS_ACCESS_KEY_ID", "AKIDEXAMPLE");
    std::env::set_var("SCEN6_AWS_SECRET_ACCESS_KEY", "sk-secret");

    // transformation endpoint always fails
    let (transform_addr, transform_calls) = spawn_upstream(Arc::new(|_, _| {
        hyper::Response::builder()
            .status(500)
            .body(hyper::Body::from("internal error"))
            .unwrap()
    }));

    // pattern origin accepts only presigned requests
    let (origin_addr, origin_calls) = spawn_upstream(Arc::new(|_, req| {
        let query = req.uri().query().unwrap_or_default();
        assert!(query.contains("X-Amz-Signature="), "unsigned fetch: {}", req.uri());
        assert!(query.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        ok_video(Bytes::from_static(b"ORIGINBYTES"))
    }));

    let mut app = base_config(transform_addr);
    app.patterns[0].origin_url = Some(format!("http://127.0.0.1:{}", origin_addr.port()));
    app.patterns[0].auth = Some(AuthConfig::AwsS3PresignedUrl {
        access_key_var: "SCEN6_AWS_ACCESS_KEY_ID".into(),
        secret_key_var: "SCEN6_AWS_SECRET_ACCESS_KEY".into(),
        session_token_var: None,
        region: "us-east-1".into(),
        service: "s3".into(),
        expires_in_secs: Some(3600),
    });

    let proxy = Proxy::new(&app);
    let resp = proxy.get("/videos/clip.mp4", &[]).await;

    // one original attempt plus the single transient retry
    assert_eq!(transform_calls.load(Ordering::SeqCst), 2);
    assert_eq!(origin_calls.load(Ordering::SeqCst), 1);

    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body.bytes().unwrap().as_ref(), b"ORIGINBYTES");

    let header = |name: &str| {
        resp.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    assert_eq!(header("x-fallback-applied").as_deref(), Some("true"));
    assert_eq!(header("x-pattern-fallback-applied").as_deref(), Some("true"));
    assert_eq!(header("x-pattern-name").as_deref(), Some("videos"));
    assert_eq!(
        header("x-pattern-auth-type").as_deref(),
        Some("aws-s3-presigned-url")
    );
    assert_eq!(header("x-pattern-origin-domain").as_deref(), Some("127.0.0.1"));
    assert_eq!(header("x-original-error-status").as_deref(), Some("500"));
    assert_eq!(resp.header(CACHE_CONTROL), Some("no-store"));
}

#[tokio::test]
async fn conditional_revalidation_gets_304() {
    let (addr, _calls) = spawn_upstream(Arc::new(|_, _| ok_video(video_body(256))));
    let proxy = Proxy::new(&base_config(addr));

    let resp = proxy.get("/videos/clip.mp4", &[]).await;
    let etag = resp.header(http::header::ETAG).unwrap().to_string();

    let key = variant_key_for(&proxy.config(), "/videos/clip.mp4", &[]);
    proxy.wait_for_variant(&key).await;

    let resp = proxy
        .get(
            "/videos/clip.mp4",
            &[(http::header::IF_NONE_MATCH, etag.as_str())],
        )
        .await;
    assert_eq!(resp.status, StatusCode::NOT_MODIFIED);
    assert!(resp.body.is_empty());
    assert_eq!(
        resp.header(http::header::ETAG).map(String::from),
        Some(etag)
    );
}

#[tokio::test]
async fn head_requests_serve_headers_only() {
    let (addr, calls) = spawn_upstream(Arc::new(|_, _| ok_video(video_body(256))));
    let proxy = Proxy::new(&base_config(addr));

    // warm the caches with a GET
    proxy.get("/videos/clip.mp4", &[]).await;
    let key = variant_key_for(&proxy.config(), "/videos/clip.mp4", &[]);
    proxy.wait_for_variant(&key).await;

    let mut req = Request::new(Method::HEAD, "/videos/clip.mp4".parse().unwrap());
    let config = proxy.config();
    req.extensions.insert(ConfigSnapshot(config.clone()));
    prepare_request(&mut req, &config).unwrap();
    let resp = proxy.processor.call(req).await.unwrap();

    assert_eq!(resp.status, StatusCode::OK);
    assert!(resp.body.is_empty());
    assert_eq!(resp.header(CONTENT_LENGTH), Some("256"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn forced_miss_bumps_the_version() {
    let (addr, calls) = spawn_upstream(Arc::new(|_, _| ok_video(video_body(64))));
    let proxy = Proxy::new(&base_config(addr));

    proxy.get("/videos/clip.mp4", &[]).await;
    let key = variant_key_for(&proxy.config(), "/videos/clip.mp4", &[]);
    proxy.wait_for_variant(&key).await;

    // warm hit, no new fetch
    proxy.get("/videos/clip.mp4", &[]).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // nocache forces a version bump and a fresh transformation
    let resp = proxy.get("/videos/clip.mp4?nocache=1", &[]).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // the bumped version now addresses a different variant, so the old entry
    // no longer serves the key
    let versions = &proxy.services.versions;
    let version = versions.read("/videos/clip.mp4|").await.unwrap();
    assert!(version > 1);
}

#[tokio::test]
async fn debug_view_renders_diagnostics() {
    let (addr, _calls) = spawn_upstream(Arc::new(|_, _| ok_video(video_body(64))));
    let proxy = Proxy::new(&base_config(addr));

    let resp = proxy.get("/videos/clip.mp4?debug=view", &[]).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.content_type(), Some("text/html; charset=utf-8"));

    let body = String::from_utf8(resp.body.bytes().unwrap().to_vec()).unwrap();
    assert!(body.contains("Request diagnostics"));
    assert!(body.contains("videos"));
}

#[tokio::test]
async fn request_errors_skip_the_fallback_chain() {
    let (addr, calls) = spawn_upstream(Arc::new(|_, _| ok_video(video_body(16))));
    let proxy = Proxy::new(&base_config(addr));

    let resp = proxy.get("/videos/clip.mp4?width=huge", &[]).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);

    let resp = proxy.get("/images/logo.png", &[]).await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn coalesced_requests_share_one_transformation() {
    // the upstream answers slowly so every concurrent request lands inside
    // the leader's in-flight window
    let (addr, calls) = spawn_upstream_delayed(
        Arc::new(|_, _| ok_video(video_body(128))),
        Duration::from_millis(150),
    );

    let proxy = Arc::new(Proxy::new(&base_config(addr)));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let proxy = proxy.clone();
        handles.push(tokio::spawn(async move {
            proxy.get("/videos/clip.mp4?derivative=medium", &[]).await
        }));
    }

    for handle in handles {
        let resp = handle.await.unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body.bytes().unwrap().len(), 128);
    }

    // followers coalesce onto the leader; allow at most the rare straggler
    // that started after the leader finished
    assert!(calls.load(Ordering::SeqCst) <= 2, "transformations were not coalesced");
}
