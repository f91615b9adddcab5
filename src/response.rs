use http::header::{ACCEPT_RANGES, CACHE_CONTROL, CONTENT_TYPE};
use http::StatusCode;

use crate::config::{CacheTtlPolicyConfig, RuntimeConfig};
use crate::options::{ImQuery, TransformOptions};
use crate::path::RouteMatch;
use crate::req::{Body, Diagnostics, Request, Response};

const MAX_TAG_LEN: usize = 1024;

/// TTL for a status class under the given policy. Zero means "do not cache".
pub fn ttl_for_status(policy: &CacheTtlPolicyConfig, status: StatusCode) -> u64 {
    if status.is_success() {
        policy.ok
    } else if status.is_redirection() {
        policy.redirects
    } else if status.is_client_error() {
        policy.client_error
    } else {
        policy.server_error
    }
}

/// Apply the response policy headers: `Cache-Control` from the status class,
/// `Cache-Tag` from the request's transform shape, `Accept-Ranges` on
/// success. Responses already marked `no-store` (fallbacks) are left alone.
pub fn finalize(
    config: &RuntimeConfig,
    route: &RouteMatch,
    opts: &TransformOptions,
    imquery: Option<&ImQuery>,
    request_path: &str,
    resp: &mut Response,
) {
    let already_no_store = resp
        .header(CACHE_CONTROL)
        .map(|cc| cc.contains("no-store"))
        .unwrap_or(false);

    if !already_no_store {
        let ttl = route
            .pattern
            .cache_ttl
            .filter(|_| resp.status.is_success())
            .unwrap_or_else(|| ttl_for_status(&config.cache.ttl, resp.status));

        if ttl == 0 {
            resp.set_header(CACHE_CONTROL, "no-store");
        } else if resp.status.is_success() {
            resp.set_header(CACHE_CONTROL, format!("public, max-age={}", ttl));
        } else {
            resp.set_header(CACHE_CONTROL, format!("max-age={}", ttl));
        }
    }

    if resp.status.is_success() {
        resp.set_header(ACCEPT_RANGES, "bytes");

        // the fallback engine writes its own tag; leave it alone
        if resp.headers.get("cache-tag").is_none() {
            let content_type = resp.content_type().map(String::from);
            let tags = build_cache_tags(request_path, opts, imquery, content_type.as_deref());
            if !tags.is_empty() {
                resp.set_header_name("cache-tag", tags.join(","));
            }
        }
    }
}

/// Cache tags describing the variant: path (and its segments when nested),
/// derivative, mode, dimensions, quality settings, content type components,
/// and requested IMQuery dimensions.
pub fn build_cache_tags(
    request_path: &str,
    opts: &TransformOptions,
    imquery: Option<&ImQuery>,
    content_type: Option<&str>,
) -> Vec<String> {
    let mut tags = Vec::new();
    let mut push = |tag: String| {
        let mut tag = sanitize_tag(&tag);
        tag.truncate(MAX_TAG_LEN);
        tags.push(tag);
    };

    let path = request_path.trim_matches('/');
    push(format!("video-path-{}", path));

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() > 1 {
        for segment in &segments {
            push(format!("video-segment-{}", segment));
        }
    }

    if let Some(derivative) = &opts.derivative {
        push(format!("video-derivative-{}", derivative));
    }

    push(format!("video-mode-{}", opts.mode));
    if let Some(time) = &opts.time {
        push(format!("video-time-{}", time));
    }
    if let Some(duration) = &opts.duration {
        push(format!("video-duration-{}", duration));
    }
    if let Some(fps) = opts.fps {
        push(format!("video-fps-{}", fps));
    }

    if let Some(width) = opts.width {
        push(format!("video-width-{}", width));
    }
    if let Some(height) = opts.height {
        push(format!("video-height-{}", height));
    }
    if let (Some(width), Some(height)) = (opts.width, opts.height) {
        push(format!("video-dimensions-{}x{}", width, height));
    }

    if let Some(quality) = &opts.quality {
        push(format!("video-quality-{}", quality));
    }
    if let Some(compression) = &opts.compression {
        push(format!("video-compression-{}", compression));
    }

    if let Some(content_type) = content_type {
        let essence = content_type.split(';').next().unwrap_or(content_type);
        if let Some((kind, subtype)) = essence.split_once('/') {
            push(format!("video-content-type-{}", kind));
            push(format!("video-content-subtype-{}", subtype));
        }
    }

    if let Some(imquery) = imquery {
        if let Some(width) = imquery.width {
            push(format!("video-imwidth-{}", width));
        }
        if let Some(height) = imquery.height {
            push(format!("video-imheight-{}", height));
        }
    }

    tags
}

fn sanitize_tag(tag: &str) -> String {
    tag.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Whether this request asked for the debug view.
pub fn wants_debug_view(req: &Request) -> bool {
    req.query_pairs()
        .iter()
        .any(|(name, value)| name == "debug" && matches!(value.as_str(), "view" | "true"))
}

/// Replace the response body with a diagnostics page. With no static-assets
/// collaborator configured, this is the minimal HTML fallback.
pub fn render_debug_page(req: &mut Request, resp: &mut Response) {
    let diagnostics = req.extensions.get::<Diagnostics>().cloned().unwrap_or_default();
    let json = serde_json::to_string_pretty(&diagnostics)
        .unwrap_or_else(|_| "{}".to_string());

    let html = format!(
        "<!doctype html>\n<html>\n<head><title>Video debug</title></head>\n<body>\n\
         <h1>Request diagnostics</h1>\n<pre>{}</pre>\n</body>\n</html>\n",
        escape_html(&json)
    );

    resp.status = StatusCode::OK;
    resp.set_header(CONTENT_TYPE, "text/html; charset=utf-8");
    resp.set_header(CACHE_CONTROL, "no-store");
    resp.body = Body::from(html);
}

/// Escape JSON destined for an HTML page.
fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}
