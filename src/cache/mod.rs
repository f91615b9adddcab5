use http::header::{IF_MODIFIED_SINCE, IF_NONE_MATCH};
use http::{HeaderMap, HeaderValue};

pub mod edge;
pub mod presigned;
pub mod range;

pub use edge::EdgeCache;
pub use presigned::{PresignedEntry, PresignedUrlCache};

/// Conditional-request check against stored validators. `If-None-Match` takes
/// precedence over `If-Modified-Since` (RFC 7232 §6); etag matching is
/// comma-list aware and honors `*`.
pub fn not_modified(
    req_headers: &HeaderMap<HeaderValue>,
    etag: Option<&str>,
    last_modified: Option<&str>,
) -> bool {
    if let Some(none_match) = req_headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        let Some(etag) = etag else {
            return false;
        };
        return none_match
            .split(',')
            .map(str::trim)
            .any(|candidate| candidate == etag || candidate == "*" || candidate == "\"*\"");
    }

    if let Some(modified_since) = req_headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
    {
        let (Ok(client_date), Some(stored)) = (
            httpdate::parse_http_date(modified_since),
            last_modified.and_then(|lm| httpdate::parse_http_date(lm).ok()),
        ) else {
            return false;
        };
        return client_date >= stored;
    }

    false
}
