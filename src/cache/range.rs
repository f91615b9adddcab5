use bytes::Bytes;
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE};
use http::StatusCode;

use crate::req::{Body, Response};

/// Interpretation of a `Range` header against a body of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// No range requested.
    Full,
    /// Inclusive byte span within the body.
    Partial(u64, u64),
    /// Unparseable, multi-range, or starting past the end of the body.
    Unsatisfiable,
}

/// Parse a `Range` header as a single `bytes=START-END?` span.
pub fn parse_range(header: Option<&str>, total: u64) -> RangeOutcome {
    let Some(header) = header else {
        return RangeOutcome::Full;
    };

    match http_range::HttpRange::parse(header, total) {
        Ok(ranges) if ranges.len() == 1 => {
            let r = ranges[0];
            RangeOutcome::Partial(r.start, r.start + r.length - 1)
        }
        _ => RangeOutcome::Unsatisfiable,
    }
}

/// Parse `bytes=START-END?` without knowing the body size (used before a
/// variant-store read, where the size is only known after the fetch).
/// `None` means the header is not a single well-formed byte range.
pub fn parse_range_raw(header: &str) -> Option<(u64, Option<u64>)> {
    let spec = header.strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => None,
        e => Some(e.parse::<u64>().ok()?),
    };
    if let Some(end) = end {
        if end < start {
            return None;
        }
    }
    Some((start, end))
}

/// Build a 206 from an already-sliced span of a larger body. Content headers
/// are expected to be present on `resp` already; this sets the range envelope.
pub fn partial_response(mut resp: Response, slice: Bytes, start: u64, end: u64, total: u64) -> Response {
    resp.status = StatusCode::PARTIAL_CONTENT;
    resp.set_header(CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total));
    resp.set_header(CONTENT_LENGTH, (end - start + 1).to_string());
    resp.set_header(ACCEPT_RANGES, "bytes");
    resp.body = Body::from(slice);
    resp
}

/// `416 Range Not Satisfiable` with the mandatory `bytes */{total}` envelope.
pub fn unsatisfiable_response(total: u64) -> Response {
    let err = crate::error::Error::new(crate::error::ErrorKind::UnsatisfiableRange);
    let mut resp = Response::new(StatusCode::RANGE_NOT_SATISFIABLE);
    resp.set_header(CONTENT_RANGE, format!("bytes */{}", total));
    resp.set_header_name("x-error-type", err.kind_tag());
    resp
}
