use http::{Extensions, HeaderMap, HeaderName, HeaderValue, StatusCode};

use super::Body;
use crate::error::Error;

#[derive(Debug, Default)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap<HeaderValue>,
    pub body: Body,
    pub extensions: Extensions,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Plain-text response, used for terminal errors.
    pub fn text(status: StatusCode, message: impl Into<String>) -> Self {
        let mut resp = Self::new(status);
        resp.set_header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8");
        resp.body = Body::from(message.into());
        resp
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn header(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Insert a header, ignoring values that are not valid header strings.
    pub fn set_header(&mut self, name: HeaderName, value: impl AsRef<str>) {
        if let Ok(value) = HeaderValue::from_str(value.as_ref()) {
            self.headers.insert(name, value);
        }
    }

    pub fn set_header_name(&mut self, name: &'static str, value: impl AsRef<str>) {
        if let Ok(value) = HeaderValue::from_str(value.as_ref()) {
            self.headers.insert(HeaderName::from_static(name), value);
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(http::header::CONTENT_TYPE)
    }
}

impl From<Error> for Response {
    fn from(err: Error) -> Self {
        let mut resp = Self::text(err.http_status(), format!("{}\n", err));
        resp.set_header(http::header::CACHE_CONTROL, "no-store");
        resp.set_header_name("x-error-type", err.kind_tag());
        resp
    }
}

impl From<Response> for hyper::Response<hyper::Body> {
    fn from(resp: Response) -> Self {
        let mut builder = hyper::Response::builder().status(resp.status);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(resp.headers);
        }
        builder
            .body(resp.body.into())
            .unwrap_or_else(|_| hyper::Response::new(hyper::Body::empty()))
    }
}

impl From<hyper::Response<hyper::Body>> for Response {
    fn from(resp: hyper::Response<hyper::Body>) -> Self {
        let (parts, body) = resp.into_parts();
        Self {
            status: parts.status,
            headers: parts.headers,
            body: Body::from(body),
            extensions: parts.extensions,
        }
    }
}
