pub mod body;
pub mod request;
pub mod response;

pub use body::Body;
pub use request::Request;
pub use response::Response;

/// Per-request diagnostics, attached as a request extension and surfaced by
/// the response builder on `?debug=view` requests.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct Diagnostics {
    pub pattern: Option<String>,
    pub source: Option<String>,
    pub origin_url: Option<String>,
    pub upstream_url: Option<String>,
    pub variant_key: Option<String>,
    pub version: Option<u64>,
    pub cache_status: Option<String>,
    pub fallback_reason: Option<String>,
    pub warnings: Vec<String>,
}

impl Diagnostics {
    /// Borrow the request's diagnostics, inserting an empty record on first use.
    pub fn of(req: &mut Request) -> &mut Diagnostics {
        if req.extensions.get::<Diagnostics>().is_none() {
            req.extensions.insert(Diagnostics::default());
        }
        req.extensions.get_mut::<Diagnostics>().unwrap()
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}
