use crate::error::Error;
use crate::req::{Request, Response};

pub mod storage;
pub mod transform;

pub use transform::TransformClient;

/// Terminal element of the request pipeline: sends a request upstream and
/// produces a response.
#[async_trait::async_trait]
pub trait Client: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response, Error>;
}

pub type HttpClient = hyper::Client<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>>;

/// Shared outbound HTTP client: HTTPS via rustls, plain HTTP allowed for
/// local origins.
pub fn build_http_client() -> HttpClient {
    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .https_or_http()
        .enable_http1()
        .build();

    hyper::Client::builder().build::<_, hyper::Body>(https)
}
