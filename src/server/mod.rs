use crate::error::Error;
use crate::req::{Request, Response};

pub mod http;

pub use self::http::{HttpServer, HttpServerBuilder};

/// A Handler gets passed to the server upon creation; the server forwards
/// every decoded request to it.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: Request) -> Result<Response, Error>;
}

// Accept async closures as handlers (tests mostly)
#[async_trait::async_trait]
impl<Fun, Fut> Handler for Fun
where
    Fun: Fn(Request) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Response, Error>> + Send,
{
    async fn handle(&self, req: Request) -> Result<Response, Error> {
        self(req).await
    }
}
