use std::sync::Arc;

use miette::Result;

use crate::client::Client;
use crate::error::Error;
use crate::middleware::{Layer, RequestProcessor};
use crate::req::{Request, Response};
use crate::server::{Handler, HttpServer, HttpServerBuilder};

/// Couples the inbound server, the middleware stack, and the terminal client.
pub struct Pipeline<M, C>
where
    M: Layer + 'static,
    C: Client + 'static,
{
    server: HttpServerBuilder,
    middleware: M,
    client: C,
}

#[async_trait::async_trait]
impl<C: Client, L: Layer> Handler for RequestProcessor<C, L> {
    async fn handle(&self, req: Request) -> Result<Response, Error> {
        self.call(req).await
    }
}

impl<M, C> Pipeline<M, C>
where
    M: Layer + 'static,
    C: Client + 'static,
{
    pub fn new(server: HttpServerBuilder, middleware: M, client: C) -> Self {
        Self {
            server,
            middleware,
            client,
        }
    }

    pub async fn run(self) -> Result<HttpServer> {
        let handler = Arc::new(RequestProcessor::new(self.client, self.middleware));
        self.server.serve(handler)
    }
}
