use crate::client::Client;
use crate::error::Error;
use crate::req::{Request, Response};

pub mod cache;
pub use self::cache::CacheLayer;

/// A processing layer in the request pipeline. Layers may answer a request
/// themselves (cache hit) or delegate to the next element.
#[async_trait::async_trait]
pub trait Layer: Send + Sync {
    async fn call(&self, req: Request, next: &dyn NextLayer) -> Result<Response, Error>;
}

#[async_trait::async_trait]
pub trait NextLayer: Send + Sync {
    async fn call(&self, req: Request) -> Result<Response, Error>;
}

// based on https://github.com/tower-rs/tower/blob/master/tower-layer/src/stack.rs#L5
pub struct Chain<Current: Layer, Next: Layer> {
    current: Current,
    next: Next,
}

impl<C: Layer, N: Layer> Chain<C, N> {
    pub fn new(current: C, next: N) -> Self {
        Self { current, next }
    }

    #[allow(unused)]
    pub fn then<L: Layer>(self, next: L) -> Chain<Self, L> {
        Chain::new(self, next)
    }
}

struct ChainNext<'a, L: Layer> {
    layer: &'a L,
    next: &'a dyn NextLayer,
}

#[async_trait::async_trait]
impl<L: Layer> NextLayer for ChainNext<'_, L> {
    async fn call(&self, req: Request) -> Result<Response, Error> {
        self.layer.call(req, self.next).await
    }
}

#[async_trait::async_trait]
impl<C: Layer, N: Layer> Layer for Chain<C, N> {
    async fn call(&self, req: Request, next: &dyn NextLayer) -> Result<Response, Error> {
        let then = ChainNext {
            layer: &self.next,
            next,
        };
        self.current.call(req, &then).await
    }
}

pub struct Identity;

#[async_trait::async_trait]
impl Layer for Identity {
    async fn call(&self, req: Request, next: &dyn NextLayer) -> Result<Response, Error> {
        next.call(req).await
    }
}

struct ClientNext<'a, C: Client> {
    client: &'a C,
}

#[async_trait::async_trait]
impl<C: Client> NextLayer for ClientNext<'_, C> {
    async fn call(&self, req: Request) -> Result<Response, Error> {
        self.client.send(req).await
    }
}

/// Couples a middleware stack to the terminal client.
pub struct RequestProcessor<C: Client, L: Layer = Identity> {
    layer: L,
    client: C,
}

impl<C: Client> RequestProcessor<C, Identity> {
    #[allow(unused)]
    pub fn from_client(client: C) -> RequestProcessor<C, Identity> {
        RequestProcessor {
            layer: Identity,
            client,
        }
    }
}

impl<C: Client, L: Layer> RequestProcessor<C, L> {
    pub fn new(client: C, layer: L) -> RequestProcessor<C, L> {
        RequestProcessor { layer, client }
    }

    pub async fn call(&self, req: Request) -> Result<Response, Error> {
        let send = ClientNext {
            client: &self.client,
        };
        self.layer.call(req, &send).await
    }
}
