use std::convert::Infallible;
use std::net::TcpListener;
use std::sync::Arc;

use futures::future::BoxFuture;
use hyper::service::{make_service_fn, service_fn};
use miette::{IntoDiagnostic, Result};
use tracing::{debug, info, warn};

use super::Handler;
use crate::config::runtime::ConfigSnapshot;
use crate::config::RuntimeConfig;
use crate::error::Error;
use crate::options::{self, RequestOptions};
use crate::path;
use crate::req::{Diagnostics, Request, Response};
use crate::services::Services;

pub struct HttpServerBuilder {
    pub host: String,
    pub port: u16,
    services: Arc<Services>,
}

impl HttpServerBuilder {
    pub fn new(host: impl Into<String>, port: u16, services: Arc<Services>) -> Self {
        Self {
            host: host.into(),
            port,
            services,
        }
    }

    pub fn serve(&self, handler: Arc<dyn Handler>) -> Result<HttpServer> {
        let services = self.services.clone();

        let make_svc = make_service_fn(move |_| {
            let handler = handler.clone();
            let services = services.clone();
            std::future::ready(Ok::<_, Infallible>(service_fn(
                move |req: hyper::Request<hyper::Body>| {
                    let handler = handler.clone();
                    let services = services.clone();
                    async move {
                        let resp: hyper::Response<hyper::Body> =
                            handle_connection(services, handler, req).await.into();
                        Ok::<_, Infallible>(resp)
                    }
                },
            )))
        });

        let listener =
            TcpListener::bind((self.host.as_str(), self.port)).into_diagnostic()?;
        listener.set_nonblocking(true).into_diagnostic()?;
        let server = hyper::Server::from_tcp(listener)
            .into_diagnostic()?
            .serve(make_svc);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = server.with_graceful_shutdown(async {
            rx.await.ok();
        });

        let task = tokio::spawn(server);
        info!("proxy is listening at http://{}:{}/", self.host, self.port);

        Ok(HttpServer {
            fut: Box::pin(async move {
                task.await
                    .map_err(|e| Error::unknown(e.to_string()))?
                    .map_err(|e| Error::unknown(e.to_string()))
            }),
            term_sig: tx,
        })
    }
}

pub struct HttpServer {
    fut: BoxFuture<'static, std::result::Result<(), Error>>,
    term_sig: tokio::sync::oneshot::Sender<()>,
}

impl HttpServer {
    pub async fn stop(self) -> std::result::Result<(), Error> {
        let _ = self.term_sig.send(());
        self.fut.await.ok();
        Ok(())
    }
}

/// Decode, route, and dispatch one request.
async fn handle_connection(
    services: Arc<Services>,
    handler: Arc<dyn Handler>,
    req: hyper::Request<hyper::Body>,
) -> Response {
    let mut req = Request::from(req);

    // Opportunistic dynamic-config refresh; single-flight and TTL-guarded.
    if let Err(e) = services
        .config
        .refresh_from(services.config_store.as_ref())
        .await
    {
        warn!(error = %e, "dynamic configuration refresh failed");
    }
    let config = services.config.snapshot();
    req.extensions.insert(ConfigSnapshot(config.clone()));

    if let Err(e) = prepare_request(&mut req, &config) {
        debug!(uri = %req.uri, error = %e, "request rejected");
        return Response::from(e);
    }

    debug!("{:?}", req);

    match handler.handle(req).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "request failed");
            Response::from(e)
        }
    }
}

/// Route the path and normalize the transform options, attaching both as
/// request extensions. Request-level failures answer 4xx with no fallback.
pub(crate) fn prepare_request(req: &mut Request, config: &RuntimeConfig) -> Result<(), Error> {
    let route = path::resolve(req.path(), &config.patterns)?;

    let mut pairs = req.query_pairs();
    // pattern-level overrides are forced onto the request
    for (name, value) in &route.pattern.transformation_overrides {
        pairs.push((name.clone(), value.clone()));
    }

    let mut outcome = options::normalize(&pairs, &config.derivatives)?;
    if outcome.options.quality.is_none() {
        outcome.options.quality = route.pattern.quality.clone();
    }
    if outcome.options.format.is_none() && outcome.options.mode == options::Mode::Frame {
        outcome.options.format = req
            .header(http::header::ACCEPT)
            .and_then(options::format_from_accept)
            .map(String::from);
    }

    let diag = Diagnostics::of(req);
    diag.pattern = Some(route.pattern.name.clone());
    diag.origin_url = Some(route.origin_path.clone());
    for warning in &outcome.warnings {
        debug!(%warning, "option dropped by mode gating");
        diag.warn(warning.clone());
    }

    req.extensions.insert(route);
    req.extensions.insert(RequestOptions {
        options: outcome.options,
        imquery: outcome.imquery,
    });

    Ok(())
}
