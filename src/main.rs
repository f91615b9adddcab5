// schematic's `ConfigEnum` derive expands to code that is ambiguous between an
// enum variant and an associated type name on this rustc version; the macro
// itself (not this crate's code) triggers the lint.
#![allow(ambiguous_associated_items)]

mod auth;
mod cache;
mod cli;
mod client;
mod config;
mod error;
mod fallback;
mod kv;
mod middleware;
mod options;
mod origin;
mod path;
mod pipeline;
mod req;
mod response;
#[cfg(test)]
mod scenarios;
mod server;
mod services;
mod transform;

use clap::Parser;
use miette::{IntoDiagnostic, Result, WrapErr};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, util::TryInitError, EnvFilter};

use client::TransformClient;
use middleware::{CacheLayer, Chain, Identity};
use pipeline::Pipeline;
use server::HttpServerBuilder;
use services::Services;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = try_init_tracing();

    // credentials arrive through the environment; a missing .env is fine
    let _ = dotenvy::dotenv();

    let args = cli::CliArgs::parse();

    let app_config = match &args.config.config_file {
        Some(path) => {
            if args.config.regenerate {
                let _ = std::fs::remove_file(path);
                config::generate(path)?;
            }
            if args.config.generate_if_missing {
                config::load_or_generate(path)?
            } else {
                config::load(path)?
            }
        }
        None => config::AppConfig::default(),
    };

    let (services, _config) = Services::build_in_memory(&app_config)
        .into_diagnostic()
        .wrap_err("Failed to wire services")?;

    let server = HttpServerBuilder::new(
        app_config.server.host.clone(),
        app_config.server.port,
        services.clone(),
    );
    let middleware = Chain::new(CacheLayer::new(services.clone()), Identity);
    let client = TransformClient::new(services);

    let p = Pipeline::new(server, middleware, client);
    let server = p.run().await?;

    tokio::signal::ctrl_c().await.into_diagnostic()?;
    server.stop().await.into_diagnostic()?;

    Ok(())
}

pub(crate) fn try_init_tracing() -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
}
