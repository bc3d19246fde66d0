use std::net::SocketAddr;

use anyhow::{Context, Result};
use finproxy_service::config::Config;
use finproxy_service::metric;
use finproxy_service::proxy::ProxyService;

use crate::endpoints;

/// Creates the proxy service and serves HTTP on the configured `bind` address.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let io_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("finproxy-io")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("finproxy-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let service = ProxyService::create(&config, io_pool.handle().to_owned())
        .context("failed to create HTTP service state")?;
    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address `{}`", config.bind))?;

    let server = axum_server::bind(socket).serve(endpoints::create_app(service).into_make_service());
    tracing::info!("Starting HTTP server on {}", socket);

    web_pool.block_on(server)?;
    tracing::info!("System shutdown complete");

    Ok(())
}
