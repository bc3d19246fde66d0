use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use finproxy_service::config::Config;

/// Asks the proxy at `addr` (or the configured `bind` address) whether it is up.
pub fn healthcheck(config: Config, addr: Option<SocketAddr>, timeout: u64) -> Result<()> {
    let addr = match addr {
        Some(addr) => addr,
        None => config
            .bind
            .parse()
            .with_context(|| format!("invalid bind address `{}`", config.bind))?,
    };

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout))
        .build()?;

    let url = format!("http://{addr}/healthcheck");
    tracing::debug!("Sending request to: {url}");

    let response = client.get(url).send();
    let status = match response {
        Ok(response) => response.status(),
        Err(error) => {
            println!("ERROR");
            bail!("failed to check finproxy ({addr}) health: {error}");
        }
    };

    if !status.is_success() {
        println!("ERROR");
        bail!("finproxy ({addr}) is unhealthy. Status: {status}");
    }

    println!("OK");
    Ok(())
}
