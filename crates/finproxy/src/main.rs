//! finproxy.
//!
//! finproxy is a small web service that fetches JSON documents from third-party APIs on behalf of
//! a dashboard. It retries rate limited and failed requests with a backoff, shares one upstream
//! request between concurrent callers, and keeps recent responses around so that a flaky upstream
//! degrades to slightly stale data instead of errors.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;


#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
