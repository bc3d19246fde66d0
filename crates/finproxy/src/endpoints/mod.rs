use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use finproxy_service::metric;
use finproxy_service::proxy::ProxyService;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

mod error;
mod proxy;

pub use error::ResponseError;

use proxy::{proxy_get, proxy_post};

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: ProxyService) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(64 * 1024));
    Router::new()
        .route("/api/proxy", get(proxy_get).post(proxy_post))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
