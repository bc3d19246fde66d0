//! Helpers for testing the proxy and its web server.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`Upstream`], make sure that it is held until all requests to it have been made.
//!    If the server is dropped, the port is closed and all further requests fail. To avoid this,
//!    assign it to a variable: `let upstream = Upstream::new();`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{self, Request};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::routing::get;
use axum::{Json, Router};
use reqwest::{StatusCode, Url};
use serde_json::{Value, json};
use tower::ServiceExt;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `finproxy` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("finproxy=trace,finproxy_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// The JSON document served by [`Upstream`] for a given path.
pub fn document(path: &str) -> Value {
    json!({ "path": path, "price": 42 })
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Creates a new test server serving the given router.
    pub fn new(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `127.0.0.1` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A fake upstream API that counts every request it receives.
///
/// The following routes are available:
///
///  - `/json/*path`: Responds with [`document`] for `path`.
///  - `/delay/:time/*path`: Waits for `time` (e.g. `100ms`), then serves `/path`. This counts as a
///    single access.
///  - `/respond_statuscode/:num/*tail`: Responds with an empty body and the given status.
///  - `/ratelimited/:n/*path`: Responds with `429` to the first `n` requests for this URL, and with
///    [`document`] for `path` afterwards.
///  - `/toggle/*path`: Responds with [`document`], or with `500` while
///    [`set_failing`](Self::set_failing) is on.
///  - `/garbage_data/*tail`: Responds with `tail` as plain text.
///  - `/echo_headers/*tail`: Responds with the request headers as a JSON object.
pub struct Upstream {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
    failing: Arc<AtomicBool>,
}

impl Upstream {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));
        let failing = Arc::new(AtomicBool::new(false));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let routes = Self::routes(failing.clone());
        let delayed = routes.clone();
        let router = Router::new()
            .route(
                "/delay/:time/*path",
                get(
                    move |extract::Path((time, path)): extract::Path<(String, String)>,
                          headers: HeaderMap| {
                        let delayed = delayed.clone();
                        async move {
                            let duration = humantime::parse_duration(&time).unwrap();
                            tokio::time::sleep(duration).await;

                            let mut request = axum::http::Request::builder()
                                .uri(format!("/{path}"))
                                .body(Body::empty())
                                .unwrap();
                            *request.headers_mut() = headers;
                            delayed.oneshot(request).await.unwrap()
                        }
                    },
                ),
            )
            .merge(routes)
            .layer(middleware::from_fn(hitcounter));

        let server = Server::new(router);

        Self {
            server,
            hits,
            failing,
        }
    }

    fn routes(failing: Arc<AtomicBool>) -> Router {
        let rate_limits = Arc::new(Mutex::new(BTreeMap::<String, usize>::new()));

        Router::new()
            .route(
                "/json/*path",
                get(|extract::Path(path): extract::Path<String>| async move {
                    Json(document(&path))
                }),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/ratelimited/:n/*path",
                get(
                    move |extract::OriginalUri(uri),
                          extract::Path((n, path)): extract::Path<(usize, String)>| {
                        let rate_limits = rate_limits.clone();
                        async move {
                            let seen = {
                                let mut rate_limits = rate_limits.lock().unwrap();
                                let seen = rate_limits.entry(uri.to_string()).or_default();
                                *seen += 1;
                                *seen
                            };

                            if seen <= n {
                                Err(StatusCode::TOO_MANY_REQUESTS)
                            } else {
                                Ok(Json(document(&path)))
                            }
                        }
                    },
                ),
            )
            .route(
                "/toggle/*path",
                get(move |extract::Path(path): extract::Path<String>| {
                    let failing = failing.clone();
                    async move {
                        if failing.load(Ordering::SeqCst) {
                            Err(StatusCode::INTERNAL_SERVER_ERROR)
                        } else {
                            Ok(Json(document(&path)))
                        }
                    }
                }),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .route(
                "/echo_headers/*tail",
                get(|headers: HeaderMap| async move {
                    let headers: serde_json::Map<String, Value> = headers
                        .iter()
                        .map(|(name, value)| {
                            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
                            (name.to_string(), Value::String(value))
                        })
                        .collect();
                    Json(headers)
                }),
            )
    }

    /// Returns the total number of requests this server has received so far.
    pub fn accesses(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }

    /// Returns the number of requests received per URI.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let hits = self.hits.lock().unwrap();
        hits.iter().map(|(uri, n)| (uri.clone(), *n)).collect()
    }

    /// Makes all `/toggle/` routes fail with `500` until switched off again.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for Upstream {
    fn default() -> Self {
        Self::new()
    }
}
