use axum::Json;
use axum::body::Bytes;
use axum::extract;
use axum::http::{HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use finproxy_service::proxy::{InputError, ProxyError, ProxyResponse, ProxyService};
use serde::Deserialize;
use serde_json::Value;

use super::ResponseError;

/// Tells the client whether the payload is `fresh`, `new` or `stale`.
pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-cache-status");

/// The body of a `POST /api/proxy` request, and the query of a `GET` request.
///
/// `url` is kept as a raw JSON value so that a wrongly typed URL is reported like any other
/// invalid URL instead of as a parser error.
#[derive(Debug, Default, Deserialize)]
pub struct ProxyRequest {
    #[serde(default)]
    pub url: Option<Value>,
}

impl ProxyRequest {
    /// Returns the requested URL.
    ///
    /// `null`, `false`, `0` and `""` count as a missing URL. Any other non-string is malformed.
    pub fn url(&self) -> Result<Option<&str>, InputError> {
        match &self.url {
            None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(None),
            Some(Value::String(url)) => Ok(Some(url.as_str())),
            Some(Value::Number(n)) if n.as_f64() == Some(0.0) => Ok(None),
            Some(_) => Err(InputError::Malformed),
        }
    }
}

pub async fn proxy_post(
    extract::State(service): extract::State<ProxyService>,
    body: Bytes,
) -> Result<Response, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("POST /api/proxy"));
    });

    // An empty body is treated like a body without a URL.
    let request: ProxyRequest = if body.is_empty() {
        ProxyRequest::default()
    } else {
        serde_json::from_slice(&body)?
    };

    let url = request.url().map_err(ProxyError::from)?;
    let response = service.handle(url).await?;
    Ok(into_response(response))
}

pub async fn proxy_get(
    extract::State(service): extract::State<ProxyService>,
    extract::Query(request): extract::Query<ProxyRequest>,
) -> Result<Response, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /api/proxy"));
    });

    let url = request.url().map_err(ProxyError::from)?;
    let response = service.handle(url).await?;
    Ok(into_response(response))
}

fn into_response(response: ProxyResponse) -> Response {
    let mut http_response = Json(&*response.payload).into_response();
    http_response.headers_mut().insert(
        CACHE_STATUS_HEADER,
        HeaderValue::from_static(response.cache_status.as_str()),
    );
    http_response
}
