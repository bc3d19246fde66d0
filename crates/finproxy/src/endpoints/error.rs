use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use finproxy_service::proxy::ProxyError;
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};

/// An error returned from a web handler.
///
/// The client sees `message`. Server errors additionally report the full `err` chain to sentry.
#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    message: String,
    err: anyhow::Error,
}

impl From<ProxyError> for ResponseError {
    fn from(err: ProxyError) -> Self {
        let status = if err.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        Self {
            status,
            message: err.user_message(),
            err: err.into(),
        }
    }
}

impl From<serde_json::Error> for ResponseError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: err.to_string(),
            err: err.into(),
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        let body = ApiErrorResponse {
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

/// An error response from the api.
///
/// The message lives under the `error` key, which is where the dashboard looks for it.
#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Eq)]
pub struct ApiErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use finproxy_service::download::FetchError;
    use finproxy_service::proxy::InputError;

    use super::*;

    #[test]
    fn test_status_codes() {
        let err = ResponseError::from(ProxyError::from(InputError::Malformed));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Invalid URL format");

        let err = ResponseError::from(ProxyError::FetchFailed(FetchError::ConnectionReset(
            "connection reset by peer".into(),
        )));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "Connection reset - API may be rate limiting");
    }

    #[test]
    fn test_json_error() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = ResponseError::from(err);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        insta::assert_snapshot!(err.message, @"EOF while parsing an object at line 1 column 1");
    }
}
