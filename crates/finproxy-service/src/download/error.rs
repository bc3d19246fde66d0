use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// An error that happens when fetching a JSON document from an upstream API.
///
/// The error is cheap to clone, as one outcome is shared between every caller waiting on the
/// same in-flight fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The upstream answered with a non-success status code.
    ///
    /// A `429` status only ends up here once the retry budget is exhausted.
    #[error("API returned status {status}: {reason}")]
    Status { status: u16, reason: String },
    /// A single attempt did not complete within its timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// No connection could be established within the connect timeout.
    #[error("connection timed out: {0}")]
    ConnectTimeout(String),
    /// The upstream reset or aborted the connection.
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    /// Any other transport level problem, like DNS resolution or a refused connection.
    #[error("{0}")]
    Network(String),
    /// The upstream answered successfully, but the body is not JSON.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The fetch task panicked or was cancelled by a runtime shutdown.
    #[error("internal error")]
    InternalError,
}

impl FetchError {
    /// Whether this is a transport failure that may resolve by trying again.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::ConnectTimeout(_) | Self::ConnectionReset(_) | Self::Network(_)
        )
    }

    /// Whether the upstream asked us to slow down.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Status { status: 429, .. })
    }

    /// A short, static name for this error used in metric tags.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Status { status: 429, .. } => "ratelimited",
            Self::Status { .. } => "status",
            Self::Timeout(_) => "timeout",
            Self::ConnectTimeout(_) => "connecttimeout",
            Self::ConnectionReset(_) => "connectionreset",
            Self::Network(_) => "network",
            Self::Malformed(_) => "malformed",
            Self::InternalError => "internalerror",
        }
    }

    fn from_transport_error(error: &(dyn StdError + 'static), is_timeout: bool) -> Self {
        let mut innermost = error;
        let mut is_reset = false;

        let mut current = Some(error);
        while let Some(err) = current {
            if let Some(io_err) = err.downcast_ref::<io::Error>() {
                is_reset |= matches!(
                    io_err.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
                );
            }
            innermost = err;
            current = err.source();
        }

        let message = innermost.to_string();
        let lowercase = message.to_lowercase();

        if is_reset || lowercase.contains("connection reset") || lowercase.contains("econnreset") {
            Self::ConnectionReset(message)
        } else if is_timeout || lowercase.contains("timed out") {
            Self::ConnectTimeout(message)
        } else {
            Self::Network(message)
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        let is_timeout = error.is_timeout();
        Self::from_transport_error(&error, is_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("error sending request")]
    struct Outer(#[source] io::Error);

    #[test]
    fn test_classify_reset() {
        let err = Outer(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "peer went away",
        ));
        let err = FetchError::from_transport_error(&err, false);
        assert_eq!(err, FetchError::ConnectionReset("peer went away".into()));
        assert!(err.is_network());
    }

    #[test]
    fn test_classify_reset_by_message() {
        let err = Outer(io::Error::other("read ECONNRESET"));
        let err = FetchError::from_transport_error(&err, false);
        assert_eq!(err, FetchError::ConnectionReset("read ECONNRESET".into()));
    }

    #[test]
    fn test_classify_connect_timeout() {
        let err = Outer(io::Error::new(io::ErrorKind::TimedOut, "operation timed out"));
        let err = FetchError::from_transport_error(&err, true);
        assert_eq!(
            err,
            FetchError::ConnectTimeout("operation timed out".into())
        );
    }

    #[test]
    fn test_classify_generic() {
        let err = Outer(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "Connection refused (os error 111)",
        ));
        let err = FetchError::from_transport_error(&err, false);
        assert_eq!(
            err,
            FetchError::Network("Connection refused (os error 111)".into())
        );
    }

    #[test]
    fn test_status_display() {
        let err = FetchError::Status {
            status: 404,
            reason: "Not Found".into(),
        };
        assert_eq!(err.to_string(), "API returned status 404: Not Found");
        assert!(!err.is_network());
        assert!(!err.is_rate_limited());

        let err = FetchError::Status {
            status: 429,
            reason: "Too Many Requests".into(),
        };
        assert!(err.is_rate_limited());
        assert_eq!(err.metrics_tag(), "ratelimited");
    }
}
