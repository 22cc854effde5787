//! Error types for the authgate HTTP proxy layer.

use authgate_core::GateError;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, WWW_AUTHENTICATE};
use http_body_util::Full;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Errors that can occur while handling a proxied request.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Upstream target URI could not be built (maps to 400 Bad Request)
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// Connection error to upstream (maps to 502 Bad Gateway)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection refused by upstream (maps to 502 Bad Gateway)
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Upstream did not answer in time (maps to 504 Gateway Timeout)
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Client disconnected before a response could be written
    #[error("Client disconnected")]
    ClientDisconnect,

    /// The gate refused the request (400, 401, 403 or 404)
    #[error("Rejected: {0}")]
    Rejected(#[from] GateError),

    /// Decision task failed (maps to 500)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Convert error to HTTP response with appropriate status code.
    ///
    /// Bodies are generic; detail stays in the logs.
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        let (status, message) = match self {
            ProxyError::ConnectionRefused(_) | ProxyError::Connection(_) => (
                StatusCode::BAD_GATEWAY,
                "502 Bad Gateway\n\nFailed to connect to upstream server.",
            ),
            ProxyError::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "504 Gateway Timeout\n\nUpstream server did not respond in time.",
            ),
            ProxyError::InvalidUri(_) => (
                StatusCode::BAD_REQUEST,
                "400 Bad Request\n\nInvalid request URI.",
            ),
            ProxyError::ClientDisconnect => (
                StatusCode::BAD_REQUEST,
                "400 Bad Request\n\nClient disconnected.",
            ),
            ProxyError::Rejected(GateError::Unauthenticated { .. }) => (
                StatusCode::UNAUTHORIZED,
                "401 Unauthorized\n\nAuthentication required.",
            ),
            ProxyError::Rejected(GateError::PolicyDenied) => {
                (StatusCode::FORBIDDEN, "403 Forbidden\n\nAccess denied.")
            }
            ProxyError::Rejected(GateError::RouteNotFound) => {
                (StatusCode::NOT_FOUND, "404 Not Found\n")
            }
            ProxyError::Rejected(GateError::MalformedPath) => (
                StatusCode::BAD_REQUEST,
                "400 Bad Request\n\nMalformed request path.",
            ),
            ProxyError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "500 Internal Server Error\n",
            ),
        };

        let mut builder = Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "text/plain");
        if let ProxyError::Rejected(GateError::Unauthenticated { challenge }) = self {
            builder = builder.header(WWW_AUTHENTICATE, challenge.as_str());
        }

        builder
            .body(Full::new(Bytes::from(message)))
            .unwrap_or_else(|_| {
                let mut resp = Response::new(Full::new(Bytes::from("500 Internal Server Error")));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            })
    }
}

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthenticated_carries_challenge() {
        let resp = ProxyError::Rejected(GateError::Unauthenticated {
            challenge: "acsjwt".to_string(),
        })
        .to_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()[WWW_AUTHENTICATE], "acsjwt");
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ProxyError::Rejected(GateError::PolicyDenied), StatusCode::FORBIDDEN),
            (ProxyError::Rejected(GateError::RouteNotFound), StatusCode::NOT_FOUND),
            (ProxyError::Rejected(GateError::MalformedPath), StatusCode::BAD_REQUEST),
            (ProxyError::Connection("x".into()), StatusCode::BAD_GATEWAY),
            (ProxyError::ConnectionRefused("x".into()), StatusCode::BAD_GATEWAY),
            (ProxyError::Timeout("x".into()), StatusCode::GATEWAY_TIMEOUT),
            (ProxyError::InvalidUri("x".into()), StatusCode::BAD_REQUEST),
            (ProxyError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            let resp = error.to_response();
            assert_eq!(resp.status(), status, "{error}");
            assert!(!resp.headers().contains_key(WWW_AUTHENTICATE));
        }
    }
}
