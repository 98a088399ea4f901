//! Error types for the forwarding engines.

use http::{HeaderMap, StatusCode};
use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, error::ProtocolError};

/// Boxed error used at the callback and transport seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure while reaching the backend over HTTP.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend transport error: {0}")]
    Transport(#[source] BoxError),
    #[error("backend request timed out")]
    Timeout,
    #[error("too many redirects (limit {0})")]
    TooManyRedirects(usize),
    #[error("invalid redirect location: {0}")]
    InvalidRedirect(String),
}

/// Error handed to the HTTP error handler.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("response modifier failed: {0}")]
    ModifyResponse(#[source] BoxError),
}

/// The backend WebSocket dial failed before a connection was established.
#[derive(Error, Debug)]
#[error("failed to dial backend {target}: {source}")]
pub struct DialError {
    pub target: String,
    #[source]
    pub source: tungstenite::Error,
}

/// Partial HTTP response returned by a backend that refused the upgrade.
#[derive(Debug, Clone)]
pub struct RejectedHandshake {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl DialError {
    #[must_use]
    pub fn new(target: impl Into<String>, source: tungstenite::Error) -> Self {
        Self {
            target: target.into(),
            source,
        }
    }

    /// The backend's HTTP response, if it answered the handshake with one.
    #[must_use]
    pub fn response(&self) -> Option<RejectedHandshake> {
        match &self.source {
            tungstenite::Error::Http(response) => Some(RejectedHandshake {
                status: response.status(),
                headers: response.headers().clone(),
                body: response
                    .body()
                    .as_ref()
                    .map(|body| body.to_vec())
                    .unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

/// The caller's side of the WebSocket handshake was rejected.
#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error("websocket upgrade requires GET, got {0}")]
    MethodNotAllowed(http::Method),
    #[error("bad websocket handshake: {0}")]
    BadHandshake(&'static str),
    #[error("request origin not allowed")]
    OriginRejected,
    #[error("connection upgrade failed: {0}")]
    Hyper(#[from] hyper::Error),
}

impl UpgradeError {
    /// Status code sent to the caller for this rejection.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::BadHandshake(_) | Self::Hyper(_) => StatusCode::BAD_REQUEST,
            Self::OriginRejected => StatusCode::FORBIDDEN,
        }
    }
}

/// A proxy was built with a target it can never reach.
#[derive(Error, Debug)]
#[error("invalid proxy target {0:?}")]
pub struct InvalidTarget(pub String);

/// Mid-stream failure on one relay direction.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("read failed: {0}")]
    Read(#[source] tungstenite::Error),
    #[error("write failed: {0}")]
    Write(#[source] tungstenite::Error),
}

impl RelayError {
    #[must_use]
    pub const fn source_error(&self) -> &tungstenite::Error {
        match self {
            Self::Read(e) | Self::Write(e) => e,
        }
    }

    /// Whether the failure only says the connection was already shut down.
    #[must_use]
    pub const fn is_normal_closure(&self) -> bool {
        is_closed(self.source_error())
    }
}

pub(crate) const fn is_closed(err: &tungstenite::Error) -> bool {
    matches!(
        err,
        tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Protocol(ProtocolError::SendAfterClosing)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_error_classification() {
        assert!(RelayError::Read(tungstenite::Error::ConnectionClosed).is_normal_closure());
        assert!(RelayError::Write(tungstenite::Error::AlreadyClosed).is_normal_closure());
        assert!(
            !RelayError::Read(tungstenite::Error::Protocol(
                ProtocolError::ResetWithoutClosingHandshake
            ))
            .is_normal_closure()
        );
    }

    #[test]
    fn upgrade_error_status() {
        assert_eq!(
            UpgradeError::MethodNotAllowed(http::Method::POST).status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(UpgradeError::OriginRejected.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            UpgradeError::BadHandshake("missing key").status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn dial_error_without_response() {
        let err = DialError::new("ws://127.0.0.1:1", tungstenite::Error::ConnectionClosed);
        assert!(err.response().is_none());
        assert!(err.to_string().contains("ws://127.0.0.1:1"));
    }
}
