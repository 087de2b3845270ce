//! Error types for hprose-client.

use std::sync::Arc;

use thiserror::Error;

/// Main error type for all hprose operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading settings.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed stream: unexpected tag, truncated input, unknown class index.
    #[error("{0}")]
    Protocol(String),

    /// The value cannot be encoded with the current writer settings.
    #[error("{0}")]
    Serialize(String),

    /// Error envelope returned by the server.
    #[error("{0}")]
    Server(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP response with a status other than 200.
    #[error("{0}")]
    HttpStatus(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// TLS setup or handshake error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The call did not settle within its timeout.
    #[error("timeout")]
    Timeout,

    /// Connection closed before the response arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// Endpoint URI could not be parsed.
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// No transport exists for the endpoint scheme.
    #[error("The {0} client isn't implemented.")]
    UnsupportedScheme(String),

    /// Endpoints of different protocol families were configured together.
    #[error("Not support multiple protocol.")]
    MixedSchemes,

    /// The client dropped the call before it settled.
    #[error("call canceled")]
    Canceled,

    /// One failure delivered to several calls, such as a failed batch.
    #[error("{0}")]
    Shared(Arc<Error>),
}

impl Error {
    /// Whether the error happened while moving bytes, which makes the call
    /// eligible for retry and fail-switch.
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::HttpStatus(_)
            | Error::WebSocket(_)
            | Error::Tls(_)
            | Error::Timeout
            | Error::ConnectionClosed => true,
            Error::Http(e) => !e.is_builder(),
            Error::Shared(inner) => inner.is_transport(),
            _ => false,
        }
    }

    /// Build an unexpected-tag protocol error.
    pub(crate) fn unexpected_tag(found: Option<u8>, expected: Option<&[u8]>) -> Self {
        use crate::codec::tags::tag_name;

        match (found, expected) {
            (Some(tag), Some(expected)) if !expected.is_empty() => {
                let expected: String = expected.iter().map(|&t| tag_name(t)).collect();
                Error::Protocol(format!(
                    "Tag \"{expected}\" expected, but \"{}\" found in stream",
                    tag_name(tag)
                ))
            }
            (Some(tag), _) => Error::Protocol(format!(
                "Unexpected serialize tag \"{}\" in stream",
                tag_name(tag)
            )),
            (None, _) => Error::Protocol("No byte found in stream".to_string()),
        }
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
