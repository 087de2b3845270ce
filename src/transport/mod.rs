//! Transport module - moving request bytes to an endpoint and back.
//!
//! Provides:
//! - [`HttpTransport`] - `http:` / `https:` (reqwest)
//! - [`WebSocketTransport`] - `ws:` / `wss:` (tokio-tungstenite)
//! - [`HalfDuplexTransport`] / [`FullDuplexTransport`] - `tcp:` family,
//!   optionally over TLS (tokio-rustls)
//!
//! The engine owns timeouts, retries and endpoint rotation; a transport
//! only has to deliver one request and return the matching response.

mod http;
pub mod socket;
mod websocket;

pub use http::HttpTransport;
pub use socket::{FullDuplexTransport, HalfDuplexTransport};
pub use websocket::WebSocketTransport;

use std::sync::Arc;

use bytes::Bytes;
use url::Url;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::handler::{BoxFuture, InvokeContext};

/// Sends one request and yields its response.
pub trait Transport: Send + Sync + 'static {
    /// Deliver `request` to `uri` and resolve with the response bytes.
    ///
    /// Dropping the returned future abandons the request; implementations
    /// release whatever the request held (pending entries, pooled
    /// connections) when that happens.
    fn send_and_receive(
        &self,
        uri: &Url,
        request: Bytes,
        ctx: &InvokeContext,
    ) -> BoxFuture<'static, Result<Bytes>>;

    /// Close every connection held by the transport.
    fn close(&self) {}
}

/// Protocol family of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `http:`, `https:`
    Http,
    /// `ws:`, `wss:`
    WebSocket,
    /// `tcp:`, `tcp4:`, `tcp6:`, `tcps:`, `tcp4s:`, `tcp6s:`, `tls:`
    Socket,
}

impl Scheme {
    /// Family of `uri`.
    pub fn of(uri: &Url) -> Result<Self> {
        match uri.scheme() {
            "http" | "https" => Ok(Scheme::Http),
            "ws" | "wss" => Ok(Scheme::WebSocket),
            "tcp" | "tcp4" | "tcp6" | "tcps" | "tcp4s" | "tcp6s" | "tls" => Ok(Scheme::Socket),
            other => Err(Error::UnsupportedScheme(format!("{other}:"))),
        }
    }
}

/// Parse an endpoint list that must share one protocol family.
pub fn parse_endpoints<S: AsRef<str>>(uris: &[S]) -> Result<(Scheme, Vec<Url>)> {
    let urls = uris
        .iter()
        .map(|uri| Url::parse(uri.as_ref()).map_err(|_| Error::InvalidUri(uri.as_ref().to_string())))
        .collect::<Result<Vec<_>>>()?;

    let mut scheme = None;
    for url in &urls {
        let this = Scheme::of(url)?;
        match scheme {
            None => scheme = Some(this),
            Some(s) if s != this => return Err(Error::MixedSchemes),
            Some(_) => {}
        }
    }
    let scheme = scheme.ok_or_else(|| Error::InvalidUri("You should set server uri first!".into()))?;
    Ok((scheme, urls))
}

/// Build the transport serving `scheme`.
pub fn for_scheme(scheme: Scheme, settings: &Settings) -> Result<Arc<dyn Transport>> {
    Ok(match scheme {
        Scheme::Http => Arc::new(HttpTransport::new(settings)?),
        Scheme::WebSocket => Arc::new(WebSocketTransport::new(settings)),
        Scheme::Socket if settings.full_duplex => Arc::new(FullDuplexTransport::new(settings)),
        Scheme::Socket => Arc::new(HalfDuplexTransport::new(settings)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_detection() {
        let (scheme, urls) =
            parse_endpoints(&["tcp://127.0.0.1:4321", "tls://example.com:4321"]).unwrap();
        assert_eq!(scheme, Scheme::Socket);
        assert_eq!(urls.len(), 2);

        let (scheme, _) = parse_endpoints(&["wss://example.com/rpc"]).unwrap();
        assert_eq!(scheme, Scheme::WebSocket);
    }

    #[test]
    fn test_unsupported_scheme() {
        let err = parse_endpoints(&["ftp://example.com/"]).unwrap_err();
        assert_eq!(err.to_string(), "The ftp: client isn't implemented.");
    }

    #[test]
    fn test_mixed_schemes() {
        let err = parse_endpoints(&["http://a/", "tcp://b:1"]).unwrap_err();
        assert!(matches!(err, Error::MixedSchemes));
    }

    #[test]
    fn test_empty_and_invalid() {
        let none: [&str; 0] = [];
        assert!(matches!(parse_endpoints(&none), Err(Error::InvalidUri(_))));
        assert!(matches!(parse_endpoints(&["not a uri"]), Err(Error::InvalidUri(_))));
    }
}
