//! Connected socket, plain or encrypted.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use url::{Host, Url};

use crate::error::{Error, Result};

/// Address family an endpoint scheme restricts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Any,
    V4,
    V6,
}

/// How to reach one socket endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Endpoint {
    host: String,
    port: u16,
    family: Family,
    tls: bool,
}

impl Endpoint {
    pub(crate) fn parse(uri: &Url) -> Result<Self> {
        let (family, tls) = match uri.scheme() {
            "tcp" => (Family::Any, false),
            "tcp4" => (Family::V4, false),
            "tcp6" => (Family::V6, false),
            "tcps" | "tls" => (Family::Any, true),
            "tcp4s" => (Family::V4, true),
            "tcp6s" => (Family::V6, true),
            other => return Err(Error::UnsupportedScheme(format!("{other}:"))),
        };
        let host = match uri.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(Error::InvalidUri(uri.to_string())),
        };
        let port = uri
            .port()
            .ok_or_else(|| Error::InvalidUri(format!("{uri} has no port")))?;
        Ok(Self {
            host,
            port,
            family,
            tls,
        })
    }

    fn accepts(&self, addr: &SocketAddr) -> bool {
        match self.family {
            Family::Any => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

/// Opens connections, sharing one TLS configuration.
pub(crate) struct Connector {
    no_delay: bool,
    tls: Mutex<Option<TlsConnector>>,
}

impl Connector {
    pub(crate) fn new(no_delay: bool) -> Self {
        Self {
            no_delay,
            tls: Mutex::new(None),
        }
    }

    fn tls_connector(&self) -> Result<TlsConnector> {
        let mut tls = self.tls.lock();
        if let Some(connector) = tls.as_ref() {
            return Ok(connector.clone());
        }
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        *tls = Some(connector.clone());
        Ok(connector)
    }

    /// Resolve `endpoint` and connect to the first address that answers.
    pub(crate) async fn connect(&self, endpoint: &Endpoint) -> Result<SocketStream> {
        let mut last_error = None;
        let addrs = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port)).await?;
        let mut stream = None;
        for addr in addrs.filter(|a| endpoint.accepts(a)) {
            match TcpStream::connect(addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }
        let stream = match (stream, last_error) {
            (Some(stream), _) => stream,
            (None, Some(e)) => return Err(e.into()),
            (None, None) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no {:?} address for {}", endpoint.family, endpoint.host),
                )))
            }
        };
        stream.set_nodelay(self.no_delay)?;

        if !endpoint.tls {
            return Ok(SocketStream::Plain(stream));
        }
        let name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| Error::Tls(e.to_string()))?;
        let tls = self
            .tls_connector()?
            .connect(name, stream)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(SocketStream::Tls(Box::new(tls)))
    }
}

/// A connected socket.
pub(crate) enum SocketStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for SocketStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            SocketStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SocketStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            SocketStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SocketStream::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            SocketStream::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            SocketStream::Plain(s) => s.is_write_vectored(),
            SocketStream::Tls(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketStream::Plain(s) => Pin::new(s).poll_flush(cx),
            SocketStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            SocketStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
