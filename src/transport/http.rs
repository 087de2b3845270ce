//! HTTP transport: one POST per request.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use url::Url;

use super::Transport;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::handler::{BoxFuture, InvokeContext};

const TEXT_CONTENT_TYPE: &str = "text/plain; charset=UTF-8";

/// Transport for `http:` and `https:` endpoints.
pub struct HttpTransport {
    client: reqwest::Client,
    headers: HeaderMap,
}

impl HttpTransport {
    /// Build the transport from the client settings.
    ///
    /// Header names or values that are not valid HTTP are rejected, and a
    /// `Content-Type` header is ignored.
    pub fn new(settings: &Settings) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if !settings.keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }
        let client = builder.build()?;

        let mut headers = HeaderMap::new();
        for (name, value) in &settings.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Protocol(format!("invalid header name {name}: {e}")))?;
            if name == CONTENT_TYPE {
                continue;
            }
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Protocol(format!("invalid value for header {name}: {e}")))?;
            headers.append(name, value);
        }

        Ok(Self { client, headers })
    }
}

impl Transport for HttpTransport {
    fn send_and_receive(
        &self,
        uri: &Url,
        request: Bytes,
        ctx: &InvokeContext,
    ) -> BoxFuture<'static, Result<Bytes>> {
        let mut builder = self
            .client
            .post(uri.clone())
            .headers(self.headers.clone())
            .body(request);
        if !ctx.binary {
            builder = builder.header(CONTENT_TYPE, TEXT_CONTENT_TYPE);
        }
        if let Some(timeout) = ctx.timeout() {
            builder = builder.timeout(timeout);
        }

        Box::pin(async move {
            let response = builder.send().await?;
            let status = response.status();
            if status != StatusCode::OK {
                return Err(Error::HttpStatus(format!(
                    "{}:{}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("")
                )));
            }
            Ok(response.bytes().await?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one connection, capture the request head and answer with `reply`.
    async fn serve_once(reply: &'static str) -> (Url, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut received = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    if text[head_end + 4..].ends_with('z') {
                        break;
                    }
                }
            }
            socket.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).into_owned()
        });
        (Url::parse(&format!("http://{addr}/rpc")).unwrap(), task)
    }

    #[tokio::test]
    async fn test_post_with_headers() {
        let (uri, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nR1z\n",
        )
        .await;

        let mut settings = Settings::default();
        settings.headers.insert("X-Token".into(), "secret".into());
        settings.headers.insert("Content-Type".into(), "ignored/type".into());
        let transport = HttpTransport::new(&settings).unwrap();

        let reply = transport
            .send_and_receive(&uri, Bytes::from_static(b"Cs1\"f\"z"), &InvokeContext::default())
            .await
            .unwrap();
        assert_eq!(&reply[..], b"R1z\n");

        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with("post /rpc"));
        assert!(request.contains("x-token: secret"));
        assert!(request.contains("content-type: text/plain; charset=utf-8"));
        assert!(!request.contains("ignored/type"));
    }

    #[tokio::test]
    async fn test_non_200_is_an_error() {
        let (uri, _server) = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let transport = HttpTransport::new(&Settings::default()).unwrap();

        let err = transport
            .send_and_receive(&uri, Bytes::from_static(b"z"), &InvokeContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "503:Service Unavailable");
        assert!(err.is_transport());
    }
}
