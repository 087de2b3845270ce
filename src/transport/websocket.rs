//! WebSocket transport.
//!
//! Requests share one connection per endpoint. Every binary message starts
//! with a 4-byte big-endian request id that the server echoes in its reply,
//! so replies may arrive in any order:
//! ```text
//! ┌──────────────┬──────────────────┐
//! │ id uint32 BE │ envelope         │
//! └──────────────┴──────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use super::Transport;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::handler::{BoxFuture, InvokeContext};
use crate::protocol::next_request_id;

/// Requests in flight on one connection; later ones wait for a slot.
pub const MAX_IN_FLIGHT: usize = 100;

type Waiter = oneshot::Sender<Result<Bytes>>;

struct Requests {
    next_id: u32,
    closed: bool,
    waiters: HashMap<u32, Waiter>,
}

struct Connection {
    uri: Url,
    tx: mpsc::UnboundedSender<WsMessage>,
    requests: Mutex<Requests>,
    slots: Arc<Semaphore>,
}

impl Connection {
    async fn open(uri: &Url) -> Result<Arc<Self>> {
        let (ws, _) = tokio_tungstenite::connect_async(uri.as_str()).await?;
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

        let conn = Arc::new(Self {
            uri: uri.clone(),
            tx,
            requests: Mutex::new(Requests {
                next_id: 0,
                closed: false,
                waiters: HashMap::new(),
            }),
            slots: Arc::new(Semaphore::new(MAX_IN_FLIGHT)),
        });
        tracing::debug!(uri = %uri, "websocket connected");

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, WsMessage::Close(_));
                if let Err(e) = sink.send(message).await {
                    tracing::debug!(error = %e, "websocket send failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = conn.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(WsMessage::Binary(data)) => reader.deliver(data),
                    Ok(WsMessage::Close(_)) => break,
                    Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Text(_))
                    | Ok(WsMessage::Frame(_)) => {}
                    Err(e) => {
                        tracing::debug!(uri = %reader.uri, error = %e, "websocket receive failed");
                        break;
                    }
                }
            }
            reader.fail();
        });

        Ok(conn)
    }

    fn deliver(&self, data: Bytes) {
        if data.len() < 4 {
            tracing::warn!(len = data.len(), "websocket message without request id");
            return;
        }
        let id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let waiter = self.requests.lock().waiters.remove(&id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(Ok(data.slice(4..)));
            }
            None => tracing::debug!(id, "reply to unknown request"),
        }
    }

    /// Mark the connection dead and reject everything in flight.
    fn fail(&self) {
        let waiters = {
            let mut requests = self.requests.lock();
            requests.closed = true;
            std::mem::take(&mut requests.waiters)
        };
        if !waiters.is_empty() {
            tracing::debug!(uri = %self.uri, rejected = waiters.len(), "websocket closed");
        }
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(Error::ConnectionClosed));
        }
    }

    fn close(&self) {
        let _ = self.tx.send(WsMessage::Close(None));
        self.fail();
    }

    fn is_closed(&self) -> bool {
        self.requests.lock().closed
    }

    fn is_idle(&self) -> bool {
        self.requests.lock().waiters.is_empty()
    }

    async fn request(&self, payload: Bytes) -> Result<Bytes> {
        let _permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let (id, rx) = {
            let mut requests = self.requests.lock();
            if requests.closed {
                return Err(Error::ConnectionClosed);
            }
            let id = requests.next_id;
            requests.next_id = next_request_id(id);
            let (tx, rx) = oneshot::channel();
            requests.waiters.insert(id, tx);
            (id, rx)
        };
        let _guard = WaiterGuard { conn: self, id };

        let mut message = BytesMut::with_capacity(4 + payload.len());
        message.put_u32(id);
        message.extend_from_slice(&payload);
        self.tx
            .send(WsMessage::Binary(message.freeze()))
            .map_err(|_| Error::ConnectionClosed)?;

        rx.await.unwrap_or(Err(Error::ConnectionClosed))
    }
}

/// Removes the waiter of an abandoned request.
struct WaiterGuard<'a> {
    conn: &'a Connection,
    id: u32,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.conn.requests.lock().waiters.remove(&self.id);
    }
}

struct Shared {
    keep_alive: bool,
    current: Mutex<Option<Arc<Connection>>>,
    connecting: tokio::sync::Mutex<()>,
}

impl Shared {
    fn cached(&self, uri: &Url) -> Option<Arc<Connection>> {
        self.current
            .lock()
            .as_ref()
            .filter(|c| c.uri == *uri && !c.is_closed())
            .cloned()
    }

    async fn connection(&self, uri: &Url) -> Result<Arc<Connection>> {
        if let Some(conn) = self.cached(uri) {
            return Ok(conn);
        }
        let _connecting = self.connecting.lock().await;
        if let Some(conn) = self.cached(uri) {
            return Ok(conn);
        }
        let conn = Connection::open(uri).await?;
        let previous = self.current.lock().replace(conn.clone());
        if let Some(previous) = previous {
            previous.close();
        }
        Ok(conn)
    }

    fn release(&self, conn: &Arc<Connection>) {
        if self.keep_alive || !conn.is_idle() {
            return;
        }
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
            *current = None;
        }
        drop(current);
        conn.close();
    }
}

/// Transport for `ws:` and `wss:` endpoints.
pub struct WebSocketTransport {
    shared: Arc<Shared>,
}

impl WebSocketTransport {
    /// Build the transport; the connection opens on the first request.
    pub fn new(settings: &Settings) -> Self {
        Self {
            shared: Arc::new(Shared {
                keep_alive: settings.keep_alive,
                current: Mutex::new(None),
                connecting: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

impl Transport for WebSocketTransport {
    fn send_and_receive(
        &self,
        uri: &Url,
        request: Bytes,
        _ctx: &InvokeContext,
    ) -> BoxFuture<'static, Result<Bytes>> {
        let shared = self.shared.clone();
        let uri = uri.clone();
        Box::pin(async move {
            let conn = shared.connection(&uri).await?;
            let result = conn.request(request).await;
            shared.release(&conn);
            result
        })
    }

    fn close(&self) {
        let current = self.shared.current.lock().take();
        if let Some(conn) = current {
            conn.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Echo server answering each request with `R` + payload, in reverse
    /// order of every pair it receives.
    async fn spawn_server() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    let (mut sink, mut stream) = ws.split();
                    let mut held: Option<Bytes> = None;
                    while let Some(Ok(message)) = stream.next().await {
                        let WsMessage::Binary(data) = message else {
                            continue;
                        };
                        let mut reply = BytesMut::new();
                        reply.extend_from_slice(&data[..4]);
                        reply.put_u8(b'R');
                        reply.extend_from_slice(&data[4..]);
                        let reply = reply.freeze();
                        match held.take() {
                            None if &data[4..] == b"hold" => held = Some(reply),
                            None => sink.send(WsMessage::Binary(reply)).await.unwrap(),
                            Some(first) => {
                                sink.send(WsMessage::Binary(reply)).await.unwrap();
                                sink.send(WsMessage::Binary(first)).await.unwrap();
                            }
                        }
                    }
                });
            }
        });
        Url::parse(&format!("ws://{addr}/")).unwrap()
    }

    #[tokio::test]
    async fn test_request_reply() {
        let uri = spawn_server().await;
        let transport = WebSocketTransport::new(&Settings::default());
        let ctx = InvokeContext::default();

        let reply = transport
            .send_and_receive(&uri, Bytes::from_static(b"1z"), &ctx)
            .await
            .unwrap();
        assert_eq!(&reply[..], b"R1z");
    }

    #[tokio::test]
    async fn test_out_of_order_replies_are_matched_by_id() {
        let uri = spawn_server().await;
        let transport = WebSocketTransport::new(&Settings::default());
        let ctx = InvokeContext::default();

        let first = transport.send_and_receive(&uri, Bytes::from_static(b"hold"), &ctx);
        let first = tokio::spawn(first);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let second = transport
            .send_and_receive(&uri, Bytes::from_static(b"next"), &ctx)
            .await
            .unwrap();

        assert_eq!(&second[..], b"Rnext");
        assert_eq!(&first.await.unwrap().unwrap()[..], b"Rhold");
    }

    #[tokio::test]
    async fn test_close_rejects_pending() {
        let uri = spawn_server().await;
        let transport = WebSocketTransport::new(&Settings::default());
        let ctx = InvokeContext::default();

        let held = tokio::spawn(transport.send_and_receive(&uri, Bytes::from_static(b"hold"), &ctx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        transport.close();

        assert!(matches!(held.await.unwrap(), Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = WebSocketTransport::new(&Settings::default());
        let uri = Url::parse(&format!("ws://{addr}/")).unwrap();
        let err = transport
            .send_and_receive(&uri, Bytes::from_static(b"z"), &InvokeContext::default())
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
