//! Half-duplex socket transport.
//!
//! One request at a time per connection: write a frame, read the reply
//! frame, return the connection to the idle list. At most `max_pool_size`
//! requests are on the wire at once; the rest wait in arrival order.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use url::Url;

use super::stream::{Connector, Endpoint, SocketStream};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::handler::{BoxFuture, InvokeContext};
use crate::protocol::{half_duplex_frame, validate_length, Header, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::transport::Transport;

struct Idle {
    endpoint: Endpoint,
    stream: SocketStream,
    since: Instant,
}

struct Shared {
    connector: Connector,
    slots: Arc<Semaphore>,
    max_pool_size: usize,
    keep_alive: bool,
    pool_timeout: Option<Duration>,
    idle: Mutex<Vec<Idle>>,
}

impl Shared {
    fn take_idle(&self, endpoint: &Endpoint) -> Option<SocketStream> {
        let mut idle = self.idle.lock();
        if let Some(timeout) = self.pool_timeout {
            idle.retain(|i| i.since.elapsed() < timeout);
        }
        let index = idle.iter().rposition(|i| i.endpoint == *endpoint)?;
        Some(idle.swap_remove(index).stream)
    }

    fn put_idle(self: &Arc<Self>, endpoint: Endpoint, stream: SocketStream) {
        if !self.keep_alive {
            return;
        }
        {
            let mut idle = self.idle.lock();
            if idle.len() >= self.max_pool_size {
                idle.remove(0);
            }
            idle.push(Idle {
                endpoint,
                stream,
                since: Instant::now(),
            });
        }
        if let Some(timeout) = self.pool_timeout {
            let shared = Arc::downgrade(self);
            tokio::spawn(sweep_after(shared, timeout));
        }
    }
}

/// Close connections idle for `timeout` or longer.
async fn sweep_after(shared: Weak<Shared>, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    if let Some(shared) = shared.upgrade() {
        let mut idle = shared.idle.lock();
        let before = idle.len();
        idle.retain(|i| i.since.elapsed() < timeout);
        if idle.len() < before {
            tracing::debug!(closed = before - idle.len(), "closed idle connections");
        }
    }
}

/// Exchange one frame pair on `stream`.
async fn exchange(stream: &mut SocketStream, request: &[u8]) -> Result<Bytes> {
    stream.write_all(&half_duplex_frame(request)).await?;
    stream.flush().await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let header = Header::decode(&head).ok_or(Error::ConnectionClosed)?;
    if header.id.is_some() {
        return Err(Error::Protocol(
            "full-duplex frame on a half-duplex connection".into(),
        ));
    }
    validate_length(header.payload_length, DEFAULT_MAX_PAYLOAD_SIZE)?;

    let mut payload = vec![0u8; header.payload_length as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

/// Transport for socket endpoints sending one request per connection at a
/// time.
pub struct HalfDuplexTransport {
    shared: Arc<Shared>,
}

impl HalfDuplexTransport {
    /// Build the transport from the client settings.
    pub fn new(settings: &Settings) -> Self {
        let max_pool_size = settings.max_pool_size.max(1);
        Self {
            shared: Arc::new(Shared {
                connector: Connector::new(settings.no_delay),
                slots: Arc::new(Semaphore::new(max_pool_size)),
                max_pool_size,
                keep_alive: settings.keep_alive,
                pool_timeout: settings.pool_timeout(),
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connections currently parked in the idle list.
    pub fn idle_count(&self) -> usize {
        self.shared.idle.lock().len()
    }
}

impl Transport for HalfDuplexTransport {
    fn send_and_receive(
        &self,
        uri: &Url,
        request: Bytes,
        _ctx: &InvokeContext,
    ) -> BoxFuture<'static, Result<Bytes>> {
        let shared = self.shared.clone();
        let endpoint = Endpoint::parse(uri);
        Box::pin(async move {
            let endpoint = endpoint?;
            let _permit = shared
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::ConnectionClosed)?;

            let mut stream = match shared.take_idle(&endpoint) {
                Some(stream) => stream,
                None => shared.connector.connect(&endpoint).await?,
            };
            // A failed or abandoned exchange drops the connection.
            let response = exchange(&mut stream, &request).await?;
            shared.put_idle(endpoint, stream);
            Ok(response)
        })
    }

    fn close(&self) {
        self.shared.idle.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};

    /// Server answering each frame with `R` + payload after `delay`.
    async fn spawn_server(delay: Duration) -> (Url, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let busy = Arc::new(AtomicUsize::new(0));

        let (accepted_c, peak_c) = (accepted.clone(), peak.clone());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accepted_c.fetch_add(1, Ordering::SeqCst);
                let (peak, busy) = (peak_c.clone(), busy.clone());
                tokio::spawn(serve(socket, delay, peak, busy));
            }
        });
        (
            Url::parse(&format!("tcp://127.0.0.1:{}", addr.port())).unwrap(),
            accepted,
            peak,
        )
    }

    async fn serve(mut socket: TcpStream, delay: Duration, peak: Arc<AtomicUsize>, busy: Arc<AtomicUsize>) {
        loop {
            let mut head = [0u8; 4];
            if socket.read_exact(&mut head).await.is_err() {
                return;
            }
            let mut payload = vec![0u8; u32::from_be_bytes(head) as usize];
            socket.read_exact(&mut payload).await.unwrap();

            let now = busy.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            busy.fetch_sub(1, Ordering::SeqCst);

            let mut reply = b"R".to_vec();
            reply.extend_from_slice(&payload);
            socket.write_all(&half_duplex_frame(&reply)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_connection_is_reused() {
        let (uri, accepted, _) = spawn_server(Duration::ZERO).await;
        let transport = HalfDuplexTransport::new(&Settings::default());
        let ctx = InvokeContext::default();

        for _ in 0..3 {
            let reply = transport
                .send_and_receive(&uri, Bytes::from_static(b"1z"), &ctx)
                .await
                .unwrap();
            assert_eq!(&reply[..], b"R1z");
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(transport.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let (uri, accepted, peak) = spawn_server(Duration::from_millis(50)).await;
        let settings = Settings {
            max_pool_size: 2,
            ..Settings::default()
        };
        let transport = HalfDuplexTransport::new(&settings);
        let ctx = InvokeContext::default();

        let calls: Vec<_> = (0..3)
            .map(|_| tokio::spawn(transport.send_and_receive(&uri, Bytes::from_static(b"z"), &ctx)))
            .collect();
        for call in calls {
            assert_eq!(&call.await.unwrap().unwrap()[..], b"Rz");
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_without_keep_alive_connections_are_not_pooled() {
        let (uri, accepted, _) = spawn_server(Duration::ZERO).await;
        let settings = Settings {
            keep_alive: false,
            ..Settings::default()
        };
        let transport = HalfDuplexTransport::new(&settings);
        let ctx = InvokeContext::default();

        for _ in 0..2 {
            transport
                .send_and_receive(&uri, Bytes::from_static(b"z"), &ctx)
                .await
                .unwrap();
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(transport.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_connection_expires() {
        let (uri, _, _) = spawn_server(Duration::ZERO).await;
        let settings = Settings {
            pool_timeout: 30,
            ..Settings::default()
        };
        let transport = HalfDuplexTransport::new(&settings);
        transport
            .send_and_receive(&uri, Bytes::from_static(b"z"), &InvokeContext::default())
            .await
            .unwrap();
        assert_eq!(transport.idle_count(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HalfDuplexTransport::new(&Settings::default());
        let uri = Url::parse(&format!("tcp://127.0.0.1:{port}")).unwrap();
        let err = transport
            .send_and_receive(&uri, Bytes::from_static(b"z"), &InvokeContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
