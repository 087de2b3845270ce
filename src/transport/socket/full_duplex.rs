//! Full-duplex socket transport.
//!
//! Requests are multiplexed over pooled connections by correlation id.
//! Each connection carries at most [`MAX_IN_FLIGHT`] requests; up to
//! `max_pool_size` connections are opened before new requests wait for a
//! free slot.
//!
//! ```text
//! send_and_receive ─► checkout ─► Conn ─► WriterHandle ─► writer task ─► socket
//!                                  ▲                                        │
//!                                  └──────── reader task (FrameBuffer) ◄────┘
//! ```

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{oneshot, Notify};
use tokio::task::AbortHandle;
use url::Url;

use super::stream::{Connector, Endpoint};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::handler::{BoxFuture, InvokeContext};
use crate::protocol::{next_request_id, FrameBuffer};
use crate::transport::Transport;
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Requests in flight on one connection.
pub const MAX_IN_FLIGHT: usize = 10;

const READ_BUFFER_SIZE: usize = 64 * 1024;

type Waiter = oneshot::Sender<Result<Bytes>>;

struct ConnState {
    next_id: u32,
    closed: bool,
    in_flight: usize,
    last_used: Instant,
    waiters: HashMap<u32, Waiter>,
}

struct Conn {
    endpoint: Endpoint,
    writer: WriterHandle,
    state: Mutex<ConnState>,
    reader: Mutex<Option<AbortHandle>>,
}

impl Conn {
    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    fn reserve(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.in_flight >= MAX_IN_FLIGHT {
            return false;
        }
        state.in_flight += 1;
        true
    }

    /// Free a slot; true when the connection became idle.
    fn release(&self) -> bool {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.last_used = Instant::now();
        state.in_flight == 0 && !state.closed
    }

    fn idle_for(&self) -> Option<Duration> {
        let state = self.state.lock();
        (state.in_flight == 0 && !state.closed).then(|| state.last_used.elapsed())
    }

    fn deliver(&self, id: u32, payload: Bytes) {
        let waiter = self.state.lock().waiters.remove(&id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(Ok(payload));
            }
            None => tracing::debug!(id, "reply to unknown request"),
        }
    }

    /// Mark closed, stop the reader and reject everything in flight.
    fn shutdown(&self) {
        let waiters = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.waiters)
        };
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(Error::ConnectionClosed));
        }
    }

    async fn request(&self, payload: Bytes) -> Result<Bytes> {
        let (id, rx) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::ConnectionClosed);
            }
            let id = state.next_id;
            state.next_id = next_request_id(id);
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(id, tx);
            (id, rx)
        };
        let _guard = WaiterGuard { conn: self, id };

        self.writer.send(OutboundFrame::new(Some(id), payload)).await?;
        rx.await.unwrap_or(Err(Error::ConnectionClosed))
    }
}

/// Removes the waiter of an abandoned request.
struct WaiterGuard<'a> {
    conn: &'a Conn,
    id: u32,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.conn.state.lock().waiters.remove(&self.id);
    }
}

async fn read_loop<R>(conn: &Conn, mut reader: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        for frame in frames.push(&buf[..n])? {
            match frame.id() {
                Some(id) => conn.deliver(id, frame.payload),
                None => {
                    return Err(Error::Protocol(
                        "half-duplex frame on a full-duplex connection".into(),
                    ))
                }
            }
        }
    }
}

#[derive(Default)]
struct Pool {
    conns: Vec<Arc<Conn>>,
    /// Endpoints of connections being opened.
    opening: Vec<Endpoint>,
}

impl Pool {
    fn opened(&mut self, endpoint: &Endpoint) {
        if let Some(i) = self.opening.iter().position(|e| e == endpoint) {
            self.opening.swap_remove(i);
        }
    }
}

enum Checkout {
    Ready(InFlight),
    Open,
    Wait,
}

struct Shared {
    connector: Connector,
    max_pool_size: usize,
    keep_alive: bool,
    pool_timeout: Option<Duration>,
    pool: Mutex<Pool>,
    notify: Notify,
}

impl Shared {
    async fn checkout(self: &Arc<Self>, endpoint: &Endpoint) -> Result<InFlight> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            match self.try_checkout(endpoint) {
                Checkout::Ready(in_flight) => return Ok(in_flight),
                Checkout::Open => return self.open(endpoint).await,
                Checkout::Wait => notified.await,
            }
        }
    }

    fn try_checkout(self: &Arc<Self>, endpoint: &Endpoint) -> Checkout {
        let evicted = {
            let mut pool = self.pool.lock();
            pool.conns.retain(|c| !c.is_closed());

            let best = pool
                .conns
                .iter()
                .filter(|c| c.endpoint == *endpoint)
                .map(|c| (c.in_flight(), c))
                .filter(|(n, _)| *n < MAX_IN_FLIGHT)
                .min_by_key(|(n, _)| *n)
                .map(|(_, c)| c.clone());
            if let Some(conn) = best {
                if conn.reserve() {
                    return Checkout::Ready(InFlight {
                        shared: self.clone(),
                        conn,
                    });
                }
            }

            // One connection per endpoint opens at a time; later requests
            // wait to share it.
            if pool.opening.contains(endpoint) {
                return Checkout::Wait;
            }
            if pool.conns.len() + pool.opening.len() < self.max_pool_size {
                pool.opening.push(endpoint.clone());
                return Checkout::Open;
            }

            // Make room by dropping an idle connection to another endpoint.
            let Some(index) = pool
                .conns
                .iter()
                .position(|c| c.endpoint != *endpoint && c.in_flight() == 0)
            else {
                return Checkout::Wait;
            };
            pool.opening.push(endpoint.clone());
            pool.conns.remove(index)
        };
        evicted.shutdown();
        Checkout::Open
    }

    async fn open(self: &Arc<Self>, endpoint: &Endpoint) -> Result<InFlight> {
        let mut opening = Opening {
            shared: self,
            endpoint,
            done: false,
        };
        let stream = self.connector.connect(endpoint).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, mut writer_task) = spawn_writer_task(write_half);

        let conn = Arc::new(Conn {
            endpoint: endpoint.clone(),
            writer,
            state: Mutex::new(ConnState {
                next_id: 0,
                closed: false,
                in_flight: 1,
                last_used: Instant::now(),
                waiters: HashMap::new(),
            }),
            reader: Mutex::new(None),
        });

        let reader_conn = conn.clone();
        let shared = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            let outcome = tokio::select! {
                r = read_loop(&reader_conn, read_half) => r,
                w = &mut writer_task => match w {
                    Ok(Err(e)) => Err(e),
                    _ => Err(Error::ConnectionClosed),
                },
            };
            if let Err(e) = outcome {
                tracing::debug!(error = %e, "socket connection closed");
            }
            match shared.upgrade() {
                Some(shared) => shared.discard(&reader_conn),
                None => reader_conn.shutdown(),
            }
        });
        *conn.reader.lock() = Some(reader.abort_handle());
        tracing::debug!(endpoint = ?endpoint, "socket connected");

        {
            let mut pool = self.pool.lock();
            pool.opened(endpoint);
            pool.conns.push(conn.clone());
        }
        opening.done = true;
        self.notify.notify_waiters();
        Ok(InFlight {
            shared: self.clone(),
            conn,
        })
    }

    fn discard(&self, conn: &Arc<Conn>) {
        conn.shutdown();
        self.pool.lock().conns.retain(|c| !Arc::ptr_eq(c, conn));
        self.notify.notify_waiters();
    }

    fn on_idle(self: &Arc<Self>, conn: &Arc<Conn>) {
        if !self.keep_alive {
            self.discard(conn);
            return;
        }
        let Some(timeout) = self.pool_timeout else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let shared = Arc::downgrade(self);
        let conn = Arc::downgrade(conn);
        runtime.spawn(close_if_idle(shared, conn, timeout));
    }

    fn close_all(&self) {
        let conns = std::mem::take(&mut self.pool.lock().conns);
        for conn in conns {
            conn.shutdown();
        }
        self.notify.notify_waiters();
    }
}

async fn close_if_idle(shared: Weak<Shared>, conn: Weak<Conn>, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let (Some(shared), Some(conn)) = (shared.upgrade(), conn.upgrade()) else {
        return;
    };
    if conn.idle_for().is_some_and(|idle| idle >= timeout) {
        tracing::debug!(endpoint = ?conn.endpoint, "closing idle connection");
        shared.discard(&conn);
    }
}

/// Undoes the reservation of a connection that failed to open.
struct Opening<'a> {
    shared: &'a Shared,
    endpoint: &'a Endpoint,
    done: bool,
}

impl Drop for Opening<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.shared.pool.lock().opened(self.endpoint);
            self.shared.notify.notify_waiters();
        }
    }
}

/// One reserved request slot on a connection.
struct InFlight {
    shared: Arc<Shared>,
    conn: Arc<Conn>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.conn.release() {
            self.shared.on_idle(&self.conn);
        }
        self.shared.notify.notify_waiters();
    }
}

/// Transport for socket endpoints multiplexing requests by correlation id.
pub struct FullDuplexTransport {
    shared: Arc<Shared>,
}

impl FullDuplexTransport {
    /// Build the transport from the client settings.
    pub fn new(settings: &Settings) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector: Connector::new(settings.no_delay),
                max_pool_size: settings.max_pool_size.max(1),
                keep_alive: settings.keep_alive,
                pool_timeout: settings.pool_timeout(),
                pool: Mutex::new(Pool::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Open connections.
    pub fn connection_count(&self) -> usize {
        self.shared
            .pool
            .lock()
            .conns
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }
}

impl Transport for FullDuplexTransport {
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
            let in_flight = shared.checkout(&endpoint).await?;
            in_flight.conn.request(request).await
        })
    }

    fn close(&self) {
        self.shared.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::full_duplex_frame;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    /// Server echoing `R` + payload; a payload of `hold` is answered only
    /// after the next request, so replies come back out of order.
    async fn spawn_server() -> (Url, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket));
            }
        });
        (
            Url::parse(&format!("tcp://127.0.0.1:{}", addr.port())).unwrap(),
            accepted,
        )
    }

    async fn serve(socket: TcpStream) {
        let (mut read, mut write) = socket.into_split();
        let mut frames = FrameBuffer::new();
        let mut held: Option<Vec<u8>> = None;
        let mut buf = vec![0u8; 4096];
        loop {
            let n = match read.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            for frame in frames.push(&buf[..n]).unwrap() {
                let mut reply = b"R".to_vec();
                reply.extend_from_slice(frame.payload());
                let bytes = full_duplex_frame(frame.id().unwrap(), &reply);
                if frame.payload() == b"hold" {
                    held = Some(bytes);
                    continue;
                }
                write.write_all(&bytes).await.unwrap();
                if let Some(first) = held.take() {
                    write.write_all(&first).await.unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn test_replies_matched_by_id() {
        let (uri, accepted) = spawn_server().await;
        let transport = FullDuplexTransport::new(&Settings::default());
        let ctx = InvokeContext::default();

        let held = tokio::spawn(transport.send_and_receive(&uri, Bytes::from_static(b"hold"), &ctx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let next = transport
            .send_and_receive(&uri, Bytes::from_static(b"next"), &ctx)
            .await
            .unwrap();

        assert_eq!(&next[..], b"Rnext");
        assert_eq!(&held.await.unwrap().unwrap()[..], b"Rhold");
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_opened_past_in_flight_limit() {
        let (uri, _) = spawn_server().await;
        let transport = FullDuplexTransport::new(&Settings::default());
        let ctx = InvokeContext::default();

        // Held requests never complete on their own.
        let held: Vec<_> = (0..MAX_IN_FLIGHT + 1)
            .map(|_| tokio::spawn(transport.send_and_receive(&uri, Bytes::from_static(b"hold"), &ctx)))
            .collect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.connection_count(), 2);

        transport.close();
        for call in held {
            assert!(call.await.unwrap().is_err());
        }
    }

    #[tokio::test]
    async fn test_abandoned_request_frees_slot() {
        let (uri, _) = spawn_server().await;
        let settings = Settings {
            max_pool_size: 1,
            ..Settings::default()
        };
        let transport = FullDuplexTransport::new(&settings);
        let ctx = InvokeContext::default();

        for _ in 0..MAX_IN_FLIGHT {
            let held = transport.send_and_receive(&uri, Bytes::from_static(b"hold"), &ctx);
            let _ = tokio::time::timeout(Duration::from_millis(10), held).await;
        }
        let reply = tokio::time::timeout(
            Duration::from_secs(1),
            transport.send_and_receive(&uri, Bytes::from_static(b"1"), &ctx),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&reply[..], b"R1");
    }

    #[tokio::test]
    async fn test_server_close_rejects_pending() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
        });

        let transport = FullDuplexTransport::new(&Settings::default());
        let uri = Url::parse(&format!("tcp://127.0.0.1:{port}")).unwrap();
        let err = transport
            .send_and_receive(&uri, Bytes::from_static(b"z"), &InvokeContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert_eq!(transport.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_connection_closed_after_pool_timeout() {
        let (uri, _) = spawn_server().await;
        let settings = Settings {
            pool_timeout: 30,
            ..Settings::default()
        };
        let transport = FullDuplexTransport::new(&settings);
        transport
            .send_and_receive(&uri, Bytes::from_static(b"z"), &InvokeContext::default())
            .await
            .unwrap();
        assert_eq!(transport.connection_count(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.connection_count(), 0);
    }
}
