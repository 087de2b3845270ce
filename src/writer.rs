//! Dedicated writer task for socket connections.
//!
//! Callers hand frames to the task over an mpsc channel. The task owns the
//! write half of the connection and batches whatever is queued into single
//! vectored writes, so concurrent requests on a full-duplex connection
//! never contend on a lock.
//!
//! ```text
//! Call 1 ─┐
//! Call 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► socket
//! Call N ─┘
//! ```

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::{Header, MAX_HEADER_SIZE};

/// Channel capacity of the frame queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Encoded header; only the first `header_len` bytes are sent.
    pub header: [u8; MAX_HEADER_SIZE],
    /// Header length (4 half-duplex, 8 full-duplex).
    pub header_len: usize,
    /// Request envelope.
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Create a frame, taking the length from `payload`.
    #[inline]
    pub fn new(id: Option<u32>, payload: Bytes) -> Self {
        let length = payload.len() as u32;
        let header = match id {
            Some(id) => Header::full_duplex(id, length),
            None => Header::half_duplex(length),
        };
        Self {
            header: header.encode(),
            header_len: header.size(),
            payload,
        }
    }

    #[inline]
    fn header_bytes(&self) -> &[u8] {
        &self.header[..self.header_len]
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        self.header_len + self.payload.len()
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheap to clone; every clone feeds the same connection.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Queue a frame. Fails once the writer task has stopped.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// Spawn the writer task for `writer`.
///
/// The task ends cleanly when every handle is dropped, or with the first
/// write error.
pub fn spawn_writer_task<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(first) = rx.recv().await {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::debug!(error = %e, "socket writer stopped");
            rx.close();
            return Err(e);
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Slices of `batch` after the first `skip_bytes` bytes.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [frame.header_bytes(), &frame.payload[..]] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                slices.push(IoSlice::new(&part[skip_bytes.saturating_sub(offset)..]));
            }
            offset = end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_outbound_frame_sizes() {
        let half = OutboundFrame::new(None, Bytes::from_static(b"hello"));
        assert_eq!(half.header_bytes(), &[0, 0, 0, 5]);
        assert_eq!(half.size(), 9);

        let full = OutboundFrame::new(Some(3), Bytes::from_static(b"hello"));
        assert_eq!(full.header_bytes(), &[0x80, 0, 0, 5, 0, 0, 0, 3]);
        assert_eq!(full.size(), 13);
    }

    #[test]
    fn test_build_remaining_slices_partial_header() {
        let batch = vec![OutboundFrame::new(Some(1), Bytes::from_static(b"hello"))];

        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);

        let slices = build_remaining_slices(&batch, 5);
        assert_eq!(slices[0].len(), 3);
        assert_eq!(slices[1].len(), 5);

        let slices = build_remaining_slices(&batch, 10);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 3);
    }

    #[test]
    fn test_build_remaining_slices_skips_empty_payload() {
        let batch = vec![
            OutboundFrame::new(None, Bytes::new()),
            OutboundFrame::new(None, Bytes::from_static(b"z")),
        ];
        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 3);
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5)
            .map(|i| OutboundFrame::new(Some(i), Bytes::from_static(b"abc")))
            .collect();

        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner().len(), 5 * (8 + 3));
    }

    #[tokio::test]
    async fn test_writer_task_delivers_in_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client);

        for i in 0..10u32 {
            let payload = Bytes::copy_from_slice(&i.to_be_bytes());
            handle.send(OutboundFrame::new(Some(i), payload)).await.unwrap();
        }

        let mut buf = vec![0u8; 10 * 12];
        server.read_exact(&mut buf).await.unwrap();
        for (i, frame) in buf.chunks(12).enumerate() {
            assert_eq!(&frame[4..8], &(i as u32).to_be_bytes());
        }
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client);
        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_send_after_writer_failure() {
        let (client, server) = duplex(16);
        drop(server);
        let (handle, task) = spawn_writer_task(client);

        let _ = handle
            .send(OutboundFrame::new(None, Bytes::from_static(b"x")))
            .await;
        assert!(task.await.unwrap().is_err());
        let again = handle
            .send(OutboundFrame::new(None, Bytes::from_static(b"y")))
            .await;
        assert!(matches!(again, Err(Error::ConnectionClosed)));
    }
}
