//! Handle to a result that settles later.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Result of an operation already running in the background.
///
/// The operation starts when the handle is created, whether or not the
/// handle is ever awaited. It settles exactly once; if the client drops the
/// operation first, the handle resolves to [`Error::Canceled`].
#[must_use = "the call runs regardless, but its result is lost unless awaited"]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    /// A handle and the sender that settles it.
    pub(crate) fn channel() -> (oneshot::Sender<Result<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Canceled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropped_sender_cancels() {
        let (tx, pending) = Pending::<()>::channel();
        drop(tx);
        assert!(matches!(pending.await, Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn test_settled_from_task() {
        let (tx, pending) = Pending::channel();
        tokio::spawn(async move {
            let _ = tx.send(Ok("done"));
        });
        assert_eq!(pending.await.unwrap(), "done");
    }
}
