// ABOUTME: AsyncQueue decouples a session's event-ingestion loop from its consumers.
// ABOUTME: Push until close, consumers suspend when empty and stop once closed and drained.

use futures::stream::{self, BoxStream, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Buffered multi-consumer queue with explicit close semantics.
///
/// Cloning yields another handle to the same queue. Each item is delivered
/// to exactly one consumer. Pushes after [`AsyncQueue::close`] are dropped.
pub struct AsyncQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
}

impl<T> Clone for AsyncQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> AsyncQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                tx: Mutex::new(Some(tx)),
                rx: tokio::sync::Mutex::new(rx),
            }),
        }
    }

    /// Push an item. Returns false when the queue is already closed.
    pub fn push(&self, item: T) -> bool {
        let tx = self.inner.tx.lock().unwrap_or_else(|e| e.into_inner());
        match tx.as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    /// Close the queue. Buffered items remain available to consumers.
    pub fn close(&self) {
        let mut tx = self.inner.tx.lock().unwrap_or_else(|e| e.into_inner());
        // Dropping the sender ends iteration once the buffer is drained
        tx.take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Wait for the next item, or None once closed and drained
    pub async fn next(&self) -> Option<T> {
        self.inner.rx.lock().await.recv().await
    }

    /// Take an item without waiting
    pub fn try_next(&self) -> Option<T> {
        self.inner.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Stream over the queue; several streams may drain the same queue
    pub fn stream(&self) -> BoxStream<'static, T> {
        stream::unfold(self.clone(), |queue| async move {
            queue.next().await.map(|item| (item, queue))
        })
        .boxed()
    }
}

impl<T: Send + 'static> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_is_closed_reflects_close() {
        let queue: AsyncQueue<u8> = AsyncQueue::new();
        assert!(!queue.is_closed());
        queue.close();
        assert!(queue.is_closed());
        queue.close();
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_try_next_does_not_wait() {
        let queue = AsyncQueue::new();
        assert_eq!(queue.try_next(), None);
        queue.push(7);
        assert_eq!(queue.try_next(), Some(7));
    }
}
