//! In-process transport over a pair of channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::TransportError;

use super::Transport;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

impl std::fmt::Debug for MemTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTransport")
            .field("is_closed", &self.is_closed_inner())
            .finish_non_exhaustive()
    }
}

struct MemInner {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: AsyncMutex<mpsc::Receiver<Bytes>>,
    closed: AtomicBool,
    /// Shared by both ends; set once either end closes.
    link_down: Arc<watch::Sender<bool>>,
}

impl MemTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);
        let (link_down, _) = watch::channel(false);
        let link_down = Arc::new(link_down);

        let a = Self {
            inner: Arc::new(MemInner {
                tx: Mutex::new(Some(tx_b)),
                rx: AsyncMutex::new(rx_a),
                closed: AtomicBool::new(false),
                link_down: link_down.clone(),
            }),
        };
        let b = Self {
            inner: Arc::new(MemInner {
                tx: Mutex::new(Some(tx_a)),
                rx: AsyncMutex::new(rx_b),
                closed: AtomicBool::new(false),
                link_down,
            }),
        };
        (a, b)
    }

    fn is_closed_inner(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    async fn wait_link_down(&self) {
        let mut rx = self.inner.link_down.subscribe();
        let _ = rx.wait_for(|down| *down).await;
    }
}

impl Transport for MemTransport {
    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed_inner() || *self.inner.link_down.borrow() {
            return Err(TransportError::Closed);
        }
        let tx = self
            .inner
            .tx
            .lock()
            .clone()
            .ok_or(TransportError::Closed)?;

        tokio::select! {
            sent = tx.send(frame) => sent.map_err(|_| TransportError::Closed),
            _ = self.wait_link_down() => Err(TransportError::Closed),
        }
    }

    async fn recv_frame(&self, max_size: usize) -> Result<Bytes, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let mut rx = self.inner.rx.lock().await;
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame.ok_or(TransportError::Closed)?,
            _ = self.wait_link_down() => return Err(TransportError::Closed),
        };

        if frame.len() > max_size {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: max_size,
            });
        }
        Ok(frame)
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.tx.lock().take();
        self.inner.link_down.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn frames_cross_in_order() {
        let (a, b) = MemTransport::pair();
        a.send_frame(Bytes::from_static(b"one")).await.unwrap();
        a.send_frame(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(b.recv_frame(16).await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b.recv_frame(16).await.unwrap(), Bytes::from_static(b"two"));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (a, b) = MemTransport::pair();
        a.send_frame(Bytes::from(vec![0u8; 32])).await.unwrap();

        let err = b.recv_frame(8).await.unwrap_err();
        assert_eq!(err, TransportError::FrameTooLarge { len: 32, max: 8 });
    }

    #[tokio::test]
    async fn close_unblocks_both_ends() {
        let (a, b) = MemTransport::pair();

        let waiter = {
            let b = b.clone();
            tokio::spawn(async move { b.recv_frame(16).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.close();

        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("recv should unblock")
            .unwrap();
        assert_eq!(res, Err(TransportError::Closed));
        assert_eq!(
            a.send_frame(Bytes::from_static(b"late")).await,
            Err(TransportError::Closed)
        );
        assert!(a.is_closed());
    }
}
