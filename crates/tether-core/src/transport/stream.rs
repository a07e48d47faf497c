//! Transport over any byte stream, one frame per little-endian `u32` length prefix.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::TransportError;

use super::Transport;

type BoxedReader = Box<dyn AsyncRead + Unpin + Send + Sync>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send + Sync>;

#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport").finish_non_exhaustive()
    }
}

struct StreamInner {
    reader: AsyncMutex<BoxedReader>,
    writer: AsyncMutex<BoxedWriter>,
    closed: watch::Sender<bool>,
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_split(reader, writer)
    }

    /// Create a transport from separate reader and writer halves, such as
    /// stdin/stdout or an already split socket.
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed,
            }),
        }
    }

    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }

    fn is_closed_inner(&self) -> bool {
        *self.inner.closed.borrow()
    }

    async fn wait_closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

async fn read_frame(reader: &mut BoxedReader, max_size: usize) -> Result<Bytes, TransportError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max_size {
        return Err(TransportError::FrameTooLarge { len, max: max_size });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

impl Transport for StreamTransport {
    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }
        let len = u32::try_from(frame.len()).map_err(|_| TransportError::FrameTooLarge {
            len: frame.len(),
            max: u32::MAX as usize,
        })?;

        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&len.to_le_bytes()).await?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv_frame(&self, max_size: usize) -> Result<Bytes, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let mut reader = self.inner.reader.lock().await;
        tokio::select! {
            frame = read_frame(&mut reader, max_size) => frame,
            _ = self.wait_closed() => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        // Shutting down the write half is what lets the peer see EOF.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            handle.spawn(async move {
                let mut writer = inner.writer.lock().await;
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!(error = %e, "stream transport shutdown failed");
                }
            });
        }
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
    async fn length_prefixed_frames_cross() {
        let (a, b) = StreamTransport::pair();
        a.send_frame(Bytes::from_static(b"hello")).await.unwrap();
        a.send_frame(Bytes::new()).await.unwrap();

        assert_eq!(b.recv_frame(64).await.unwrap(), Bytes::from_static(b"hello"));
        assert!(b.recv_frame(64).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (a, b) = StreamTransport::pair();
        a.send_frame(Bytes::from(vec![1u8; 100])).await.unwrap();

        let err = b.recv_frame(10).await.unwrap_err();
        assert_eq!(err, TransportError::FrameTooLarge { len: 100, max: 10 });
    }

    #[tokio::test]
    async fn close_is_seen_as_eof_by_peer() {
        let (a, b) = StreamTransport::pair();
        a.close();

        let res = tokio::time::timeout(Duration::from_secs(1), b.recv_frame(64))
            .await
            .expect("peer should observe EOF");
        assert_eq!(res, Err(TransportError::Closed));
        assert_eq!(a.recv_frame(64).await, Err(TransportError::Closed));
    }
}
