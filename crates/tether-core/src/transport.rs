//! Transport trait and type-erased wrapper.
//!
//! A transport moves discrete frames over one reliable, ordered connection.
//! Each backend lives in its own module under `transport/` and implements
//! [`Transport`]. The session only ever holds an [`AnyTransport`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::TransportError;

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "stream")]
pub mod stream;

/// Trait for transport implementations.
///
/// Write deadlines are applied by the session around `send_frame`. Size
/// limits are applied by the transport on receive, before the frame is
/// buffered.
pub trait Transport: Send + Sync + Clone + 'static {
    /// Send one frame.
    fn send_frame(&self, frame: Bytes)
        -> impl Future<Output = Result<(), TransportError>> + Send + '_;

    /// Receive one frame of at most `max_size` bytes.
    fn recv_frame(
        &self,
        max_size: usize,
    ) -> impl Future<Output = Result<Bytes, TransportError>> + Send + '_;

    /// Close this transport.
    ///
    /// A pending `recv_frame` returns `TransportError::Closed`, and the peer
    /// observes end of stream.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Object-safe version of [`Transport`] for dynamic dispatch.
pub trait DynTransport: Send + Sync + 'static {
    fn send_frame_dyn(
        &self,
        frame: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    fn recv_frame_dyn(
        &self,
        max_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, TransportError>> + Send + '_>>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

impl<T: Transport> DynTransport for T {
    fn send_frame_dyn(
        &self,
        frame: Bytes,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(self.send_frame(frame))
    }

    fn recv_frame_dyn(
        &self,
        max_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes, TransportError>> + Send + '_>> {
        Box::pin(self.recv_frame(max_size))
    }

    fn close(&self) {
        Transport::close(self)
    }

    fn is_closed(&self) -> bool {
        Transport::is_closed(self)
    }
}

/// Type-erased transport wrapper.
///
/// Adds one vtable hop over a concrete transport, which is noise next to the
/// I/O and encoding cost of a frame.
#[derive(Clone)]
pub struct AnyTransport {
    inner: Arc<dyn DynTransport>,
}

impl std::fmt::Debug for AnyTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyTransport")
            .field("is_closed", &self.inner.is_closed())
            .finish_non_exhaustive()
    }
}

impl AnyTransport {
    pub fn new<T: Transport>(transport: T) -> Self {
        Self {
            inner: Arc::new(transport),
        }
    }

    pub async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        self.inner.send_frame_dyn(frame).await
    }

    pub async fn recv_frame(&self, max_size: usize) -> Result<Bytes, TransportError> {
        self.inner.recv_frame_dyn(max_size).await
    }

    pub fn close(&self) {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Create a pair of connected in-memory transports.
    #[cfg(feature = "mem")]
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Self::new(a), Self::new(b))
    }

    /// Create a transport from a byte stream (TCP socket, Unix socket, pipe).
    #[cfg(feature = "stream")]
    pub fn stream<S>(stream: S) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self::new(stream::StreamTransport::new(stream))
    }

    #[cfg(feature = "stream")]
    pub fn stream_pair() -> (Self, Self) {
        let (a, b) = stream::StreamTransport::pair();
        (Self::new(a), Self::new(b))
    }
}

impl Transport for AnyTransport {
    fn send_frame(
        &self,
        frame: Bytes,
    ) -> impl Future<Output = Result<(), TransportError>> + Send + '_ {
        self.inner.send_frame_dyn(frame)
    }

    fn recv_frame(
        &self,
        max_size: usize,
    ) -> impl Future<Output = Result<Bytes, TransportError>> + Send + '_ {
        self.inner.recv_frame_dyn(max_size)
    }

    fn close(&self) {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
