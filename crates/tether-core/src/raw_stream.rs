//! Raw byte streams multiplexed over a session.
//!
//! A stream is opened on a named channel and identified on the wire by a
//! numeric id. The opener allocates the id by role parity, so both sides can
//! open streams at the same time without coordinating.
//!
//! Flow control is credit based. A sender starts with `stream_window`
//! credits and spends one per data frame; the receiver hands credits back
//! as the application consumes data. The read loop therefore never waits
//! on a stream: a peer that sends beyond its credits has its stream closed.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Semaphore};

use crate::config::SessionConfig;
use crate::control::panic_message;
use crate::frame::{is_reserved_channel, Frame, FrameBody, Role};
use crate::link::Link;
use crate::session::SessionId;
use crate::SessionError;

pub(crate) type StreamHandlerFn = dyn Fn(RawStream) -> BoxFuture<'static, ()> + Send + Sync;

pub(crate) fn boxed_handler<F, Fut>(handler: F) -> Arc<StreamHandlerFn>
where
    F: Fn(RawStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |stream| handler(stream).boxed())
}

struct Route {
    channel: Arc<str>,
    /// Inbound data, bounded by the window we granted.
    data_tx: mpsc::Sender<Bytes>,
    /// Credits the peer granted us for outbound data.
    credits: Arc<Semaphore>,
}

/// Open streams and stream handlers of one session.
pub(crate) struct StreamTable {
    session_id: SessionId,
    link: Arc<Link>,
    window: u32,
    chunk_size: usize,
    init_timeout: Duration,
    own_parity: u32,
    handlers: RwLock<HashMap<String, Arc<StreamHandlerFn>>>,
    routes: Mutex<HashMap<u32, Route>>,
    pending_opens: Mutex<HashMap<u32, oneshot::Sender<bool>>>,
    next_id: AtomicU32,
    closed: AtomicBool,
}

impl StreamTable {
    pub(crate) fn new(session_id: SessionId, role: Role, link: Arc<Link>, config: &SessionConfig) -> Self {
        let first = role.first_stream_id();
        Self {
            session_id,
            link,
            window: config.stream_window,
            chunk_size: config.stream_chunk_size,
            init_timeout: config.stream_init_timeout,
            own_parity: first % 2,
            handlers: RwLock::new(HashMap::new()),
            routes: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(first),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn register_handler(&self, channel: String, handler: Arc<StreamHandlerFn>) {
        self.handlers.write().insert(channel, handler);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Insert a route and build the local end of the stream.
    fn attach(self: &Arc<Self>, id: u32, channel: Arc<str>) -> Result<RawStream, SessionError> {
        let (data_tx, data_rx) = mpsc::channel(self.window as usize);
        let credits = Arc::new(Semaphore::new(self.window as usize));
        let mut routes = self.routes.lock();
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        routes.insert(
            id,
            Route {
                channel: channel.clone(),
                data_tx,
                credits: credits.clone(),
            },
        );
        drop(routes);

        Ok(RawStream {
            id,
            channel,
            table: self.clone(),
            data_rx,
            credits,
            consumed: 0,
            closed: false,
        })
    }

    fn detach(&self, id: u32) -> bool {
        match self.routes.lock().remove(&id) {
            Some(route) => {
                route.credits.close();
                true
            }
            None => false,
        }
    }

    pub(crate) async fn open(self: &Arc<Self>, channel: &str) -> Result<RawStream, SessionError> {
        /// Removes the half-open stream unless the peer accepted it.
        struct OpenGuard<'a> {
            table: &'a StreamTable,
            id: u32,
            active: bool,
        }

        impl Drop for OpenGuard<'_> {
            fn drop(&mut self) {
                if self.active {
                    self.table.pending_opens.lock().remove(&self.id);
                    self.table.detach(self.id);
                }
            }
        }

        if is_reserved_channel(channel) {
            return Err(SessionError::ReservedChannel(channel.to_owned()));
        }
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        let (accepted_tx, accepted_rx) = oneshot::channel();
        self.pending_opens.lock().insert(id, accepted_tx);
        let stream = self.attach(id, channel.into())?;
        let mut guard = OpenGuard {
            table: self,
            id,
            active: true,
        };

        self.link
            .send(Frame::new(channel, FrameBody::StreamOpen { stream: id }))
            .await?;
        tracing::debug!(session = %self.session_id, channel, stream = id, "stream open sent");

        match tokio::time::timeout(self.init_timeout, accepted_rx).await {
            Ok(Ok(true)) => {
                guard.active = false;
                tracing::debug!(session = %self.session_id, channel, stream = id, "stream accepted");
                Ok(stream)
            }
            Ok(Ok(false)) => Err(SessionError::StreamRejected {
                channel: channel.to_owned(),
            }),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_elapsed) => {
                tracing::warn!(
                    session = %self.session_id,
                    channel,
                    stream = id,
                    timeout_ms = self.init_timeout.as_millis() as u64,
                    "stream open timed out"
                );
                Err(SessionError::StreamOpenTimeout {
                    channel: channel.to_owned(),
                })
            }
        }
    }

    /// Route one frame from a non-reserved channel. Never blocks.
    pub(crate) fn handle_frame(self: &Arc<Self>, channel: String, body: FrameBody) {
        match body {
            FrameBody::StreamOpen { stream } => self.accept(channel, stream),
            FrameBody::StreamAccept { stream } => self.resolve_open(&channel, stream, true),
            FrameBody::StreamReject { stream } => self.resolve_open(&channel, stream, false),
            FrameBody::StreamData { stream, data } => self.push_data(&channel, stream, data),
            FrameBody::StreamCredit { stream, credits } => {
                if let Some(route) = self.routes.lock().get(&stream) {
                    route.credits.add_permits(credits as usize);
                }
            }
            FrameBody::StreamClose { stream } => {
                if self.detach(stream) {
                    tracing::debug!(session = %self.session_id, channel = %channel, stream, "stream closed by peer");
                }
            }
            other => tracing::warn!(
                session = %self.session_id,
                channel = %channel,
                kind = other.kind(),
                "unexpected frame on stream channel"
            ),
        }
    }

    fn accept(self: &Arc<Self>, channel: String, id: u32) {
        let handler = self.handlers.read().get(&channel).cloned();
        let collides = id % 2 == self.own_parity || self.routes.lock().contains_key(&id);

        let table = self.clone();
        let stream = match handler {
            Some(handler) if !collides => match self.attach(id, channel.as_str().into()) {
                Ok(stream) => Some((handler, stream)),
                Err(_) => return,
            },
            _ => None,
        };

        tokio::spawn(async move {
            let Some((handler, stream)) = stream else {
                tracing::debug!(session = %table.session_id, channel = %channel, stream = id, "rejecting stream");
                let reject = Frame::new(channel, FrameBody::StreamReject { stream: id });
                let _ = table.link.send(reject).await;
                return;
            };

            let accept = Frame::new(channel.as_str(), FrameBody::StreamAccept { stream: id });
            if let Err(e) = table.link.send(accept).await {
                tracing::debug!(session = %table.session_id, stream = id, error = %e, "failed to accept stream");
                return;
            }
            tracing::debug!(session = %table.session_id, channel = %channel, stream = id, "stream accepted");

            if let Err(panic) = AssertUnwindSafe(handler(stream)).catch_unwind().await {
                tracing::error!(
                    session = %table.session_id,
                    channel = %channel,
                    stream = id,
                    panic = %panic_message(&*panic),
                    "stream handler panicked"
                );
            }
        });
    }

    fn resolve_open(self: &Arc<Self>, channel: &str, id: u32, accepted: bool) {
        match self.pending_opens.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(accepted);
            }
            None if accepted => {
                // We gave up waiting; tell the peer's handler to stop.
                self.detach(id);
                self.send_close(channel.to_owned(), id);
            }
            None => {}
        }
    }

    fn push_data(self: &Arc<Self>, channel: &str, id: u32, data: Vec<u8>) {
        let result = match self.routes.lock().get(&id) {
            Some(route) => route.data_tx.try_send(Bytes::from(data)),
            None => {
                tracing::debug!(session = %self.session_id, channel, stream = id, "data for unknown stream");
                return;
            }
        };
        match result {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    session = %self.session_id,
                    channel,
                    stream = id,
                    window = self.window,
                    "peer exceeded stream credits; closing stream"
                );
                self.detach(id);
                self.send_close(channel.to_owned(), id);
            }
            Err(TrySendError::Closed(_)) => {
                self.detach(id);
            }
        }
    }

    fn send_close(self: &Arc<Self>, channel: String, id: u32) {
        if self.is_closed() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let table = self.clone();
        handle.spawn(async move {
            let _ = table
                .link
                .send(Frame::new(channel, FrameBody::StreamClose { stream: id }))
                .await;
        });
    }

    /// Drop every route and fail pending opens.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let routes: Vec<Route> = self.routes.lock().drain().map(|(_, r)| r).collect();
        for route in &routes {
            route.credits.close();
        }
        self.pending_opens.lock().clear();
        tracing::debug!(session = %self.session_id, streams = routes.len(), "streams closed");
    }
}

/// One end of a raw byte stream.
///
/// Dropping the stream closes it.
pub struct RawStream {
    id: u32,
    channel: Arc<str>,
    table: Arc<StreamTable>,
    data_rx: mpsc::Receiver<Bytes>,
    credits: Arc<Semaphore>,
    consumed: u32,
    closed: bool,
}

impl std::fmt::Debug for RawStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawStream")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl RawStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Send `data`, split into chunks of at most `stream_chunk_size` bytes.
    ///
    /// Waits for credits when the peer is behind.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        for chunk in data.chunks(self.table.chunk_size) {
            let permit = self
                .credits
                .acquire()
                .await
                .map_err(|_| SessionError::Closed)?;
            permit.forget();
            let frame = Frame::new(
                &*self.channel,
                FrameBody::StreamData {
                    stream: self.id,
                    data: chunk.to_vec(),
                },
            );
            self.table.link.send(frame).await?;
        }
        Ok(())
    }

    /// Next chunk, or `None` once the stream is closed by either side and
    /// everything received has been read.
    pub async fn recv(&mut self) -> Option<Bytes> {
        let chunk = self.data_rx.recv().await?;
        self.consumed += 1;
        if self.consumed >= (self.table.window / 2).max(1) {
            let credits = std::mem::take(&mut self.consumed);
            let frame = Frame::new(
                &*self.channel,
                FrameBody::StreamCredit {
                    stream: self.id,
                    credits,
                },
            );
            if let Err(e) = self.table.link.send(frame).await {
                tracing::debug!(stream = self.id, error = %e, "failed to return stream credits");
            }
        }
        Some(chunk)
    }

    /// Close both directions and notify the peer.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.data_rx.close();
        if self.table.detach(self.id) {
            self.table
                .link
                .send(Frame::new(&*self.channel, FrameBody::StreamClose { stream: self.id }))
                .await?;
        }
        Ok(())
    }
}

impl Drop for RawStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if self.table.detach(self.id) {
            self.table.send_close(self.channel.to_string(), self.id);
        }
    }
}
