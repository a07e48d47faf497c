//! Session: one connected peer.
//!
//! A session owns the transport. Only the read loop spawned by
//! [`Session::init`] calls `recv_frame`; every inbound frame is routed by its
//! channel name to Control, the Signaler or a raw stream, without waiting
//! on any of them.
//!
//! ```text
//!                      ┌──────────────┐
//!   transport ───────► │  read loop   │
//!                      └──────┬───────┘
//!          "control"          │ "signal"           other
//!      ┌──────────────────────┼──────────────────────┐
//!      ▼                      ▼                      ▼
//!   Control              Signaler               StreamTable
//!   (calls)      (state, filter, triggers)     (raw streams)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let session = Session::server(transport)?;
//! let (control, signaler) = session.init(
//!     Init::new()
//!         .call("greet", |_ctx, name: String| async move { Ok(format!("hi {name}")) })
//!         .signal("news")
//!         .stream("upload", |mut stream| async move {
//!             while let Some(chunk) = stream.recv().await { /* ... */ }
//!         }),
//! )?;
//! session.on_close(|| tracing::info!("peer gone"));
//! ```

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::config::SessionConfig;
use crate::control::{panic_message, CallContext, CallOptions, Control};
use crate::frame::{is_reserved_channel, Frame, FrameBody, Hello, Role, CONTROL_CHANNEL, PROTOCOL_VERSION, SIGNAL_CHANNEL};
use crate::link::Link;
use crate::raw_stream::{boxed_handler, RawStream, StreamHandlerFn, StreamTable};
use crate::signal::{SignalContext, Signaler};
use crate::transport::AnyTransport;
use crate::validate::Validate;
use crate::{HandlerError, SessionError, TransportError};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for the peer's hello.
    Connecting,
    Ready,
    /// Terminal.
    Closed,
}

type Setup = Box<dyn FnOnce(&Control, &Signaler) + Send>;
type CloseHook = Box<dyn FnOnce() + Send>;

/// Everything a session serves, registered before the read loop starts.
#[derive(Default)]
pub struct Init {
    streams: Vec<(String, Arc<StreamHandlerFn>)>,
    setup: Vec<Setup>,
}

impl fmt::Debug for Init {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Init")
            .field("streams", &self.streams.iter().map(|(c, _)| c).collect::<Vec<_>>())
            .field("setup", &self.setup.len())
            .finish()
    }
}

impl Init {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve raw streams the peer opens on `channel`. The handler runs on
    /// its own task.
    pub fn stream<F, Fut>(mut self, channel: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RawStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.streams.push((channel.into(), boxed_handler(handler)));
        self
    }

    /// Register a synchronous call with the session's default timeout.
    pub fn call<A, R, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Validate + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let name = name.into();
        self.setup(move |control, _| {
            let timeout = control.default_options().timeout;
            control.register_call(name, timeout, handler);
        })
    }

    /// Register a call with its own timeout and size ceilings.
    pub fn call_with<A, R, F, Fut>(self, name: impl Into<String>, options: CallOptions, handler: F) -> Self
    where
        A: DeserializeOwned + Validate + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let name = name.into();
        self.setup(move |control, _| control.register_async_call(name, options, handler))
    }

    pub fn signal(self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.setup(move |_, signaler| signaler.add_signal(&id))
    }

    pub fn signal_filter<D, F>(self, id: impl Into<String>, filter: F) -> Self
    where
        D: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&D, &SignalContext) -> bool + Send + Sync + 'static,
    {
        let id = id.into();
        self.setup(move |_, signaler| signaler.add_signal_filter(&id, filter))
    }

    pub fn required_signal_filter<D, F>(self, id: impl Into<String>, filter: F) -> Self
    where
        D: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&D, &SignalContext) -> bool + Send + Sync + 'static,
    {
        let id = id.into();
        self.setup(move |_, signaler| signaler.add_required_signal_filter(&id, filter))
    }

    /// Arbitrary registration against the session's handles.
    pub fn setup(mut self, f: impl FnOnce(&Control, &Signaler) + Send + 'static) -> Self {
        self.setup.push(Box::new(f));
        self
    }
}

/// A connected peer. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct SessionInner {
    id: SessionId,
    role: Role,
    config: SessionConfig,
    link: Arc<Link>,
    state: watch::Sender<SessionState>,
    initialized: AtomicBool,
    closed: AtomicBool,
    control: Control,
    signaler: Signaler,
    streams: Arc<StreamTable>,
    close_hooks: Mutex<Vec<CloseHook>>,
}

impl Session {
    pub fn new(transport: AnyTransport, role: Role, config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let id = SessionId::next();
        let link = Arc::new(Link::new(
            transport,
            id,
            config.write_timeout,
            config.max_frame_size,
        ));
        let (state, _) = watch::channel(SessionState::Connecting);
        let control = Control::new(CONTROL_CHANNEL, id, link.clone(), &config);
        let signaler = Signaler::new(id, link.clone(), &config);
        let streams = Arc::new(StreamTable::new(id, role, link.clone(), &config));

        tracing::debug!(session = %id, ?role, "session created");
        Ok(Self {
            inner: Arc::new(SessionInner {
                id,
                role,
                config,
                link,
                state,
                initialized: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                control,
                signaler,
                streams,
                close_hooks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Initiating side, configured from the environment.
    pub fn client(transport: AnyTransport) -> Result<Self, SessionError> {
        Self::new(transport, Role::Initiator, SessionConfig::from_env())
    }

    /// Accepting side, configured from the environment.
    pub fn server(transport: AnyTransport) -> Result<Self, SessionError> {
        Self::new(transport, Role::Acceptor, SessionConfig::from_env())
    }

    /// Register handlers and signals, then start the read loop.
    ///
    /// Fails with [`SessionError::AlreadyInitialized`] on a second call.
    pub fn init(&self, init: Init) -> Result<(Control, Signaler), SessionError> {
        if let Some((channel, _)) = init.streams.iter().find(|(c, _)| is_reserved_channel(c)) {
            return Err(SessionError::ReservedChannel(channel.clone()));
        }
        if self.inner.initialized.swap(true, Ordering::AcqRel) {
            return Err(SessionError::AlreadyInitialized);
        }
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let inner = &self.inner;
        for (channel, handler) in init.streams {
            inner.streams.register_handler(channel, handler);
        }
        for setup in init.setup {
            setup(&inner.control, &inner.signaler);
        }

        tokio::spawn(self.clone().run());
        Ok((inner.control.clone(), inner.signaler.clone()))
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn control(&self) -> &Control {
        &self.inner.control
    }

    pub fn signaler(&self) -> &Signaler {
        &self.inner.signaler
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Observe state transitions. Slow observers only see the latest state.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolve once the session is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Wait until the handshake finished. Returns `false` if the session
    /// closed first.
    pub async fn ready(&self) -> bool {
        let mut rx = self.inner.state.subscribe();
        let ready = matches!(
            rx.wait_for(|s| *s != SessionState::Connecting).await.as_deref(),
            Ok(SessionState::Ready)
        );
        ready
    }

    /// Run `hook` when the session closes. Hooks run once, in registration
    /// order; a hook registered after close runs immediately.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.inner.close_hooks.lock();
        if !self.is_closed() {
            hooks.push(Box::new(hook));
            return;
        }
        drop(hooks);
        run_hook(self.inner.id, Box::new(hook));
    }

    /// Open a raw stream on `channel`, waiting up to `stream_init_timeout`
    /// for the peer to accept.
    pub async fn open_stream(&self, channel: &str) -> Result<RawStream, SessionError> {
        self.inner.streams.open(channel).await
    }

    /// Close the session. Only the first call does anything.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(session = %inner.id, "closing session");
        inner.link.close();

        let hooks = std::mem::take(&mut *inner.close_hooks.lock());
        for hook in hooks {
            run_hook(inner.id, hook);
        }

        inner.control.close();
        inner.signaler.close();
        inner.streams.close();
        // Last, so `closed()` observers see a fully torn down session.
        inner.state.send_replace(SessionState::Closed);
        tracing::info!(session = %inner.id, "session closed");
    }

    async fn run(self) {
        let id = self.inner.id;
        tracing::debug!(session = %id, "read loop starting");
        let mut state = self.inner.state.subscribe();

        let result = tokio::select! {
            result = self.read_frames() => result,
            _ = state.wait_for(|s| *s == SessionState::Closed) => Ok(()),
        };
        match result {
            Ok(()) | Err(TransportError::Closed) => {
                tracing::debug!(session = %id, "read loop finished")
            }
            Err(e) => tracing::warn!(session = %id, error = %e, "read loop failed"),
        }
        self.close();
    }

    async fn handshake(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        inner.link.send(Frame::hello(inner.role)).await?;
        inner.link.open();

        let recv = inner
            .link
            .transport()
            .recv_frame(inner.link.max_frame_size());
        let bytes = tokio::time::timeout(inner.config.handshake_timeout, recv)
            .await
            .map_err(|_| {
                TransportError::Handshake(format!(
                    "no hello within {:?}",
                    inner.config.handshake_timeout
                ))
            })??;
        let hello = match Frame::decode(&bytes) {
            Ok(Frame {
                body: FrameBody::Hello(hello),
                ..
            }) => hello,
            Ok(frame) => {
                return Err(TransportError::Handshake(format!(
                    "expected hello, got {}",
                    frame.body.kind()
                )))
            }
            Err(e) => return Err(TransportError::Handshake(e.to_string())),
        };
        check_hello(inner.role, &hello)?;
        Ok(())
    }

    async fn read_frames(&self) -> Result<(), TransportError> {
        let inner = &self.inner;
        self.handshake().await?;
        inner.state.send_if_modified(|s| {
            if *s == SessionState::Connecting {
                *s = SessionState::Ready;
                true
            } else {
                false
            }
        });
        tracing::debug!(session = %inner.id, "session ready");

        loop {
            let bytes = inner
                .link
                .transport()
                .recv_frame(inner.link.max_frame_size())
                .await?;
            let frame = match Frame::decode(&bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(session = %inner.id, len = bytes.len(), error = %e, "dropping undecodable frame");
                    continue;
                }
            };
            tracing::trace!(session = %inner.id, channel = %frame.channel, kind = frame.body.kind(), "frame received");

            match frame.channel.as_str() {
                CONTROL_CHANNEL => inner.control.handle_frame(frame.body),
                SIGNAL_CHANNEL => inner.signaler.handle_frame(frame.body),
                _ => inner.streams.handle_frame(frame.channel, frame.body),
            }
        }
    }
}

fn check_hello(role: Role, hello: &Hello) -> Result<(), TransportError> {
    if hello.version != PROTOCOL_VERSION {
        return Err(TransportError::Handshake(format!(
            "protocol version mismatch: ours {PROTOCOL_VERSION}, peer {}",
            hello.version
        )));
    }
    if hello.role != role.peer() {
        return Err(TransportError::Handshake(format!(
            "both peers claim role {:?}",
            hello.role
        )));
    }
    Ok(())
}

fn run_hook(session: SessionId, hook: CloseHook) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(hook)) {
        tracing::warn!(session = %session, panic = %panic_message(&*panic), "close hook panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.0.to_string());
    }

    #[test]
    fn hello_must_come_from_the_other_role() {
        let ok = Hello {
            version: PROTOCOL_VERSION,
            role: Role::Acceptor,
        };
        assert!(check_hello(Role::Initiator, &ok).is_ok());
        assert!(matches!(
            check_hello(Role::Acceptor, &ok),
            Err(TransportError::Handshake(_))
        ));

        let old = Hello {
            version: PROTOCOL_VERSION + 1,
            role: Role::Acceptor,
        };
        assert!(matches!(
            check_hello(Role::Initiator, &old),
            Err(TransportError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn init_rejects_reserved_stream_channels() {
        let (a, _b) = AnyTransport::mem_pair();
        let session = Session::new(a, Role::Initiator, SessionConfig::default()).unwrap();
        let err = session
            .init(Init::new().stream("control", |_stream| async {}))
            .unwrap_err();
        assert_eq!(err, SessionError::ReservedChannel("control".into()));

        // A rejected init does not count.
        assert!(session.init(Init::new()).is_ok());
        assert_eq!(
            session.init(Init::new()).unwrap_err(),
            SessionError::AlreadyInitialized
        );
        session.close();
    }

    #[tokio::test]
    async fn close_hook_after_close_runs_immediately() {
        let (a, _b) = AnyTransport::mem_pair();
        let session = Session::new(a, Role::Initiator, SessionConfig::default()).unwrap();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);

        let (tx, rx) = std::sync::mpsc::channel();
        session.on_close(move || tx.send(()).unwrap());
        rx.try_recv().unwrap();
    }
}
