//! Control: request/response calls correlated by id.
//!
//! Each outstanding call owns one entry in the pending table until its
//! response arrives, its deadline passes, the caller drops the future, or
//! the session closes. Inbound requests run on their own task so a slow
//! handler never holds up the read loop or other calls.
//!
//! ```ignore
//! control.register_call("greet", Duration::from_secs(5), |_ctx, name: String| async move {
//!     Ok::<_, HandlerError>(format!("hello, {name}"))
//! });
//!
//! let reply: String = peer_control.call("greet", &"world".to_string()).await?;
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::codec::{Codec, PostcardCodec};
use crate::config::{
    SessionConfig, DEFAULT_CALL_TIMEOUT, DEFAULT_MAX_ARG_SIZE, DEFAULT_MAX_RET_SIZE,
};
use crate::frame::{CallOutcome, Frame, FrameBody, WireError};
use crate::link::Link;
use crate::session::SessionId;
use crate::validate::Validate;
use crate::{ErrorCode, HandlerError, RpcError};

/// Timeout and size ceilings of one call type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    pub timeout: Duration,
    pub max_arg_size: usize,
    pub max_ret_size: usize,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CALL_TIMEOUT,
            max_arg_size: DEFAULT_MAX_ARG_SIZE,
            max_ret_size: DEFAULT_MAX_RET_SIZE,
        }
    }
}

impl CallOptions {
    pub fn new(timeout: Duration, max_arg_size: usize, max_ret_size: usize) -> Self {
        Self {
            timeout,
            max_arg_size,
            max_ret_size,
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }
}

/// What a handler knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct CallContext {
    name: Arc<str>,
    session_id: SessionId,
    deadline: Instant,
}

impl CallContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// When the caller stops waiting. The handler is never preempted; a
    /// result produced after this point is discarded by the caller.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

type RawHandlerFn =
    dyn Fn(CallContext, Bytes) -> BoxFuture<'static, Result<Vec<u8>, HandlerError>> + Send + Sync;

struct CallHandler {
    options: CallOptions,
    func: Arc<RawHandlerFn>,
}

struct PendingCall {
    tx: oneshot::Sender<CallOutcome>,
    deadline: Option<Instant>,
}

/// Handle to one side's call subsystem. Cheap to clone.
#[derive(Clone)]
pub struct Control {
    inner: Arc<ControlInner>,
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("channel", &self.inner.channel)
            .field("session", &self.inner.session_id)
            .field("pending", &self.inner.pending.lock().len())
            .finish_non_exhaustive()
    }
}

struct ControlInner {
    channel: &'static str,
    session_id: SessionId,
    link: Arc<Link>,
    defaults: CallOptions,
    max_pending: usize,
    handlers: RwLock<HashMap<String, Arc<CallHandler>>>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Control {
    pub(crate) fn new(
        channel: &'static str,
        session_id: SessionId,
        link: Arc<Link>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ControlInner {
                channel,
                session_id,
                link,
                defaults: config.call_options(),
                max_pending: config.max_pending_calls,
                handlers: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Options used by [`call`](Self::call) and [`register_call`](Self::register_call).
    pub fn default_options(&self) -> CallOptions {
        self.inner.defaults
    }

    /// Register a synchronous call with the default size ceilings.
    ///
    /// Registering a name again replaces the previous handler.
    pub fn register_call<A, R, F, Fut>(&self, name: impl Into<String>, timeout: Duration, handler: F)
    where
        A: DeserializeOwned + Validate + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let options = self.inner.defaults.with_timeout(timeout);
        self.register_typed(name, options, handler);
    }

    /// Register a call whose payloads exceed the synchronous ceilings, such
    /// as binary blobs.
    pub fn register_async_call<A, R, F, Fut>(
        &self,
        name: impl Into<String>,
        options: CallOptions,
        handler: F,
    ) where
        A: DeserializeOwned + Validate + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        self.register_typed(name, options, handler);
    }

    fn register_typed<A, R, F, Fut>(&self, name: impl Into<String>, options: CallOptions, handler: F)
    where
        A: DeserializeOwned + Validate + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register_raw_call(name, options, move |ctx, arg: Bytes| {
            let handler = handler.clone();
            async move {
                let arg: A = PostcardCodec::decode(&arg)?;
                arg.validate()?;
                let ret = handler(ctx, arg).await?;
                PostcardCodec::encode(&ret).map_err(HandlerError::internal)
            }
        });
    }

    /// Register a handler that works on undecoded bytes.
    pub fn register_raw_call<F, Fut>(&self, name: impl Into<String>, options: CallOptions, handler: F)
    where
        F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
    {
        let name = name.into();
        let func: Arc<RawHandlerFn> =
            Arc::new(move |ctx: CallContext, arg: Bytes| handler(ctx, arg).boxed());
        let replaced = self
            .inner
            .handlers
            .write()
            .insert(name.clone(), Arc::new(CallHandler { options, func }))
            .is_some();
        tracing::debug!(
            session = %self.inner.session_id,
            channel = self.inner.channel,
            call = %name,
            replaced,
            "registered call"
        );
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.handlers.read().contains_key(name)
    }

    /// Invoke a synchronous call with the default ceilings and timeout.
    pub async fn call<A, R>(&self, name: &str, arg: &A) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_typed(name, arg, self.inner.defaults, None).await
    }

    /// Invoke a synchronous call, giving up at `deadline` if that comes
    /// before the registered timeout.
    pub async fn call_deadline<A, R>(&self, name: &str, arg: &A, deadline: Instant) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_typed(name, arg, self.inner.defaults, Some(deadline))
            .await
    }

    /// Invoke a large-payload call with explicit ceilings and timeout.
    ///
    /// To bound the wait further, wrap the future in `tokio::time::timeout`:
    /// dropping it removes the pending entry.
    pub async fn async_call<A, R>(&self, name: &str, arg: &A, options: CallOptions) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.call_typed(name, arg, options, None).await
    }

    async fn call_typed<A, R>(
        &self,
        name: &str,
        arg: &A,
        options: CallOptions,
        deadline: Option<Instant>,
    ) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let arg = PostcardCodec::encode(arg)?;
        let ret = self.call_raw(name, Bytes::from(arg), options, deadline).await?;
        Ok(PostcardCodec::decode(&ret)?)
    }

    /// Invoke a call with an already encoded argument.
    ///
    /// The effective deadline is the earlier of `deadline` and now plus
    /// `options.timeout`.
    pub async fn call_raw(
        &self,
        name: &str,
        arg: Bytes,
        options: CallOptions,
        deadline: Option<Instant>,
    ) -> Result<Bytes, RpcError> {
        if arg.len() > options.max_arg_size {
            return Err(RpcError::PayloadTooLarge {
                len: arg.len(),
                max: options.max_arg_size,
            });
        }

        let registered = Instant::now() + options.timeout;
        let deadline = deadline.map_or(registered, |d| d.min(registered));
        let request_name = name.to_owned();
        self.request(
            name,
            move |id| FrameBody::CallRequest {
                id,
                name: request_name,
                arg: arg.to_vec(),
            },
            Some(deadline),
            options.max_ret_size,
        )
        .await
    }

    /// Correlation ids and deadlines of calls still waiting for a response.
    pub fn pending_calls(&self) -> Vec<(u64, Option<Instant>)> {
        let mut calls: Vec<_> = self
            .inner
            .pending
            .lock()
            .iter()
            .map(|(id, call)| (*id, call.deadline))
            .collect();
        calls.sort_unstable_by_key(|(id, _)| *id);
        calls
    }

    /// Send a correlated request and wait for its `CallResponse`.
    ///
    /// With no deadline the wait ends only on response or session close.
    pub(crate) async fn request(
        &self,
        label: &str,
        body: impl FnOnce(u64) -> FrameBody,
        deadline: Option<Instant>,
        max_ret_size: usize,
    ) -> Result<Bytes, RpcError> {
        struct PendingGuard<'a> {
            control: &'a ControlInner,
            id: u64,
            active: bool,
        }

        impl PendingGuard<'_> {
            fn disarm(&mut self) {
                self.active = false;
            }
        }

        impl Drop for PendingGuard<'_> {
            fn drop(&mut self) {
                if !self.active {
                    return;
                }
                if self.control.pending.lock().remove(&self.id).is_some() {
                    tracing::debug!(
                        session = %self.control.session_id,
                        correlation_id = self.id,
                        "call cancelled/dropped: removed pending waiter"
                    );
                }
            }
        }

        let inner = &*self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }
        if deadline.is_some_and(|d| d <= Instant::now()) {
            tracing::debug!(session = %inner.session_id, call = label, "deadline already expired");
            return Err(RpcError::DeadlineExceeded);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = inner.register_pending(id, deadline)?;
        let mut guard = PendingGuard {
            control: inner,
            id,
            active: true,
        };

        inner.link.send(Frame::new(inner.channel, body(id))).await?;
        tracing::debug!(
            session = %inner.session_id,
            channel = inner.channel,
            call = label,
            correlation_id = id,
            "request sent"
        );

        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => return Err(RpcError::Closed),
                Err(_elapsed) => {
                    tracing::warn!(
                        session = %inner.session_id,
                        channel = inner.channel,
                        call = label,
                        correlation_id = id,
                        "call timed out waiting for response"
                    );
                    return Err(RpcError::DeadlineExceeded);
                }
            },
            None => rx.await.map_err(|_| RpcError::Closed)?,
        };
        guard.disarm();

        match outcome {
            CallOutcome::Ok(ret) if ret.len() > max_ret_size => Err(RpcError::PayloadTooLarge {
                len: ret.len(),
                max: max_ret_size,
            }),
            CallOutcome::Ok(ret) => Ok(Bytes::from(ret)),
            CallOutcome::Err(err) => Err(RpcError::from_wire(err)),
        }
    }

    /// Answer a correlated request that was not dispatched to a call handler.
    pub(crate) async fn respond(&self, id: u64, outcome: CallOutcome) {
        let frame = Frame::new(self.inner.channel, FrameBody::CallResponse { id, outcome });
        if let Err(e) = self.inner.link.send(frame).await {
            tracing::debug!(
                session = %self.inner.session_id,
                correlation_id = id,
                error = %e,
                "failed to send response"
            );
        }
    }

    /// Route a frame from this control's channel.
    pub(crate) fn handle_frame(&self, body: FrameBody) {
        match body {
            FrameBody::CallRequest { id, name, arg } => self.inner.dispatch(id, name, arg),
            FrameBody::CallResponse { id, outcome } => self.inner.resolve(id, outcome),
            other => tracing::warn!(
                session = %self.inner.session_id,
                channel = self.inner.channel,
                kind = other.kind(),
                "unexpected frame on control channel"
            ),
        }
    }

    /// Fail every pending call with `Closed` and refuse new ones.
    pub(crate) fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<PendingCall> = self
            .inner
            .pending
            .lock()
            .drain()
            .map(|(_, call)| call)
            .collect();
        tracing::debug!(
            session = %self.inner.session_id,
            channel = self.inner.channel,
            failed = drained.len(),
            "control closed"
        );
    }
}

impl ControlInner {
    fn register_pending(
        &self,
        id: u64,
        deadline: Option<Instant>,
    ) -> Result<oneshot::Receiver<CallOutcome>, RpcError> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }
        if pending.len() >= self.max_pending {
            tracing::warn!(
                session = %self.session_id,
                pending_len = pending.len(),
                max_pending = self.max_pending,
                "too many pending calls; refusing new call"
            );
            return Err(RpcError::TooManyPending {
                max: self.max_pending,
            });
        }
        pending.insert(id, PendingCall { tx, deadline });
        Ok(rx)
    }

    fn resolve(&self, id: u64, outcome: CallOutcome) {
        let waiter = self.pending.lock().remove(&id);
        match waiter {
            Some(call) => {
                if call.tx.send(outcome).is_err() {
                    tracing::debug!(correlation_id = id, "waiter dropped before response");
                }
            }
            None => tracing::debug!(
                session = %self.session_id,
                correlation_id = id,
                "discarding response for unknown or expired call"
            ),
        }
    }

    fn dispatch(&self, id: u64, name: String, arg: Vec<u8>) {
        let handler = self.handlers.read().get(&name).cloned();
        let link = self.link.clone();
        let channel = self.channel;
        let session_id = self.session_id;

        tokio::spawn(async move {
            let outcome = match handler {
                Some(handler) => run_handler(&handler, &name, session_id, arg).await,
                None => {
                    tracing::debug!(session = %session_id, call = %name, "unknown call");
                    CallOutcome::Err(WireError::new(
                        ErrorCode::CallNotFound,
                        format!("unknown call '{name}'"),
                    ))
                }
            };
            let frame = Frame::new(channel, FrameBody::CallResponse { id, outcome });
            if let Err(e) = link.send(frame).await {
                tracing::debug!(
                    session = %session_id,
                    call = %name,
                    correlation_id = id,
                    error = %e,
                    "failed to send response"
                );
            }
        });
    }
}

async fn run_handler(
    handler: &CallHandler,
    name: &str,
    session_id: SessionId,
    arg: Vec<u8>,
) -> CallOutcome {
    let options = handler.options;
    if arg.len() > options.max_arg_size {
        return CallOutcome::Err(WireError::new(
            ErrorCode::PayloadTooLarge,
            format!(
                "argument of {} bytes exceeds max {}",
                arg.len(),
                options.max_arg_size
            ),
        ));
    }

    let ctx = CallContext {
        name: name.into(),
        session_id,
        deadline: Instant::now() + options.timeout,
    };
    let fut = (handler.func)(ctx, Bytes::from(arg));

    // A panicking handler must still answer, or the caller waits out its deadline.
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(ret)) if ret.len() > options.max_ret_size => {
            tracing::warn!(
                session = %session_id,
                call = name,
                len = ret.len(),
                max = options.max_ret_size,
                "return value exceeds ceiling"
            );
            CallOutcome::Err(WireError::new(
                ErrorCode::PayloadTooLarge,
                format!(
                    "return value of {} bytes exceeds max {}",
                    ret.len(),
                    options.max_ret_size
                ),
            ))
        }
        Ok(Ok(ret)) => CallOutcome::Ok(ret),
        Ok(Err(err)) => CallOutcome::Err(err.into_wire(name)),
        Err(panic) => {
            tracing::error!(
                session = %session_id,
                call = name,
                panic = %panic_message(&*panic),
                "handler panicked"
            );
            CallOutcome::Err(WireError::internal())
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
