//! Signaler: filtered publish/subscribe between two peers.
//!
//! Each side declares the signals it may trigger (`add_signal`) and
//! subscribes to the signals the peer triggers (`on_signal` and friends).
//! Subscribing announces interest to the peer with `setSignalState` before
//! returning, so a trigger issued afterwards reaches the new listener.
//! Triggers for signals nobody listens to never leave the triggering side.
//!
//! Inbound triggers are delivered by one worker per signal id, in arrival
//! order. The worker acknowledges a trigger only after every listener has
//! taken the event, so a full listener queue slows the triggering peer down
//! for that signal id alone. Triggers for ids without listeners are
//! acknowledged straight away, and a worker exits once its id has no
//! listeners and nothing queued.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::Instant;

use crate::codec::{Codec, PostcardCodec};
use crate::config::SessionConfig;
use crate::control::{panic_message, Control};
use crate::frame::{CallOutcome, FrameBody, SIGNAL_CHANNEL};
use crate::link::Link;
use crate::session::SessionId;
use crate::validate::Validate;
use crate::{DecodeError, ErrorCode, HandlerError, RpcError, SignalError};

const SET_SIGNAL_STATE: &str = "setSignalState";
const SET_SIGNAL_FILTER: &str = "setSignalFilter";

#[derive(Debug, Serialize, Deserialize)]
struct SignalState {
    signal: String,
    active: bool,
}

impl Validate for SignalState {}

#[derive(Debug, Serialize, Deserialize)]
struct SignalFilter {
    signal: String,
    data: Vec<u8>,
}

impl Validate for SignalFilter {}

/// One triggered event, as seen by a listener or a filter.
#[derive(Debug, Clone)]
pub struct SignalContext {
    signal: Arc<str>,
    data: Bytes,
    session_id: SessionId,
}

impl SignalContext {
    pub fn signal_id(&self) -> &str {
        &self.signal
    }

    /// Encoded payload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Session the event arrived on (or, for filters, is about to leave on).
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        PostcardCodec::decode(&self.data)
    }
}

type FilterFn = Arc<dyn Fn(&SignalContext) -> bool + Send + Sync>;
type FilterFactory = Arc<dyn Fn(&[u8]) -> Result<FilterFn, DecodeError> + Send + Sync>;
type Callback = Arc<dyn Fn(SignalContext) + Send + Sync>;

/// Filter installed by the peer for one outgoing signal.
///
/// The predicate is built on this side from the peer's filter data by the
/// function given to [`Signaler::add_signal_filter`]; only data crosses the
/// connection.
#[derive(Clone, Default)]
enum FilterSpec {
    #[default]
    NoFilter,
    Predicate { data: Bytes, eval: FilterFn },
}

impl std::fmt::Debug for FilterSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoFilter => f.write_str("NoFilter"),
            Self::Predicate { data, .. } => f
                .debug_struct("Predicate")
                .field("data_len", &data.len())
                .finish_non_exhaustive(),
        }
    }
}

/// Trigger-side view of a signal.
#[derive(Default)]
struct OutboundSignal {
    declared: bool,
    remote_active: bool,
    factory: Option<FilterFactory>,
    require_filter: bool,
    filter: FilterSpec,
}

#[derive(Clone)]
enum Sink {
    Queue(mpsc::Sender<SignalContext>),
    Func(Callback),
}

struct ListenerEntry {
    key: u64,
    once: bool,
    sink: Sink,
}

/// Listening-side view of a signal.
#[derive(Default)]
struct InboundSignal {
    listeners: Vec<ListenerEntry>,
    filter_set: bool,
    /// Last state acknowledged by the peer.
    announced: bool,
}

impl InboundSignal {
    fn wants_events(&self) -> bool {
        !self.listeners.is_empty() || self.filter_set
    }
}

enum Delivery {
    Trigger { correlation_id: u64, ctx: SignalContext },
    /// Interest in the signal was withdrawn.
    Idle,
}

/// Identifies a close hook registered on a [`Signaler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

type CloseHook = Box<dyn FnOnce() + Send>;

/// Handle to one side's signal subsystem. Cheap to clone.
#[derive(Clone)]
pub struct Signaler {
    inner: Arc<SignalerInner>,
}

impl std::fmt::Debug for Signaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signaler")
            .field("session", &self.inner.session_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

pub(crate) struct SignalerInner {
    session_id: SessionId,
    control: Control,
    listener_queue_size: usize,
    trigger_timeout: Option<Duration>,
    delivery_timeout: Option<Duration>,
    outbound: Mutex<HashMap<String, OutboundSignal>>,
    inbound: Mutex<HashMap<String, InboundSignal>>,
    state_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    deliveries: Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
    close_hooks: Mutex<Vec<(HookId, CloseHook)>>,
    next_key: AtomicU64,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl Signaler {
    pub(crate) fn new(session_id: SessionId, link: Arc<Link>, config: &SessionConfig) -> Self {
        let control = Control::new(SIGNAL_CHANNEL, session_id, link, config);
        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new(SignalerInner {
            session_id,
            control: control.clone(),
            listener_queue_size: config.listener_queue_size,
            trigger_timeout: config.trigger_timeout,
            delivery_timeout: config.delivery_timeout,
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            state_locks: Mutex::new(HashMap::new()),
            deliveries: Mutex::new(HashMap::new()),
            close_hooks: Mutex::new(Vec::new()),
            next_key: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            closed_tx,
        });

        let weak = Arc::downgrade(&inner);
        control.register_call(SET_SIGNAL_STATE, config.call_timeout, move |_ctx, req: SignalState| {
            let weak = weak.clone();
            async move {
                let inner = weak.upgrade().ok_or_else(|| HandlerError::internal("signaler gone"))?;
                inner.set_remote_state(req.signal, req.active);
                Ok::<_, HandlerError>(())
            }
        });

        let weak = Arc::downgrade(&inner);
        control.register_call(SET_SIGNAL_FILTER, config.call_timeout, move |_ctx, req: SignalFilter| {
            let weak = weak.clone();
            async move {
                let inner = weak.upgrade().ok_or_else(|| HandlerError::internal("signaler gone"))?;
                inner.set_remote_filter(&req.signal, req.data)
            }
        });

        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<SignalerInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<SignalerInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), SignalError> {
        if self.is_closed() {
            Err(SignalError::Closed)
        } else {
            Ok(())
        }
    }

    /// Declare a signal this side may trigger. Idempotent.
    pub fn add_signal(&self, id: &str) {
        self.inner.declare(id, None, false);
    }

    /// Declare a signal whose listeners may narrow delivery with a filter.
    ///
    /// `filter` receives the peer's decoded filter data and the outgoing
    /// event; returning `false` skips the event for this peer. Without a
    /// filter from the peer every event is sent.
    pub fn add_signal_filter<D, F>(&self, id: &str, filter: F)
    where
        D: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&D, &SignalContext) -> bool + Send + Sync + 'static,
    {
        self.inner.declare(id, Some(filter_factory(filter)), false);
    }

    /// Like [`add_signal_filter`](Self::add_signal_filter), but events are
    /// only sent to a peer once it has set a filter.
    pub fn add_required_signal_filter<D, F>(&self, id: &str, filter: F)
    where
        D: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&D, &SignalContext) -> bool + Send + Sync + 'static,
    {
        self.inner.declare(id, Some(filter_factory(filter)), true);
    }

    /// Send an event to the peer's listeners of `id`.
    ///
    /// A signal the peer doesn't listen to, or that was never declared, is
    /// a silent no-op. Otherwise this waits until the peer has handed the
    /// event to every listener.
    pub async fn trigger_signal<T>(&self, id: &str, data: &T) -> Result<(), SignalError>
    where
        T: Serialize + ?Sized,
    {
        let data = PostcardCodec::encode(data)?;
        self.trigger_signal_raw(id, Bytes::from(data)).await
    }

    pub async fn trigger_signal_raw(&self, id: &str, data: Bytes) -> Result<(), SignalError> {
        self.inner.trigger(id, data).await
    }

    /// Subscribe with the default queue size.
    pub async fn on_signal(&self, id: &str) -> Result<Listener, SignalError> {
        self.on_signal_opts(id, self.inner.listener_queue_size).await
    }

    /// Subscribe with a queue of `queue_size` events (at least 1).
    pub async fn on_signal_opts(&self, id: &str, queue_size: usize) -> Result<Listener, SignalError> {
        self.queue_listener(id, queue_size, false).await
    }

    /// Run `f` inline for every event until the subscription is closed or
    /// the signaler closes. A panicking callback does not affect other
    /// listeners.
    pub async fn on_signal_func<F>(&self, id: &str, f: F) -> Result<Subscription, SignalError>
    where
        F: Fn(SignalContext) + Send + Sync + 'static,
    {
        self.func_listener(id, Arc::new(f), false).await
    }

    /// Receive at most one event.
    pub async fn once_signal(&self, id: &str) -> Result<Listener, SignalError> {
        self.queue_listener(id, 1, true).await
    }

    pub async fn once_signal_opts(&self, id: &str, queue_size: usize) -> Result<Listener, SignalError> {
        self.queue_listener(id, queue_size, true).await
    }

    pub async fn once_signal_func<F>(&self, id: &str, f: F) -> Result<Subscription, SignalError>
    where
        F: Fn(SignalContext) + Send + Sync + 'static,
    {
        self.func_listener(id, Arc::new(f), true).await
    }

    async fn queue_listener(
        &self,
        id: &str,
        queue_size: usize,
        once: bool,
    ) -> Result<Listener, SignalError> {
        if queue_size == 0 {
            return Err(SignalError::ZeroQueueSize);
        }
        let (tx, rx) = mpsc::channel(queue_size);
        let key = self.add_listener(id, once, Sink::Queue(tx)).await?;
        Ok(Listener {
            signal: id.into(),
            key,
            rx,
            signaler: self.downgrade(),
            closed: false,
        })
    }

    async fn func_listener(
        &self,
        id: &str,
        f: Callback,
        once: bool,
    ) -> Result<Subscription, SignalError> {
        let key = self.add_listener(id, once, Sink::Func(f)).await?;
        Ok(Subscription {
            signal: id.into(),
            key,
            signaler: self.downgrade(),
        })
    }

    async fn add_listener(&self, id: &str, once: bool, sink: Sink) -> Result<u64, SignalError> {
        self.ensure_open()?;
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        {
            let mut inbound = self.inner.inbound.lock();
            if self.is_closed() {
                return Err(SignalError::Closed);
            }
            inbound
                .entry(id.to_owned())
                .or_default()
                .listeners
                .push(ListenerEntry { key, once, sink });
        }

        match self.inner.sync_state(id).await {
            Ok(()) => Ok(key),
            Err(SignalError::Closed) => {
                self.inner.inbound.lock().remove(id);
                Err(SignalError::Closed)
            }
            Err(e) => {
                // Activation is advisory; the listener still works once the
                // peer learns about it.
                tracing::warn!(
                    session = %self.inner.session_id,
                    signal = id,
                    error = %e,
                    "failed to announce signal state"
                );
                Ok(key)
            }
        }
    }

    /// Ask the peer to filter `id` with `data` before sending.
    pub async fn set_signal_filter<T>(&self, id: &str, data: &T) -> Result<(), SignalError>
    where
        T: Serialize + ?Sized,
    {
        let data = PostcardCodec::encode(data)?;
        self.set_signal_filter_raw(id, data).await
    }

    pub async fn set_signal_filter_raw(&self, id: &str, data: Vec<u8>) -> Result<(), SignalError> {
        self.ensure_open()?;
        let req = SignalFilter {
            signal: id.to_owned(),
            data,
        };
        match self.inner.control.call::<_, ()>(SET_SIGNAL_FILTER, &req).await {
            Ok(()) => {}
            Err(RpcError::Status {
                code: ErrorCode::SignalNotFound,
                ..
            }) => return Err(SignalError::NotFound(id.to_owned())),
            Err(RpcError::Status {
                code: ErrorCode::FilterFuncUndefined,
                ..
            }) => return Err(SignalError::FilterFuncUndefined(id.to_owned())),
            Err(e) => return Err(e.into()),
        }

        self.inner
            .inbound
            .lock()
            .entry(id.to_owned())
            .or_default()
            .filter_set = true;
        self.inner.sync_state(id).await
    }

    /// Run `hook` when this signaler closes. Returns `None`, without
    /// registering, if it is already closed.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) -> Option<HookId> {
        let mut hooks = self.inner.close_hooks.lock();
        if self.is_closed() {
            return None;
        }
        let id = HookId(self.inner.next_key.fetch_add(1, Ordering::Relaxed));
        hooks.push((id, Box::new(hook)));
        Some(id)
    }

    pub fn remove_close_hook(&self, id: HookId) -> bool {
        let mut hooks = self.inner.close_hooks.lock();
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }

    pub(crate) fn handle_frame(&self, body: FrameBody) {
        match body {
            FrameBody::SignalTrigger { id, signal, data } => self.enqueue_trigger(id, signal, data),
            other => self.inner.control.handle_frame(other),
        }
    }

    fn enqueue_trigger(&self, correlation_id: u64, signal: String, data: Vec<u8>) {
        let ctx = SignalContext {
            signal: signal.as_str().into(),
            data: Bytes::from(data),
            session_id: self.inner.session_id,
        };
        let mut workers = self.inner.deliveries.lock();
        if self.is_closed() {
            return;
        }
        if !workers.contains_key(&signal) && !self.inner.is_listening(&signal) {
            drop(workers);
            tracing::trace!(session = %self.inner.session_id, signal = %signal, "no listeners; acknowledging");
            let control = self.inner.control.clone();
            tokio::spawn(async move {
                control.respond(correlation_id, CallOutcome::Ok(Vec::new())).await;
            });
            return;
        }
        let worker = workers.entry(signal).or_insert_with_key(|signal| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_delivery(self.downgrade(), signal.clone(), rx));
            tx
        });
        if worker
            .send(Delivery::Trigger {
                correlation_id,
                ctx,
            })
            .is_err()
        {
            tracing::debug!(correlation_id, "delivery worker gone; dropping trigger");
        }
    }

    pub(crate) fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.closed_tx.send_replace(true);
        inner.control.close();
        inner.inbound.lock().clear();
        inner.deliveries.lock().clear();
        inner.outbound.lock().clear();

        let hooks = std::mem::take(&mut *inner.close_hooks.lock());
        for (_, hook) in hooks {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(hook)) {
                tracing::warn!(
                    session = %inner.session_id,
                    panic = %panic_message(&*panic),
                    "signaler close hook panicked"
                );
            }
        }
        tracing::debug!(session = %inner.session_id, "signaler closed");
    }
}

fn filter_factory<D, F>(filter: F) -> FilterFactory
where
    D: DeserializeOwned + Send + Sync + 'static,
    F: Fn(&D, &SignalContext) -> bool + Send + Sync + 'static,
{
    let filter = Arc::new(filter);
    Arc::new(move |bytes: &[u8]| {
        let data: D = PostcardCodec::decode(bytes)?;
        let filter = filter.clone();
        let eval: FilterFn = Arc::new(move |ctx: &SignalContext| filter(&data, ctx));
        Ok(eval)
    })
}

impl SignalerInner {
    fn declare(&self, id: &str, factory: Option<FilterFactory>, require_filter: bool) {
        let mut outbound = self.outbound.lock();
        let entry = outbound.entry(id.to_owned()).or_default();
        entry.declared = true;
        if let Some(factory) = factory {
            entry.factory = Some(factory);
            entry.require_filter = require_filter;
        }
    }

    fn set_remote_state(&self, signal: String, active: bool) {
        tracing::debug!(session = %self.session_id, signal = %signal, active, "peer signal state");
        // Recorded even for undeclared ids: the peer may subscribe first.
        self.outbound.lock().entry(signal).or_default().remote_active = active;
    }

    fn set_remote_filter(&self, signal: &str, data: Vec<u8>) -> Result<(), HandlerError> {
        let factory = {
            let outbound = self.outbound.lock();
            let entry = match outbound.get(signal) {
                Some(entry) if entry.declared => entry,
                _ => {
                    return Err(HandlerError::Status {
                        code: ErrorCode::SignalNotFound,
                        message: format!("signal '{signal}' not found"),
                    })
                }
            };
            entry.factory.clone().ok_or_else(|| HandlerError::Status {
                code: ErrorCode::FilterFuncUndefined,
                message: format!("no filter function for signal '{signal}'"),
            })?
        };

        let eval = factory(&data).map_err(|e| HandlerError::invalid_argument(e.to_string()))?;
        if let Some(entry) = self.outbound.lock().get_mut(signal) {
            entry.filter = FilterSpec::Predicate {
                data: Bytes::from(data),
                eval,
            };
        }
        tracing::debug!(session = %self.session_id, signal, "peer installed filter");
        Ok(())
    }

    async fn trigger(&self, id: &str, data: Bytes) -> Result<(), SignalError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SignalError::Closed);
        }

        let filter = {
            let outbound = self.outbound.lock();
            let Some(entry) = outbound.get(id) else {
                return Ok(());
            };
            if !entry.declared || !entry.remote_active {
                return Ok(());
            }
            match &entry.filter {
                FilterSpec::NoFilter if entry.require_filter => return Ok(()),
                FilterSpec::NoFilter => None,
                FilterSpec::Predicate { eval, .. } => Some(eval.clone()),
            }
        };

        if let Some(eval) = filter {
            let ctx = SignalContext {
                signal: id.into(),
                data: data.clone(),
                session_id: self.session_id,
            };
            match std::panic::catch_unwind(AssertUnwindSafe(|| eval(&ctx))) {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(panic) => {
                    tracing::warn!(
                        session = %self.session_id,
                        signal = id,
                        panic = %panic_message(&*panic),
                        "signal filter panicked; skipping"
                    );
                    return Ok(());
                }
            }
        }

        let deadline = self.trigger_timeout.map(|t| Instant::now() + t);
        let signal = id.to_owned();
        self.control
            .request(
                id,
                move |correlation_id| FrameBody::SignalTrigger {
                    id: correlation_id,
                    signal,
                    data: data.to_vec(),
                },
                deadline,
                usize::MAX,
            )
            .await?;
        Ok(())
    }

    fn state_lock(&self, id: &str) -> Arc<AsyncMutex<()>> {
        self.state_locks
            .lock()
            .entry(id.to_owned())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Push the current interest in `id` to the peer if it changed.
    ///
    /// Serialized per id so the peer sees states in the order they were
    /// decided.
    async fn sync_state(&self, id: &str) -> Result<(), SignalError> {
        let lock = self.state_lock(id);
        let _serialized = lock.lock().await;
        let result = self.announce(id).await;
        self.forget_if_idle(id, &lock);
        result
    }

    async fn announce(&self, id: &str) -> Result<(), SignalError> {
        let (desired, announced) = {
            let inbound = self.inbound.lock();
            inbound
                .get(id)
                .map_or((false, false), |s| (s.wants_events(), s.announced))
        };
        if desired == announced {
            return Ok(());
        }

        let req = SignalState {
            signal: id.to_owned(),
            active: desired,
        };
        self.control.call::<_, ()>(SET_SIGNAL_STATE, &req).await?;
        if let Some(state) = self.inbound.lock().get_mut(id) {
            state.announced = desired;
        }
        tracing::debug!(session = %self.session_id, signal = id, active = desired, "announced signal state");
        Ok(())
    }

    /// Drop the bookkeeping for `id` once nothing listens and the peer
    /// knows it. `lock` is the caller's handle on the state lock.
    fn forget_if_idle(&self, id: &str, lock: &Arc<AsyncMutex<()>>) {
        let mut locks = self.state_locks.lock();
        let mut inbound = self.inbound.lock();
        if inbound.get(id).is_some_and(|s| s.wants_events() || s.announced) {
            return;
        }
        inbound.remove(id);
        // Anyone else holding the lock is about to use it.
        if Arc::strong_count(lock) == 2 {
            locks.remove(id);
        }
    }

    fn is_listening(&self, id: &str) -> bool {
        self.inbound.lock().get(id).is_some_and(InboundSignal::wants_events)
    }

    /// Called by a delivery worker with an empty queue. Unregisters the
    /// worker and returns `true` if its signal has no listeners left.
    fn retire_worker(&self, id: &str, rx: &mpsc::UnboundedReceiver<Delivery>) -> bool {
        let mut workers = self.deliveries.lock();
        // Triggers are queued under this lock, so the check holds.
        if !rx.is_empty() || self.is_listening(id) {
            return false;
        }
        workers.remove(id);
        true
    }

    fn remove_listener(self: &Arc<Self>, id: &str, key: u64) {
        let deactivate = {
            let mut inbound = self.inbound.lock();
            let Some(state) = inbound.get_mut(id) else {
                return;
            };
            let before = state.listeners.len();
            state.listeners.retain(|l| l.key != key);
            before != state.listeners.len() && !state.wants_events()
        };
        if deactivate {
            if let Some(worker) = self.deliveries.lock().get(id) {
                let _ = worker.send(Delivery::Idle);
            }
            self.spawn_sync_state(id);
        }
    }

    fn spawn_sync_state(self: &Arc<Self>, id: &str) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = self.clone();
        let id = id.to_owned();
        handle.spawn(async move {
            if let Err(e) = inner.sync_state(&id).await {
                tracing::debug!(session = %inner.session_id, signal = %id, error = %e, "failed to withdraw signal state");
            }
        });
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn deliver(self: &Arc<Self>, ctx: SignalContext) {
        let (targets, deactivate) = {
            let mut inbound = self.inbound.lock();
            let Some(state) = inbound.get_mut(ctx.signal_id()) else {
                return;
            };
            let targets: Vec<Sink> = state.listeners.iter().map(|l| l.sink.clone()).collect();
            let before = state.listeners.len();
            // Fire-once listeners leave the set before delivery so a
            // concurrent trigger can never reach them twice.
            state.listeners.retain(|l| !l.once);
            let removed = before != state.listeners.len();
            (targets, removed && !state.wants_events())
        };
        if deactivate {
            self.spawn_sync_state(ctx.signal_id());
        }

        for sink in targets {
            match sink {
                Sink::Queue(tx) => self.push(&tx, ctx.clone()).await,
                Sink::Func(f) => {
                    let event = ctx.clone();
                    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| f(event))) {
                        tracing::warn!(
                            session = %self.session_id,
                            signal = ctx.signal_id(),
                            panic = %panic_message(&*panic),
                            "signal callback panicked"
                        );
                    }
                }
            }
        }
    }

    async fn push(&self, tx: &mpsc::Sender<SignalContext>, ctx: SignalContext) {
        let signal = ctx.signal.clone();
        let send = async {
            match self.delivery_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, tx.send(ctx)).await {
                    Ok(sent) => sent.is_ok(),
                    Err(_elapsed) => {
                        tracing::warn!(
                            session = %self.session_id,
                            signal = %signal,
                            timeout_ms = timeout.as_millis() as u64,
                            "listener queue full; dropping event"
                        );
                        true
                    }
                },
                None => tx.send(ctx).await.is_ok(),
            }
        };
        tokio::select! {
            delivered = send => {
                if !delivered {
                    tracing::debug!(session = %self.session_id, signal = %signal, "listener gone");
                }
            }
            _ = self.wait_closed() => {}
        }
    }
}

async fn run_delivery(
    signaler: Weak<SignalerInner>,
    signal: String,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
) {
    while let Some(delivery) = rx.recv().await {
        let Some(inner) = signaler.upgrade() else {
            break;
        };
        if let Delivery::Trigger { correlation_id, ctx } = delivery {
            inner.deliver(ctx).await;
            inner
                .control
                .respond(correlation_id, CallOutcome::Ok(Vec::new()))
                .await;
        }
        if rx.is_empty() && inner.retire_worker(&signal, &rx) {
            break;
        }
    }
    tracing::trace!(signal = %signal, "delivery worker stopped");
}

/// A queue-backed subscription to one signal.
///
/// Dropping the listener unsubscribes it.
pub struct Listener {
    signal: Arc<str>,
    key: u64,
    rx: mpsc::Receiver<SignalContext>,
    signaler: Weak<SignalerInner>,
    closed: bool,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("signal", &self.signal)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Listener {
    pub fn signal_id(&self) -> &str {
        &self.signal
    }

    /// Next event, or `None` once the listener or its signaler is closed
    /// and the queue is drained. A fire-once listener ends after its event.
    pub async fn recv(&mut self) -> Option<SignalContext> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SignalContext> {
        self.rx.try_recv().ok()
    }

    /// Unsubscribe. Events already queued can still be received.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rx.close();
        if let Some(inner) = self.signaler.upgrade() {
            inner.remove_listener(&self.signal, self.key);
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// A callback subscription. The callback stays registered until
/// [`close`](Self::close) or until the signaler closes; dropping the handle
/// does not unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    signal: Arc<str>,
    key: u64,
    signaler: Weak<SignalerInner>,
}

impl Subscription {
    pub fn signal_id(&self) -> &str {
        &self.signal
    }

    pub fn close(self) {
        if let Some(inner) = self.signaler.upgrade() {
            inner.remove_listener(&self.signal, self.key);
        }
    }
}
