//! tether-testkit: shared session scenarios for tether transports.
//!
//! Provides the `TransportFactory` trait and scenarios that every transport
//! must pass. Each scenario builds two sessions over a fresh transport pair
//! and drives one feature end to end.
//!
//! # Usage
//!
//! ```ignore
//! use tether_testkit::{MemFactory, TransportFactory};
//!
//! #[tokio::test]
//! async fn mem_call_round_trip() {
//!     tether_testkit::run_call_round_trip::<MemFactory>().await;
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tether_core::mem::MemTransport;
use tether_core::stream::StreamTransport;
use tether_core::{
    AnyTransport, AppError, CallOptions, Control, ErrorCode, Group, GroupError, HandlerError,
    Init, Listener, RawStream, Role, RpcError, Session, SessionConfig, SessionError, SignalContext,
    SignalError, Signaler, Transport, TransportError,
};
use tokio::net::{TcpListener, TcpStream};

/// Upper bound for anything a scenario waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// How long a scenario waits to conclude that nothing arrives.
pub const QUIET: Duration = Duration::from_millis(150);

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Transport or session creation failed.
    Setup(String),
    Rpc(RpcError),
    Session(SessionError),
    Signal(SignalError),
    Group(GroupError),
    Transport(TransportError),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Rpc(e) => write!(f, "call error: {}", e),
            TestError::Session(e) => write!(f, "session error: {}", e),
            TestError::Signal(e) => write!(f, "signal error: {}", e),
            TestError::Group(e) => write!(f, "group error: {}", e),
            TestError::Transport(e) => write!(f, "transport error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<RpcError> for TestError {
    fn from(e: RpcError) -> Self {
        TestError::Rpc(e)
    }
}

impl From<SessionError> for TestError {
    fn from(e: SessionError) -> Self {
        TestError::Session(e)
    }
}

impl From<SignalError> for TestError {
    fn from(e: SignalError) -> Self {
        TestError::Signal(e)
    }
}

impl From<GroupError> for TestError {
    fn from(e: GroupError) -> Self {
        TestError::Group(e)
    }
}

impl From<TransportError> for TestError {
    fn from(e: TransportError) -> Self {
        TestError::Transport(e)
    }
}

impl From<std::io::Error> for TestError {
    fn from(e: std::io::Error) -> Self {
        TestError::Setup(e.to_string())
    }
}

/// Factory trait for creating transport pairs for testing.
pub trait TransportFactory: Send + Sync + 'static {
    /// The transport type being tested.
    type Transport: Transport;

    /// Create a connected pair of transports.
    ///
    /// Returns (client_side, server_side) where frames sent from client
    /// are received by server and vice versa.
    fn connect_pair()
        -> impl Future<Output = Result<(Self::Transport, Self::Transport), TestError>> + Send;
}

/// In-process channel pair.
pub struct MemFactory;

impl TransportFactory for MemFactory {
    type Transport = MemTransport;

    fn connect_pair() -> impl Future<Output = Result<(MemTransport, MemTransport), TestError>> + Send {
        async { Ok(MemTransport::pair()) }
    }
}

/// Length-prefixed frames over an in-memory duplex pipe.
pub struct DuplexFactory;

impl TransportFactory for DuplexFactory {
    type Transport = StreamTransport;

    fn connect_pair(
    ) -> impl Future<Output = Result<(StreamTransport, StreamTransport), TestError>> + Send {
        async { Ok(StreamTransport::pair()) }
    }
}

/// Length-prefixed frames over a loopback TCP connection.
pub struct TcpFactory;

impl TransportFactory for TcpFactory {
    type Transport = StreamTransport;

    fn connect_pair(
    ) -> impl Future<Output = Result<(StreamTransport, StreamTransport), TestError>> + Send {
        async {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?;
            let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
            let client = client?;
            let (server, _) = accepted?;
            client.set_nodelay(true)?;
            server.set_nodelay(true)?;
            Ok((StreamTransport::new(client), StreamTransport::new(server)))
        }
    }
}

/// Install a test-friendly subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One initialized side of a connection.
pub struct Peer {
    pub session: Session,
    pub control: Control,
    pub signaler: Signaler,
}

/// Connect an initiator and an acceptor over a fresh transport pair and wait
/// until both are ready.
pub async fn connect_sessions<F: TransportFactory>(
    config: SessionConfig,
    client: Init,
    server: Init,
) -> Result<(Peer, Peer), TestError> {
    init_tracing();
    let (a, b) = F::connect_pair().await?;
    let client = start(AnyTransport::new(a), Role::Initiator, config.clone(), client)?;
    let server = start(AnyTransport::new(b), Role::Acceptor, config, server)?;

    for peer in [&client, &server] {
        if !within("handshake", peer.session.ready()).await? {
            return Err(TestError::Setup(format!(
                "session {} closed during handshake",
                peer.session.id()
            )));
        }
    }
    tracing::debug!(
        client = %client.session.id(),
        server = %server.session.id(),
        "test sessions connected"
    );
    Ok((client, server))
}

fn start(transport: AnyTransport, role: Role, config: SessionConfig, init: Init) -> Result<Peer, TestError> {
    let session = Session::new(transport, role, config)?;
    let (control, signaler) = session.init(init)?;
    Ok(Peer {
        session,
        control,
        signaler,
    })
}

/// Await `fut`, failing the scenario after [`WAIT`].
pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> Result<T, TestError> {
    tokio::time::timeout(WAIT, fut)
        .await
        .map_err(|_| TestError::Assertion(format!("timed out waiting for {}", what)))
}

fn expect_eq<T: PartialEq + std::fmt::Debug>(what: &str, got: T, expected: T) -> Result<(), TestError> {
    if got != expected {
        return Err(TestError::Assertion(format!(
            "{}: expected {:?}, got {:?}",
            what, expected, got
        )));
    }
    Ok(())
}

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Debug, PartialEq)]
enum InventoryError {
    OutOfStock(String),
}

impl AppError for InventoryError {
    fn code(&self) -> u32 {
        1
    }

    fn message(&self) -> String {
        match self {
            Self::OutOfStock(item) => item.clone(),
        }
    }

    fn from_status(code: u32, message: &str) -> Option<Self> {
        (code == 1).then(|| Self::OutOfStock(message.to_owned()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Quote {
    symbol: String,
    price: u64,
}

fn quote(symbol: &str, price: u64) -> Quote {
    Quote {
        symbol: symbol.into(),
        price,
    }
}

fn symbol_filter(symbol: &String, ctx: &SignalContext) -> bool {
    ctx.decode::<Quote>()
        .map(|q| q.symbol == *symbol)
        .unwrap_or(false)
}

fn inventory() -> Init {
    Init::new()
        .call("add", |_ctx, (a, b): (i32, i32)| async move {
            Ok::<_, HandlerError>(a + b)
        })
        .call("reserve", |_ctx, item: String| async move {
            Err::<u32, _>(HandlerError::app(&InventoryError::OutOfStock(item)))
        })
        .call_with(
            "slow",
            CallOptions::default().with_timeout(Duration::from_millis(50)),
            |_ctx, _: ()| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, HandlerError>(())
            },
        )
}

async fn next_event(listener: &mut Listener) -> Result<SignalContext, TestError> {
    within("signal event", listener.recv())
        .await?
        .ok_or_else(|| TestError::Assertion("listener closed early".into()))
}

// ============================================================================
// Test scenarios
// ============================================================================

/// Client calls `add(2, 3)` on the server and expects `5`, then the server
/// calls the client.
pub async fn run_call_round_trip<F: TransportFactory>() {
    if let Err(e) = run_call_round_trip_inner::<F>().await {
        panic!("run_call_round_trip failed: {}", e);
    }
}

async fn run_call_round_trip_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (client, server) =
        connect_sessions::<F>(SessionConfig::default(), inventory(), inventory()).await?;

    let sum: i32 = within("add", client.control.call("add", &(2, 3))).await??;
    expect_eq("client add", sum, 5)?;

    let sum: i32 = within("add", server.control.call("add", &(40, 2))).await??;
    expect_eq("server add", sum, 42)?;

    let calls = (0..16).map(|n| {
        let control = client.control.clone();
        async move { control.call::<_, i32>("add", &(n, n)).await }
    });
    let many = within("concurrent adds", join_all(calls))
        .await?
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;
    expect_eq("concurrent adds", many, (0..16).map(|n| n * 2).collect())?;
    Ok(())
}

/// An application error crosses the wire as (code, message) and converts
/// back into the caller's error type.
pub async fn run_application_error<F: TransportFactory>() {
    if let Err(e) = run_application_error_inner::<F>().await {
        panic!("run_application_error failed: {}", e);
    }
}

async fn run_application_error_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (client, _server) =
        connect_sessions::<F>(SessionConfig::default(), Init::new(), inventory()).await?;

    let result = within("reserve", client.control.call::<_, u32>("reserve", "widget")).await?;
    let err = match result {
        Ok(v) => {
            return Err(TestError::Assertion(format!(
                "expected an application error, got {}",
                v
            )))
        }
        Err(e) => e,
    };
    expect_eq("code", err.code(), Some(ErrorCode::Application(1)))?;
    expect_eq(
        "app error",
        err.app_error::<InventoryError>(),
        Some(InventoryError::OutOfStock("widget".into())),
    )?;

    let missing = within("missing", client.control.call::<_, ()>("missing", &())).await?;
    expect_eq(
        "unknown call",
        missing.err().and_then(|e| e.code()),
        Some(ErrorCode::CallNotFound),
    )
}

/// A handler that outlives its registered timeout fails the caller with
/// `DeadlineExceeded`, and the session keeps working.
pub async fn run_deadline_exceeded<F: TransportFactory>() {
    if let Err(e) = run_deadline_exceeded_inner::<F>().await {
        panic!("run_deadline_exceeded failed: {}", e);
    }
}

async fn run_deadline_exceeded_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (client, _server) =
        connect_sessions::<F>(SessionConfig::default(), Init::new(), inventory()).await?;

    let options = CallOptions::default().with_timeout(Duration::from_millis(50));
    let result = within("slow", client.control.async_call::<_, ()>("slow", &(), options)).await?;
    expect_eq("slow", result, Err(RpcError::DeadlineExceeded))?;

    let sum: i32 = within("add", client.control.call("add", &(1, 1))).await??;
    expect_eq("add after timeout", sum, 2)
}

/// Every listener receives a triggered event, in order; unknown ids are a
/// silent no-op.
pub async fn run_signal_delivery<F: TransportFactory>() {
    if let Err(e) = run_signal_delivery_inner::<F>().await {
        panic!("run_signal_delivery failed: {}", e);
    }
}

async fn run_signal_delivery_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (client, server) = connect_sessions::<F>(
        SessionConfig::default(),
        Init::new(),
        Init::new().signal("test"),
    )
    .await?;

    let mut first = client.signaler.on_signal("test").await?;
    let mut second = client.signaler.on_signal("test").await?;

    for n in 0..4u32 {
        within("trigger", server.signaler.trigger_signal("test", &n)).await??;
    }
    within("unknown trigger", server.signaler.trigger_signal("blabla", &99u32)).await??;

    for listener in [&mut first, &mut second] {
        for n in 0..4u32 {
            let ctx = next_event(listener).await?;
            expect_eq("signal id", ctx.signal_id(), "test")?;
            expect_eq("payload", ctx.decode::<u32>().ok(), Some(n))?;
        }
    }
    tokio::time::sleep(QUIET).await;
    if first.try_recv().is_some() {
        return Err(TestError::Assertion("unexpected extra event".into()));
    }
    Ok(())
}

/// A once-listener sees the first event only.
pub async fn run_once_signal<F: TransportFactory>() {
    if let Err(e) = run_once_signal_inner::<F>().await {
        panic!("run_once_signal failed: {}", e);
    }
}

async fn run_once_signal_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (client, server) = connect_sessions::<F>(
        SessionConfig::default(),
        Init::new(),
        Init::new().signal("test"),
    )
    .await?;

    let mut once = client.signaler.once_signal("test").await?;
    for n in 0..3u8 {
        within("trigger", server.signaler.trigger_signal("test", &n)).await??;
    }
    let ctx = next_event(&mut once).await?;
    expect_eq("first event", ctx.decode::<u8>().ok(), Some(0))?;
    expect_eq("after first", within("once end", once.recv()).await?.is_none(), true)
}

/// A listener's filter data narrows which events the peer sends it.
pub async fn run_signal_filter<F: TransportFactory>() {
    if let Err(e) = run_signal_filter_inner::<F>().await {
        panic!("run_signal_filter failed: {}", e);
    }
}

async fn run_signal_filter_inner<F: TransportFactory>() -> Result<(), TestError> {
    let (client, server) = connect_sessions::<F>(
        SessionConfig::default(),
        Init::new(),
        Init::new()
            .required_signal_filter("quotes", symbol_filter)
            .signal("plain"),
    )
    .await?;

    let mut listener = client.signaler.on_signal("quotes").await?;
    client.signaler.set_signal_filter("quotes", "ACME").await?;

    for q in [quote("INIT", 1), quote("ACME", 2), quote("TECH", 3)] {
        within("trigger", server.signaler.trigger_signal("quotes", &q)).await??;
    }
    let ctx = next_event(&mut listener).await?;
    expect_eq("filtered", ctx.decode::<Quote>().ok(), Some(quote("ACME", 2)))?;
    tokio::time::sleep(QUIET).await;
    expect_eq("only one match", listener.try_recv().is_none(), true)?;

    expect_eq(
        "undeclared",
        client.signaler.set_signal_filter("nowhere", "x").await,
        Err(SignalError::NotFound("nowhere".into())),
    )?;
    expect_eq(
        "no filter func",
        client.signaler.set_signal_filter("plain", "x").await,
        Err(SignalError::FilterFuncUndefined("plain".into())),
    )
}

/// A group fans out to members, honors exclusions and drops closed members.
pub async fn run_group_broadcast<F: TransportFactory>() {
    if let Err(e) = run_group_broadcast_inner::<F>().await {
        panic!("run_group_broadcast failed: {}", e);
    }
}

async fn run_group_broadcast_inner<F: TransportFactory>() -> Result<(), TestError> {
    let server_init = || Init::new().signal("test");
    let (one_client, one_server) =
        connect_sessions::<F>(SessionConfig::default(), Init::new(), server_init()).await?;
    let (two_client, two_server) =
        connect_sessions::<F>(SessionConfig::default(), Init::new(), server_init()).await?;
    let mut one = one_client.signaler.on_signal("test").await?;
    let mut two = two_client.signaler.on_signal("test").await?;

    let group = Group::new();
    group.add([&one_server.signaler, &two_server.signaler]);
    expect_eq("members", group.len(), 2)?;

    within("broadcast", group.trigger_signal("test", "testData", &[])).await??;
    for listener in [&mut one, &mut two] {
        let ctx = next_event(listener).await?;
        expect_eq("payload", ctx.decode::<String>().ok(), Some("testData".into()))?;
    }

    within(
        "excluding broadcast",
        group.trigger_signal("test", "second", &[&one_server.signaler]),
    )
    .await??;
    let ctx = next_event(&mut two).await?;
    expect_eq("payload", ctx.decode::<String>().ok(), Some("second".into()))?;
    tokio::time::sleep(QUIET).await;
    expect_eq("excluded member", one.try_recv().is_none(), true)?;

    one_client.session.close();
    within("member close", one_server.session.closed()).await?;
    expect_eq("members after close", group.len(), 1)?;
    Ok(())
}

/// A raw stream moves more data than one window holds, in order.
pub async fn run_raw_stream_transfer<F: TransportFactory>() {
    if let Err(e) = run_raw_stream_transfer_inner::<F>().await {
        panic!("run_raw_stream_transfer failed: {}", e);
    }
}

const TRANSFER_LEN: usize = 32 * 1024;

async fn count_and_reply(mut stream: RawStream) {
    let mut received = Vec::with_capacity(TRANSFER_LEN);
    while received.len() < TRANSFER_LEN {
        match stream.recv().await {
            Some(chunk) => received.extend_from_slice(&chunk),
            None => return,
        }
    }
    let digest: u64 = received
        .iter()
        .enumerate()
        .map(|(i, b)| (i as u64 + 1) * u64::from(*b))
        .sum();
    let _ = stream.send(&digest.to_le_bytes()).await;
    while stream.recv().await.is_some() {}
}

async fn run_raw_stream_transfer_inner<F: TransportFactory>() -> Result<(), TestError> {
    let config = SessionConfig {
        stream_window: 4,
        stream_chunk_size: 512,
        ..SessionConfig::default()
    };
    let (client, _server) = connect_sessions::<F>(
        config,
        Init::new(),
        Init::new().stream("upload", count_and_reply),
    )
    .await?;

    let data: Vec<u8> = (0..TRANSFER_LEN).map(|i| (i % 253) as u8).collect();
    let expected: u64 = data
        .iter()
        .enumerate()
        .map(|(i, b)| (i as u64 + 1) * u64::from(*b))
        .sum();

    let mut stream = within("open", client.session.open_stream("upload")).await??;
    within("upload", stream.send(&data)).await??;
    let reply = within("digest", stream.recv())
        .await?
        .ok_or_else(|| TestError::Assertion("stream closed before digest".into()))?;
    let digest = <[u8; 8]>::try_from(&reply[..])
        .map(u64::from_le_bytes)
        .map_err(|_| TestError::Assertion(format!("digest has {} bytes", reply.len())))?;
    expect_eq("digest", digest, expected)?;
    stream.close().await?;

    let rejected = within("reject", client.session.open_stream("download")).await?;
    expect_eq(
        "unknown channel",
        rejected.err(),
        Some(SessionError::StreamRejected {
            channel: "download".into(),
        }),
    )
}

/// Closing one side closes the other and fails its pending calls.
pub async fn run_close_propagation<F: TransportFactory>() {
    if let Err(e) = run_close_propagation_inner::<F>().await {
        panic!("run_close_propagation failed: {}", e);
    }
}

async fn run_close_propagation_inner<F: TransportFactory>() -> Result<(), TestError> {
    let server = Init::new().call("hang", |_ctx, _: ()| async move {
        std::future::pending::<()>().await;
        Ok::<_, HandlerError>(())
    });
    let (client, server) = connect_sessions::<F>(SessionConfig::default(), Init::new(), server).await?;

    let pending = {
        let control = client.control.clone();
        tokio::spawn(async move { control.call::<_, ()>("hang", &()).await })
    };
    tokio::time::sleep(QUIET).await;
    server.session.close();

    within("client close", client.session.closed()).await?;
    let result = within("pending call", pending)
        .await?
        .map_err(|e| TestError::Assertion(format!("call task failed: {}", e)))?;
    expect_eq("pending call", result, Err(RpcError::Closed))?;
    expect_eq("client closed", client.signaler.is_closed(), true)
}
