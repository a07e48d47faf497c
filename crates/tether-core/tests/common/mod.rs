#![allow(dead_code)]

use std::time::Duration;

use tether_core::{AnyTransport, Control, Init, Role, Session, SessionConfig, Signaler};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// How long a test waits to conclude that nothing arrives.
pub const QUIET: Duration = Duration::from_millis(150);

pub struct Peer {
    pub session: Session,
    pub control: Control,
    pub signaler: Signaler,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn connect(client: Init, server: Init) -> (Peer, Peer) {
    connect_with(SessionConfig::default(), client, server).await
}

pub async fn connect_with(config: SessionConfig, client: Init, server: Init) -> (Peer, Peer) {
    init_tracing();
    let (a, b) = AnyTransport::mem_pair();
    let client = start(a, Role::Initiator, config.clone(), client);
    let server = start(b, Role::Acceptor, config, server);
    assert!(tokio::time::timeout(WAIT, client.session.ready()).await.unwrap());
    assert!(tokio::time::timeout(WAIT, server.session.ready()).await.unwrap());
    (client, server)
}

fn start(transport: AnyTransport, role: Role, config: SessionConfig, init: Init) -> Peer {
    let session = Session::new(transport, role, config).unwrap();
    let (control, signaler) = session.init(init).unwrap();
    Peer {
        session,
        control,
        signaler,
    }
}

pub async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(WAIT, fut)
        .await
        .expect("timed out")
}
