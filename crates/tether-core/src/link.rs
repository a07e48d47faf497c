//! Outbound half of a session: every frame leaves through here.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

use crate::frame::{Frame, FrameBody};
use crate::session::SessionId;
use crate::transport::AnyTransport;
use crate::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// Our hello has not been written yet.
    Pending,
    Open,
    Closed,
}

pub(crate) struct Link {
    transport: AnyTransport,
    session_id: SessionId,
    write_timeout: Duration,
    max_frame_size: usize,
    gate: watch::Sender<Gate>,
}

impl Link {
    pub(crate) fn new(
        transport: AnyTransport,
        session_id: SessionId,
        write_timeout: Duration,
        max_frame_size: usize,
    ) -> Self {
        let (gate, _) = watch::channel(Gate::Pending);
        Self {
            transport,
            session_id,
            write_timeout,
            max_frame_size,
            gate,
        }
    }

    pub(crate) fn transport(&self) -> &AnyTransport {
        &self.transport
    }

    pub(crate) fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Let frames other than the hello through.
    pub(crate) fn open(&self) {
        self.gate.send_if_modified(|gate| {
            if *gate == Gate::Pending {
                *gate = Gate::Open;
                true
            } else {
                false
            }
        });
    }

    async fn wait_open(&self) -> Result<(), TransportError> {
        let mut rx = self.gate.subscribe();
        let gate = rx
            .wait_for(|g| *g != Gate::Pending)
            .await
            .map(|g| *g)
            .unwrap_or(Gate::Closed);
        match gate {
            Gate::Open => Ok(()),
            _ => Err(TransportError::Closed),
        }
    }

    /// Encode and write one frame within the write deadline.
    ///
    /// Frames wait until the session's hello is out, so the peer always sees
    /// the hello first. An oversized frame fails without touching the
    /// transport. A failed or timed-out write closes the transport: a
    /// partial frame leaves the byte stream unusable.
    pub(crate) async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !matches!(frame.body, FrameBody::Hello(_)) {
            self.wait_open().await?;
        }

        let bytes = frame.encode()?;
        if bytes.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len: bytes.len(),
                max: self.max_frame_size,
            });
        }

        let kind = frame.body.kind();
        match tokio::time::timeout(self.write_timeout, self.transport.send_frame(Bytes::from(bytes)))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(TransportError::Closed)) => Err(TransportError::Closed),
            Ok(Err(e)) => {
                tracing::warn!(session = %self.session_id, kind, error = %e, "write failed, closing transport");
                self.close();
                Err(e)
            }
            Err(_elapsed) => {
                tracing::warn!(
                    session = %self.session_id,
                    kind,
                    timeout_ms = self.write_timeout.as_millis() as u64,
                    "write deadline exceeded, closing transport"
                );
                self.close();
                Err(TransportError::Timeout)
            }
        }
    }

    pub(crate) fn close(&self) {
        self.gate.send_replace(Gate::Closed);
        self.transport.close();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Role;

    fn link() -> (Link, AnyTransport) {
        let (a, b) = AnyTransport::mem_pair();
        (
            Link::new(a, SessionId::next(), Duration::from_secs(1), 1024),
            b,
        )
    }

    #[tokio::test]
    async fn frames_wait_for_the_hello() {
        let (link, peer) = link();
        let link = std::sync::Arc::new(link);

        let early = {
            let link = link.clone();
            tokio::spawn(async move {
                link.send(Frame::new("x", FrameBody::StreamClose { stream: 1 }))
                    .await
            })
        };
        tokio::task::yield_now().await;

        link.send(Frame::hello(Role::Initiator)).await.unwrap();
        link.open();
        early.await.unwrap().unwrap();

        let first = Frame::decode(&peer.recv_frame(1024).await.unwrap()).unwrap();
        assert!(matches!(first.body, FrameBody::Hello(_)));
        let second = Frame::decode(&peer.recv_frame(1024).await.unwrap()).unwrap();
        assert_eq!(second.body, FrameBody::StreamClose { stream: 1 });
    }

    #[tokio::test]
    async fn closing_releases_gated_senders() {
        let (link, _peer) = link();
        let link = std::sync::Arc::new(link);
        let waiting = {
            let link = link.clone();
            tokio::spawn(async move {
                link.send(Frame::new("x", FrameBody::StreamClose { stream: 1 }))
                    .await
            })
        };
        tokio::task::yield_now().await;
        link.close();
        assert_eq!(waiting.await.unwrap(), Err(TransportError::Closed));
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() {
        let (link, _peer) = link();
        link.open();
        let frame = Frame::new(
            "x",
            FrameBody::StreamData {
                stream: 1,
                data: vec![0; 4096],
            },
        );
        assert!(matches!(
            link.send(frame).await,
            Err(TransportError::FrameTooLarge { max: 1024, .. })
        ));
    }
}
