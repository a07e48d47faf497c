//! Wire envelope.
//!
//! Every transport frame carries exactly one postcard-encoded [`Frame`]. The
//! `channel` field names the logical stream channel: [`CONTROL_CHANNEL`] for
//! application calls, [`SIGNAL_CHANNEL`] for signal state, filter and trigger
//! traffic, and any other name for a raw stream channel.

use serde::{Deserialize, Serialize};

use crate::codec::{Codec, PostcardCodec};
use crate::{DecodeError, EncodeError, ErrorCode};

pub const PROTOCOL_VERSION: u32 = 1;

pub const CONTROL_CHANNEL: &str = "control";
pub const SIGNAL_CHANNEL: &str = "signal";

pub(crate) fn is_reserved_channel(channel: &str) -> bool {
    channel == CONTROL_CHANNEL || channel == SIGNAL_CHANNEL
}

/// Which end of the connection a session is.
///
/// Roles must be complementary. The initiator allocates odd raw-stream ids,
/// the acceptor even ones, so both sides can open streams without
/// coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Initiator,
    Acceptor,
}

impl Role {
    pub fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Acceptor,
            Self::Acceptor => Self::Initiator,
        }
    }

    pub(crate) fn first_stream_id(self) -> u32 {
        match self {
            Self::Initiator => 1,
            Self::Acceptor => 2,
        }
    }
}

/// First frame sent in each direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u32,
    pub role: Role,
}

/// Error body of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: i64,
    pub message: String,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_i64(),
            message: message.into(),
        }
    }

    pub(crate) fn internal() -> Self {
        Self::new(ErrorCode::Uncategorized, "internal error")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallOutcome {
    Ok(Vec<u8>),
    Err(WireError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameBody {
    Hello(Hello),
    CallRequest {
        id: u64,
        name: String,
        arg: Vec<u8>,
    },
    CallResponse {
        id: u64,
        outcome: CallOutcome,
    },
    /// Acknowledged with a `CallResponse` carrying the same id once every
    /// local listener has taken the event.
    SignalTrigger {
        id: u64,
        signal: String,
        data: Vec<u8>,
    },
    StreamOpen {
        stream: u32,
    },
    StreamAccept {
        stream: u32,
    },
    StreamReject {
        stream: u32,
    },
    StreamData {
        stream: u32,
        data: Vec<u8>,
    },
    StreamCredit {
        stream: u32,
        credits: u32,
    },
    StreamClose {
        stream: u32,
    },
}

impl FrameBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::CallRequest { .. } => "call-request",
            Self::CallResponse { .. } => "call-response",
            Self::SignalTrigger { .. } => "signal-trigger",
            Self::StreamOpen { .. } => "stream-open",
            Self::StreamAccept { .. } => "stream-accept",
            Self::StreamReject { .. } => "stream-reject",
            Self::StreamData { .. } => "stream-data",
            Self::StreamCredit { .. } => "stream-credit",
            Self::StreamClose { .. } => "stream-close",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub channel: String,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(channel: impl Into<String>, body: FrameBody) -> Self {
        Self {
            channel: channel.into(),
            body,
        }
    }

    pub fn hello(role: Role) -> Self {
        Self::new(
            CONTROL_CHANNEL,
            FrameBody::Hello(Hello {
                version: PROTOCOL_VERSION,
                role,
            }),
        )
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        PostcardCodec::encode(self)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        PostcardCodec::decode(buf)
    }
}
