//! tether-core: sessions, calls and signals over one byte connection.
//!
//! This crate defines:
//! - Sessions and the read loop that demultiplexes frames ([`Session`], [`Init`])
//! - Request/response calls with typed errors ([`Control`], [`HandlerError`], [`RpcError`])
//! - Filtered publish/subscribe ([`Signaler`], [`Listener`]) and fan-out ([`Group`])
//! - Raw byte streams with credit flow control ([`RawStream`])
//! - Transport traits and backends ([`Transport`], [`AnyTransport`])
//! - The wire envelope ([`Frame`]) and its codec ([`Codec`], [`PostcardCodec`])
//! - Argument validation ([`Validate`])

#![forbid(unsafe_code)]

mod codec;
mod config;
mod control;
mod error;
mod frame;
mod group;
mod link;
mod raw_stream;
mod session;
mod signal;
mod transport;
mod validate;

pub use codec::*;
pub use config::*;
pub use control::*;
pub use error::*;
pub use frame::*;
pub use group::*;
pub use raw_stream::*;
pub use session::*;
pub use signal::*;
pub use transport::*;
pub use validate::*;
