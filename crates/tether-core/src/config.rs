//! Session limits and timeouts.
//!
//! Every field has a default and an environment override. Overrides that
//! fail to parse or are zero are ignored.

use std::str::FromStr;
use std::time::Duration;

use crate::control::CallOptions;
use crate::SessionError;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ARG_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_RET_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_PENDING: usize = 8192;
pub const DEFAULT_STREAM_INIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STREAM_WINDOW: u32 = 64;
pub const DEFAULT_STREAM_CHUNK_SIZE: usize = 32 * 1024;
pub const DEFAULT_LISTENER_QUEUE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Largest encoded frame accepted or sent.
    pub max_frame_size: usize,
    /// Deadline for writing one frame. A timed-out write closes the session.
    pub write_timeout: Duration,
    /// How long to wait for the peer's hello. Expiry closes the session.
    pub handshake_timeout: Duration,
    /// Registered timeout for calls that don't name one.
    pub call_timeout: Duration,
    /// Argument ceiling for synchronous calls.
    pub max_arg_size: usize,
    /// Return ceiling for synchronous calls.
    pub max_ret_size: usize,
    pub max_pending_calls: usize,
    pub stream_init_timeout: Duration,
    /// Data frames a raw-stream sender may have in flight.
    pub stream_window: u32,
    pub stream_chunk_size: usize,
    /// Queue size used by `on_signal`.
    pub listener_queue_size: usize,
    /// How long `trigger_signal` waits for the peer to take the event.
    /// `None` waits until the session closes.
    pub trigger_timeout: Option<Duration>,
    /// How long an inbound trigger waits on a full listener queue before the
    /// event is dropped for that listener. `None` waits until there is room.
    pub delivery_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_arg_size: DEFAULT_MAX_ARG_SIZE,
            max_ret_size: DEFAULT_MAX_RET_SIZE,
            max_pending_calls: DEFAULT_MAX_PENDING,
            stream_init_timeout: DEFAULT_STREAM_INIT_TIMEOUT,
            stream_window: DEFAULT_STREAM_WINDOW,
            stream_chunk_size: DEFAULT_STREAM_CHUNK_SIZE,
            listener_queue_size: DEFAULT_LISTENER_QUEUE,
            trigger_timeout: None,
            delivery_timeout: None,
        }
    }
}

impl SessionConfig {
    /// Defaults overlaid with `TETHER_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = parse_positive::<usize>(lookup("TETHER_MAX_FRAME_SIZE")) {
            self.max_frame_size = v;
        }
        if let Some(v) = parse_millis(lookup("TETHER_WRITE_TIMEOUT_MS")) {
            self.write_timeout = v;
        }
        if let Some(v) = parse_millis(lookup("TETHER_HANDSHAKE_TIMEOUT_MS")) {
            self.handshake_timeout = v;
        }
        if let Some(v) = parse_millis(lookup("TETHER_CALL_TIMEOUT_MS")) {
            self.call_timeout = v;
        }
        if let Some(v) = parse_positive::<usize>(lookup("TETHER_MAX_ARG_SIZE")) {
            self.max_arg_size = v;
        }
        if let Some(v) = parse_positive::<usize>(lookup("TETHER_MAX_RET_SIZE")) {
            self.max_ret_size = v;
        }
        if let Some(v) = parse_positive::<usize>(lookup("TETHER_MAX_PENDING")) {
            self.max_pending_calls = v;
        }
        if let Some(v) = parse_millis(lookup("TETHER_STREAM_INIT_TIMEOUT_MS")) {
            self.stream_init_timeout = v;
        }
        if let Some(v) = parse_positive::<u32>(lookup("TETHER_STREAM_WINDOW")) {
            self.stream_window = v;
        }
        if let Some(v) = parse_positive::<usize>(lookup("TETHER_STREAM_CHUNK_SIZE")) {
            self.stream_chunk_size = v;
        }
        if let Some(v) = parse_positive::<usize>(lookup("TETHER_LISTENER_QUEUE")) {
            self.listener_queue_size = v;
        }
        if let Some(v) = parse_millis(lookup("TETHER_TRIGGER_TIMEOUT_MS")) {
            self.trigger_timeout = Some(v);
        }
        if let Some(v) = parse_millis(lookup("TETHER_DELIVERY_TIMEOUT_MS")) {
            self.delivery_timeout = Some(v);
        }
        self
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        let invalid =
            |msg: &str| -> Result<(), SessionError> { Err(SessionError::InvalidConfig(msg.to_owned())) };

        if self.max_frame_size == 0 {
            return invalid("max_frame_size must be non-zero");
        }
        if self.handshake_timeout.is_zero() {
            return invalid("handshake_timeout must be non-zero");
        }
        if self.max_arg_size == 0 || self.max_ret_size == 0 {
            return invalid("call size ceilings must be non-zero");
        }
        if self.max_pending_calls == 0 {
            return invalid("max_pending_calls must be non-zero");
        }
        if self.stream_window == 0 {
            return invalid("stream_window must be non-zero");
        }
        if self.stream_chunk_size == 0 || self.stream_chunk_size >= self.max_frame_size {
            return invalid("stream_chunk_size must be non-zero and below max_frame_size");
        }
        if self.listener_queue_size == 0 {
            return invalid("listener_queue_size must be non-zero");
        }
        Ok(())
    }

    /// Options for a synchronous call registered with the default timeout.
    pub fn call_options(&self) -> CallOptions {
        CallOptions {
            timeout: self.call_timeout,
            max_arg_size: self.max_arg_size,
            max_ret_size: self.max_ret_size,
        }
    }
}

fn parse_positive<T>(value: Option<String>) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    value
        .and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| *v > T::default())
}

fn parse_millis(value: Option<String>) -> Option<Duration> {
    parse_positive::<u64>(value).map(Duration::from_millis)
}
