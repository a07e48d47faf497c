//! Error codes and error types.
//!
//! Wire errors are a `(code, message)` pair. Code `0` is an uncategorized
//! failure, positive codes belong to the application and are carried
//! verbatim, negative codes are reserved for protocol failures detected by
//! the session itself.

use core::fmt;

use crate::frame::WireError;
use crate::session::SessionId;
use crate::validate::ValidationError;

/// Wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Unclassified failure (`0`). Internal handler errors and panics map here.
    Uncategorized,
    /// Argument failed field validation (`-1`).
    InvalidArgument,
    /// No handler registered under the requested name (`-2`).
    CallNotFound,
    /// Argument or return value exceeded its size ceiling (`-3`).
    PayloadTooLarge,
    /// Argument bytes could not be decoded (`-4`).
    MalformedPayload,
    /// Signal id was never declared by the peer (`-5`).
    SignalNotFound,
    /// Peer declared the signal without a filter function (`-6`).
    FilterFuncUndefined,
    /// Application-defined code, always non-zero.
    Application(u32),
}

impl ErrorCode {
    /// Decode a wire code. Positive codes outside `u32` are uncategorized.
    pub fn from_i64(value: i64) -> Self {
        match value {
            -1 => Self::InvalidArgument,
            -2 => Self::CallNotFound,
            -3 => Self::PayloadTooLarge,
            -4 => Self::MalformedPayload,
            -5 => Self::SignalNotFound,
            -6 => Self::FilterFuncUndefined,
            v if v > 0 => u32::try_from(v).map_or(Self::Uncategorized, Self::Application),
            _ => Self::Uncategorized,
        }
    }

    /// Wire representation. Every application code fits.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Uncategorized => 0,
            Self::InvalidArgument => -1,
            Self::CallNotFound => -2,
            Self::PayloadTooLarge => -3,
            Self::MalformedPayload => -4,
            Self::SignalNotFound => -5,
            Self::FilterFuncUndefined => -6,
            Self::Application(code) => i64::from(code),
        }
    }

    /// Application code, or an uncategorized failure for `0`.
    pub fn application(code: u32) -> Self {
        if code == 0 {
            Self::Uncategorized
        } else {
            Self::Application(code)
        }
    }

    pub fn is_application(self) -> bool {
        matches!(self, Self::Application(_))
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uncategorized => write!(f, "uncategorized"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::CallNotFound => write!(f, "call not found"),
            Self::PayloadTooLarge => write!(f, "payload too large"),
            Self::MalformedPayload => write!(f, "malformed payload"),
            Self::SignalNotFound => write!(f, "signal not found"),
            Self::FilterFuncUndefined => write!(f, "filter function undefined"),
            Self::Application(code) => write!(f, "application error {code}"),
        }
    }
}

/// Cloneable snapshot of a `std::io::Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoError {
    pub kind: std::io::ErrorKind,
    pub message: String,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for IoError {}

impl From<std::io::Error> for IoError {
    fn from(e: std::io::Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Transport-level errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Closed,
    Io(IoError),
    FrameTooLarge { len: usize, max: usize },
    Timeout,
    Handshake(String),
    Encode(EncodeError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds max {max}")
            }
            Self::Timeout => write!(f, "write deadline exceeded"),
            Self::Handshake(msg) => write!(f, "handshake failed: {msg}"),
            Self::Encode(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EncodeError> for TransportError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Closed
        } else {
            Self::Io(e.into())
        }
    }
}

/// Encoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeError(pub String);

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "encode failed: {}", self.0)
    }
}

impl std::error::Error for EncodeError {}

impl From<postcard::Error> for EncodeError {
    fn from(e: postcard::Error) -> Self {
        Self(e.to_string())
    }
}

/// Decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError(pub String);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "decode failed: {}", self.0)
    }
}

impl std::error::Error for DecodeError {}

impl From<postcard::Error> for DecodeError {
    fn from(e: postcard::Error) -> Self {
        Self(e.to_string())
    }
}

/// Errors surfaced to the issuer of a control call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The session closed before the call resolved.
    Closed,
    /// The effective deadline elapsed. Local only: the peer may still run the handler.
    DeadlineExceeded,
    /// The peer answered with a wire error.
    Status { code: ErrorCode, message: String },
    Transport(TransportError),
    Encode(EncodeError),
    Decode(DecodeError),
    /// Argument or response exceeded the configured ceiling on this side.
    PayloadTooLarge { len: usize, max: usize },
    TooManyPending { max: usize },
}

impl RpcError {
    pub(crate) fn from_wire(err: WireError) -> Self {
        Self::Status {
            code: ErrorCode::from_i64(err.code),
            message: err.message,
        }
    }

    /// Wire code carried by a `Status` error.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed | Self::Transport(TransportError::Closed))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    /// Rebuild a typed application error from a `Status` carrying an application code.
    pub fn app_error<E: AppError>(&self) -> Option<E> {
        match self {
            Self::Status {
                code: ErrorCode::Application(code),
                message,
            } => E::from_status(*code, message),
            _ => None,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "session closed"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::Status { code, message } => write!(f, "{code}: {message}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Encode(e) => write!(f, "{e}"),
            Self::Decode(e) => write!(f, "{e}"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload of {len} bytes exceeds max {max}")
            }
            Self::TooManyPending { max } => {
                write!(f, "too many pending calls (max {max})")
            }
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed => Self::Closed,
            other => Self::Transport(other),
        }
    }
}

impl From<EncodeError> for RpcError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

impl From<DecodeError> for RpcError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// An application error table that round-trips through `(code, message)`.
///
/// ```ignore
/// #[derive(Debug, PartialEq)]
/// enum AccountError {
///     NotFound(String),
///     AlreadyExists(String),
/// }
///
/// impl AppError for AccountError {
///     fn code(&self) -> u32 {
///         match self {
///             Self::NotFound(_) => 1,
///             Self::AlreadyExists(_) => 2,
///         }
///     }
///
///     fn message(&self) -> String { /* ... */ }
///
///     fn from_status(code: u32, message: &str) -> Option<Self> {
///         match code {
///             1 => Some(Self::NotFound(message.to_owned())),
///             2 => Some(Self::AlreadyExists(message.to_owned())),
///             _ => None,
///         }
///     }
/// }
/// ```
pub trait AppError: Sized {
    /// Non-zero application code.
    fn code(&self) -> u32;

    fn message(&self) -> String;

    fn from_status(code: u32, message: &str) -> Option<Self>;
}

/// Error returned by a call handler.
#[derive(Debug)]
pub enum HandlerError {
    /// Sent to the caller as is.
    Status { code: ErrorCode, message: String },
    /// Logged locally; the caller only sees an uncategorized failure.
    Internal(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn application(code: u32, message: impl Into<String>) -> Self {
        Self::Status {
            code: ErrorCode::application(code),
            message: message.into(),
        }
    }

    pub fn app<E: AppError>(err: &E) -> Self {
        Self::application(err.code(), err.message())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::Status {
            code: ErrorCode::InvalidArgument,
            message: message.into(),
        }
    }

    pub fn internal<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Internal(err.into())
    }

    pub(crate) fn into_wire(self, call: &str) -> WireError {
        match self {
            Self::Status { code, message } => WireError {
                code: code.as_i64(),
                message,
            },
            Self::Internal(err) => {
                tracing::error!(call, error = %err, "handler failed");
                WireError::internal()
            }
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status { code, message } => write!(f, "{code}: {message}"),
            Self::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<ValidationError> for HandlerError {
    fn from(e: ValidationError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

impl From<DecodeError> for HandlerError {
    fn from(e: DecodeError) -> Self {
        Self::Status {
            code: ErrorCode::MalformedPayload,
            message: e.to_string(),
        }
    }
}

impl From<RpcError> for HandlerError {
    fn from(e: RpcError) -> Self {
        Self::Internal(Box::new(e))
    }
}

impl From<SignalError> for HandlerError {
    fn from(e: SignalError) -> Self {
        Self::Internal(Box::new(e))
    }
}

/// Session lifecycle and raw-stream errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    AlreadyInitialized,
    Closed,
    /// The peer has no handler for the requested channel.
    StreamRejected { channel: String },
    StreamOpenTimeout { channel: String },
    /// `control` and `signal` cannot be used as raw-stream channels.
    ReservedChannel(String),
    InvalidConfig(String),
    Transport(TransportError),
    Encode(EncodeError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInitialized => write!(f, "session already initialized"),
            Self::Closed => write!(f, "session closed"),
            Self::StreamRejected { channel } => write!(f, "stream '{channel}' rejected by peer"),
            Self::StreamOpenTimeout { channel } => {
                write!(f, "timed out opening stream '{channel}'")
            }
            Self::ReservedChannel(channel) => write!(f, "channel '{channel}' is reserved"),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Encode(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed => Self::Closed,
            other => Self::Transport(other),
        }
    }
}

/// Signaler errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalError {
    Closed,
    /// The peer never declared this signal id.
    NotFound(String),
    /// The peer declared the signal but no filter function for it.
    FilterFuncUndefined(String),
    /// Listener queues hold at least one event.
    ZeroQueueSize,
    Encode(EncodeError),
    Rpc(RpcError),
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "signaler closed"),
            Self::NotFound(id) => write!(f, "signal '{id}' not found"),
            Self::FilterFuncUndefined(id) => {
                write!(f, "no filter function defined for signal '{id}'")
            }
            Self::ZeroQueueSize => write!(f, "listener queue size must be at least 1"),
            Self::Encode(e) => write!(f, "{e}"),
            Self::Rpc(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(e) => Some(e),
            Self::Rpc(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RpcError> for SignalError {
    fn from(e: RpcError) -> Self {
        if e.is_closed() {
            Self::Closed
        } else {
            Self::Rpc(e)
        }
    }
}

impl From<EncodeError> for SignalError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

/// One member's failure during a group trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFailure {
    pub session: SessionId,
    pub error: SignalError,
}

/// Group fan-out errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// The payload could not be encoded; nothing was sent.
    Encode(EncodeError),
    /// Some members failed. Every other member was still attempted.
    Delivery(Vec<MemberFailure>),
}

impl fmt::Display for GroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "{e}"),
            Self::Delivery(failures) => {
                write!(f, "trigger failed for {} member(s)", failures.len())?;
                for failure in failures {
                    write!(f, "; session {}: {}", failure.session, failure.error)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for GroupError {}

impl From<EncodeError> for GroupError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum AccountError {
        NotFound(String),
        AlreadyExists(String),
    }

    impl fmt::Display for AccountError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::NotFound(m) | Self::AlreadyExists(m) => f.write_str(m),
            }
        }
    }

    impl AppError for AccountError {
        fn code(&self) -> u32 {
            match self {
                Self::NotFound(_) => 1,
                Self::AlreadyExists(_) => 2,
            }
        }

        fn message(&self) -> String {
            self.to_string()
        }

        fn from_status(code: u32, message: &str) -> Option<Self> {
            match code {
                1 => Some(Self::NotFound(message.to_owned())),
                2 => Some(Self::AlreadyExists(message.to_owned())),
                _ => None,
            }
        }
    }

    #[test]
    fn reserved_codes_survive_the_wire() {
        for code in [
            ErrorCode::Uncategorized,
            ErrorCode::InvalidArgument,
            ErrorCode::CallNotFound,
            ErrorCode::PayloadTooLarge,
            ErrorCode::MalformedPayload,
            ErrorCode::SignalNotFound,
            ErrorCode::FilterFuncUndefined,
            ErrorCode::Application(42),
        ] {
            assert_eq!(ErrorCode::from_i64(code.as_i64()), code);
        }
    }

    #[test]
    fn unknown_negative_code_is_uncategorized() {
        assert_eq!(ErrorCode::from_i64(-999), ErrorCode::Uncategorized);
        assert_eq!(ErrorCode::from_i64(i64::from(u32::MAX) + 1), ErrorCode::Uncategorized);
    }

    #[test]
    fn large_application_codes_keep_their_value() {
        let wire = HandlerError::application(3_000_000_000, "big").into_wire("bulk");
        assert_eq!(wire.code, 3_000_000_000);

        let received = RpcError::from_wire(wire);
        assert_eq!(received.code(), Some(ErrorCode::Application(3_000_000_000)));

        let wire = HandlerError::application(u32::MAX, "max").into_wire("bulk");
        assert_eq!(
            RpcError::from_wire(wire).code(),
            Some(ErrorCode::Application(u32::MAX))
        );
    }

    #[test]
    fn application_zero_is_uncategorized() {
        assert_eq!(ErrorCode::application(0), ErrorCode::Uncategorized);
        assert_eq!(ErrorCode::application(7), ErrorCode::Application(7));
    }

    #[test]
    fn app_error_rebuilds_from_status() {
        let sent = AccountError::AlreadyExists("user bob".into());
        let wire = HandlerError::app(&sent).into_wire("register");
        let received = RpcError::from_wire(wire);

        assert_eq!(received.code(), Some(ErrorCode::Application(2)));
        assert_eq!(received.app_error::<AccountError>(), Some(sent));
    }

    #[test]
    fn internal_detail_is_not_sent() {
        let wire = HandlerError::internal("db password rejected").into_wire("login");
        assert_eq!(wire.code, 0);
        assert!(!wire.message.contains("password"));
    }

    #[test]
    fn validation_maps_to_invalid_argument() {
        let err: HandlerError = ValidationError::new("name", "must not be empty").into();
        let wire = err.into_wire("greet");
        assert_eq!(ErrorCode::from_i64(wire.code), ErrorCode::InvalidArgument);
    }

    #[test]
    fn closed_rpc_error_becomes_closed_signal_error() {
        assert_eq!(SignalError::from(RpcError::Closed), SignalError::Closed);
        assert_eq!(
            SignalError::from(RpcError::from(TransportError::Closed)),
            SignalError::Closed
        );
    }
}
