//! Payload codec.
//!
//! Typed operations on [`Control`](crate::Control), [`Signaler`](crate::Signaler)
//! and [`Group`](crate::Group) encode with [`PostcardCodec`]. Every typed
//! operation has a raw-bytes twin for applications that bring their own
//! encoding.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{DecodeError, EncodeError};

/// Encodes typed values to bytes and back.
pub trait Codec {
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EncodeError>;

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, DecodeError>;
}

/// serde + postcard.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, EncodeError> {
        Ok(postcard::to_allocvec(value)?)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, DecodeError> {
        Ok(postcard::from_bytes(buf)?)
    }
}
