//! Message encoding for byte-oriented transports.
//!
//! A [`Codec`] turns typed messages into bytes and back. The concrete codec
//! is picked when a transport is constructed; the transport never inspects
//! message types at runtime.

use crate::error::CodecError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;

/// Encodes outbound messages and decodes inbound ones.
///
/// `Input` is what this side sends, `Output` is what it expects to receive.
/// The two differ for request/response protocols.
pub trait Codec: Send + Sync {
    /// Message type accepted by [`encode`](Self::encode).
    type Input;
    /// Message type produced by [`decode`](Self::decode).
    type Output;

    fn encode(&self, message: &Self::Input) -> Result<Bytes, CodecError>;

    /// Decode a complete payload. Never returns a partially-parsed value.
    fn decode(&self, payload: &[u8]) -> Result<Self::Output, CodecError>;
}

/// JSON codec for any serde type.
pub struct JsonCodec<E, D> {
    _marker: PhantomData<fn(&E) -> D>,
}

impl<E, D> JsonCodec<E, D> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E, D> Default for JsonCodec<E, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, D> Clone for JsonCodec<E, D> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<E, D> fmt::Debug for JsonCodec<E, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonCodec").finish()
    }
}

impl<E, D> Codec for JsonCodec<E, D>
where
    E: Serialize,
    D: DeserializeOwned,
{
    type Input = E;
    type Output = D;

    fn encode(&self, message: &E) -> Result<Bytes, CodecError> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(CodecError::Encode)
    }

    fn decode(&self, payload: &[u8]) -> Result<D, CodecError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| CodecError::invalid(payload, format!("invalid UTF-8: {e}")))?;
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| CodecError::invalid(payload, format!("invalid JSON: {e}")))?;
        // Messages are JSON objects; serde would otherwise read arrays positionally.
        if !value.is_object() {
            return Err(CodecError::invalid(payload, "expected a JSON object"));
        }
        serde_json::from_value(value)
            .map_err(|e| CodecError::invalid(payload, format!("invalid message: {e}")))
    }
}
