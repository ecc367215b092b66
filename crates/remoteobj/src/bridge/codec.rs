//! Framed codec for handle traffic.
//!
//! Uses LengthDelimitedCodec for framing and a pluggable [`Codec`] for the
//! message bodies. Works over any AsyncRead/AsyncWrite.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::channel::ChannelError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The value has no representation in this codec.
    #[error("value cannot be encoded: {0}")]
    Unrepresentable(String),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Turns message values into frame bodies and back.
pub trait Codec: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Unrepresentable(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

/// Frames messages with a 4-byte length prefix and encodes bodies with a
/// [`Codec`].
pub struct FrameCodec<T> {
    inner: LengthDelimitedCodec,
    codec: Arc<dyn Codec>,
    _phantom: PhantomData<T>,
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new(Arc::new(JsonCodec))
    }
}

impl<T> FrameCodec<T> {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
            codec,
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = ChannelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let value = self
                    .codec
                    .decode(&bytes)
                    .map_err(|e| ChannelError::Decode(e.to_string()))?;
                let item =
                    serde_json::from_value(value).map_err(|e| ChannelError::Decode(e.to_string()))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = ChannelError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Nothing reaches `dst` unless the whole body encodes.
        let value = serde_json::to_value(&item).map_err(|e| {
            ChannelError::Encode(CodecError::Unrepresentable(e.to_string()).to_string())
        })?;
        let body = self
            .codec
            .encode(&value)
            .map_err(|e| ChannelError::Encode(e.to_string()))?;
        let body_len = body.len();
        tracing::trace!(codec = self.codec.name(), body_size_bytes = body_len, "Encoding frame");
        if body_len > 100_000 {
            tracing::info!(
                body_size_bytes = body_len,
                body_size_kb = body_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(body), dst)?;
        Ok(())
    }
}
