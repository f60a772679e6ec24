//! JSON-lines codec for tokio.
//!
//! Wraps [`LineCodec`] and maps each line to a typed value with serde.
//! Blank lines are skipped so a keepalive `\n` never surfaces as an error.

use std::marker::PhantomData;

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{self, ProtocolError};
use crate::line::LineCodec;

/// Tokio codec decoding `D` and encoding any `Serialize` value.
pub struct JsonCodec<D> {
    inner: LineCodec,
    _item: PhantomData<fn() -> D>,
}

impl<D> JsonCodec<D> {
    /// Create a codec with the default frame limit.
    pub fn new() -> Self {
        Self::with_max_len(crate::line::DEFAULT_MAX_LEN)
    }

    /// Create a codec with a custom frame limit in bytes.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            inner: LineCodec::with_max_len(max_len),
            _item: PhantomData,
        }
    }
}

impl<D> Default for JsonCodec<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeserializeOwned> Decoder for JsonCodec<D> {
    type Item = D;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> error::Result<Option<D>> {
        while let Some(line) = self.inner.decode(src)? {
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(&line)?));
        }
        Ok(None)
    }
}

impl<D, E: Serialize> Encoder<E> for JsonCodec<D> {
    type Error = ProtocolError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> error::Result<()> {
        let line = serde_json::to_string(&item)?;
        self.inner.encode(line, dst)
    }
}
