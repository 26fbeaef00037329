//! Framed codec for worker communication.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, duplex streams, sockets).
//!
//! Decoding yields `Result<T, MalformedFrame>` items: a frame with a sound
//! length prefix but an undecodable body is reported without killing the
//! stream, while an oversized length prefix is rejected before the body is
//! buffered and ends the stream.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

const HEADER_LEN: usize = 4;

/// Largest frame a 4-byte length prefix can describe.
pub const MAX_WIRE_FRAME_LENGTH: usize = u32::MAX as usize;

/// Room for the JSON envelope around a base64 payload.
const ENVELOPE_OVERHEAD: usize = 64 * 1024;

/// Frame length needed to carry `max_payload` raw bytes as base64 JSON.
pub fn payload_frame_limit(max_payload: usize) -> usize {
    max_payload
        .div_ceil(3)
        .saturating_mul(4)
        .saturating_add(ENVELOPE_OVERHEAD)
        .min(MAX_WIRE_FRAME_LENGTH)
}

/// A complete frame whose body did not decode as the expected message type.
#[derive(Debug, Clone, thiserror::Error)]
#[error("malformed frame ({len} bytes): {reason}")]
pub struct MalformedFrame {
    pub len: usize,
    pub reason: String,
}

/// A length prefix larger than the decoder accepts.
#[derive(Debug, Clone, thiserror::Error)]
#[error("frame of {size} bytes exceeds limit of {limit} bytes")]
pub struct FrameTooLarge {
    pub size: usize,
    pub limit: usize,
}

/// Extract a [`FrameTooLarge`] from a decoder error, if that is what it was.
pub fn frame_too_large(err: &io::Error) -> Option<&FrameTooLarge> {
    err.get_ref()?.downcast_ref::<FrameTooLarge>()
}

/// Codec that frames messages with length prefix and serializes with JSON.
///
/// Wraps LengthDelimitedCodec and adds serde_json serialization.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    max_frame_length: usize,
    /// Inner codec consumed a header and is waiting for the body.
    reading_body: bool,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(MAX_WIRE_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        let max_frame_length = max_frame_length.min(MAX_WIRE_FRAME_LENGTH);
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(HEADER_LEN)
                .max_frame_length(max_frame_length)
                .new_codec(),
            max_frame_length,
            reading_body: false,
            _phantom: PhantomData,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = Result<T, MalformedFrame>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut header_seen = false;
        if !self.reading_body && src.len() >= HEADER_LEN {
            let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if size > self.max_frame_length {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    FrameTooLarge {
                        size,
                        limit: self.max_frame_length,
                    },
                ));
            }
            header_seen = true;
        }

        let frame = self.inner.decode(src)?;
        self.reading_body = frame.is_none() && (self.reading_body || header_seen);

        Ok(frame.map(|bytes| {
            serde_json::from_slice(&bytes).map_err(|e| MalformedFrame {
                len: bytes.len(),
                reason: e.to_string(),
            })
        }))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        // These events must never be shipped back over IPC by WorkerTracingLayer,
        // which filters this module's target.
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > 1024 * 1024 {
            tracing::debug!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}
