//! Length-prefixed codec for stream transports
//!
//! All messages on a byte stream are framed as:
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: JSON Envelope ]
//! ```
//!
//! Message-oriented transports (WebSocket) carry the JSON body alone.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::Envelope;

/// Maximum message size (10 MB) to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("Invalid message length prefix: {0}")]
    InvalidLength(u32),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    /// Whether the stream is still aligned on a frame boundary after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::Json(_))
    }
}

/// Encode an Envelope into a length-prefixed byte buffer
pub fn encode(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    encode_into(envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode an Envelope directly into a provided buffer
pub fn encode_into(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), CodecError> {
    let body = serde_json::to_vec(envelope)?;

    if body.len() > MAX_MESSAGE_SIZE as usize {
        return Err(CodecError::MessageTooLarge(body.len()));
    }

    buf.reserve(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);

    Ok(())
}

/// Try to decode a length-prefixed Envelope from a buffer
///
/// Returns:
/// - `Ok(Some(envelope))` if a complete message was decoded
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the data is invalid; a JSON error still consumes the frame
pub fn decode(buf: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
    // Need at least 4 bytes for the length prefix
    if buf.len() < 4 {
        return Ok(None);
    }

    // Peek at the length prefix without consuming
    let msg_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);

    if msg_len > MAX_MESSAGE_SIZE {
        return Err(CodecError::InvalidLength(msg_len));
    }

    let total_len = 4 + msg_len as usize;

    if buf.len() < total_len {
        return Ok(None);
    }

    buf.advance(4);
    let body = buf.split_to(msg_len as usize);

    Ok(Some(serde_json::from_slice(&body)?))
}

/// Decoder state machine for streaming decoding
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Partial frame data being accumulated
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete frames
    pub fn decode_next(&mut self) -> Result<Option<Envelope>, CodecError> {
        decode(&mut self.buffer)
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_test_envelope() -> Envelope {
        Envelope::new("transcript", Some(json!({ "text": "hello" }))).with_session("s-1")
    }

    #[test]
    fn test_length_prefix_matches_body() {
        let encoded = encode(&create_test_envelope()).expect("encode failed");

        let len_prefix = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len_prefix as usize, encoded.len() - 4);

        let mut buf = BytesMut::from(&encoded[..]);
        let decoded = decode(&mut buf).expect("decode failed").expect("no message");
        assert_eq!(decoded, create_test_envelope_with_ts(decoded.timestamp));
        assert!(buf.is_empty(), "buffer should be empty after decode");
    }

    fn create_test_envelope_with_ts(timestamp: u64) -> Envelope {
        Envelope {
            timestamp,
            ..create_test_envelope()
        }
    }

    #[test]
    fn test_partial_decode() {
        let encoded = encode(&create_test_envelope()).expect("encode failed");

        let mut buf = BytesMut::from(&encoded[..5]);
        let result = decode(&mut buf).expect("decode should not fail on partial data");
        assert!(result.is_none(), "should return None for partial data");

        // Buffer should be unchanged (data not consumed)
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_frame_decoder_chunks_and_multiple_frames() {
        let first = encode(&Envelope::ping()).expect("encode failed");
        let second = encode(&create_test_envelope()).expect("encode failed");

        let mut decoder = FrameDecoder::new();
        decoder.extend(&first[..3]);
        assert!(decoder.decode_next().expect("decode error").is_none());

        decoder.extend(&first[3..]);
        decoder.extend(&second);

        let a = decoder.decode_next().expect("decode error").expect("first frame");
        let b = decoder.decode_next().expect("decode error").expect("second frame");
        assert_eq!(a.msg_type, "ping");
        assert_eq!(b.msg_type, "transcript");
        assert!(decoder.decode_next().expect("decode error").is_none());
        assert_eq!(decoder.buffer_len(), 0);
    }

    #[test]
    fn test_invalid_json_consumes_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(b"{{{");
        buf.extend_from_slice(&encode(&Envelope::pong()).unwrap());

        let err = decode(&mut buf).unwrap_err();
        assert!(err.is_recoverable());

        let next = decode(&mut buf).expect("decode error").expect("next frame");
        assert_eq!(next.msg_type, "pong");
    }

    #[test]
    fn test_message_too_large() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_MESSAGE_SIZE + 1);
        buf.put_bytes(0, 100);

        let result = decode(&mut buf);
        assert!(matches!(result, Err(CodecError::InvalidLength(_))));
        assert!(!result.unwrap_err().is_recoverable());
    }
}
