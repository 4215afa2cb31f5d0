//! # Message Framer
//!
//! The outer datagram frame and the inner sub-message stream.
//!
//! Every datagram on the wire is one outer frame:
//!
//! ```text
//! ┌──────────┬──────────┬────────────────────┬──────────────┐
//! │ u16 size │ u16 type │ 32-byte sender id  │ body …       │
//! └──────────┴──────────┴────────────────────┴──────────────┘
//! ```
//!
//! all fields in network byte order, `size` counting the header itself.
//! The body is a byte-for-byte concatenation of zero or more boxed
//! sub-messages, each `u16 size | u16 type | payload`. The transport never
//! interprets the inner `type`; it only checks well-formedness. Truncation
//! and corruption are indistinguishable at this layer, so tokenization stops
//! at the first bad inner header and the remainder is reported and dropped.
//!
//! HTTP ingress delivers the same sub-message stream as an unframed byte
//! *stream*, so [`StreamTokenizer`] buffers a partial header and partial body
//! across reads.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::identity::{PeerId, PEER_ID_LEN};

/// Outer frame header length: size + type + sender identity.
pub const FRAME_HEADER_LEN: usize = 2 + 2 + PEER_ID_LEN;

/// Inner sub-message header length.
pub const INNER_HEADER_LEN: usize = 4;

/// Largest datagram the receive path accepts.
pub const MAX_DATAGRAM: usize = 65536;

/// Outer frame `type` is protocol-reserved and transmitted as zero.
pub const FRAME_TYPE: u16 = 0;

/// Framing and tokenization errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Payload would push the framed size past the u16 size field.
    #[error("payload of {0} bytes does not fit a frame")]
    PayloadTooLarge(usize),

    /// Fewer bytes than an outer header.
    #[error("frame truncated: {0} bytes")]
    Truncated(usize),

    /// Outer size field smaller than the header or larger than the buffer.
    #[error("bad outer frame size {size} (available {available})")]
    BadOuterSize { size: usize, available: usize },

    /// Inner sub-message header invalid; the rest of the buffer is dropped.
    #[error("bad inner sub-message size {size} at offset {offset}")]
    BadInnerSize { size: usize, offset: usize },

    /// A streamed message exceeded the tokenizer's configured bound.
    #[error("streamed sub-message of {size} bytes exceeds limit {limit}")]
    OversizedMessage { size: usize, limit: usize },
}

/// One boxed sub-message, as carried inside an outer frame or a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerMessage {
    raw: Bytes,
}

impl InnerMessage {
    /// Inner `type` field. Opaque to the transport.
    pub fn msg_type(&self) -> u16 {
        u16::from_be_bytes([self.raw[2], self.raw[3]])
    }

    /// The payload carried after the inner header.
    pub fn body(&self) -> &[u8] {
        &self.raw[INNER_HEADER_LEN..]
    }

    /// The full boxed bytes, header included, as handed to the service.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// Box a payload into one inner sub-message.
///
/// Callers that already hold boxed messages (the service's SEND_MSG path)
/// never need this; it exists for local producers and tests.
pub fn box_message(msg_type: u16, body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let total = INNER_HEADER_LEN + body.len();
    if total > u16::MAX as usize {
        return Err(FrameError::PayloadTooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.extend_from_slice(&msg_type.to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Build an outer frame around `body` (a concatenation of boxed messages).
///
/// One allocation of header + body, sender stamped in place.
pub fn encode_frame(sender: &PeerId, body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let total = FRAME_HEADER_LEN + body.len();
    if total > u16::MAX as usize {
        return Err(FrameError::PayloadTooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.extend_from_slice(&FRAME_TYPE.to_be_bytes());
    out.extend_from_slice(sender.as_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// A decoded outer frame: the sender and its (still boxed) body.
#[derive(Debug)]
pub struct Frame {
    pub sender: PeerId,
    pub body: Bytes,
}

/// Decode one datagram into an outer frame.
///
/// Validates `header ≤ size ≤ available`; bytes past the declared size are
/// rejected rather than ignored (a datagram carries exactly one frame).
pub fn decode_frame(datagram: &[u8]) -> Result<Frame, FrameError> {
    if datagram.len() < FRAME_HEADER_LEN {
        return Err(FrameError::Truncated(datagram.len()));
    }
    let size = u16::from_be_bytes([datagram[0], datagram[1]]) as usize;
    if size < FRAME_HEADER_LEN || size > datagram.len() {
        return Err(FrameError::BadOuterSize {
            size,
            available: datagram.len(),
        });
    }
    // Outer type is reserved; tolerate any value on receive.
    let sender = PeerId::from_slice(&datagram[4..4 + PEER_ID_LEN])
        .expect("slice length fixed by FRAME_HEADER_LEN");
    Ok(Frame {
        sender,
        body: Bytes::copy_from_slice(&datagram[FRAME_HEADER_LEN..size]),
    })
}

/// Iterate the boxed sub-messages of a frame body.
///
/// Yields messages until the buffer is exhausted or an invalid inner header
/// is hit, in which case the final item is the error and iteration stops.
pub struct InnerMessages {
    body: Bytes,
    offset: usize,
    poisoned: bool,
}

impl InnerMessages {
    pub fn new(body: Bytes) -> Self {
        Self { body, offset: 0, poisoned: false }
    }
}

impl Iterator for InnerMessages {
    type Item = Result<InnerMessage, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned || self.offset >= self.body.len() {
            return None;
        }
        let remaining = self.body.len() - self.offset;
        if remaining < INNER_HEADER_LEN {
            self.poisoned = true;
            return Some(Err(FrameError::BadInnerSize {
                size: remaining,
                offset: self.offset,
            }));
        }
        let size = u16::from_be_bytes([self.body[self.offset], self.body[self.offset + 1]]) as usize;
        if size < INNER_HEADER_LEN || size > remaining {
            self.poisoned = true;
            return Some(Err(FrameError::BadInnerSize { size, offset: self.offset }));
        }
        let raw = self.body.slice(self.offset..self.offset + size);
        self.offset += size;
        Some(Ok(InnerMessage { raw }))
    }
}

/// Re-entrant tokenizer for the HTTP ingress byte stream.
///
/// Chunks arrive with arbitrary boundaries; the tokenizer accumulates until
/// a full `u16 size | u16 type | payload` message is present, then emits it.
/// A partial header or partial body simply stays buffered for the next call.
#[derive(Debug)]
pub struct StreamTokenizer {
    buf: BytesMut,
    max_message: usize,
}

impl StreamTokenizer {
    pub fn new(max_message: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_message,
        }
    }

    /// Feed one chunk; drain every now-complete message.
    ///
    /// A malformed or oversized inner header poisons the stream: the caller
    /// must treat the session as broken (per-session fatal).
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<InnerMessage>, FrameError> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            if self.buf.len() < INNER_HEADER_LEN {
                break;
            }
            let size = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
            if size < INNER_HEADER_LEN {
                return Err(FrameError::BadInnerSize { size, offset: 0 });
            }
            if size > self.max_message {
                return Err(FrameError::OversizedMessage {
                    size,
                    limit: self.max_message,
                });
            }
            if self.buf.len() < size {
                break;
            }
            let raw = self.buf.split_to(size).freeze();
            out.push(InnerMessage { raw });
        }
        Ok(out)
    }

    /// Bytes currently buffered waiting for completion.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(tag: u8) -> PeerId {
        PeerId::from_bytes([tag; PEER_ID_LEN])
    }

    #[test]
    fn frame_round_trip_single_message() {
        let boxed = box_message(7, b"hello-peer!").unwrap();
        let frame = encode_frame(&peer(1), &boxed).unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_LEN + 4 + 11);

        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.sender, peer(1));
        let msgs: Vec<_> = InnerMessages::new(decoded.body)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msg_type(), 7);
        assert_eq!(msgs[0].body(), b"hello-peer!");
        assert_eq!(msgs[0].body().len(), 11);
    }

    #[test]
    fn frame_concatenated_messages_in_order() {
        let mut body = Vec::new();
        for (t, payload) in [(1u16, &b"one"[..]), (2, b""), (3, b"three")] {
            body.extend_from_slice(&box_message(t, payload).unwrap());
        }
        let frame = encode_frame(&peer(9), &body).unwrap();
        let decoded = decode_frame(&frame).unwrap();
        let msgs: Vec<_> = InnerMessages::new(decoded.body)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].body(), b"one");
        assert_eq!(msgs[1].body(), b"");
        assert_eq!(msgs[2].body(), b"three");
    }

    #[test]
    fn zero_length_payload_survives() {
        let boxed = box_message(0, b"").unwrap();
        let frame = encode_frame(&peer(2), &boxed).unwrap();
        let decoded = decode_frame(&frame).unwrap();
        let msgs: Vec<_> = InnerMessages::new(decoded.body)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].body().is_empty());
    }

    #[test]
    fn decode_rejects_bad_sizes() {
        assert!(matches!(
            decode_frame(&[0u8; 10]),
            Err(FrameError::Truncated(10))
        ));

        let boxed = box_message(1, b"x").unwrap();
        let mut frame = encode_frame(&peer(1), &boxed).unwrap();
        // Lie about the outer size.
        frame[0] = 0;
        frame[1] = 4;
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameError::BadOuterSize { .. })
        ));
    }

    #[test]
    fn inner_iteration_stops_at_corruption() {
        let mut body = box_message(1, b"good").unwrap();
        // Append garbage that declares a size larger than what follows.
        body.extend_from_slice(&[0xff, 0xff, 0x00, 0x01]);
        let frame = encode_frame(&peer(1), &body).unwrap();
        let decoded = decode_frame(&frame).unwrap();
        let mut iter = InnerMessages::new(decoded.body);
        assert!(iter.next().unwrap().is_ok());
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn tokenizer_reassembles_across_arbitrary_splits() {
        let mut stream = Vec::new();
        let payloads: Vec<Vec<u8>> = vec![b"a".to_vec(), vec![0u8; 300], b"end".to_vec()];
        for p in &payloads {
            stream.extend_from_slice(&box_message(42, p).unwrap());
        }

        // Feed one byte at a time; order and content must be preserved.
        let mut tok = StreamTokenizer::new(MAX_DATAGRAM);
        let mut got = Vec::new();
        for byte in &stream {
            got.extend(tok.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(got.len(), payloads.len());
        for (msg, expected) in got.iter().zip(&payloads) {
            assert_eq!(msg.body(), &expected[..]);
        }
        assert_eq!(tok.pending(), 0);
    }

    #[test]
    fn tokenizer_rejects_undersized_header() {
        let mut tok = StreamTokenizer::new(MAX_DATAGRAM);
        let err = tok.push(&[0x00, 0x02, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, FrameError::BadInnerSize { size: 2, .. }));
    }

    #[test]
    fn tokenizer_bounds_message_size() {
        let mut tok = StreamTokenizer::new(64);
        let err = tok.push(&[0x01, 0x00, 0x00, 0x00]).unwrap_err();
        assert!(matches!(err, FrameError::OversizedMessage { size: 256, .. }));
    }

    #[test]
    fn frame_size_limit_enforced() {
        let body = vec![0u8; u16::MAX as usize];
        assert!(matches!(
            encode_frame(&peer(1), &body),
            Err(FrameError::PayloadTooLarge(_))
        ));
    }
}
