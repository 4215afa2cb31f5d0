//! # Communicator–Service Wire Protocol
//!
//! Control-plane messages exchanged with the local transport service over a
//! stream-oriented UNIX connection. Every message is one envelope:
//!
//! ```text
//! ┌──────────┬──────────┬───────────────┐
//! │ u16 size │ u16 type │ body …        │
//! └──────────┴──────────┴───────────────┘
//! ```
//!
//! network byte order, `size` counting the 4-byte envelope header. Bodies
//! are fixed-layout fields, optionally followed by variable-length data
//! (NUL-terminated UTF-8 address strings, or a boxed message that must carry
//! its own valid `{u16 size, u16 type}` header).
//!
//! Numeric message types are stable across reconnects. Decoding is strict:
//! any length or termination violation is a [`ProtocolError`], which the
//! service client turns into a disconnect-and-reconnect.

use bytes::Bytes;
use thiserror::Error;

use crate::identity::{PeerId, PEER_ID_LEN};

/// Envelope header length.
pub const ENVELOPE_HEADER_LEN: usize = 4;

/// Hard bound on one envelope, matching the u16 size field.
pub const MAX_ENVELOPE: usize = u16::MAX as usize;

// C→S message types.
pub const MT_NEW_COMMUNICATOR: u16 = 1200;
pub const MT_ADD_ADDRESS: u16 = 1201;
pub const MT_DEL_ADDRESS: u16 = 1202;
pub const MT_INCOMING_MSG: u16 = 1203;
pub const MT_QUEUE_CREATE_OK: u16 = 1206;
pub const MT_QUEUE_CREATE_FAIL: u16 = 1207;
pub const MT_QUEUE_SETUP: u16 = 1208;
pub const MT_QUEUE_UPDATE: u16 = 1209;
pub const MT_QUEUE_TEARDOWN: u16 = 1210;
pub const MT_SEND_MSG_ACK: u16 = 1212;
pub const MT_BACKCHANNEL: u16 = 1213;

// S→C message types.
pub const MT_INCOMING_MSG_ACK: u16 = 1204;
pub const MT_QUEUE_CREATE: u16 = 1205;
pub const MT_SEND_MSG: u16 = 1211;
pub const MT_BACKCHANNEL_INCOMING: u16 = 1214;

/// Communicator characteristics advertised in NEW_COMMUNICATOR.
pub const CC_UNKNOWN: u32 = 0;
pub const CC_RELIABLE: u32 = 1;
pub const CC_UNRELIABLE: u32 = 2;

/// Network classes announced with addresses and queues.
pub const NT_UNSPECIFIED: u32 = 0;
pub const NT_LOOPBACK: u32 = 1;
pub const NT_LAN: u32 = 2;
pub const NT_WAN: u32 = 3;

/// Queue connection status.
pub const CS_DOWN: u32 = 0;
pub const CS_UP: u32 = 1;

/// Wire decoding/encoding violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("envelope truncated")]
    Truncated,

    #[error("envelope size {0} below header")]
    BadEnvelopeSize(usize),

    #[error("unknown message type {0}")]
    UnknownType(u16),

    #[error("message body too short for type {0}")]
    ShortBody(u16),

    #[error("string field missing NUL terminator")]
    MissingNul,

    #[error("string field is not valid UTF-8")]
    BadUtf8,

    #[error("boxed message has an invalid inner header")]
    BadBoxedMessage,

    #[error("trailing bytes after message body")]
    TrailingBytes,

    #[error("unknown flow-control id {fc_id} from {sender}")]
    UnknownFlowId { sender: String, fc_id: u64 },
}

/// Bounds-checked reader over one envelope body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    msg_type: u16,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], msg_type: u16) -> Self {
        Self { buf, pos: 0, msg_type }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() - self.pos < n {
            return Err(ProtocolError::ShortBody(self.msg_type));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn peer(&mut self) -> Result<PeerId, ProtocolError> {
        let bytes = self.take(PEER_ID_LEN)?;
        Ok(PeerId::from_slice(bytes).expect("fixed-size take"))
    }

    /// A NUL-terminated UTF-8 string consuming the terminator.
    fn cstr(&mut self) -> Result<String, ProtocolError> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProtocolError::MissingNul)?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| ProtocolError::BadUtf8)?;
        self.pos += nul + 1;
        Ok(s.to_string())
    }

    /// Everything left, validated as exactly one boxed message.
    fn boxed(&mut self) -> Result<Bytes, ProtocolError> {
        let rest = &self.buf[self.pos..];
        validate_boxed(rest)?;
        self.pos = self.buf.len();
        Ok(Bytes::copy_from_slice(rest))
    }

    fn finish(self) -> Result<(), ProtocolError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes)
        }
    }
}

/// Check that `buf` is exactly one `{u16 size, u16 type}`-headed message.
pub fn validate_boxed(buf: &[u8]) -> Result<(), ProtocolError> {
    if buf.len() < 4 {
        return Err(ProtocolError::BadBoxedMessage);
    }
    let size = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if size < 4 || size != buf.len() {
        return Err(ProtocolError::BadBoxedMessage);
    }
    Ok(())
}

/// Envelope writer: header stamped on [`Envelope::finish`].
struct Envelope {
    buf: Vec<u8>,
}

impl Envelope {
    fn new(msg_type: u16) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&msg_type.to_be_bytes());
        Self { buf }
    }

    fn u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn u64(mut self, v: u64) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn peer(mut self, p: &PeerId) -> Self {
        self.buf.extend_from_slice(p.as_bytes());
        self
    }

    fn cstr(mut self, s: &str) -> Self {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        self
    }

    fn bytes(mut self, b: &[u8]) -> Self {
        self.buf.extend_from_slice(b);
        self
    }

    fn finish(mut self) -> Vec<u8> {
        debug_assert!(self.buf.len() <= MAX_ENVELOPE);
        let size = (self.buf.len() as u16).to_be_bytes();
        self.buf[0] = size[0];
        self.buf[1] = size[1];
        self.buf
    }
}

/// Control messages the communicator sends to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOut {
    NewCommunicator {
        characteristics: u32,
        prefix: String,
    },
    AddAddress {
        aid: u32,
        network_type: u32,
        expiration_us: u64,
        address: String,
    },
    DelAddress {
        aid: u32,
    },
    IncomingMsg {
        sender: PeerId,
        expected_addr_validity_us: u64,
        fc_on: bool,
        fc_id: u64,
        body: Vec<u8>,
    },
    QueueCreateOk {
        request_id: u32,
        peer: PeerId,
    },
    QueueCreateFail {
        request_id: u32,
        peer: PeerId,
    },
    QueueSetup {
        queue_id: u32,
        peer: PeerId,
        network_type: u32,
        mtu: u32,
        qlen: u64,
        priority: u32,
        connection_status: u32,
        address: String,
    },
    QueueUpdate {
        queue_id: u32,
        peer: PeerId,
        network_type: u32,
        mtu: u32,
        qlen: u64,
        priority: u32,
        connection_status: u32,
    },
    QueueTeardown {
        queue_id: u32,
        peer: PeerId,
    },
    SendMsgAck {
        ok: bool,
        mid: u64,
        receiver: PeerId,
    },
    Backchannel {
        pid: PeerId,
        body: Vec<u8>,
        target: String,
    },
}

impl ControlOut {
    /// Serialize into one envelope.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlOut::NewCommunicator { characteristics, prefix } => {
                Envelope::new(MT_NEW_COMMUNICATOR)
                    .u32(*characteristics)
                    .cstr(prefix)
                    .finish()
            }
            ControlOut::AddAddress { aid, network_type, expiration_us, address } => {
                Envelope::new(MT_ADD_ADDRESS)
                    .u32(*aid)
                    .u32(*network_type)
                    .u64(*expiration_us)
                    .cstr(address)
                    .finish()
            }
            ControlOut::DelAddress { aid } => {
                Envelope::new(MT_DEL_ADDRESS).u32(*aid).finish()
            }
            ControlOut::IncomingMsg {
                sender,
                expected_addr_validity_us,
                fc_on,
                fc_id,
                body,
            } => Envelope::new(MT_INCOMING_MSG)
                .peer(sender)
                .u64(*expected_addr_validity_us)
                .u32(u32::from(*fc_on))
                .u64(*fc_id)
                .bytes(body)
                .finish(),
            ControlOut::QueueCreateOk { request_id, peer } => {
                Envelope::new(MT_QUEUE_CREATE_OK)
                    .u32(*request_id)
                    .peer(peer)
                    .finish()
            }
            ControlOut::QueueCreateFail { request_id, peer } => {
                Envelope::new(MT_QUEUE_CREATE_FAIL)
                    .u32(*request_id)
                    .peer(peer)
                    .finish()
            }
            ControlOut::QueueSetup {
                queue_id,
                peer,
                network_type,
                mtu,
                qlen,
                priority,
                connection_status,
                address,
            } => Envelope::new(MT_QUEUE_SETUP)
                .u32(*queue_id)
                .peer(peer)
                .u32(*network_type)
                .u32(*mtu)
                .u64(*qlen)
                .u32(*priority)
                .u32(*connection_status)
                .cstr(address)
                .finish(),
            ControlOut::QueueUpdate {
                queue_id,
                peer,
                network_type,
                mtu,
                qlen,
                priority,
                connection_status,
            } => Envelope::new(MT_QUEUE_UPDATE)
                .u32(*queue_id)
                .peer(peer)
                .u32(*network_type)
                .u32(*mtu)
                .u64(*qlen)
                .u32(*priority)
                .u32(*connection_status)
                .finish(),
            ControlOut::QueueTeardown { queue_id, peer } => {
                Envelope::new(MT_QUEUE_TEARDOWN)
                    .u32(*queue_id)
                    .peer(peer)
                    .finish()
            }
            ControlOut::SendMsgAck { ok, mid, receiver } => {
                Envelope::new(MT_SEND_MSG_ACK)
                    .u32(u32::from(*ok))
                    .u64(*mid)
                    .peer(receiver)
                    .finish()
            }
            ControlOut::Backchannel { pid, body, target } => {
                Envelope::new(MT_BACKCHANNEL)
                    .peer(pid)
                    .u32(body.len() as u32)
                    .bytes(body)
                    .cstr(target)
                    .finish()
            }
        }
    }
}

/// Control messages the service sends to the communicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlIn {
    IncomingMsgAck {
        fc_id: u64,
        sender: PeerId,
    },
    QueueCreate {
        request_id: u32,
        peer: PeerId,
        address: String,
    },
    SendMsg {
        queue_id: u32,
        mid: u64,
        receiver: PeerId,
        /// One boxed message, inner header already validated.
        payload: Bytes,
    },
    BackchannelIncoming {
        pid: PeerId,
        payload: Bytes,
    },
}

/// Decode one complete envelope (header included).
pub fn decode_control(envelope: &[u8]) -> Result<ControlIn, ProtocolError> {
    if envelope.len() < ENVELOPE_HEADER_LEN {
        return Err(ProtocolError::Truncated);
    }
    let size = u16::from_be_bytes([envelope[0], envelope[1]]) as usize;
    if size < ENVELOPE_HEADER_LEN {
        return Err(ProtocolError::BadEnvelopeSize(size));
    }
    if size != envelope.len() {
        return Err(ProtocolError::Truncated);
    }
    let msg_type = u16::from_be_bytes([envelope[2], envelope[3]]);
    let mut r = Reader::new(&envelope[ENVELOPE_HEADER_LEN..], msg_type);

    let msg = match msg_type {
        MT_INCOMING_MSG_ACK => {
            let fc_id = r.u64()?;
            let sender = r.peer()?;
            ControlIn::IncomingMsgAck { fc_id, sender }
        }
        MT_QUEUE_CREATE => {
            let request_id = r.u32()?;
            let peer = r.peer()?;
            let address = r.cstr()?;
            ControlIn::QueueCreate { request_id, peer, address }
        }
        MT_SEND_MSG => {
            let queue_id = r.u32()?;
            let mid = r.u64()?;
            let receiver = r.peer()?;
            let payload = r.boxed()?;
            ControlIn::SendMsg { queue_id, mid, receiver, payload }
        }
        MT_BACKCHANNEL_INCOMING => {
            let pid = r.peer()?;
            let payload = r.boxed()?;
            ControlIn::BackchannelIncoming { pid, payload }
        }
        other => return Err(ProtocolError::UnknownType(other)),
    };
    r.finish()?;
    Ok(msg)
}

/// Extract complete envelopes from a stream accumulation buffer.
///
/// Returns the split-off envelope, or `None` while the buffer holds only a
/// partial one. The size field is validated before splitting so a poisoned
/// peer cannot wedge the reader.
pub fn split_envelope(buf: &mut bytes::BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    if buf.len() < ENVELOPE_HEADER_LEN {
        return Ok(None);
    }
    let size = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if size < ENVELOPE_HEADER_LEN {
        return Err(ProtocolError::BadEnvelopeSize(size));
    }
    if buf.len() < size {
        return Ok(None);
    }
    Ok(Some(buf.split_to(size).freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn peer(tag: u8) -> PeerId {
        PeerId::from_bytes([tag; 32])
    }

    fn boxed(msg_type: u16, body: &[u8]) -> Vec<u8> {
        crate::frame::box_message(msg_type, body).unwrap()
    }

    #[test]
    fn envelope_header_is_size_then_type() {
        let env = ControlOut::DelAddress { aid: 7 }.encode();
        assert_eq!(env.len(), 8);
        assert_eq!(u16::from_be_bytes([env[0], env[1]]), 8);
        assert_eq!(u16::from_be_bytes([env[2], env[3]]), MT_DEL_ADDRESS);
        assert_eq!(u32::from_be_bytes([env[4], env[5], env[6], env[7]]), 7);
    }

    #[test]
    fn decode_incoming_msg_ack() {
        // Hand-build the S→C envelope.
        let mut env = Vec::new();
        env.extend_from_slice(&44u16.to_be_bytes());
        env.extend_from_slice(&MT_INCOMING_MSG_ACK.to_be_bytes());
        env.extend_from_slice(&99u64.to_be_bytes());
        env.extend_from_slice(peer(5).as_bytes());
        assert_eq!(env.len(), 44);

        match decode_control(&env).unwrap() {
            ControlIn::IncomingMsgAck { fc_id, sender } => {
                assert_eq!(fc_id, 99);
                assert_eq!(sender, peer(5));
            }
            other => panic!("wrong decode: {other:?}"),
        }
    }

    #[test]
    fn decode_send_msg_validates_boxed_payload() {
        let payload = boxed(33, b"data");
        let body_len = 4 + 8 + 32 + payload.len();
        let mut env = Vec::new();
        env.extend_from_slice(&((4 + body_len) as u16).to_be_bytes());
        env.extend_from_slice(&MT_SEND_MSG.to_be_bytes());
        env.extend_from_slice(&3u32.to_be_bytes());
        env.extend_from_slice(&12u64.to_be_bytes());
        env.extend_from_slice(peer(9).as_bytes());
        env.extend_from_slice(&payload);

        match decode_control(&env).unwrap() {
            ControlIn::SendMsg { queue_id, mid, receiver, payload } => {
                assert_eq!(queue_id, 3);
                assert_eq!(mid, 12);
                assert_eq!(receiver, peer(9));
                assert_eq!(&payload[4..], b"data");
            }
            other => panic!("wrong decode: {other:?}"),
        }

        // Corrupt the boxed header: declared size disagrees with the body.
        let cut = env.len() - 1;
        let mut bad = env[..cut].to_vec();
        bad[0] = ((cut >> 8) & 0xff) as u8;
        bad[1] = (cut & 0xff) as u8;
        assert_eq!(decode_control(&bad), Err(ProtocolError::BadBoxedMessage));
    }

    #[test]
    fn decode_queue_create_requires_nul() {
        let addr = "unix-/tmp/peer.sock";
        let body_len = 4 + 32 + addr.len() + 1;
        let mut env = Vec::new();
        env.extend_from_slice(&((4 + body_len) as u16).to_be_bytes());
        env.extend_from_slice(&MT_QUEUE_CREATE.to_be_bytes());
        env.extend_from_slice(&1u32.to_be_bytes());
        env.extend_from_slice(peer(2).as_bytes());
        env.extend_from_slice(addr.as_bytes());
        env.push(0);

        match decode_control(&env).unwrap() {
            ControlIn::QueueCreate { request_id, peer: p, address } => {
                assert_eq!(request_id, 1);
                assert_eq!(p, peer(2));
                assert_eq!(address, addr);
            }
            other => panic!("wrong decode: {other:?}"),
        }

        // Strip the NUL.
        let cut = env.len() - 1;
        let mut bad = env[..cut].to_vec();
        bad[0] = ((cut >> 8) & 0xff) as u8;
        bad[1] = (cut & 0xff) as u8;
        assert_eq!(decode_control(&bad), Err(ProtocolError::MissingNul));
    }

    #[test]
    fn decode_rejects_unknown_type_and_bad_sizes() {
        let mut env = Vec::new();
        env.extend_from_slice(&4u16.to_be_bytes());
        env.extend_from_slice(&9999u16.to_be_bytes());
        assert_eq!(decode_control(&env), Err(ProtocolError::UnknownType(9999)));

        assert_eq!(decode_control(&[0, 2, 0, 0]), Err(ProtocolError::BadEnvelopeSize(2)));
        assert_eq!(decode_control(&[0, 0]), Err(ProtocolError::Truncated));
    }

    #[test]
    fn split_envelope_reassembles_partial_reads() {
        let env = ControlOut::DelAddress { aid: 1 }.encode();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&env[..3]);
        assert_eq!(split_envelope(&mut buf).unwrap(), None);
        buf.extend_from_slice(&env[3..]);
        let got = split_envelope(&mut buf).unwrap().unwrap();
        assert_eq!(&got[..], &env[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn split_envelope_rejects_undersized_header() {
        let mut buf = BytesMut::from(&[0u8, 1, 0, 0][..]);
        assert!(split_envelope(&mut buf).is_err());
    }

    #[test]
    fn encode_round_trips_through_generic_fields() {
        // Spot-check a fat C→S message layout.
        let env = ControlOut::QueueSetup {
            queue_id: 5,
            peer: peer(1),
            network_type: NT_LOOPBACK,
            mtu: 65500,
            qlen: 16,
            priority: 1,
            connection_status: CS_UP,
            address: "unix-/tmp/a".to_string(),
        }
        .encode();
        let size = u16::from_be_bytes([env[0], env[1]]) as usize;
        assert_eq!(size, env.len());
        assert_eq!(u16::from_be_bytes([env[2], env[3]]), MT_QUEUE_SETUP);
        assert_eq!(*env.last().unwrap(), 0);
    }

    #[test]
    fn incoming_msg_layout() {
        let body = boxed(7, b"xy");
        let env = ControlOut::IncomingMsg {
            sender: peer(4),
            expected_addr_validity_us: 1_000_000,
            fc_on: true,
            fc_id: 42,
            body: body.clone(),
        }
        .encode();
        let expected = ENVELOPE_HEADER_LEN + 32 + 8 + 4 + 8 + body.len();
        assert_eq!(env.len(), expected);
        // fc_on flag sits after sender + validity.
        let off = ENVELOPE_HEADER_LEN + 32 + 8;
        assert_eq!(u32::from_be_bytes(env[off..off + 4].try_into().unwrap()), 1);
    }
}
