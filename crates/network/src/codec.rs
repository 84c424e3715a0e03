//! Binary frame codec
//!
//! Wire format: `[type:1][length:4 big-endian][payload:length]`.
//!
//! [`FrameDecoder`] buffers partial reads and yields exactly one frame per
//! `5 + length` bytes consumed, leaving any remainder buffered for the next
//! call. A declared length above [`MAX_PAYLOAD_SIZE`] poisons the stream;
//! callers must close the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame header size (type + length)
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (16 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Unknown frame type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("Malformed payload for {0:?}: {1}")]
    MalformedPayload(FrameType, String),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Frame type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Handshake = 0x01,
    HandshakeAck = 0x02,
    Ping = 0x03,
    Pong = 0x04,
    Message = 0x05,
    RelayRequest = 0x06,
    RelayResponse = 0x07,
    PeerExchange = 0x08,
    DhtFindNode = 0x09,
    SyncRequest = 0x0A,
    PunchRequest = 0x0B,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => Self::Handshake,
            0x02 => Self::HandshakeAck,
            0x03 => Self::Ping,
            0x04 => Self::Pong,
            0x05 => Self::Message,
            0x06 => Self::RelayRequest,
            0x07 => Self::RelayResponse,
            0x08 => Self::PeerExchange,
            0x09 => Self::DhtFindNode,
            0x0A => Self::SyncRequest,
            0x0B => Self::PunchRequest,
            _ => return None,
        })
    }

    /// Frames accepted before the peer has authenticated
    pub fn allowed_before_auth(&self) -> bool {
        matches!(
            self,
            Self::Handshake | Self::HandshakeAck | Self::Ping | Self::Pong
        )
    }
}

/// A raw frame: type byte plus opaque payload.
///
/// The type byte is kept raw so that an unknown type can be reported for that
/// frame without losing stream sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub type_byte: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            type_byte: frame_type as u8,
            payload: payload.into(),
        }
    }

    pub fn frame_type(&self) -> Result<FrameType> {
        FrameType::from_byte(self.type_byte).ok_or(CodecError::UnknownType(self.type_byte))
    }

    /// Encoded length on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into a contiguous buffer
pub fn encode_frame(frame: &Frame) -> Result<Bytes> {
    if frame.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(frame.payload.len()));
    }
    let mut buf = BytesMut::with_capacity(frame.wire_len());
    buf.put_u8(frame.type_byte);
    buf.put_u32(frame.payload.len() as u32);
    buf.extend_from_slice(&frame.payload);
    Ok(buf.freeze())
}

/// Streaming decoder; one per connection
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, if any.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.poisoned {
            return Err(CodecError::PayloadTooLarge(self.peek_len().unwrap_or(0)));
        }
        let Some(len) = self.peek_len() else {
            return Ok(None);
        };
        if len > MAX_PAYLOAD_SIZE {
            self.poisoned = true;
            return Err(CodecError::PayloadTooLarge(len));
        }
        if self.buf.len() < HEADER_SIZE + len {
            self.buf.reserve(HEADER_SIZE + len - self.buf.len());
            return Ok(None);
        }

        let type_byte = self.buf.get_u8();
        self.buf.advance(4);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(Frame { type_byte, payload }))
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn peek_len(&self) -> Option<usize> {
        if self.buf.len() < HEADER_SIZE {
            return None;
        }
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        Some(len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(t: FrameType, payload: &[u8]) -> Vec<u8> {
        encode_frame(&Frame::new(t, payload.to_vec())).unwrap().to_vec()
    }

    #[test]
    fn test_header_layout() {
        let bytes = encoded(FrameType::Ping, b"abc");
        assert_eq!(bytes, vec![0x03, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_byte_at_a_time() {
        let wire = encoded(FrameType::Message, b"hello world");
        let mut dec = FrameDecoder::new();
        for (i, b) in wire.iter().enumerate() {
            dec.push(&[*b]);
            let out = dec.next_frame().unwrap();
            if i + 1 < wire.len() {
                assert!(out.is_none());
            } else {
                let frame = out.unwrap();
                assert_eq!(frame.frame_type().unwrap(), FrameType::Message);
                assert_eq!(&frame.payload[..], b"hello world");
            }
        }
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn test_two_frames_one_chunk_with_trailing_partial() {
        let mut wire = encoded(FrameType::Ping, b"1");
        wire.extend(encoded(FrameType::Pong, b"22"));
        let third = encoded(FrameType::Message, b"333");
        wire.extend(&third[..4]);

        let mut dec = FrameDecoder::new();
        dec.push(&wire);
        assert_eq!(&dec.next_frame().unwrap().unwrap().payload[..], b"1");
        assert_eq!(&dec.next_frame().unwrap().unwrap().payload[..], b"22");
        assert!(dec.next_frame().unwrap().is_none());
        assert_eq!(dec.buffered(), 4);

        dec.push(&third[4..]);
        assert_eq!(&dec.next_frame().unwrap().unwrap().payload[..], b"333");
    }

    #[test]
    fn test_split_at_every_offset() {
        let frames = [
            (FrameType::Handshake, b"{\"walletAddress\":\"0xab\"}".to_vec()),
            (FrameType::Ping, Vec::new()),
            (FrameType::Message, vec![7u8; 300]),
            (FrameType::SyncRequest, b"{}".to_vec()),
        ];
        let mut wire = Vec::new();
        for (t, payload) in &frames {
            wire.extend(encoded(*t, payload));
        }

        for split in 0..=wire.len() {
            let mut dec = FrameDecoder::new();
            let mut got = Vec::new();
            for chunk in [&wire[..split], &wire[split..]] {
                dec.push(chunk);
                while let Some(frame) = dec.next_frame().unwrap() {
                    got.push(frame);
                }
            }
            assert_eq!(got.len(), frames.len(), "split at {}", split);
            for (frame, (t, payload)) in got.iter().zip(&frames) {
                assert_eq!(frame.frame_type().unwrap(), *t);
                assert_eq!(&frame.payload[..], &payload[..]);
            }
            assert_eq!(dec.buffered(), 0);
        }
    }

    #[test]
    fn test_empty_payload() {
        let mut dec = FrameDecoder::new();
        dec.push(&encoded(FrameType::Ping, b""));
        let frame = dec.next_frame().unwrap().unwrap();
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_oversized_length_poisons_stream() {
        let mut dec = FrameDecoder::new();
        let len = (MAX_PAYLOAD_SIZE + 1) as u32;
        let mut header = vec![0x05];
        header.extend_from_slice(&len.to_be_bytes());
        dec.push(&header);
        assert!(matches!(dec.next_frame(), Err(CodecError::PayloadTooLarge(_))));
        dec.push(&encoded(FrameType::Ping, b""));
        assert!(dec.next_frame().is_err());
    }

    #[test]
    fn test_unknown_type_is_frame_scoped() {
        let mut wire = vec![0x7F, 0, 0, 0, 1, 0xAA];
        wire.extend(encoded(FrameType::Ping, b"x"));
        let mut dec = FrameDecoder::new();
        dec.push(&wire);

        let unknown = dec.next_frame().unwrap().unwrap();
        assert_eq!(unknown.frame_type(), Err(CodecError::UnknownType(0x7F)));
        let ping = dec.next_frame().unwrap().unwrap();
        assert_eq!(ping.frame_type().unwrap(), FrameType::Ping);
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let frame = Frame::new(FrameType::Message, vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert!(encode_frame(&frame).is_err());
    }

    #[test]
    fn test_pre_auth_frames() {
        assert!(FrameType::Handshake.allowed_before_auth());
        assert!(FrameType::Ping.allowed_before_auth());
        assert!(!FrameType::Message.allowed_before_auth());
        assert!(!FrameType::RelayRequest.allowed_before_auth());
        assert!(!FrameType::PunchRequest.allowed_before_auth());
        assert_eq!(FrameType::from_byte(0x0B), Some(FrameType::PunchRequest));
    }
}
