//! Multiplex session wire format
//!
//! Frames travel inside the ciphered layer:
//! `type(1) + stream_id(4) + length(2) + payload(length)`, big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum payload size (64KB)
pub const MAX_PAYLOAD_SIZE: usize = 65535;

/// Frame header size: type(1) + stream_id(4) + length(2)
pub const FRAME_HEADER_SIZE: usize = 7;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Stream payload
    Data = 0x01,
    /// Open a new stream
    Open = 0x02,
    /// Sender will write no more on this stream
    Close = 0x03,
    /// Abort the stream in both directions
    Reset = 0x04,
    /// Grant the peer more send credit
    WindowUpdate = 0x05,
    /// Keepalive
    Keepalive = 0x06,
    /// Keepalive ACK
    KeepaliveAck = 0x07,
    /// Session is going away
    GoAway = 0x08,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::Open),
            0x03 => Some(Self::Close),
            0x04 => Some(Self::Reset),
            0x05 => Some(Self::WindowUpdate),
            0x06 => Some(Self::Keepalive),
            0x07 => Some(Self::KeepaliveAck),
            0x08 => Some(Self::GoAway),
            _ => None,
        }
    }
}

/// Multiplex frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            stream_id,
            payload: payload.into(),
        }
    }

    /// Create a DATA frame
    pub fn data(stream_id: u32, data: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Data, stream_id, data)
    }

    /// Create an OPEN frame
    pub fn open(stream_id: u32) -> Self {
        Self::new(FrameType::Open, stream_id, Bytes::new())
    }

    /// Create a CLOSE (half-close) frame
    pub fn close(stream_id: u32) -> Self {
        Self::new(FrameType::Close, stream_id, Bytes::new())
    }

    /// Create a RESET frame
    pub fn reset(stream_id: u32) -> Self {
        Self::new(FrameType::Reset, stream_id, Bytes::new())
    }

    /// Create a WINDOW_UPDATE frame
    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        Self::new(
            FrameType::WindowUpdate,
            stream_id,
            Bytes::copy_from_slice(&increment.to_be_bytes()),
        )
    }

    /// Create a KEEPALIVE frame carrying an opaque nonce
    pub fn keepalive(nonce: u32) -> Self {
        Self::new(FrameType::Keepalive, 0, Bytes::copy_from_slice(&nonce.to_be_bytes()))
    }

    /// Answer a KEEPALIVE by echoing its payload
    pub fn keepalive_ack(payload: Bytes) -> Self {
        Self::new(FrameType::KeepaliveAck, 0, payload)
    }

    /// Create a GOAWAY frame
    pub fn go_away() -> Self {
        Self::new(FrameType::GoAway, 0, Bytes::new())
    }

    /// Serialize frame to bytes
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.stream_id);
        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
    }

    /// Parse a WINDOW_UPDATE payload
    pub fn parse_window_update(&self) -> Option<u32> {
        if self.frame_type != FrameType::WindowUpdate || self.payload.len() != 4 {
            return None;
        }
        let mut buf = &self.payload[..];
        Some(buf.get_u32())
    }
}

/// Frame parsing error
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid frame type: {0}")]
    InvalidType(u8),
    #[error("Payload too large: {0}")]
    PayloadTooLarge(usize),
}

/// Tokio codec for encoding/decoding frames
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(item.payload.len()));
        }
        dst.reserve(FRAME_HEADER_SIZE + item.payload.len());
        item.write_to(dst);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least header
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Validate frame type
        let frame_type = FrameType::from_u8(src[0]).ok_or(FrameError::InvalidType(src[0]))?;
        let payload_len = u16::from_be_bytes([src[5], src[6]]) as usize;

        // Check if we have complete frame
        let total_len = FRAME_HEADER_SIZE + payload_len;
        if src.len() < total_len {
            // Reserve space for the full frame
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        // Extract frame data
        let mut buf = src.split_to(total_len);
        buf.advance(1); // Skip type
        let stream_id = buf.get_u32();
        buf.advance(2); // Skip length (we already know it)
        let payload = buf.freeze();

        Ok(Some(Frame {
            frame_type,
            stream_id,
            payload,
        }))
    }
}
