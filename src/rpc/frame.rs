//! Call frame format
//!
//! Each call stream carries exactly one request frame followed by exactly
//! one response or error frame:
//! ```text
//! +--------+--------+--------+--------+--------+-- ... --+
//! | Type   | Length (4 bytes, big-endian)      | Payload |
//! +--------+--------+--------+--------+--------+-- ... --+
//! ```
//!
//! Message Types:
//! - 0x01: Request  - MessagePack `{method, payload}` envelope
//! - 0x02: Response - MessagePack-encoded method response
//! - 0x03: Error    - UTF-8 error message

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, ErrorKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Header size: 1 byte type + 4 bytes length
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Message types for the call protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x01,
    Response = 0x02,
    Error = 0x03,
}

impl MessageType {
    /// Parse message type from byte
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Request),
            0x02 => Some(Self::Response),
            0x03 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_byte(&self) -> u8 {
        *self as u8
    }
}

/// A parsed call frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(Bytes),
    Response(Bytes),
    /// Explicit error marker from the handling side
    Error(String),
}

impl Frame {
    fn parts(&self) -> (MessageType, &[u8]) {
        match self {
            Frame::Request(data) => (MessageType::Request, &data[..]),
            Frame::Response(data) => (MessageType::Response, &data[..]),
            Frame::Error(msg) => (MessageType::Error, msg.as_bytes()),
        }
    }

    /// Encode frame into bytes
    pub fn encode(&self) -> io::Result<Bytes> {
        let (msg_type, payload) = self.parts();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("Payload too large: {} bytes", payload.len()),
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u8(msg_type.as_byte());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(payload);
        Ok(buf.freeze())
    }

    /// Try to decode a frame from bytes
    /// Returns None if not enough data, Err if invalid
    pub fn decode(buf: &mut BytesMut) -> io::Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek at header without consuming
        let msg_type = buf[0];
        let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

        if length > MAX_PAYLOAD_SIZE {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("Payload too large: {} bytes", length),
            ));
        }

        let msg_type = MessageType::from_byte(msg_type).ok_or_else(|| {
            io::Error::new(
                ErrorKind::InvalidData,
                format!("Unknown message type: {}", msg_type),
            )
        })?;

        if buf.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        buf.advance(HEADER_SIZE);
        let data = buf.split_to(length).freeze();

        let frame = match msg_type {
            MessageType::Request => Frame::Request(data),
            MessageType::Response => Frame::Response(data),
            MessageType::Error => Frame::Error(String::from_utf8_lossy(&data).to_string()),
        };

        Ok(Some(frame))
    }
}

/// Read one frame. Returns `None` on a clean end of stream before any
/// header byte arrived.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Frame>> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(frame) = Frame::decode(&mut buf)? {
            return Ok(Some(frame));
        }
        if reader.read_buf(&mut buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("stream ended inside a frame ({} bytes buffered)", buf.len()),
            ));
        }
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    writer.write_all(&frame.encode()?).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_frame_layout() {
        let encoded = Frame::Error("boom".into()).encode().unwrap();
        assert_eq!(&encoded[..], &[0x03, 0, 0, 0, 4, b'b', b'o', b'o', b'm']);
    }

    #[test]
    fn test_partial_frame() {
        let encoded = Frame::Response(Bytes::from_static(b"hello")).encode().unwrap();

        let mut buf = BytesMut::from(&encoded[..3]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());

        let mut buf = BytesMut::from(&encoded[..7]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7, "partial decode must not consume input");
    }

    #[test]
    fn test_rejects_unknown_type_and_oversize() {
        let mut buf = BytesMut::from(&[0x7f, 0, 0, 0, 0][..]);
        assert!(Frame::decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Request.as_byte());
        buf.put_u32((MAX_PAYLOAD_SIZE + 1) as u32);
        assert!(Frame::decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_read_frame_across_small_writes() {
        let (mut a, mut b) = tokio::io::duplex(4);
        let frame = Frame::Request(Bytes::from(vec![7u8; 100]));
        let expected = frame.clone();

        let writer = tokio::spawn(async move {
            write_frame(&mut a, &frame).await.unwrap();
        });

        let read = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(read, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_frame_eof_handling() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());

        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0x02, 0, 0, 0, 10, 1, 2]).await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }
}
