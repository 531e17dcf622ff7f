//! Frame and ack definitions plus their stream codec.
//!
//! A frame is the unit of bulk data. Sequence numbers are scoped to one
//! file transfer and allocated in strictly increasing order by the sender.
//!
//! # Frame format
//!
//! ```text
//! | version:u8 | file_id:u32 BE | frame_id:u32 BE | len:u16 BE | payload[len] |
//! ```
//!
//! A `len` of zero is legal and marks end-of-file; no payload bytes follow.
//!
//! # Ack format
//!
//! ```text
//! | version:u8 | file_id:u32 BE | frame_id:u32 BE |
//! ```

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Protocol version carried in every frame and ack.
pub const VERSION: u8 = 0;

/// Maximum payload bytes a single frame may carry.
pub const MAX_PAYLOAD: usize = 65535;

const FRAME_HEADER_SIZE: usize = 11;
const ACK_SIZE: usize = 9;

/// Returns true if `frame_size` is a legal configured payload size.
pub fn is_valid_frame_size(frame_size: usize) -> bool {
    frame_size >= 1 && frame_size <= MAX_PAYLOAD
}

/// A frame in the transfer protocol.
///
/// Frames are immutable once created; retransmission reuses the same
/// frame value on a different relay stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version.
    pub version: u8,

    /// File identifier the frame belongs to.
    pub file_id: u32,

    /// Sequence number within the file, starting at 0.
    pub frame_id: u32,

    /// Payload bytes. Empty marks end-of-file.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a data frame.
    pub fn new(file_id: u32, frame_id: u32, payload: Bytes) -> Self {
        Self {
            version: VERSION,
            file_id,
            frame_id,
            payload,
        }
    }

    /// Creates the zero-payload end-of-file frame.
    pub fn eof(file_id: u32, frame_id: u32) -> Self {
        Self::new(file_id, frame_id, Bytes::new())
    }

    /// Returns true if this frame marks end-of-file.
    pub fn is_eof(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Acknowledgement for one committed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Protocol version.
    pub version: u8,

    /// File identifier.
    pub file_id: u32,

    /// Sequence number being acknowledged.
    pub frame_id: u32,
}

impl Ack {
    /// Creates an ack for the given frame sequence.
    pub fn new(file_id: u32, frame_id: u32) -> Self {
        Self {
            version: VERSION,
            file_id,
            frame_id,
        }
    }
}

/// Writes one frame to the stream.
pub async fn write_frame<W>(w: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.payload.len() > MAX_PAYLOAD {
        return Err(Error::protocol("frame payload too large"));
    }

    let mut head = [0u8; FRAME_HEADER_SIZE];
    head[0] = frame.version;
    head[1..5].copy_from_slice(&frame.file_id.to_be_bytes());
    head[5..9].copy_from_slice(&frame.frame_id.to_be_bytes());
    head[9..11].copy_from_slice(&(frame.payload.len() as u16).to_be_bytes());

    w.write_all(&head).await?;
    if !frame.payload.is_empty() {
        w.write_all(&frame.payload).await?;
    }
    w.flush().await?;
    Ok(())
}

/// Reads one frame from the stream. A short read is an error.
pub async fn read_frame<R>(r: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; FRAME_HEADER_SIZE];
    r.read_exact(&mut head).await?;

    let version = head[0];
    let file_id = u32::from_be_bytes([head[1], head[2], head[3], head[4]]);
    let frame_id = u32::from_be_bytes([head[5], head[6], head[7], head[8]]);
    let len = u16::from_be_bytes([head[9], head[10]]) as usize;

    let payload = if len == 0 {
        Bytes::new()
    } else {
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf).await?;
        Bytes::from(buf)
    };

    Ok(Frame {
        version,
        file_id,
        frame_id,
        payload,
    })
}

/// Writes one ack to the stream.
pub async fn write_ack<W>(w: &mut W, ack: &Ack) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; ACK_SIZE];
    buf[0] = ack.version;
    buf[1..5].copy_from_slice(&ack.file_id.to_be_bytes());
    buf[5..9].copy_from_slice(&ack.frame_id.to_be_bytes());

    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one ack from the stream. A short read is an error.
pub async fn read_ack<R>(r: &mut R) -> Result<Ack>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; ACK_SIZE];
    r.read_exact(&mut buf).await?;

    Ok(Ack {
        version: buf[0],
        file_id: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
        frame_id: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_bounds() {
        assert!(!is_valid_frame_size(0));
        assert!(is_valid_frame_size(1));
        assert!(is_valid_frame_size(5120));
        assert!(is_valid_frame_size(65535));
        assert!(!is_valid_frame_size(65536));
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let frame = Frame::new(7, 42, Bytes::from_static(b"hello frame"));
        write_frame(&mut a, &frame).await.unwrap();

        let decoded = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_frame_wire_layout() {
        let (mut a, mut b) = tokio::io::duplex(64);

        write_frame(&mut a, &Frame::new(1, 2, Bytes::from_static(b"xy")))
            .await
            .unwrap();
        drop(a);

        let mut raw = Vec::new();
        b.read_to_end(&mut raw).await.unwrap();
        assert_eq!(
            raw,
            vec![0, 0, 0, 0, 1, 0, 0, 0, 2, 0, 2, b'x', b'y'],
        );
    }

    #[tokio::test]
    async fn test_eof_frame_has_no_payload_bytes() {
        let (mut a, mut b) = tokio::io::duplex(64);

        write_frame(&mut a, &Frame::eof(3, 9)).await.unwrap();
        drop(a);

        let decoded = read_frame(&mut b).await.unwrap();
        assert!(decoded.is_eof());
        assert_eq!(decoded.frame_id, 9);

        // nothing left on the stream after the 11-byte header
        let mut rest = Vec::new();
        b.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let (mut a, mut b) = tokio::io::duplex(64);

        a.write_all(&[0, 0, 0, 0, 1, 0, 0]).await.unwrap();
        drop(a);

        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_error() {
        let (mut a, mut b) = tokio::io::duplex(64);

        // header promises 4 payload bytes, deliver 2
        a.write_all(&[0, 0, 0, 0, 1, 0, 0, 0, 2, 0, 4, b'a', b'b'])
            .await
            .unwrap();
        drop(a);

        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_ack_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let ack = Ack::new(7, 1234);
        write_ack(&mut a, &ack).await.unwrap();

        let decoded = read_ack(&mut b).await.unwrap();
        assert_eq!(decoded, ack);
    }
}
