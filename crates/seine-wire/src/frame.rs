use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Result, WireError};

/// Frame header: `sequence:u32 status:i32 command:i32 length:u32`, big-endian.
pub const HEADER_LEN: usize = 16;

/// Hard cap on a frame payload. A header announcing more than this is a
/// malformed message; the bytes are never read.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sequence: u32,
    pub status: i32,
    pub command: i32,
    pub length: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.sequence.to_be_bytes());
        out[4..8].copy_from_slice(&self.status.to_be_bytes());
        out[8..12].copy_from_slice(&self.command.to_be_bytes());
        out[12..16].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            sequence: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            status: i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            command: i32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            length: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }
}

/// One complete framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u32,
    pub status: i32,
    pub command: i32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(sequence: u32, command: i32, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            status: 0,
            command,
            payload,
        }
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            sequence: self.sequence,
            status: self.status,
            command: self.command,
            length: self.payload.len() as u32,
        }
    }
}

/// Write one frame: header then payload, in full. A short write surfaces as
/// the underlying I/O error and is fatal to the connection. A payload above
/// [`MAX_PAYLOAD`] is rejected before any byte is written; the `u32` length
/// field could not represent it faithfully.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    if frame.payload.len() > MAX_PAYLOAD {
        return Err(WireError::Malformed(format!(
            "frame payload of {} bytes exceeds maximum {MAX_PAYLOAD}",
            frame.payload.len()
        )));
    }
    writer.write_all(&frame.header().encode()).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame: 16 header bytes, then exactly `length` payload
/// bytes. Short reads are fatal; an announced length above [`MAX_PAYLOAD`]
/// is rejected before allocating.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let header = FrameHeader::decode(&header);

    let length = header.length as usize;
    if length > MAX_PAYLOAD {
        tracing::warn!(
            target: "seine.wire",
            length,
            command = header.command,
            "rejecting frame with oversized payload"
        );
        return Err(WireError::Malformed(format!(
            "frame payload of {length} bytes exceeds maximum {MAX_PAYLOAD}"
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        sequence: header.sequence,
        status: header.status,
        command: header.command,
        payload,
    })
}
