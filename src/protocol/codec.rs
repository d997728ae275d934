//! Frame codec
//!
//! ## Wire format
//!
//! ```text
//! +----------------+------------------+---------------------------+
//! | command_id u32 | payload_len u32  | payload (payload_len)     |
//! | little-endian  | little-endian    |                           |
//! +----------------+------------------+---------------------------+
//! ```
//!
//! A zero-length payload is legal and used by tag-only commands such as
//! `ProcessMesh`. There is no checksum; the loopback transport is reliable.

use std::io::Read;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::types::Frame;
use crate::{BridgeError, Result};

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 8;

/// Largest payload `encode` accepts (2^31 - 1)
pub const MAX_ENCODABLE_PAYLOAD: usize = i32::MAX as usize;

/// Default inbound payload cap (256 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

/// Build the 8-byte header
pub fn encode_header(command_id: u32, payload_len: u32) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&command_id.to_le_bytes());
    header[4..8].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Split a header into `(command_id, payload_len)`
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> (u32, u32) {
    let command_id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let payload_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    (command_id, payload_len)
}

/// Encode a frame into a contiguous buffer.
pub fn encode(command_id: u32, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_ENCODABLE_PAYLOAD {
        return Err(BridgeError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_ENCODABLE_PAYLOAD,
        });
    }
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&encode_header(command_id, payload.len() as u32));
    out.extend_from_slice(payload);
    Ok(out)
}

fn check_cap(payload_len: u32, max_frame_bytes: u32) -> Result<()> {
    if payload_len > max_frame_bytes {
        return Err(BridgeError::FrameTooLarge {
            declared: payload_len as u64,
            max: max_frame_bytes as u64,
        });
    }
    Ok(())
}

/// Fill `buf` from a blocking reader, returning the number of bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Decode one frame from a blocking reader.
///
/// Reads exactly 8 header bytes, then exactly `payload_len` bytes.
pub fn decode_from<R: Read>(reader: &mut R, max_frame_bytes: u32) -> Result<Frame> {
    let mut header = [0u8; HEADER_SIZE];
    let got = read_full(reader, &mut header)?;
    if got < HEADER_SIZE {
        return Err(BridgeError::UnexpectedEnd {
            context: "frame header",
            needed: HEADER_SIZE,
            got,
        });
    }
    let (command_id, payload_len) = decode_header(&header);
    check_cap(payload_len, max_frame_bytes)?;

    let mut payload = vec![0u8; payload_len as usize];
    let got = read_full(reader, &mut payload)?;
    if got < payload.len() {
        return Err(BridgeError::UnexpectedEnd {
            context: "frame payload",
            needed: payload.len(),
            got,
        });
    }
    Ok(Frame::new(command_id, payload))
}

async fn read_full_async<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read one frame from an async stream.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly on a frame
/// boundary; a close anywhere else is `UnexpectedEnd`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> Result<Option<Frame>> {
    let mut header = [0u8; HEADER_SIZE];
    let got = read_full_async(reader, &mut header).await?;
    if got == 0 {
        return Ok(None);
    }
    if got < HEADER_SIZE {
        return Err(BridgeError::UnexpectedEnd {
            context: "frame header",
            needed: HEADER_SIZE,
            got,
        });
    }
    let (command_id, payload_len) = decode_header(&header);
    check_cap(payload_len, max_frame_bytes)?;

    let mut payload = vec![0u8; payload_len as usize];
    let got = read_full_async(reader, &mut payload).await?;
    if got < payload.len() {
        return Err(BridgeError::UnexpectedEnd {
            context: "frame payload",
            needed: payload.len(),
            got,
        });
    }
    trace!("Read frame {} ({} bytes)", super::commands::label(command_id), payload_len);
    Ok(Some(Frame::new(command_id, payload)))
}

/// Write one frame to an async stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    if frame.payload.len() > MAX_ENCODABLE_PAYLOAD {
        return Err(BridgeError::PayloadTooLarge {
            len: frame.payload.len(),
            max: MAX_ENCODABLE_PAYLOAD,
        });
    }
    writer.write_all(&encode_header(frame.command_id, frame.payload.len() as u32)).await?;
    writer.write_all(&frame.payload).await?;
    Ok(())
}
