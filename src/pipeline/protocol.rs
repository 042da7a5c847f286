//! Control channel wire format.
//!
//! Two message shapes cross the worker boundary, both little-endian and with
//! no framing beyond their fixed sizes:
//! - `FRAME_READY` (worker -> consumer): `length: u32`, `page_index: u32`
//! - reply (consumer -> worker): one byte, `0` = ACK, `1` = ABORT

use std::io::{self, ErrorKind, Read, Write};

use super::error::{PipelineError, Result};

/// Encoded size of a `FRAME_READY` notice
pub const FRAME_READY_LEN: usize = 8;

const ACK_BYTE: u8 = 0;
const ABORT_BYTE: u8 = 1;

/// "A frame of `length` bytes for `page_index` is in the buffer."
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameNotice {
    pub length: u32,
    pub page_index: u32,
}

impl FrameNotice {
    #[must_use]
    pub const fn new(length: u32, page_index: u32) -> Self {
        Self { length, page_index }
    }

    #[must_use]
    pub fn encode(&self) -> [u8; FRAME_READY_LEN] {
        let mut out = [0u8; FRAME_READY_LEN];
        out[..4].copy_from_slice(&self.length.to_le_bytes());
        out[4..].copy_from_slice(&self.page_index.to_le_bytes());
        out
    }

    #[must_use]
    pub fn decode(bytes: [u8; FRAME_READY_LEN]) -> Self {
        Self {
            length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            page_index: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// The consumer's reply to a `FRAME_READY`.
///
/// Only handshake outcomes live here; rendering success or failure has its own
/// type ([`RenderOutcome`](super::RenderOutcome)) and never travels as a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOrAbort {
    /// Frame copied out, proceed
    Ack,
    /// Stop now
    Abort,
}

impl AckOrAbort {
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Ack => ACK_BYTE,
            Self::Abort => ABORT_BYTE,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            ACK_BYTE => Ok(Self::Ack),
            ABORT_BYTE => Ok(Self::Abort),
            other => Err(PipelineError::protocol(format!(
                "unknown reply byte {other:#04x}"
            ))),
        }
    }
}

pub fn write_notice<W: Write>(writer: &mut W, notice: FrameNotice) -> io::Result<()> {
    writer.write_all(&notice.encode())?;
    writer.flush()
}

/// Reads one notice. `Ok(None)` means the peer closed the channel cleanly
/// between messages; EOF inside a message is an error.
pub fn read_notice<R: Read>(reader: &mut R) -> io::Result<Option<FrameNotice>> {
    let mut buf = [0u8; FRAME_READY_LEN];
    if !read_message(reader, &mut buf)? {
        return Ok(None);
    }
    Ok(Some(FrameNotice::decode(buf)))
}

pub fn write_reply<W: Write>(writer: &mut W, reply: AckOrAbort) -> io::Result<()> {
    writer.write_all(&[reply.to_byte()])?;
    writer.flush()
}

/// Reads one reply. `Ok(None)` means the peer closed the channel.
pub fn read_reply<R: Read>(reader: &mut R) -> Result<Option<AckOrAbort>> {
    let mut buf = [0u8; 1];
    if !read_message(reader, &mut buf)? {
        return Ok(None);
    }
    AckOrAbort::from_byte(buf[0]).map(Some)
}

fn read_message<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("channel closed after {filled} of {} bytes", buf.len()),
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
