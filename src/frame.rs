//! Binary frame codec for the non-TTY streaming protocol
//!
//! Every non-TTY message on a command transport (and every data frame on a
//! control channel) is a single tagged unit: byte 0 is the stream tag, the
//! rest is the payload. Payloads may be empty (EOF signals, empty exit).

use crate::error::{Result, SpriteError};

/// Stream tag identifying which stream a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamTag {
    /// Input to the remote process
    Stdin = 0,
    /// Remote process standard output
    Stdout = 1,
    /// Remote process standard error
    Stderr = 2,
    /// Exit code notification (payload is 0 or 1 bytes, empty means 0)
    Exit = 3,
    /// End of input, no payload
    StdinEof = 4,
}

impl TryFrom<u8> for StreamTag {
    type Error = SpriteError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(StreamTag::Stdin),
            1 => Ok(StreamTag::Stdout),
            2 => Ok(StreamTag::Stderr),
            3 => Ok(StreamTag::Exit),
            4 => Ok(StreamTag::StdinEof),
            other => Err(SpriteError::Frame(format!("unknown stream tag {other}"))),
        }
    }
}

/// Encode a frame: tag byte followed by the payload
pub fn encode(tag: StreamTag, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(tag as u8);
    buf.extend_from_slice(payload);
    buf
}

/// Decode a frame into its tag and payload
///
/// Fails on an empty buffer or an unknown tag byte.
pub fn decode(buf: &[u8]) -> Result<(StreamTag, &[u8])> {
    let (&tag, payload) = buf
        .split_first()
        .ok_or_else(|| SpriteError::Frame("empty frame".to_string()))?;
    Ok((StreamTag::try_from(tag)?, payload))
}

/// Interpret an Exit frame payload as an exit code (empty payload means 0)
pub fn exit_code(payload: &[u8]) -> i32 {
    payload.first().map_or(0, |&b| i32::from(b))
}
