//! Framed binary protocol between the supervisor and the worker process.
//!
//! Three message shapes travel over the worker's stdin/stdout pipes:
//! a request carrying raw image bytes, a reply carrying markup text, and a
//! stop sentinel that ends the worker loop. Frames are a one-byte tag
//! followed by a tag-specific payload; integers are little-endian.

use std::io::{Read, Write};

use thiserror::Error;

const TAG_STOP: u8 = 0x00;
const TAG_REQUEST: u8 = 0x01;
const TAG_REPLY: u8 = 0x02;

/// Sanity cap on frame payloads. Anything larger than this is a corrupt
/// stream, not a legitimate upload.
const MAX_PAYLOAD_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// One image to recognize, correlated by id.
    Request { id: u64, image_bytes: Vec<u8> },
    /// The recognized markup for a request; empty text is a valid result.
    Reply { id: u64, text: String },
    /// Tells the worker loop to exit cleanly.
    Stop,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown frame tag {tag:#04x}")]
    UnknownTag { tag: u8 },

    #[error("Frame payload of {len} bytes exceeds the {max} byte cap")]
    PayloadTooLarge { len: u64, max: u32 },

    #[error("Reply text is not valid UTF-8")]
    TextNotUtf8,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Write one frame and flush, so a reply is never stuck in a pipe buffer
/// while the supervisor's deadline runs down.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), ProtocolError> {
    match message {
        Message::Stop => {
            writer.write_all(&[TAG_STOP])?;
        }
        Message::Request { id, image_bytes } => {
            let len = checked_len(image_bytes.len())?;
            writer.write_all(&[TAG_REQUEST])?;
            writer.write_all(&id.to_le_bytes())?;
            writer.write_all(&len.to_le_bytes())?;
            writer.write_all(image_bytes)?;
        }
        Message::Reply { id, text } => {
            let len = checked_len(text.len())?;
            writer.write_all(&[TAG_REPLY])?;
            writer.write_all(&id.to_le_bytes())?;
            writer.write_all(&len.to_le_bytes())?;
            writer.write_all(text.as_bytes())?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Read one frame, blocking until it is complete. EOF before the first tag
/// byte surfaces as `Io(UnexpectedEof)`.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message, ProtocolError> {
    let mut tag = [0u8; 1];
    reader.read_exact(&mut tag)?;

    match tag[0] {
        TAG_STOP => Ok(Message::Stop),
        TAG_REQUEST => {
            let id = read_u64(reader)?;
            let image_bytes = read_payload(reader)?;
            Ok(Message::Request { id, image_bytes })
        }
        TAG_REPLY => {
            let id = read_u64(reader)?;
            let payload = read_payload(reader)?;
            let text = String::from_utf8(payload).map_err(|_| ProtocolError::TextNotUtf8)?;
            Ok(Message::Reply { id, text })
        }
        tag => Err(ProtocolError::UnknownTag { tag }),
    }
}

/// Length-check before any frame bytes hit the wire: an overlong payload
/// must fail cleanly instead of truncating the length field and desyncing
/// the stream.
fn checked_len(len: usize) -> Result<u32, ProtocolError> {
    match u32::try_from(len) {
        Ok(len) if len <= MAX_PAYLOAD_BYTES => Ok(len),
        _ => Err(ProtocolError::PayloadTooLarge {
            len: len as u64,
            max: MAX_PAYLOAD_BYTES,
        }),
    }
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, ProtocolError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_payload<R: Read>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_PAYLOAD_BYTES {
        return Err(ProtocolError::PayloadTooLarge {
            len: u64::from(len),
            max: MAX_PAYLOAD_BYTES,
        });
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}
