//! Wire primitives for the server list ping protocol.
//!
//! VarInts are LEB128-encoded `u32` values carrying an `i32` payload, which is
//! exactly what `unsigned-varint` implements for 5-byte integers.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use unsigned_varint::{decode, encode};

/// A VarInt never spans more than 5 bytes.
pub const MAX_VARINT_LEN: usize = 5;

/// Upper bound for a modern status frame. Real responses (favicons included)
/// stay far below this.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Framing errors. These never leave the probe module; a rung that hits one
/// simply yields to the next rung.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid varint: {0}")]
    VarInt(String),
    #[error("frame length {0} out of range")]
    Length(i64),
    #[error("unexpected packet id {0:#04x}")]
    UnexpectedPacket(i32),
    #[error("truncated frame")]
    Truncated,
    #[error("invalid string: {0}")]
    Text(String),
}

/// Append a VarInt-encoded `i32`.
pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut tmp = encode::u32_buffer();
    buf.extend_from_slice(encode::u32(value as u32, &mut tmp));
}

/// Append a VarInt length-prefixed UTF-8 string.
pub fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_varint(buf, value.len() as i32);
    buf.extend_from_slice(value.as_bytes());
}

/// Prefix a packet body with its VarInt length.
pub fn frame(packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(packet.len() + MAX_VARINT_LEN);
    write_varint(&mut out, packet.len() as i32);
    out.extend_from_slice(packet);
    out
}

/// Decode a VarInt from the front of `buf`, returning the value and the rest.
pub fn read_varint_prefix(buf: &[u8]) -> Result<(i32, &[u8]), FrameError> {
    let (value, rest) = decode::u32(buf).map_err(|e| FrameError::VarInt(e.to_string()))?;
    Ok((value as i32, rest))
}

/// Decode a VarInt length-prefixed UTF-8 string from the front of `buf`.
pub fn read_string_prefix(buf: &[u8]) -> Result<(String, &[u8]), FrameError> {
    let (len, rest) = read_varint_prefix(buf)?;
    if len < 0 {
        return Err(FrameError::Length(len as i64));
    }
    let len = len as usize;
    if rest.len() < len {
        return Err(FrameError::Truncated);
    }
    let text = std::str::from_utf8(&rest[..len])
        .map_err(|e| FrameError::Text(e.to_string()))?
        .to_string();
    Ok((text, &rest[len..]))
}

/// Read one VarInt from a stream, one byte at a time.
pub async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32, FrameError> {
    let mut bytes = [0u8; MAX_VARINT_LEN];
    for i in 0..MAX_VARINT_LEN {
        bytes[i] = reader.read_u8().await?;
        if bytes[i] & 0x80 == 0 {
            let (value, _) = read_varint_prefix(&bytes[..=i])?;
            return Ok(value);
        }
    }
    Err(FrameError::VarInt("varint longer than 5 bytes".to_string()))
}

/// Read one length-prefixed frame body.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let len = read_varint(reader).await?;
    if len <= 0 || len as usize > MAX_FRAME_LEN {
        return Err(FrameError::Length(len as i64));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Encode a string as UTF-16BE code units, as the pre-netty protocol expects.
pub fn encode_utf16be(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(|unit| unit.to_be_bytes()).collect()
}

/// Decode UTF-16BE bytes. An odd trailing byte is a framing error.
pub fn decode_utf16be(bytes: &[u8]) -> Result<String, FrameError> {
    if bytes.len() % 2 != 0 {
        return Err(FrameError::Truncated);
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| FrameError::Text(e.to_string()))
}
