//! Length-prefixed record framing over a reliable byte stream.
//!
//! Every logical record is `[len: u32 big-endian][payload]`. Transfers open
//! with three plaintext handshake records (filename, ASCII file size, and a
//! strategy options blob), each acknowledged with a literal `"OK"` record.

use std::io::{Read, Write};

use bytes::{BufMut, BytesMut};

use crate::error::TransferError;

/// Upper bound on a single record. Multicast ships a whole encrypted file in
/// one record, so this is generous; anything larger is a corrupt or hostile
/// length prefix.
pub const MAX_RECORD_LEN: usize = 256 * 1024 * 1024;

/// Literal payload acknowledging a handshake step.
pub const ACK_OK: &[u8] = b"OK";

/// Write one framed record.
pub fn write_record<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), TransferError> {
    if payload.len() > MAX_RECORD_LEN {
        return Err(TransferError::protocol(format!(
            "record of {} bytes exceeds the {MAX_RECORD_LEN} byte limit",
            payload.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    w.write_all(&buf)?;
    Ok(())
}

/// Read one framed record.
pub fn read_record<R: Read>(r: &mut R) -> Result<Vec<u8>, TransferError> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_RECORD_LEN {
        return Err(TransferError::protocol(format!(
            "record length {len} exceeds the {MAX_RECORD_LEN} byte limit"
        )));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(payload)
}

/// The plaintext preamble of every transfer stream.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub filename: String,
    pub file_size: u64,
    /// Strategy-specific options blob; strict JSON when non-empty.
    pub options: Vec<u8>,
}

/// Sender side of the handshake: three records, each awaiting `"OK"`.
pub fn send_handshake<S: Read + Write>(
    stream: &mut S,
    filename: &str,
    file_size: u64,
    options: &[u8],
) -> Result<(), TransferError> {
    write_record(stream, filename.as_bytes())?;
    expect_ok(stream, "filename")?;
    write_record(stream, file_size.to_string().as_bytes())?;
    expect_ok(stream, "file size")?;
    write_record(stream, options)?;
    expect_ok(stream, "options")?;
    Ok(())
}

/// Receiver side of the handshake, acknowledging each step.
pub fn recv_handshake<S: Read + Write>(stream: &mut S) -> Result<Handshake, TransferError> {
    let filename_bytes = read_record(stream)?;
    let filename = String::from_utf8(filename_bytes)
        .map_err(|_| TransferError::protocol("filename is not UTF-8"))?;
    if filename.is_empty() || filename.contains(['/', '\\']) || filename == ".." {
        return Err(TransferError::protocol(format!(
            "refusing suspicious filename {filename:?}"
        )));
    }
    write_record(stream, ACK_OK)?;

    let size_bytes = read_record(stream)?;
    let file_size = std::str::from_utf8(&size_bytes)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| TransferError::protocol("file size is not an ASCII decimal"))?;
    write_record(stream, ACK_OK)?;

    let options = read_record(stream)?;
    write_record(stream, ACK_OK)?;

    Ok(Handshake {
        filename,
        file_size,
        options,
    })
}

fn expect_ok<R: Read>(stream: &mut R, step: &str) -> Result<(), TransferError> {
    let record = read_record(stream)?;
    if record != ACK_OK {
        return Err(TransferError::protocol(format!(
            "{step} handshake step not acknowledged"
        )));
    }
    Ok(())
}
