//! Binary format helpers for the RDB encoder.
//!
//! TLV-style primitives, CRC32 checksums, and the magic header. All
//! multi-byte integers are little-endian.

use std::io::{self, Read, Write};

use crc32fast::Hasher;
use thiserror::Error;

/// Magic bytes opening an RDB stream. The AOF loader probes for these
/// at offset 0 to detect a preamble.
pub const RDB_MAGIC: &[u8; 5] = b"CINDB";

/// Current format version.
pub const FORMAT_VERSION: u8 = 1;

/// Errors reading or writing the persistence formats.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("invalid magic bytes")]
    InvalidMagic,

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u8),

    #[error("crc32 mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("unknown record tag: {0}")]
    UnknownTag(u8),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// CRC32 over a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    let mut h = Hasher::new();
    h.update(data);
    h.finalize()
}

pub fn write_u8(w: &mut impl Write, val: u8) -> io::Result<()> {
    w.write_all(&[val])
}

pub fn write_u32(w: &mut impl Write, val: u32) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

pub fn write_u64(w: &mut impl Write, val: u64) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

pub fn write_i64(w: &mut impl Write, val: i64) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

pub fn write_f64(w: &mut impl Write, val: f64) -> io::Result<()> {
    w.write_all(&val.to_le_bytes())
}

/// Length-prefixed byte field: `[len: u32][data]`.
pub fn write_bytes(w: &mut impl Write, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("field length {} exceeds u32::MAX", data.len()),
        )
    })?;
    write_u32(w, len)?;
    w.write_all(data)
}

pub fn read_u8(r: &mut impl Read) -> Result<u8, FormatError> {
    let mut buf = [0u8; 1];
    read_exact(r, &mut buf)?;
    Ok(buf[0])
}

pub fn read_u32(r: &mut impl Read) -> Result<u32, FormatError> {
    let mut buf = [0u8; 4];
    read_exact(r, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u64(r: &mut impl Read) -> Result<u64, FormatError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn read_i64(r: &mut impl Read) -> Result<i64, FormatError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

pub fn read_f64(r: &mut impl Read) -> Result<f64, FormatError> {
    let mut buf = [0u8; 8];
    read_exact(r, &mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

/// Cap on a length-prefixed field; a corrupt prefix must not cause a
/// multi-gigabyte allocation.
pub const MAX_FIELD_LEN: usize = 512 * 1024 * 1024;

pub fn read_bytes(r: &mut impl Read) -> Result<Vec<u8>, FormatError> {
    let len = read_u32(r)? as usize;
    if len > MAX_FIELD_LEN {
        return Err(FormatError::InvalidData(format!(
            "field length {len} exceeds maximum of {MAX_FIELD_LEN}"
        )));
    }
    let mut buf = vec![0u8; len];
    read_exact(r, &mut buf)?;
    Ok(buf)
}

fn read_exact(r: &mut impl Read, buf: &mut [u8]) -> Result<(), FormatError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FormatError::UnexpectedEof
        } else {
            FormatError::Io(e)
        }
    })
}

/// Writes the magic + version header.
pub fn write_header(w: &mut impl Write) -> io::Result<()> {
    w.write_all(RDB_MAGIC)?;
    write_u8(w, FORMAT_VERSION)
}

/// Reads and validates a header. Returns the version.
pub fn read_header(r: &mut impl Read) -> Result<u8, FormatError> {
    let mut magic = [0u8; 5];
    read_exact(r, &mut magic)?;
    if &magic != RDB_MAGIC {
        return Err(FormatError::InvalidMagic);
    }
    let version = read_u8(r)?;
    if version == 0 || version > FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    Ok(version)
}

/// Caps pre-allocation from untrusted count fields.
pub fn capped_capacity(count: u32) -> usize {
    (count as usize).min(65_536)
}
