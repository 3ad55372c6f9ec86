//! Incremental RESP parser.
//!
//! Operates on buffered byte slices. The caller is responsible for
//! reading data from the network (or a file) into a buffer — the parser
//! is purely synchronous and returns `Ok(None)` when the buffer does not
//! yet hold a complete frame, letting the caller retry after the next
//! read.
//!
//! Two entry points exist on top of the frame parser:
//!
//! - [`parse_command`] accepts what clients actually send: multi-bulk
//!   arrays, or the inline space-separated form used by humans in
//!   `telnet` sessions (any line not starting with `*`).
//! - [`parse_rdb_payload`] handles the one deliberate wart of the
//!   protocol: after a `+FULLRESYNC ...` status the next frame is
//!   `$<len>\r\n` followed by `len` raw RDB bytes with *no* trailing
//!   CRLF. Callers switch to this function when they see the prefix.

use std::io::Cursor;

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::{CmdLine, Frame};

/// Maximum nesting depth for arrays. Prevents stack overflow from
/// malicious or malformed deeply-nested frames.
const MAX_NESTING_DEPTH: usize = 64;

/// Maximum number of elements in an array. Prevents memory
/// amplification where tiny elements declare huge counts.
const MAX_ARRAY_ELEMENTS: usize = 1_048_576;

/// Maximum length of a bulk string in bytes (512 MB, matching Redis).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Cap for Vec::with_capacity in array parsing; the Vec still grows
/// organically past this as elements are parsed.
const PREALLOC_CAP: usize = 1024;

/// Parses a single complete RESP frame from `buf`.
///
/// Returns `Ok(Some((frame, consumed)))` when a complete frame was
/// parsed, `Ok(None)` if the buffer doesn't contain enough data yet,
/// or `Err(...)` if the data is malformed.
#[inline]
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);
    match try_parse(&mut cursor, 0) {
        Ok(frame) => {
            let consumed = cursor.position() as usize;
            Ok(Some((frame, consumed)))
        }
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Parses a client request: a multi-bulk array, or an inline command.
///
/// Inline form: any line whose first byte is not `*` is split on ASCII
/// whitespace into arguments. Blank inline lines are skipped (consumed
/// with no command), which matches how interactive clients behave.
///
/// Returns `Ok(Some((cmdline, consumed)))`, `Ok(None)` for an
/// incomplete buffer, or an error for malformed input.
pub fn parse_command(buf: &[u8]) -> Result<Option<(CmdLine, usize)>, ProtocolError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    if first == b'*' {
        return match parse_frame(buf)? {
            Some((frame, consumed)) => {
                let line = frame.into_cmdline()?;
                Ok(Some((line, consumed)))
            }
            None => Ok(None),
        };
    }

    // inline command: consume through the newline
    let Some(nl) = memchr::memchr(b'\n', buf) else {
        return Ok(None);
    };
    let consumed = nl + 1;
    let mut line = &buf[..nl];
    if line.ends_with(b"\r") {
        line = &line[..line.len() - 1];
    }
    let args: CmdLine = line
        .split(|&b| b == b' ' || b == b'\t')
        .filter(|part| !part.is_empty())
        .map(Bytes::copy_from_slice)
        .collect();
    if args.is_empty() {
        // blank inline line: consume it and parse whatever follows
        return Ok(parse_command(&buf[consumed..])?
            .map(|(line, extra)| (line, consumed + extra)));
    }
    Ok(Some((args, consumed)))
}

/// Parses the raw RDB payload that follows a `+FULLRESYNC` reply:
/// `$<len>\r\n` then exactly `len` bytes, with no trailing CRLF.
pub fn parse_rdb_payload(buf: &[u8]) -> Result<Option<(Bytes, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != b'$' {
        return Err(ProtocolError::InvalidPrefix(buf[0]));
    }

    let mut cursor = Cursor::new(buf);
    cursor.set_position(1);
    let len = match read_integer_line(&mut cursor) {
        Ok(n) => n,
        Err(ProtocolError::Incomplete) => return Ok(None),
        Err(e) => return Err(e),
    };
    if len < 0 || len > MAX_BULK_LEN {
        return Err(ProtocolError::InvalidFrameLength(len));
    }
    let len = len as usize;
    let start = cursor.position() as usize;
    if buf.len() < start + len {
        return Ok(None);
    }
    let data = Bytes::copy_from_slice(&buf[start..start + len]);
    Ok(Some((data, start + len)))
}

// ---------------------------------------------------------------------------
// single-pass frame parser
// ---------------------------------------------------------------------------

fn try_parse(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Frame, ProtocolError> {
    let prefix = read_byte(cursor)?;

    match prefix {
        b'+' => {
            let line = read_line(cursor)?;
            let s = std::str::from_utf8(line).map_err(|_| {
                ProtocolError::InvalidRequest("invalid utf-8 in simple string".into())
            })?;
            Ok(Frame::Simple(s.to_owned()))
        }
        b'-' => {
            let line = read_line(cursor)?;
            let s = std::str::from_utf8(line)
                .map_err(|_| ProtocolError::InvalidRequest("invalid utf-8 in error".into()))?;
            Ok(Frame::Error(s.to_owned()))
        }
        b':' => {
            let val = read_integer_line(cursor)?;
            Ok(Frame::Integer(val))
        }
        b'$' => {
            let len = read_integer_line(cursor)?;
            if len == -1 {
                return Ok(Frame::Null);
            }
            if len < 0 {
                return Err(ProtocolError::InvalidFrameLength(len));
            }
            if len > MAX_BULK_LEN {
                return Err(ProtocolError::BulkStringTooLarge(len as usize));
            }
            let len = len as usize;

            // need `len` bytes of data + \r\n
            if remaining(cursor) < len + 2 {
                return Err(ProtocolError::Incomplete);
            }

            let pos = cursor.position() as usize;
            {
                let buf = cursor.get_ref();
                if buf[pos + len] != b'\r' || buf[pos + len + 1] != b'\n' {
                    return Err(ProtocolError::InvalidFrameLength(len as i64));
                }
            }
            cursor.set_position((pos + len + 2) as u64);

            let data = Bytes::copy_from_slice(&cursor.get_ref()[pos..pos + len]);
            Ok(Frame::Bulk(data))
        }
        b'*' => {
            let next_depth = depth + 1;
            if next_depth > MAX_NESTING_DEPTH {
                return Err(ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH));
            }

            let count = read_integer_line(cursor)?;
            if count == -1 {
                return Ok(Frame::NullArray);
            }
            if count < 0 {
                return Err(ProtocolError::InvalidFrameLength(count));
            }
            if count as usize > MAX_ARRAY_ELEMENTS {
                return Err(ProtocolError::TooManyElements(count as usize));
            }

            let count = count as usize;
            let mut frames = Vec::with_capacity(count.min(PREALLOC_CAP));
            for _ in 0..count {
                frames.push(try_parse(cursor, next_depth)?);
            }
            Ok(Frame::Array(frames))
        }
        other => Err(ProtocolError::InvalidPrefix(other)),
    }
}

/// Reads a single byte, or `Incomplete` at end of buffer.
fn read_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    let pos = cursor.position() as usize;
    let buf = cursor.get_ref();
    if pos >= buf.len() {
        return Err(ProtocolError::Incomplete);
    }
    let byte = buf[pos];
    cursor.set_position((pos + 1) as u64);
    Ok(byte)
}

/// Number of unread bytes left in the cursor.
fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    cursor.get_ref().len() - cursor.position() as usize
}

/// Reads up to (not including) the next `\r\n`, advancing past it.
fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ProtocolError> {
    let buf = *cursor.get_ref();
    let start = cursor.position() as usize;
    let end = find_crlf(cursor)?;
    Ok(&buf[start..end])
}

/// Finds the next `\r\n` in the buffer starting from the cursor
/// position. Returns the index of the `\r` and advances the cursor
/// past the `\n`.
fn find_crlf(cursor: &mut Cursor<&[u8]>) -> Result<usize, ProtocolError> {
    let buf = *cursor.get_ref();
    let start = cursor.position() as usize;

    if start >= buf.len() {
        return Err(ProtocolError::Incomplete);
    }

    // SIMD-accelerated scan for \r, then verify \n follows.
    // memchr processes 16-32 bytes per cycle vs 1 byte in a naive loop.
    let mut pos = start;
    while let Some(offset) = memchr::memchr(b'\r', &buf[pos..]) {
        let cr = pos + offset;
        if cr + 1 < buf.len() && buf[cr + 1] == b'\n' {
            cursor.set_position((cr + 2) as u64);
            return Ok(cr);
        }
        // bare \r without \n — keep scanning past it
        pos = cr + 1;
    }

    Err(ProtocolError::Incomplete)
}

/// Reads a line and parses it as a decimal i64.
fn read_integer_line(cursor: &mut Cursor<&[u8]>) -> Result<i64, ProtocolError> {
    let line = read_line(cursor)?;
    let s = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidInteger)?;
    s.parse().map_err(|_| ProtocolError::InvalidInteger)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(input: &[u8]) -> (Frame, usize) {
        parse_frame(input).unwrap().unwrap()
    }

    #[test]
    fn simple_string() {
        let (frame, consumed) = complete(b"+OK\r\n");
        assert_eq!(frame, Frame::Simple("OK".into()));
        assert_eq!(consumed, 5);
    }

    #[test]
    fn error_frame() {
        let (frame, _) = complete(b"-ERR nope\r\n");
        assert_eq!(frame, Frame::Error("ERR nope".into()));
    }

    #[test]
    fn integer_frame() {
        let (frame, _) = complete(b":1234\r\n");
        assert_eq!(frame, Frame::Integer(1234));
        let (frame, _) = complete(b":-7\r\n");
        assert_eq!(frame, Frame::Integer(-7));
    }

    #[test]
    fn bulk_string() {
        let (frame, consumed) = complete(b"$5\r\nhello\r\n");
        assert_eq!(frame, Frame::Bulk(Bytes::from_static(b"hello")));
        assert_eq!(consumed, 11);
    }

    #[test]
    fn null_bulk() {
        let (frame, _) = complete(b"$-1\r\n");
        assert_eq!(frame, Frame::Null);
    }

    #[test]
    fn null_array() {
        let (frame, _) = complete(b"*-1\r\n");
        assert_eq!(frame, Frame::NullArray);
    }

    #[test]
    fn binary_safe_bulk() {
        let (frame, _) = complete(b"$3\r\na\0b\r\n");
        assert_eq!(frame, Frame::Bulk(Bytes::from_static(b"a\0b")));
    }

    #[test]
    fn array_of_bulks() {
        let (frame, _) = complete(b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::Bulk(Bytes::from_static(b"GET")),
                Frame::Bulk(Bytes::from_static(b"key")),
            ])
        );
    }

    #[test]
    fn bare_cr_inside_line_is_scanned_past() {
        let (frame, consumed) = complete(b"+a\rb\r\n");
        assert_eq!(frame, Frame::Simple("a\rb".into()));
        assert_eq!(consumed, 6);
    }

    #[test]
    fn incomplete_returns_none() {
        assert_eq!(parse_frame(b"$5\r\nhel").unwrap(), None);
        assert_eq!(parse_frame(b"*2\r\n$3\r\nGET\r\n").unwrap(), None);
        assert_eq!(parse_frame(b"+OK").unwrap(), None);
        assert_eq!(parse_frame(b"").unwrap(), None);
    }

    #[test]
    fn invalid_prefix() {
        assert!(matches!(
            parse_frame(b"?what\r\n"),
            Err(ProtocolError::InvalidPrefix(b'?'))
        ));
    }

    #[test]
    fn bulk_missing_crlf_is_error() {
        assert!(parse_frame(b"$3\r\nabcXY").is_err());
    }

    #[test]
    fn oversized_bulk_rejected() {
        assert!(matches!(
            parse_frame(b"$999999999999\r\n"),
            Err(ProtocolError::BulkStringTooLarge(_))
        ));
    }

    #[test]
    fn consumed_covers_pipelined_input() {
        let input = b"+OK\r\n:1\r\n";
        let (frame, consumed) = complete(input);
        assert_eq!(frame, Frame::Simple("OK".into()));
        let (frame2, _) = parse_frame(&input[consumed..]).unwrap().unwrap();
        assert_eq!(frame2, Frame::Integer(1));
    }

    // --- parse_command ---

    #[test]
    fn command_multibulk() {
        let (line, consumed) = parse_command(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(line, vec![Bytes::from("SET"), Bytes::from("k"), Bytes::from("v")]);
        assert_eq!(consumed, 31);
    }

    #[test]
    fn command_inline() {
        let (line, consumed) = parse_command(b"SET key value\r\n").unwrap().unwrap();
        assert_eq!(
            line,
            vec![Bytes::from("SET"), Bytes::from("key"), Bytes::from("value")]
        );
        assert_eq!(consumed, 15);
    }

    #[test]
    fn command_inline_bare_newline() {
        let (line, _) = parse_command(b"PING\n").unwrap().unwrap();
        assert_eq!(line, vec![Bytes::from("PING")]);
    }

    #[test]
    fn command_inline_incomplete() {
        assert_eq!(parse_command(b"SET key").unwrap(), None);
    }

    #[test]
    fn command_inline_blank_lines_skipped() {
        let (line, consumed) = parse_command(b"\r\n\r\nPING\r\n").unwrap().unwrap();
        assert_eq!(line, vec![Bytes::from("PING")]);
        assert_eq!(consumed, 10);
        assert_eq!(parse_command(b"\r\n").unwrap(), None);
    }

    #[test]
    fn command_rejects_nested_array() {
        let res = parse_command(b"*1\r\n*1\r\n$1\r\na\r\n");
        assert!(res.is_err());
    }

    // --- parse_rdb_payload ---

    #[test]
    fn rdb_payload_no_trailing_crlf() {
        let (data, consumed) = parse_rdb_payload(b"$5\r\nREDIS").unwrap().unwrap();
        assert_eq!(data, Bytes::from_static(b"REDIS"));
        assert_eq!(consumed, 9);
    }

    #[test]
    fn rdb_payload_incomplete() {
        assert_eq!(parse_rdb_payload(b"$10\r\nREDIS").unwrap(), None);
        assert_eq!(parse_rdb_payload(b"$10").unwrap(), None);
    }

    #[test]
    fn rdb_payload_wrong_prefix() {
        assert!(parse_rdb_payload(b"*1\r\n").is_err());
    }
}
