//! RESP frame types.
//!
//! The [`Frame`] enum represents a single parsed RESP value. Bulk
//! strings use `Bytes` for reference-counted, binary-safe storage that
//! avoids copies when moving payloads between the connection buffer,
//! the keyspace, and the append-only file.

use bytes::Bytes;

/// A command line: the name followed by its arguments, all binary-safe.
///
/// This is the currency of the dispatcher, the transaction queue, and
/// the append-only file.
pub type CmdLine = Vec<Bytes>;

/// Builds a command line from string-ish parts.
pub fn cmdline<I, S>(parts: I) -> CmdLine
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    parts
        .into_iter()
        .map(|p| Bytes::copy_from_slice(p.as_ref()))
        .collect()
}

/// Returns the lowercased command name of a command line, or `None`
/// if the line is empty or the name is not valid UTF-8.
pub fn cmd_name(line: &[Bytes]) -> Option<String> {
    let first = line.first()?;
    std::str::from_utf8(first)
        .ok()
        .map(|s| s.to_ascii_lowercase())
}

/// A single RESP protocol frame.
///
/// Covers the RESP2 types used on the wire: simple strings, errors,
/// integers, bulk strings, arrays, plus the two null markers
/// (`$-1` for a missing bulk and `*-1` for a missing array).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string response, e.g. `+OK\r\n`.
    Simple(String),

    /// Error response, e.g. `-ERR unknown command\r\n`.
    Error(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Ordered array of frames, e.g. `*2\r\n+a\r\n+b\r\n`.
    Array(Vec<Frame>),

    /// Null bulk string, `$-1\r\n`. GET on a missing key returns this.
    Null,

    /// Null array, `*-1\r\n`. EXEC after a watch conflict returns this.
    NullArray,
}

impl Frame {
    /// The canonical `+OK` reply.
    pub fn ok() -> Frame {
        Frame::Simple("OK".into())
    }

    /// The `+QUEUED` reply sent for commands buffered inside MULTI.
    pub fn queued() -> Frame {
        Frame::Simple("QUEUED".into())
    }

    /// Builds a bulk frame from anything byte-like.
    pub fn bulk(data: impl Into<Bytes>) -> Frame {
        Frame::Bulk(data.into())
    }

    /// Builds an error frame. The message should already carry its
    /// `ERR`/`WRONGTYPE`/... prefix.
    pub fn error(msg: impl Into<String>) -> Frame {
        Frame::Error(msg.into())
    }

    /// Builds the standard wrong-arity error for a command.
    pub fn arg_num_error(cmd: &str) -> Frame {
        Frame::Error(format!("ERR wrong number of arguments for '{cmd}' command"))
    }

    /// Returns `true` if this frame is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Returns `true` if this frame is one of the null markers.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null | Frame::NullArray)
    }

    /// Wraps a command line as the multi-bulk array clients (and the
    /// AOF) use to encode requests.
    pub fn from_cmdline(line: &[Bytes]) -> Frame {
        Frame::Array(line.iter().cloned().map(Frame::Bulk).collect())
    }

    /// Extracts a command line from a request frame.
    ///
    /// Requests must be non-empty arrays of bulk strings.
    pub fn into_cmdline(self) -> Result<CmdLine, crate::ProtocolError> {
        let items = match self {
            Frame::Array(items) => items,
            other => {
                return Err(crate::ProtocolError::InvalidRequest(format!(
                    "expected array, got {}",
                    other.type_name()
                )))
            }
        };
        if items.is_empty() {
            return Err(crate::ProtocolError::InvalidRequest(
                "empty command array".into(),
            ));
        }
        items
            .into_iter()
            .map(|f| match f {
                Frame::Bulk(b) => Ok(b),
                other => Err(crate::ProtocolError::InvalidRequest(format!(
                    "expected bulk string, got {}",
                    other.type_name()
                ))),
            })
            .collect()
    }

    /// Short human-readable name of the frame variant, used in errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Simple(_) => "simple string",
            Frame::Error(_) => "error",
            Frame::Integer(_) => "integer",
            Frame::Bulk(_) => "bulk string",
            Frame::Array(_) => "array",
            Frame::Null => "null bulk",
            Frame::NullArray => "null array",
        }
    }
}
