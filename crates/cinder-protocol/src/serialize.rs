//! Direct-to-buffer RESP serialization.
//!
//! Writes frames directly into a `BytesMut` buffer with no intermediate
//! allocations. Integer-to-string conversion uses `itoa` for fast
//! stack-based formatting.

use bytes::BufMut;
use bytes::BytesMut;

use crate::types::Frame;

impl Frame {
    /// Serializes this frame into the provided buffer.
    ///
    /// Writes the full RESP wire representation, including type prefix
    /// and trailing `\r\n` delimiters.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Error(msg) => {
                dst.put_u8(b'-');
                dst.put_slice(msg.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                dst.put_u8(b':');
                write_i64(*n, dst);
                dst.put_slice(b"\r\n");
            }
            Frame::Bulk(data) => {
                dst.put_u8(b'$');
                write_i64(data.len() as i64, dst);
                dst.put_slice(b"\r\n");
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            Frame::Array(items) => {
                dst.put_u8(b'*');
                write_i64(items.len() as i64, dst);
                dst.put_slice(b"\r\n");
                for item in items {
                    item.serialize(dst);
                }
            }
            Frame::Null => {
                dst.put_slice(b"$-1\r\n");
            }
            Frame::NullArray => {
                dst.put_slice(b"*-1\r\n");
            }
        }
    }

    /// Serializes this frame into a fresh byte vector. Convenience for
    /// the AOF writer and tests; network paths reuse a `BytesMut`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.serialize(&mut buf);
        buf.to_vec()
    }
}

/// Writes an i64 as its decimal ASCII representation directly into the buffer.
fn write_i64(val: i64, dst: &mut BytesMut) {
    let mut buf = itoa::Buffer::new();
    dst.put_slice(buf.format(val).as_bytes());
}
