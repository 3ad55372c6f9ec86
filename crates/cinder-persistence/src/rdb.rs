//! RDB snapshot encoding and decoding.
//!
//! Layout:
//! ```text
//! [magic "CINDB"][version: 1B]
//! [aux count: u8][aux key/value pairs]
//! per database with keys:
//!   [0xFE][db index: u32][key count: u32]
//!   per key: [type tag: 1B][key][expiry flag: 1B][deadline ms: u64?][payload]
//! [0xFF][crc32 of everything before it: u32]
//! ```
//!
//! The decoder counts the bytes it consumes so the AOF loader can
//! resume RESP parsing right after a preamble.

use std::io::{Read, Write};

use bytes::Bytes;

use cinder_core::entity::DataEntity;
use cinder_core::quicklist::QuickList;
use cinder_core::sorted_set::SortedSet;
use cinder_core::Engine;

use crate::format::{self, FormatError};

const OP_SELECT_DB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;

const TYPE_STRING: u8 = 0;
const TYPE_LIST: u8 = 1;
const TYPE_HASH: u8 = 2;
const TYPE_SET: u8 = 3;
const TYPE_ZSET: u8 = 4;

/// A `Write` that feeds a CRC hasher as it writes.
struct CrcWriter<W: Write> {
    inner: W,
    hasher: crc32fast::Hasher,
}

impl<W: Write> CrcWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
        }
    }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// A `Read` that counts consumed bytes and feeds a CRC hasher.
struct CrcReader<R: Read> {
    inner: R,
    hasher: crc32fast::Hasher,
    consumed: usize,
}

impl<R: Read> CrcReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            consumed: 0,
        }
    }
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.consumed += n;
        Ok(n)
    }
}

/// Encodes every live key of every database into `w`.
pub fn encode_engine(engine: &Engine, w: &mut impl Write) -> Result<(), FormatError> {
    let mut w = CrcWriter::new(w);
    format::write_header(&mut w)?;

    // aux metadata
    format::write_u8(&mut w, 1)?;
    format::write_bytes(&mut w, b"databases")?;
    format::write_bytes(&mut w, engine.db_count().to_string().as_bytes())?;

    for db in engine.databases() {
        // collect first so the count prefix is exact
        let mut entries: Vec<(String, DataEntity, Option<u64>)> = Vec::new();
        db.for_each_entity(|key, entity, deadline| {
            entries.push((key.to_owned(), entity.clone(), deadline));
            true
        });
        if entries.is_empty() {
            continue;
        }

        format::write_u8(&mut w, OP_SELECT_DB)?;
        format::write_u32(&mut w, db.index() as u32)?;
        format::write_u32(&mut w, entries.len() as u32)?;
        for (key, entity, deadline) in entries {
            write_entry(&mut w, &key, &entity, deadline)?;
        }
    }

    format::write_u8(&mut w, OP_EOF)?;
    let crc = w.hasher.clone().finalize();
    format::write_u32(&mut w.inner, crc)?;
    w.inner.flush()?;
    Ok(())
}

fn write_entry(
    w: &mut impl Write,
    key: &str,
    entity: &DataEntity,
    deadline: Option<u64>,
) -> Result<(), FormatError> {
    let tag = match entity {
        DataEntity::Bytes(_) => TYPE_STRING,
        DataEntity::List(_) => TYPE_LIST,
        DataEntity::Hash(_) => TYPE_HASH,
        DataEntity::Set(_) => TYPE_SET,
        DataEntity::SortedSet(_) => TYPE_ZSET,
    };
    format::write_u8(w, tag)?;
    format::write_bytes(w, key.as_bytes())?;
    match deadline {
        Some(at) => {
            format::write_u8(w, 1)?;
            format::write_u64(w, at)?;
        }
        None => format::write_u8(w, 0)?,
    }

    match entity {
        DataEntity::Bytes(b) => format::write_bytes(w, b)?,
        DataEntity::List(list) => {
            format::write_u32(w, list.len() as u32)?;
            for val in list.iter() {
                format::write_bytes(w, val)?;
            }
        }
        DataEntity::Hash(hash) => {
            format::write_u32(w, hash.len() as u32)?;
            for (field, val) in hash {
                format::write_bytes(w, field.as_bytes())?;
                format::write_bytes(w, val)?;
            }
        }
        DataEntity::Set(set) => {
            format::write_u32(w, set.len() as u32)?;
            for member in set {
                format::write_bytes(w, member.as_bytes())?;
            }
        }
        DataEntity::SortedSet(zset) => {
            format::write_u32(w, zset.len() as u32)?;
            for (member, score) in zset.iter() {
                format::write_f64(w, score)?;
                format::write_bytes(w, member.as_bytes())?;
            }
        }
    }
    Ok(())
}

fn read_string(r: &mut impl Read, what: &str) -> Result<String, FormatError> {
    let raw = format::read_bytes(r)?;
    String::from_utf8(raw)
        .map_err(|_| FormatError::InvalidData(format!("{what} is not valid utf-8")))
}

fn read_entry(r: &mut impl Read, tag: u8) -> Result<(String, DataEntity, Option<u64>), FormatError> {
    let key = read_string(r, "key")?;
    let deadline = match format::read_u8(r)? {
        0 => None,
        1 => Some(format::read_u64(r)?),
        other => {
            return Err(FormatError::InvalidData(format!(
                "bad expiry flag {other}"
            )))
        }
    };

    let entity = match tag {
        TYPE_STRING => DataEntity::Bytes(Bytes::from(format::read_bytes(r)?)),
        TYPE_LIST => {
            let count = format::read_u32(r)?;
            let mut list = QuickList::new();
            for _ in 0..count {
                list.push_back(Bytes::from(format::read_bytes(r)?));
            }
            DataEntity::List(list)
        }
        TYPE_HASH => {
            let count = format::read_u32(r)?;
            let mut hash = ahash::AHashMap::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                let field = read_string(r, "field")?;
                hash.insert(field, Bytes::from(format::read_bytes(r)?));
            }
            DataEntity::Hash(hash)
        }
        TYPE_SET => {
            let count = format::read_u32(r)?;
            let mut set = ahash::AHashSet::with_capacity(format::capped_capacity(count));
            for _ in 0..count {
                set.insert(read_string(r, "member")?);
            }
            DataEntity::Set(set)
        }
        TYPE_ZSET => {
            let count = format::read_u32(r)?;
            let mut zset = SortedSet::new();
            for _ in 0..count {
                let score = format::read_f64(r)?;
                zset.add(read_string(r, "member")?, score);
            }
            DataEntity::SortedSet(zset)
        }
        other => return Err(FormatError::UnknownTag(other)),
    };
    Ok((key, entity, deadline))
}

/// Decodes a snapshot from `r` into the engine. Returns the number of
/// bytes consumed (header through trailing CRC), which the AOF loader
/// uses to resume after a preamble.
///
/// Keys whose deadline already passed are dropped rather than restored.
pub fn decode_into(engine: &Engine, r: &mut impl Read) -> Result<usize, FormatError> {
    let mut r = CrcReader::new(r);
    format::read_header(&mut r)?;

    let aux_count = format::read_u8(&mut r)?;
    for _ in 0..aux_count {
        let _key = format::read_bytes(&mut r)?;
        let _val = format::read_bytes(&mut r)?;
    }

    let now = cinder_core::timewheel::now_unix_ms();
    loop {
        let op = format::read_u8(&mut r)?;
        match op {
            OP_SELECT_DB => {
                let db_index = format::read_u32(&mut r)? as usize;
                let key_count = format::read_u32(&mut r)?;
                let Some(db) = engine.database(db_index) else {
                    return Err(FormatError::InvalidData(format!(
                        "snapshot names database {db_index} beyond configured range"
                    )));
                };
                for _ in 0..key_count {
                    let tag = format::read_u8(&mut r)?;
                    let (key, entity, deadline) = read_entry(&mut r, tag)?;
                    match deadline {
                        Some(at) if at <= now => continue,
                        Some(at) => {
                            db.put_entity(&key, entity);
                            db.expire(&key, at);
                        }
                        None => {
                            db.put_entity(&key, entity);
                        }
                    }
                }
            }
            OP_EOF => break,
            other => return Err(FormatError::UnknownTag(other)),
        }
    }

    // snapshot the hash before the stored crc bytes pass through the
    // reader, so `computed` covers exactly the checked region
    let computed = r.hasher.clone().finalize();
    let stored = format::read_u32(&mut r)?;
    if computed != stored {
        return Err(FormatError::ChecksumMismatch {
            expected: stored,
            actual: computed,
        });
    }
    Ok(r.consumed)
}

/// Probes whether a byte slice opens with the RDB magic.
pub fn has_rdb_header(prefix: &[u8]) -> bool {
    prefix.len() >= format::RDB_MAGIC.len() && &prefix[..format::RDB_MAGIC.len()] == format::RDB_MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::registry::exec_normal;
    use cinder_core::{cmdline, EngineConfig, Frame};
    use std::io::Cursor;

    fn populated_engine() -> std::sync::Arc<Engine> {
        let engine = Engine::new(EngineConfig::default());
        let db = engine.database(0).unwrap();
        exec_normal(db, &cmdline(["SET", "s", "value"]));
        exec_normal(db, &cmdline(["RPUSH", "l", "a", "b", "c"]));
        exec_normal(db, &cmdline(["HSET", "h", "f1", "v1", "f2", "v2"]));
        exec_normal(db, &cmdline(["SADD", "set", "m1", "m2"]));
        exec_normal(db, &cmdline(["ZADD", "z", "1", "a", "2.5", "b"]));
        let db1 = engine.database(1).unwrap();
        exec_normal(db1, &cmdline(["SET", "other", "db1"]));
        engine
    }

    fn encode(engine: &Engine) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_engine(engine, &mut buf).unwrap();
        buf
    }

    #[test]
    fn round_trip_preserves_all_types() {
        let src = populated_engine();
        let buf = encode(&src);
        assert!(has_rdb_header(&buf));

        let dst = Engine::new(EngineConfig::default());
        let consumed = decode_into(&dst, &mut Cursor::new(&buf)).unwrap();
        assert_eq!(consumed, buf.len());

        let db = dst.database(0).unwrap();
        assert_eq!(
            exec_normal(db, &cmdline(["GET", "s"])),
            Frame::bulk(&b"value"[..])
        );
        assert_eq!(
            exec_normal(db, &cmdline(["LRANGE", "l", "0", "-1"])),
            Frame::Array(vec![
                Frame::bulk(&b"a"[..]),
                Frame::bulk(&b"b"[..]),
                Frame::bulk(&b"c"[..])
            ])
        );
        assert_eq!(
            exec_normal(db, &cmdline(["HGET", "h", "f2"])),
            Frame::bulk(&b"v2"[..])
        );
        assert_eq!(
            exec_normal(db, &cmdline(["SISMEMBER", "set", "m1"])),
            Frame::Integer(1)
        );
        assert_eq!(
            exec_normal(db, &cmdline(["ZSCORE", "z", "b"])),
            Frame::bulk(&b"2.5"[..])
        );
        let db1 = dst.database(1).unwrap();
        assert_eq!(
            exec_normal(db1, &cmdline(["GET", "other"])),
            Frame::bulk(&b"db1"[..])
        );
    }

    #[test]
    fn expirations_survive_round_trip() {
        let src = Engine::new(EngineConfig::default());
        let db = src.database(0).unwrap();
        exec_normal(db, &cmdline(["SET", "k", "v"]));
        exec_normal(db, &cmdline(["EXPIRE", "k", "10000"]));

        let buf = encode(&src);
        let dst = Engine::new(EngineConfig::default());
        decode_into(&dst, &mut Cursor::new(&buf)).unwrap();
        let db = dst.database(0).unwrap();
        match exec_normal(db, &cmdline(["TTL", "k"])) {
            Frame::Integer(n) => assert!(n > 0 && n <= 10_000),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dead_keys_dropped_on_decode() {
        let src = Engine::new(EngineConfig::default());
        let db = src.database(0).unwrap();
        exec_normal(db, &cmdline(["SET", "dead", "v"]));
        let past = cinder_core::timewheel::now_unix_ms().saturating_sub(10_000);
        db.expire("dead", past);
        // encode before the lazy removal notices
        let buf = encode(&src);

        let dst = Engine::new(EngineConfig::default());
        decode_into(&dst, &mut Cursor::new(&buf)).unwrap();
        assert_eq!(dst.total_keys(), 0);
    }

    #[test]
    fn corrupt_crc_detected() {
        let src = populated_engine();
        let mut buf = encode(&src);
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let dst = Engine::new(EngineConfig::default());
        let err = decode_into(&dst, &mut Cursor::new(&buf)).unwrap_err();
        assert!(matches!(err, FormatError::ChecksumMismatch { .. }));
    }

    #[test]
    fn bad_magic_detected() {
        let dst = Engine::new(EngineConfig::default());
        let err = decode_into(&dst, &mut Cursor::new(b"GARBAGE DATA")).unwrap_err();
        assert!(matches!(err, FormatError::InvalidMagic));
    }

    #[test]
    fn consumed_count_stops_before_trailing_data() {
        let src = populated_engine();
        let mut buf = encode(&src);
        let rdb_len = buf.len();
        buf.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");

        let dst = Engine::new(EngineConfig::default());
        let consumed = decode_into(&dst, &mut Cursor::new(&buf)).unwrap();
        assert_eq!(consumed, rdb_len);
    }

    #[test]
    fn empty_engine_encodes_and_decodes() {
        let src = Engine::new(EngineConfig::default());
        let buf = encode(&src);
        let dst = Engine::new(EngineConfig::default());
        decode_into(&dst, &mut Cursor::new(&buf)).unwrap();
        assert_eq!(dst.total_keys(), 0);
    }
}
