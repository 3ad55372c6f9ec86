//! Hash commands.

use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;

use super::{aof_line, key_of, parse_i64, read_first_key, rollback_hash_fields, write_first_key};
use crate::db::Database;
use crate::entity::DataEntity;
use crate::registry::{register, Table, UndoFn, FLAG_READ_ONLY, FLAG_WRITE};
use cinder_protocol::{CmdLine, Frame};

pub fn register_all(table: &mut Table) {
    register(table, "hset", exec_hset, Some(write_first_key), Some(undo_hset as UndoFn), -4, FLAG_WRITE);
    register(table, "hmset", exec_hmset, Some(write_first_key), Some(undo_hset as UndoFn), -4, FLAG_WRITE);
    register(table, "hsetnx", exec_hsetnx, Some(write_first_key), Some(undo_hset as UndoFn), 4, FLAG_WRITE);
    register(table, "hget", exec_hget, Some(read_first_key), None, 3, FLAG_READ_ONLY);
    register(table, "hdel", exec_hdel, Some(write_first_key), Some(undo_hdel as UndoFn), -3, FLAG_WRITE);
    register(table, "hexists", exec_hexists, Some(read_first_key), None, 3, FLAG_READ_ONLY);
    register(table, "hlen", exec_hlen, Some(read_first_key), None, 2, FLAG_READ_ONLY);
    register(table, "hkeys", exec_hkeys, Some(read_first_key), None, 2, FLAG_READ_ONLY);
    register(table, "hvals", exec_hvals, Some(read_first_key), None, 2, FLAG_READ_ONLY);
    register(table, "hgetall", exec_hgetall, Some(read_first_key), None, 2, FLAG_READ_ONLY);
    register(table, "hmget", exec_hmget, Some(read_first_key), None, -3, FLAG_READ_ONLY);
    register(table, "hincrby", exec_hincrby, Some(write_first_key), Some(undo_hincrby as UndoFn), 4, FLAG_WRITE);
}

fn undo_hset(db: &Arc<Database>, args: &[Bytes]) -> Vec<CmdLine> {
    let key = key_of(&args[0]);
    let fields: Vec<String> = args[1..].iter().step_by(2).map(key_of).collect();
    rollback_hash_fields(db, &key, &fields)
}

fn undo_hdel(db: &Arc<Database>, args: &[Bytes]) -> Vec<CmdLine> {
    let key = key_of(&args[0]);
    let fields: Vec<String> = args[1..].iter().map(key_of).collect();
    rollback_hash_fields(db, &key, &fields)
}

fn undo_hincrby(db: &Arc<Database>, args: &[Bytes]) -> Vec<CmdLine> {
    let key = key_of(&args[0]);
    rollback_hash_fields(db, &key, &[key_of(&args[1])])
}

fn with_hash<R>(
    db: &Arc<Database>,
    key: &str,
    f: impl FnOnce(&AHashMap<String, Bytes>) -> R,
) -> Result<Option<R>, Frame> {
    match db.with_entity(key, |e| e.as_hash().map(f)) {
        None => Ok(None),
        Some(Ok(r)) => Ok(Some(r)),
        Some(Err(wrong)) => Err(Frame::error(wrong.to_string())),
    }
}

fn with_hash_mut<R>(
    db: &Arc<Database>,
    key: &str,
    f: impl FnOnce(&mut AHashMap<String, Bytes>) -> R,
) -> Result<Option<R>, Frame> {
    match db.with_entity_mut(key, |e| e.as_hash_mut().map(f)) {
        None => Ok(None),
        Some(Ok(r)) => Ok(Some(r)),
        Some(Err(wrong)) => Err(Frame::error(wrong.to_string())),
    }
}

/// Type check before upsert-creating a hash under `key`.
fn ensure_hash(db: &Arc<Database>, key: &str) -> Result<(), Frame> {
    match db.with_entity(key, |e| e.as_hash().map(|_| ())) {
        Some(Err(wrong)) => Err(Frame::error(wrong.to_string())),
        _ => Ok(()),
    }
}

// HSET key field value [field value ...]
fn exec_hset(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    if args[1..].len() % 2 != 0 {
        return Frame::arg_num_error("hset");
    }
    let key = key_of(&args[0]);
    if let Err(e) = ensure_hash(db, &key) {
        return e;
    }
    let added = db.upsert_entity_with(
        &key,
        || DataEntity::Hash(AHashMap::new()),
        |entity| {
            let hash = entity.as_hash_mut().expect("checked hash type");
            let mut added = 0;
            for pair in args[1..].chunks(2) {
                if hash.insert(key_of(&pair[0]), pair[1].clone()).is_none() {
                    added += 1;
                }
            }
            added
        },
    );
    db.add_aof(aof_line("HSET", args));
    Frame::Integer(added)
}

/// HMSET is HSET with the legacy +OK reply.
fn exec_hmset(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    match exec_hset(db, args) {
        Frame::Integer(_) => Frame::ok(),
        other => other,
    }
}

fn exec_hsetnx(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let field = key_of(&args[1]);
    if let Err(e) = ensure_hash(db, &key) {
        return e;
    }
    let inserted = db.upsert_entity_with(
        &key,
        || DataEntity::Hash(AHashMap::new()),
        |entity| {
            let hash = entity.as_hash_mut().expect("checked hash type");
            if hash.contains_key(&field) {
                0
            } else {
                hash.insert(field.clone(), args[2].clone());
                1
            }
        },
    );
    if inserted == 1 {
        db.add_aof(aof_line("HSETNX", args));
    }
    Frame::Integer(inserted)
}

fn exec_hget(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let field = key_of(&args[1]);
    match with_hash(db, &key, |h| h.get(&field).cloned()) {
        Ok(Some(Some(val))) => Frame::Bulk(val),
        Ok(_) => Frame::Null,
        Err(e) => e,
    }
}

fn exec_hdel(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let removed = match with_hash_mut(db, &key, |hash| {
        args[1..]
            .iter()
            .filter(|f| hash.remove(&key_of(f)).is_some())
            .count()
    }) {
        Ok(opt) => opt.unwrap_or(0),
        Err(e) => return e,
    };
    if removed > 0 {
        db.remove_if_empty_collection(&key);
        db.add_aof(aof_line("HDEL", args));
    }
    Frame::Integer(removed as i64)
}

fn exec_hexists(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let field = key_of(&args[1]);
    match with_hash(db, &key, |h| h.contains_key(&field)) {
        Ok(found) => Frame::Integer(i64::from(found.unwrap_or(false))),
        Err(e) => e,
    }
}

fn exec_hlen(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    match with_hash(db, &key, |h| h.len()) {
        Ok(len) => Frame::Integer(len.unwrap_or(0) as i64),
        Err(e) => e,
    }
}

fn exec_hkeys(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    match with_hash(db, &key, |h| {
        h.keys()
            .map(|f| Frame::bulk(f.clone().into_bytes()))
            .collect::<Vec<_>>()
    }) {
        Ok(items) => Frame::Array(items.unwrap_or_default()),
        Err(e) => e,
    }
}

fn exec_hvals(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    match with_hash(db, &key, |h| {
        h.values().cloned().map(Frame::Bulk).collect::<Vec<_>>()
    }) {
        Ok(items) => Frame::Array(items.unwrap_or_default()),
        Err(e) => e,
    }
}

fn exec_hgetall(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    match with_hash(db, &key, |h| {
        let mut out = Vec::with_capacity(h.len() * 2);
        for (field, val) in h {
            out.push(Frame::bulk(field.clone().into_bytes()));
            out.push(Frame::Bulk(val.clone()));
        }
        out
    }) {
        Ok(items) => Frame::Array(items.unwrap_or_default()),
        Err(e) => e,
    }
}

fn exec_hmget(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    match with_hash(db, &key, |h| {
        args[1..]
            .iter()
            .map(|f| match h.get(&key_of(f)) {
                Some(val) => Frame::Bulk(val.clone()),
                None => Frame::Null,
            })
            .collect::<Vec<_>>()
    }) {
        Ok(Some(items)) => Frame::Array(items),
        Ok(None) => Frame::Array(args[1..].iter().map(|_| Frame::Null).collect()),
        Err(e) => e,
    }
}

// HINCRBY key field delta
fn exec_hincrby(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let field = key_of(&args[1]);
    let delta = match parse_i64(&args[2]) {
        Ok(d) => d,
        Err(e) => return e,
    };
    if let Err(e) = ensure_hash(db, &key) {
        return e;
    }
    let result = db.upsert_entity_with(
        &key,
        || DataEntity::Hash(AHashMap::new()),
        |entity| {
            let hash = entity.as_hash_mut().expect("checked hash type");
            let current: i64 = match hash.get(&field) {
                None => 0,
                Some(b) => match std::str::from_utf8(b).ok().and_then(|s| s.parse().ok()) {
                    Some(n) => n,
                    None => return Err(Frame::error("ERR hash value is not an integer")),
                },
            };
            let Some(next) = current.checked_add(delta) else {
                return Err(Frame::error("ERR increment or decrement would overflow"));
            };
            hash.insert(field.clone(), Bytes::from(next.to_string()));
            Ok(next)
        },
    );
    match result {
        Ok(next) => {
            db.add_aof(aof_line("HINCRBY", args));
            Frame::Integer(next)
        }
        Err(e) => {
            db.remove_if_empty_collection(&key);
            e
        }
    }
}
