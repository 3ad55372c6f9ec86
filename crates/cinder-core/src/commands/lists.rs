//! List commands backed by the paged quicklist.

use std::sync::Arc;

use bytes::Bytes;

use super::{aof_line, key_of, parse_i64, read_first_key, rollback_first_key, write_first_key};
use crate::db::Database;
use crate::entity::DataEntity;
use crate::quicklist::QuickList;
use crate::registry::{register, Table, UndoFn, FLAG_READ_ONLY, FLAG_WRITE};
use cinder_protocol::Frame;

pub fn register_all(table: &mut Table) {
    register(table, "lpush", exec_lpush, Some(write_first_key), Some(rollback_first_key as UndoFn), -3, FLAG_WRITE);
    register(table, "lpushx", exec_lpushx, Some(write_first_key), Some(rollback_first_key as UndoFn), -3, FLAG_WRITE);
    register(table, "rpush", exec_rpush, Some(write_first_key), Some(rollback_first_key as UndoFn), -3, FLAG_WRITE);
    register(table, "rpushx", exec_rpushx, Some(write_first_key), Some(rollback_first_key as UndoFn), -3, FLAG_WRITE);
    register(table, "lpop", exec_lpop, Some(write_first_key), Some(rollback_first_key as UndoFn), 2, FLAG_WRITE);
    register(table, "rpop", exec_rpop, Some(write_first_key), Some(rollback_first_key as UndoFn), 2, FLAG_WRITE);
    register(table, "llen", exec_llen, Some(read_first_key), None, 2, FLAG_READ_ONLY);
    register(table, "lindex", exec_lindex, Some(read_first_key), None, 3, FLAG_READ_ONLY);
    register(table, "lset", exec_lset, Some(write_first_key), Some(rollback_first_key as UndoFn), 4, FLAG_WRITE);
    register(table, "lrange", exec_lrange, Some(read_first_key), None, 4, FLAG_READ_ONLY);
    register(table, "lrem", exec_lrem, Some(write_first_key), Some(rollback_first_key as UndoFn), 4, FLAG_WRITE);
}

/// Runs `f` on the list under `key`, or the wrong-type error. `None`
/// result means the key is absent.
fn with_list<R>(
    db: &Arc<Database>,
    key: &str,
    f: impl FnOnce(&QuickList) -> R,
) -> Result<Option<R>, Frame> {
    match db.with_entity(key, |e| e.as_list().map(f)) {
        None => Ok(None),
        Some(Ok(r)) => Ok(Some(r)),
        Some(Err(wrong)) => Err(Frame::error(wrong.to_string())),
    }
}

fn with_list_mut<R>(
    db: &Arc<Database>,
    key: &str,
    f: impl FnOnce(&mut QuickList) -> R,
) -> Result<Option<R>, Frame> {
    match db.with_entity_mut(key, |e| e.as_list_mut().map(f)) {
        None => Ok(None),
        Some(Ok(r)) => Ok(Some(r)),
        Some(Err(wrong)) => Err(Frame::error(wrong.to_string())),
    }
}

/// Converts a Redis index pair to a clamped `[start, stop)` window.
fn window(start: i64, stop: i64, len: usize) -> (usize, usize) {
    let len = len as i64;
    let s = if start < 0 { (len + start).max(0) } else { start.min(len) };
    let e = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if s > e || len == 0 {
        (0, 0)
    } else {
        (s as usize, (e + 1) as usize)
    }
}

fn push(db: &Arc<Database>, args: &[Bytes], front: bool, require_existing: bool, name: &str) -> Frame {
    let key = key_of(&args[0]);

    if require_existing {
        let exists = match with_list(db, &key, |_| ()) {
            Ok(opt) => opt.is_some(),
            Err(e) => return e,
        };
        if !exists {
            return Frame::Integer(0);
        }
    } else {
        // type check before creating anything
        if let Some(Err(wrong)) = db.with_entity(&key, |e| e.as_list().map(|_| ())) {
            return Frame::error(wrong.to_string());
        }
    }

    let len = db.upsert_entity_with(
        &key,
        || DataEntity::List(QuickList::new()),
        |entity| {
            // the type was checked above while the key lock was held
            let list = entity.as_list_mut().expect("checked list type");
            for val in &args[1..] {
                if front {
                    list.push_front(val.clone());
                } else {
                    list.push_back(val.clone());
                }
            }
            list.len()
        },
    );
    db.add_aof(aof_line(name, args));
    Frame::Integer(len as i64)
}

fn exec_lpush(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    push(db, args, true, false, "LPUSH")
}

fn exec_lpushx(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    push(db, args, true, true, "LPUSHX")
}

fn exec_rpush(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    push(db, args, false, false, "RPUSH")
}

fn exec_rpushx(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    push(db, args, false, true, "RPUSHX")
}

fn pop(db: &Arc<Database>, args: &[Bytes], front: bool, name: &str) -> Frame {
    let key = key_of(&args[0]);
    let popped = match with_list_mut(db, &key, |list| {
        if front {
            list.pop_front()
        } else {
            list.pop_back()
        }
    }) {
        Ok(opt) => opt.flatten(),
        Err(e) => return e,
    };
    match popped {
        Some(val) => {
            db.remove_if_empty_collection(&key);
            db.add_aof(aof_line(name, args));
            Frame::Bulk(val)
        }
        None => Frame::Null,
    }
}

fn exec_lpop(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    pop(db, args, true, "LPOP")
}

fn exec_rpop(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    pop(db, args, false, "RPOP")
}

fn exec_llen(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    match with_list(db, &key, |list| list.len()) {
        Ok(len) => Frame::Integer(len.unwrap_or(0) as i64),
        Err(e) => e,
    }
}

fn exec_lindex(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let index = match parse_i64(&args[1]) {
        Ok(n) => n,
        Err(e) => return e,
    };
    let result = with_list(db, &key, |list| {
        let len = list.len() as i64;
        let i = if index < 0 { len + index } else { index };
        if i < 0 || i >= len {
            None
        } else {
            list.get(i as usize).cloned()
        }
    });
    match result {
        Ok(Some(Some(val))) => Frame::Bulk(val),
        Ok(_) => Frame::Null,
        Err(e) => e,
    }
}

fn exec_lset(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let index = match parse_i64(&args[1]) {
        Ok(n) => n,
        Err(e) => return e,
    };
    let val = args[2].clone();
    let result = with_list_mut(db, &key, |list| {
        let len = list.len() as i64;
        let i = if index < 0 { len + index } else { index };
        if i < 0 || i >= len {
            false
        } else {
            list.set(i as usize, val)
        }
    });
    match result {
        Ok(None) => Frame::error("ERR no such key"),
        Ok(Some(false)) => Frame::error("ERR index out of range"),
        Ok(Some(true)) => {
            db.add_aof(aof_line("LSET", args));
            Frame::ok()
        }
        Err(e) => e,
    }
}

fn exec_lrange(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let start = match parse_i64(&args[1]) {
        Ok(n) => n,
        Err(e) => return e,
    };
    let stop = match parse_i64(&args[2]) {
        Ok(n) => n,
        Err(e) => return e,
    };
    let result = with_list(db, &key, |list| {
        let (s, e) = window(start, stop, list.len());
        list.range(s, e)
    });
    match result {
        Ok(Some(vals)) => Frame::Array(vals.into_iter().map(Frame::Bulk).collect()),
        Ok(None) => Frame::Array(Vec::new()),
        Err(e) => e,
    }
}

fn exec_lrem(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let count = match parse_i64(&args[1]) {
        Ok(n) => n,
        Err(e) => return e,
    };
    let val = args[2].clone();
    let removed = match with_list_mut(db, &key, |list| list.remove_occurrences(count, &val)) {
        Ok(opt) => opt.unwrap_or(0),
        Err(e) => return e,
    };
    if removed > 0 {
        db.remove_if_empty_collection(&key);
        db.add_aof(aof_line("LREM", args));
    }
    Frame::Integer(removed as i64)
}
