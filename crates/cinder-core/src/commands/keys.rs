//! Generic keyspace commands: existence, deletion, TTL management,
//! pattern listing, cursor scan, type inspection.

use std::sync::Arc;

use bytes::Bytes;

use super::{
    aof_line, key_of, parse_i64, read_all_keys, read_first_key, rollback_given_keys, write_all_keys,
    write_first_key,
};
use crate::db::Database;
use crate::marshal::expire_at_cmd;
use crate::registry::{register, Table, UndoFn, FLAG_READ_ONLY, FLAG_WRITE};
use crate::timewheel::now_unix_ms;
use cinder_protocol::{CmdLine, Frame};

pub fn register_all(table: &mut Table) {
    register(table, "del", exec_del, Some(write_all_keys), Some(undo_del as UndoFn), -2, FLAG_WRITE);
    register(table, "exists", exec_exists, Some(read_all_keys), None, -2, FLAG_READ_ONLY);
    register(table, "expire", exec_expire, Some(write_first_key), Some(undo_expire as UndoFn), 3, FLAG_WRITE);
    register(table, "expireat", exec_expireat, Some(write_first_key), Some(undo_expire as UndoFn), 3, FLAG_WRITE);
    register(table, "pexpire", exec_pexpire, Some(write_first_key), Some(undo_expire as UndoFn), 3, FLAG_WRITE);
    register(table, "pexpireat", exec_pexpireat, Some(write_first_key), Some(undo_expire as UndoFn), 3, FLAG_WRITE);
    register(table, "ttl", exec_ttl, Some(read_first_key), None, 2, FLAG_READ_ONLY);
    register(table, "pttl", exec_pttl, Some(read_first_key), None, 2, FLAG_READ_ONLY);
    register(table, "persist", exec_persist, Some(write_first_key), Some(undo_expire as UndoFn), 2, FLAG_WRITE);
    register(table, "type", exec_type, Some(read_first_key), None, 2, FLAG_READ_ONLY);
    register(table, "rename", exec_rename, Some(rename_prepare), Some(undo_rename as UndoFn), 3, FLAG_WRITE);
    register(table, "keys", exec_keys, None, None, 2, FLAG_READ_ONLY);
    register(table, "scan", exec_scan, None, None, -2, FLAG_READ_ONLY);
    register(table, "randomkey", exec_randomkey, None, None, 1, FLAG_READ_ONLY);
}

fn rename_prepare(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (vec![key_of(&args[0]), key_of(&args[1])], Vec::new())
}

fn undo_del(db: &Arc<Database>, args: &[Bytes]) -> Vec<CmdLine> {
    let keys: Vec<String> = args.iter().map(key_of).collect();
    rollback_given_keys(db, &keys)
}

fn undo_expire(db: &Arc<Database>, args: &[Bytes]) -> Vec<CmdLine> {
    let key = key_of(&args[0]);
    match db.deadline_ms(&key) {
        Some(deadline) => vec![expire_at_cmd(&key, deadline)],
        None => vec![cinder_protocol::cmdline(["PERSIST", key.as_str()])],
    }
}

fn undo_rename(db: &Arc<Database>, args: &[Bytes]) -> Vec<CmdLine> {
    let keys = vec![key_of(&args[0]), key_of(&args[1])];
    rollback_given_keys(db, &keys)
}

fn exec_del(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let keys: Vec<String> = args.iter().map(key_of).collect();
    let deleted = db.removes(&keys);
    if deleted > 0 {
        db.add_aof(aof_line("DEL", args));
    }
    Frame::Integer(deleted as i64)
}

fn exec_exists(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let count = args
        .iter()
        .filter(|arg| db.contains_key(&key_of(arg)))
        .count();
    Frame::Integer(count as i64)
}

fn set_deadline(db: &Arc<Database>, key_arg: &Bytes, deadline_ms: u64) -> Frame {
    let key = key_of(key_arg);
    if !db.contains_key(&key) {
        return Frame::Integer(0);
    }
    db.expire(&key, deadline_ms);
    db.add_aof(expire_at_cmd(&key, deadline_ms));
    Frame::Integer(1)
}

// EXPIRE key seconds
fn exec_expire(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    match parse_i64(&args[1]) {
        Ok(secs) => set_deadline(db, &args[0], now_unix_ms().saturating_add_signed(secs.saturating_mul(1000))),
        Err(e) => e,
    }
}

// EXPIREAT key unix-seconds
fn exec_expireat(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    match parse_i64(&args[1]) {
        Ok(at) => set_deadline(db, &args[0], (at.max(0) as u64).saturating_mul(1000)),
        Err(e) => e,
    }
}

// PEXPIRE key millis
fn exec_pexpire(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    match parse_i64(&args[1]) {
        Ok(ms) => set_deadline(db, &args[0], now_unix_ms().saturating_add_signed(ms)),
        Err(e) => e,
    }
}

// PEXPIREAT key unix-millis
fn exec_pexpireat(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    match parse_i64(&args[1]) {
        Ok(at) => set_deadline(db, &args[0], at.max(0) as u64),
        Err(e) => e,
    }
}

fn ttl_reply(db: &Arc<Database>, key_arg: &Bytes, in_ms: bool) -> Frame {
    let key = key_of(key_arg);
    if !db.contains_key(&key) {
        return Frame::Integer(-2);
    }
    match db.deadline_ms(&key) {
        None => Frame::Integer(-1),
        Some(deadline) => {
            let remaining = deadline.saturating_sub(now_unix_ms());
            if in_ms {
                Frame::Integer(remaining as i64)
            } else {
                Frame::Integer((remaining / 1000) as i64)
            }
        }
    }
}

fn exec_ttl(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    ttl_reply(db, &args[0], false)
}

fn exec_pttl(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    ttl_reply(db, &args[0], true)
}

fn exec_persist(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    if !db.contains_key(&key) || db.deadline_ms(&key).is_none() {
        return Frame::Integer(0);
    }
    db.persist(&key);
    db.add_aof(aof_line("PERSIST", args));
    Frame::Integer(1)
}

fn exec_type(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    match db.with_entity(&key, |e| e.type_name()) {
        Some(name) => Frame::Simple(name.into()),
        None => Frame::Simple("none".into()),
    }
}

fn exec_rename(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let src = key_of(&args[0]);
    let dst = key_of(&args[1]);
    let Some(entity) = db.entity_snapshot(&src) else {
        return Frame::error("ERR no such key");
    };
    let deadline = db.deadline_ms(&src);
    db.remove(&src);
    db.put_entity(&dst, entity);
    match deadline {
        Some(at) => db.expire(&dst, at),
        None => db.persist(&dst),
    }
    db.add_aof(aof_line("RENAME", args));
    Frame::ok()
}

fn exec_keys(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let pattern = crate::pattern::Pattern::compile(&key_of(&args[0]));
    let mut out = Vec::new();
    for key in db.keys() {
        if db.is_expired(&key) {
            continue;
        }
        if pattern.matches(&key) {
            out.push(Frame::bulk(key.into_bytes()));
        }
    }
    Frame::Array(out)
}

// SCAN cursor [MATCH pattern] [COUNT n]
fn exec_scan(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let cursor = match parse_i64(&args[0]) {
        Ok(n) if n >= 0 => n as usize,
        Ok(_) => return Frame::error("ERR invalid cursor"),
        Err(e) => return e,
    };
    let mut pattern = "*".to_string();
    let mut count = 10usize;
    let mut i = 1;
    while i < args.len() {
        let opt = String::from_utf8_lossy(&args[i]).to_ascii_uppercase();
        match opt.as_str() {
            "MATCH" if i + 1 < args.len() => {
                pattern = key_of(&args[i + 1]);
                i += 2;
            }
            "COUNT" if i + 1 < args.len() => {
                count = match parse_i64(&args[i + 1]) {
                    Ok(n) if n > 0 => n as usize,
                    _ => return Frame::error("ERR syntax error"),
                };
                i += 2;
            }
            _ => return Frame::error("ERR syntax error"),
        }
    }

    let (keys, next) = db.scan(cursor, count, &pattern);
    Frame::Array(vec![
        Frame::bulk(next.to_string()),
        Frame::Array(keys.into_iter().map(|k| Frame::bulk(k.into_bytes())).collect()),
    ])
}

fn exec_randomkey(db: &Arc<Database>, _args: &[Bytes]) -> Frame {
    if db.key_count() == 0 {
        return Frame::Null;
    }
    match db.random_keys(1).pop() {
        Some(key) => Frame::bulk(key.into_bytes()),
        None => Frame::Null,
    }
}
