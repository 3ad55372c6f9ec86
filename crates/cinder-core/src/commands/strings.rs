//! String commands.

use std::sync::Arc;

use bytes::Bytes;

use super::{
    aof_line, key_of, parse_f64, parse_i64, read_all_keys, read_first_key, rollback_first_key,
    rollback_given_keys, write_even_keys, write_first_key,
};
use crate::db::Database;
use crate::entity::{format_float, DataEntity};
use crate::marshal::expire_at_cmd;
use crate::registry::{register, Table, UndoFn, FLAG_READ_ONLY, FLAG_WRITE};
use crate::timewheel::now_unix_ms;
use cinder_protocol::Frame;

pub fn register_all(table: &mut Table) {
    register(table, "set", exec_set, Some(write_first_key), Some(rollback_first_key as UndoFn), -3, FLAG_WRITE);
    register(table, "setnx", exec_setnx, Some(write_first_key), Some(rollback_first_key as UndoFn), 3, FLAG_WRITE);
    register(table, "setex", exec_setex, Some(write_first_key), Some(rollback_first_key as UndoFn), 4, FLAG_WRITE);
    register(table, "psetex", exec_psetex, Some(write_first_key), Some(rollback_first_key as UndoFn), 4, FLAG_WRITE);
    register(table, "get", exec_get, Some(read_first_key), None, 2, FLAG_READ_ONLY);
    register(table, "getset", exec_getset, Some(write_first_key), Some(rollback_first_key as UndoFn), 3, FLAG_WRITE);
    register(table, "mget", exec_mget, Some(read_all_keys), None, -2, FLAG_READ_ONLY);
    register(table, "mset", exec_mset, Some(write_even_keys), Some(undo_mset), -3, FLAG_WRITE);
    register(table, "msetnx", exec_msetnx, Some(write_even_keys), Some(undo_mset), -3, FLAG_WRITE);
    register(table, "incr", exec_incr, Some(write_first_key), Some(rollback_first_key as UndoFn), 2, FLAG_WRITE);
    register(table, "incrby", exec_incrby, Some(write_first_key), Some(rollback_first_key as UndoFn), 3, FLAG_WRITE);
    register(table, "incrbyfloat", exec_incrbyfloat, Some(write_first_key), Some(rollback_first_key as UndoFn), 3, FLAG_WRITE);
    register(table, "decr", exec_decr, Some(write_first_key), Some(rollback_first_key as UndoFn), 2, FLAG_WRITE);
    register(table, "decrby", exec_decrby, Some(write_first_key), Some(rollback_first_key as UndoFn), 3, FLAG_WRITE);
    register(table, "strlen", exec_strlen, Some(read_first_key), None, 2, FLAG_READ_ONLY);
    register(table, "append", exec_append, Some(write_first_key), Some(rollback_first_key as UndoFn), 3, FLAG_WRITE);
}

fn undo_mset(db: &Arc<Database>, args: &[Bytes]) -> Vec<cinder_protocol::CmdLine> {
    let keys: Vec<String> = args.iter().step_by(2).map(key_of).collect();
    rollback_given_keys(db, &keys)
}

/// Reads the string value under `key`, or the wrong-type error.
fn get_string(db: &Arc<Database>, key: &str) -> Result<Option<Bytes>, Frame> {
    match db.with_entity(key, |e| e.as_bytes().map(|b| b.clone())) {
        None => Ok(None),
        Some(Ok(b)) => Ok(Some(b)),
        Some(Err(wrong)) => Err(Frame::error(wrong.to_string())),
    }
}

// SET key value [EX seconds | PX millis] [NX | XX]
fn exec_set(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let value = args[1].clone();

    let mut expire_ms: Option<u64> = None;
    let mut nx = false;
    let mut xx = false;
    let mut i = 2;
    while i < args.len() {
        let opt = String::from_utf8_lossy(&args[i]).to_ascii_uppercase();
        match opt.as_str() {
            "NX" if !xx => nx = true,
            "XX" if !nx => xx = true,
            "EX" | "PX" if expire_ms.is_none() && i + 1 < args.len() => {
                let n = match parse_i64(&args[i + 1]) {
                    Ok(n) if n > 0 => n as u64,
                    Ok(_) => return Frame::error("ERR invalid expire time in set"),
                    Err(e) => return e,
                };
                expire_ms = Some(if opt == "EX" { n * 1000 } else { n });
                i += 1;
            }
            _ => return Frame::error("ERR syntax error"),
        }
        i += 1;
    }

    // reject SET on a key of a different type only when a value exists;
    // plain SET always overwrites, matching string semantics
    let stored = if nx {
        db.put_if_absent(&key, DataEntity::Bytes(value))
    } else if xx {
        db.put_if_exists(&key, DataEntity::Bytes(value))
    } else {
        db.put_entity(&key, DataEntity::Bytes(value));
        1
    };

    if stored == 0 {
        return Frame::Null;
    }

    match expire_ms {
        Some(ms) => {
            let deadline = now_unix_ms() + ms;
            db.expire(&key, deadline);
            // persist the absolute form so replays are idempotent
            db.add_aof(aof_line("SET", &args[..2]));
            db.add_aof(expire_at_cmd(&key, deadline));
        }
        None => {
            db.persist(&key);
            db.add_aof(aof_line("SET", args));
        }
    }
    Frame::ok()
}

fn exec_setnx(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let stored = db.put_if_absent(&key, DataEntity::Bytes(args[1].clone()));
    if stored == 1 {
        db.add_aof(aof_line("SETNX", args));
    }
    Frame::Integer(stored as i64)
}

fn set_with_ttl(db: &Arc<Database>, args: &[Bytes], ms_per_unit: u64) -> Frame {
    let key = key_of(&args[0]);
    let ttl = match parse_i64(&args[1]) {
        Ok(n) if n > 0 => n as u64 * ms_per_unit,
        Ok(_) => return Frame::error("ERR invalid expire time"),
        Err(e) => return e,
    };
    db.put_entity(&key, DataEntity::Bytes(args[2].clone()));
    let deadline = now_unix_ms() + ttl;
    db.expire(&key, deadline);
    db.add_aof(aof_line("SET", &[args[0].clone(), args[2].clone()]));
    db.add_aof(expire_at_cmd(&key, deadline));
    Frame::ok()
}

// SETEX key seconds value
fn exec_setex(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    set_with_ttl(db, args, 1000)
}

// PSETEX key millis value
fn exec_psetex(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    set_with_ttl(db, args, 1)
}

fn exec_get(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    match get_string(db, &key) {
        Ok(Some(b)) => Frame::Bulk(b),
        Ok(None) => Frame::Null,
        Err(e) => e,
    }
}

fn exec_getset(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let old = match get_string(db, &key) {
        Ok(v) => v,
        Err(e) => return e,
    };
    db.put_entity(&key, DataEntity::Bytes(args[1].clone()));
    db.persist(&key);
    db.add_aof(aof_line("SET", args));
    match old {
        Some(b) => Frame::Bulk(b),
        None => Frame::Null,
    }
}

fn exec_mget(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let out = args
        .iter()
        .map(|arg| {
            let key = key_of(arg);
            match get_string(db, &key) {
                Ok(Some(b)) => Frame::Bulk(b),
                // wrong-typed keys read as null in MGET
                _ => Frame::Null,
            }
        })
        .collect();
    Frame::Array(out)
}

fn exec_mset(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    if args.len() % 2 != 0 {
        return Frame::arg_num_error("mset");
    }
    for pair in args.chunks(2) {
        let key = key_of(&pair[0]);
        db.put_entity(&key, DataEntity::Bytes(pair[1].clone()));
    }
    db.add_aof(aof_line("MSET", args));
    Frame::ok()
}

fn exec_msetnx(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    if args.len() % 2 != 0 {
        return Frame::arg_num_error("msetnx");
    }
    let any_exists = args
        .chunks(2)
        .any(|pair| db.contains_key(&key_of(&pair[0])));
    if any_exists {
        return Frame::Integer(0);
    }
    for pair in args.chunks(2) {
        db.put_entity(&key_of(&pair[0]), DataEntity::Bytes(pair[1].clone()));
    }
    db.add_aof(aof_line("MSETNX", args));
    Frame::Integer(1)
}

fn incr_by(db: &Arc<Database>, key_arg: &Bytes, delta: i64, aof: cinder_protocol::CmdLine) -> Frame {
    let key = key_of(key_arg);
    let current = match get_string(db, &key) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let current_num: i64 = match current {
        None => 0,
        Some(b) => match std::str::from_utf8(&b).ok().and_then(|s| s.parse().ok()) {
            Some(n) => n,
            None => return Frame::error("ERR value is not an integer or out of range"),
        },
    };
    let Some(next) = current_num.checked_add(delta) else {
        return Frame::error("ERR increment or decrement would overflow");
    };
    db.put_entity(&key, DataEntity::Bytes(Bytes::from(next.to_string())));
    db.add_aof(aof);
    Frame::Integer(next)
}

fn exec_incr(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    incr_by(db, &args[0], 1, aof_line("INCR", args))
}

fn exec_incrby(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    match parse_i64(&args[1]) {
        Ok(delta) => incr_by(db, &args[0], delta, aof_line("INCRBY", args)),
        Err(e) => e,
    }
}

fn exec_decr(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    incr_by(db, &args[0], -1, aof_line("DECR", args))
}

fn exec_decrby(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    match parse_i64(&args[1]) {
        Ok(delta) => incr_by(db, &args[0], delta.wrapping_neg(), aof_line("DECRBY", args)),
        Err(e) => e,
    }
}

fn exec_incrbyfloat(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let delta = match parse_f64(&args[1]) {
        Ok(d) => d,
        Err(e) => return e,
    };
    let current = match get_string(db, &key) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let current_num: f64 = match current {
        None => 0.0,
        Some(b) => match std::str::from_utf8(&b).ok().and_then(|s| s.parse().ok()) {
            Some(n) => n,
            None => return Frame::error("ERR value is not a valid float"),
        },
    };
    let next = current_num + delta;
    if next.is_nan() || next.is_infinite() {
        return Frame::error("ERR increment would produce NaN or Infinity");
    }
    let rendered = format_float(next);
    db.put_entity(&key, DataEntity::Bytes(Bytes::from(rendered.clone())));
    db.add_aof(aof_line("INCRBYFLOAT", args));
    Frame::bulk(rendered)
}

fn exec_strlen(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    match get_string(db, &key) {
        Ok(Some(b)) => Frame::Integer(b.len() as i64),
        Ok(None) => Frame::Integer(0),
        Err(e) => e,
    }
}

fn exec_append(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let current = match get_string(db, &key) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut joined = Vec::with_capacity(current.as_ref().map(|b| b.len()).unwrap_or(0) + args[1].len());
    if let Some(b) = &current {
        joined.extend_from_slice(b);
    }
    joined.extend_from_slice(&args[1]);
    let len = joined.len();
    db.put_entity(&key, DataEntity::Bytes(Bytes::from(joined)));
    db.add_aof(aof_line("APPEND", args));
    Frame::Integer(len as i64)
}

#[cfg(test)]
mod tests {
    use super::super::test_db;
    use crate::registry::exec_normal;
    use cinder_protocol::{cmdline, Frame};

    #[test]
    fn set_then_get() {
        let db = test_db();
        assert_eq!(exec_normal(&db, &cmdline(["SET", "k", "v"])), Frame::ok());
        assert_eq!(
            exec_normal(&db, &cmdline(["GET", "k"])),
            Frame::bulk(&b"v"[..])
        );
    }

    #[test]
    fn get_missing_is_null() {
        let db = test_db();
        assert_eq!(exec_normal(&db, &cmdline(["GET", "nope"])), Frame::Null);
    }

    #[test]
    fn set_nx_respects_existing() {
        let db = test_db();
        exec_normal(&db, &cmdline(["SET", "k", "v1"]));
        assert_eq!(
            exec_normal(&db, &cmdline(["SET", "k", "v2", "NX"])),
            Frame::Null
        );
        assert_eq!(
            exec_normal(&db, &cmdline(["GET", "k"])),
            Frame::bulk(&b"v1"[..])
        );
    }

    #[test]
    fn set_xx_requires_existing() {
        let db = test_db();
        assert_eq!(
            exec_normal(&db, &cmdline(["SET", "k", "v", "XX"])),
            Frame::Null
        );
        exec_normal(&db, &cmdline(["SET", "k", "v1"]));
        assert_eq!(
            exec_normal(&db, &cmdline(["SET", "k", "v2", "XX"])),
            Frame::ok()
        );
    }

    #[test]
    fn set_with_ex_gives_ttl() {
        let db = test_db();
        exec_normal(&db, &cmdline(["SET", "k", "v", "EX", "1000"]));
        match exec_normal(&db, &cmdline(["TTL", "k"])) {
            Frame::Integer(n) => assert!(n > 0 && n <= 1000),
            other => panic!("expected integer, got {other:?}"),
        }
    }

    #[test]
    fn plain_set_clears_ttl() {
        let db = test_db();
        exec_normal(&db, &cmdline(["SET", "k", "v", "EX", "1000"]));
        exec_normal(&db, &cmdline(["SET", "k", "v2"]));
        assert_eq!(exec_normal(&db, &cmdline(["TTL", "k"])), Frame::Integer(-1));
    }

    #[test]
    fn set_bad_option_is_syntax_error() {
        let db = test_db();
        let reply = exec_normal(&db, &cmdline(["SET", "k", "v", "BOGUS"]));
        assert!(matches!(reply, Frame::Error(msg) if msg.contains("syntax")));
    }

    #[test]
    fn setnx_only_first_wins() {
        let db = test_db();
        assert_eq!(
            exec_normal(&db, &cmdline(["SETNX", "k", "a"])),
            Frame::Integer(1)
        );
        assert_eq!(
            exec_normal(&db, &cmdline(["SETNX", "k", "b"])),
            Frame::Integer(0)
        );
    }

    #[test]
    fn getset_returns_old() {
        let db = test_db();
        assert_eq!(
            exec_normal(&db, &cmdline(["GETSET", "k", "new"])),
            Frame::Null
        );
        assert_eq!(
            exec_normal(&db, &cmdline(["GETSET", "k", "newer"])),
            Frame::bulk(&b"new"[..])
        );
    }

    #[test]
    fn wrong_type_get() {
        let db = test_db();
        exec_normal(&db, &cmdline(["LPUSH", "l", "x"]));
        let reply = exec_normal(&db, &cmdline(["GET", "l"]));
        assert!(matches!(reply, Frame::Error(msg) if msg.starts_with("WRONGTYPE")));
    }

    #[test]
    fn incr_sequence() {
        let db = test_db();
        assert_eq!(exec_normal(&db, &cmdline(["INCR", "n"])), Frame::Integer(1));
        assert_eq!(exec_normal(&db, &cmdline(["INCR", "n"])), Frame::Integer(2));
        assert_eq!(
            exec_normal(&db, &cmdline(["INCRBY", "n", "10"])),
            Frame::Integer(12)
        );
        assert_eq!(exec_normal(&db, &cmdline(["DECR", "n"])), Frame::Integer(11));
        assert_eq!(
            exec_normal(&db, &cmdline(["DECRBY", "n", "5"])),
            Frame::Integer(6)
        );
    }

    #[test]
    fn incr_non_numeric_errors() {
        let db = test_db();
        exec_normal(&db, &cmdline(["SET", "k", "abc"]));
        let reply = exec_normal(&db, &cmdline(["INCR", "k"]));
        assert!(matches!(reply, Frame::Error(msg) if msg.contains("not an integer")));
    }

    #[test]
    fn incr_overflow_errors() {
        let db = test_db();
        exec_normal(&db, &cmdline(["SET", "k", i64::MAX.to_string().as_str()]));
        let reply = exec_normal(&db, &cmdline(["INCR", "k"]));
        assert!(matches!(reply, Frame::Error(msg) if msg.contains("overflow")));
    }

    #[test]
    fn incrbyfloat_formats() {
        let db = test_db();
        assert_eq!(
            exec_normal(&db, &cmdline(["INCRBYFLOAT", "f", "1.5"])),
            Frame::bulk(&b"1.5"[..])
        );
        assert_eq!(
            exec_normal(&db, &cmdline(["INCRBYFLOAT", "f", "1.5"])),
            Frame::bulk(&b"3"[..])
        );
    }

    #[test]
    fn mset_mget() {
        let db = test_db();
        assert_eq!(
            exec_normal(&db, &cmdline(["MSET", "a", "1", "b", "2"])),
            Frame::ok()
        );
        assert_eq!(
            exec_normal(&db, &cmdline(["MGET", "a", "b", "c"])),
            Frame::Array(vec![
                Frame::bulk(&b"1"[..]),
                Frame::bulk(&b"2"[..]),
                Frame::Null
            ])
        );
    }

    #[test]
    fn msetnx_all_or_nothing() {
        let db = test_db();
        exec_normal(&db, &cmdline(["SET", "b", "old"]));
        assert_eq!(
            exec_normal(&db, &cmdline(["MSETNX", "a", "1", "b", "2"])),
            Frame::Integer(0)
        );
        assert_eq!(exec_normal(&db, &cmdline(["GET", "a"])), Frame::Null);
    }

    #[test]
    fn strlen_and_append() {
        let db = test_db();
        assert_eq!(exec_normal(&db, &cmdline(["STRLEN", "k"])), Frame::Integer(0));
        assert_eq!(
            exec_normal(&db, &cmdline(["APPEND", "k", "abc"])),
            Frame::Integer(3)
        );
        assert_eq!(
            exec_normal(&db, &cmdline(["APPEND", "k", "de"])),
            Frame::Integer(5)
        );
        assert_eq!(exec_normal(&db, &cmdline(["STRLEN", "k"])), Frame::Integer(5));
    }

    #[test]
    fn setex_sets_value_and_ttl() {
        let db = test_db();
        assert_eq!(
            exec_normal(&db, &cmdline(["SETEX", "k", "100", "v"])),
            Frame::ok()
        );
        assert_eq!(
            exec_normal(&db, &cmdline(["GET", "k"])),
            Frame::bulk(&b"v"[..])
        );
        match exec_normal(&db, &cmdline(["TTL", "k"])) {
            Frame::Integer(n) => assert!(n > 0 && n <= 100),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn setex_rejects_non_positive_ttl() {
        let db = test_db();
        let reply = exec_normal(&db, &cmdline(["SETEX", "k", "0", "v"]));
        assert!(reply.is_error());
    }
}
