//! Set commands, including the inter/union/diff calculations and their
//! STORE variants.

use std::sync::Arc;

use ahash::AHashSet;
use bytes::Bytes;

use super::{
    aof_line, key_of, parse_i64, read_all_keys, read_first_key, rollback_set_members,
    write_first_key, write_first_read_rest,
};
use crate::db::Database;
use crate::entity::DataEntity;
use crate::registry::{register, Table, UndoFn, FLAG_READ_ONLY, FLAG_WRITE};
use cinder_protocol::{CmdLine, Frame};

pub fn register_all(table: &mut Table) {
    register(table, "sadd", exec_sadd, Some(write_first_key), Some(undo_members as UndoFn), -3, FLAG_WRITE);
    register(table, "srem", exec_srem, Some(write_first_key), Some(undo_members as UndoFn), -3, FLAG_WRITE);
    register(table, "sismember", exec_sismember, Some(read_first_key), None, 3, FLAG_READ_ONLY);
    register(table, "smembers", exec_smembers, Some(read_first_key), None, 2, FLAG_READ_ONLY);
    register(table, "scard", exec_scard, Some(read_first_key), None, 2, FLAG_READ_ONLY);
    register(table, "spop", exec_spop, Some(write_first_key), None, -2, FLAG_WRITE);
    register(table, "sinter", exec_sinter, Some(read_all_keys), None, -2, FLAG_READ_ONLY);
    register(table, "sinterstore", exec_sinterstore, Some(write_first_read_rest), Some(undo_store as UndoFn), -3, FLAG_WRITE);
    register(table, "sunion", exec_sunion, Some(read_all_keys), None, -2, FLAG_READ_ONLY);
    register(table, "sunionstore", exec_sunionstore, Some(write_first_read_rest), Some(undo_store as UndoFn), -3, FLAG_WRITE);
    register(table, "sdiff", exec_sdiff, Some(read_all_keys), None, -2, FLAG_READ_ONLY);
    register(table, "sdiffstore", exec_sdiffstore, Some(write_first_read_rest), Some(undo_store as UndoFn), -3, FLAG_WRITE);
}

fn undo_members(db: &Arc<Database>, args: &[Bytes]) -> Vec<CmdLine> {
    let key = key_of(&args[0]);
    let members: Vec<String> = args[1..].iter().map(key_of).collect();
    rollback_set_members(db, &key, &members)
}

fn undo_store(db: &Arc<Database>, args: &[Bytes]) -> Vec<CmdLine> {
    super::rollback_given_keys(db, &[key_of(&args[0])])
}

fn read_set(db: &Arc<Database>, key: &str) -> Result<Option<AHashSet<String>>, Frame> {
    match db.with_entity(key, |e| e.as_set().map(|s| s.clone())) {
        None => Ok(None),
        Some(Ok(s)) => Ok(Some(s)),
        Some(Err(wrong)) => Err(Frame::error(wrong.to_string())),
    }
}

fn ensure_set(db: &Arc<Database>, key: &str) -> Result<(), Frame> {
    match db.with_entity(key, |e| e.as_set().map(|_| ())) {
        Some(Err(wrong)) => Err(Frame::error(wrong.to_string())),
        _ => Ok(()),
    }
}

fn members_reply(set: impl IntoIterator<Item = String>) -> Frame {
    Frame::Array(
        set.into_iter()
            .map(|m| Frame::bulk(m.into_bytes()))
            .collect(),
    )
}

fn exec_sadd(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    if let Err(e) = ensure_set(db, &key) {
        return e;
    }
    let added = db.upsert_entity_with(
        &key,
        || DataEntity::Set(AHashSet::new()),
        |entity| {
            let set = entity.as_set_mut().expect("checked set type");
            args[1..]
                .iter()
                .filter(|m| set.insert(key_of(m)))
                .count()
        },
    );
    if added > 0 {
        db.add_aof(aof_line("SADD", args));
    }
    Frame::Integer(added as i64)
}

fn exec_srem(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let removed = match db.with_entity_mut(&key, |e| {
        e.as_set_mut()
            .map(|set| args[1..].iter().filter(|m| set.remove(&key_of(m))).count())
    }) {
        None => 0,
        Some(Ok(n)) => n,
        Some(Err(wrong)) => return Frame::error(wrong.to_string()),
    };
    if removed > 0 {
        db.remove_if_empty_collection(&key);
        db.add_aof(aof_line("SREM", args));
    }
    Frame::Integer(removed as i64)
}

fn exec_sismember(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let member = key_of(&args[1]);
    match db.with_entity(&key, |e| e.as_set().map(|s| s.contains(&member))) {
        None => Frame::Integer(0),
        Some(Ok(found)) => Frame::Integer(i64::from(found)),
        Some(Err(wrong)) => Frame::error(wrong.to_string()),
    }
}

fn exec_smembers(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    match read_set(db, &key) {
        Ok(Some(set)) => members_reply(set),
        Ok(None) => Frame::Array(Vec::new()),
        Err(e) => e,
    }
}

fn exec_scard(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    match db.with_entity(&key, |e| e.as_set().map(|s| s.len())) {
        None => Frame::Integer(0),
        Some(Ok(len)) => Frame::Integer(len as i64),
        Some(Err(wrong)) => Frame::error(wrong.to_string()),
    }
}

// SPOP key [count]
fn exec_spop(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let count = if args.len() > 1 {
        match parse_i64(&args[1]) {
            Ok(n) if n >= 0 => Some(n as usize),
            Ok(_) => return Frame::error("ERR value is out of range, must be positive"),
            Err(e) => return e,
        }
    } else {
        None
    };

    let popped = match db.with_entity_mut(&key, |e| {
        e.as_set_mut().map(|set| {
            let take = count.unwrap_or(1).min(set.len());
            // arbitrary iteration order doubles as the random pick
            let victims: Vec<String> = set.iter().take(take).cloned().collect();
            for v in &victims {
                set.remove(v);
            }
            victims
        })
    }) {
        None => Vec::new(),
        Some(Ok(v)) => v,
        Some(Err(wrong)) => return Frame::error(wrong.to_string()),
    };

    if !popped.is_empty() {
        db.remove_if_empty_collection(&key);
        // log the exact members removed, not the random request
        let mut line = cinder_protocol::cmdline(["SREM", key.as_str()]);
        line.extend(popped.iter().map(|m| Bytes::copy_from_slice(m.as_bytes())));
        db.add_aof(line);
    }

    match count {
        None => match popped.into_iter().next() {
            Some(m) => Frame::bulk(m.into_bytes()),
            None => Frame::Null,
        },
        Some(_) => members_reply(popped),
    }
}

fn gather(db: &Arc<Database>, args: &[Bytes]) -> Result<Vec<AHashSet<String>>, Frame> {
    args.iter()
        .map(|arg| Ok(read_set(db, &key_of(arg))?.unwrap_or_default()))
        .collect()
}

fn inter(sets: Vec<AHashSet<String>>) -> AHashSet<String> {
    let mut iter = sets.into_iter();
    let Some(first) = iter.next() else {
        return AHashSet::new();
    };
    iter.fold(first, |acc, s| acc.intersection(&s).cloned().collect())
}

fn union(sets: Vec<AHashSet<String>>) -> AHashSet<String> {
    sets.into_iter().flatten().collect()
}

fn diff(sets: Vec<AHashSet<String>>) -> AHashSet<String> {
    let mut iter = sets.into_iter();
    let Some(first) = iter.next() else {
        return AHashSet::new();
    };
    iter.fold(first, |acc, s| acc.difference(&s).cloned().collect())
}

fn exec_sinter(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    match gather(db, args) {
        Ok(sets) => members_reply(inter(sets)),
        Err(e) => e,
    }
}

fn exec_sunion(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    match gather(db, args) {
        Ok(sets) => members_reply(union(sets)),
        Err(e) => e,
    }
}

fn exec_sdiff(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    match gather(db, args) {
        Ok(sets) => members_reply(diff(sets)),
        Err(e) => e,
    }
}

fn store_result(db: &Arc<Database>, dest_arg: &Bytes, result: AHashSet<String>, args: &[Bytes], name: &str) -> Frame {
    let dest = key_of(dest_arg);
    let len = result.len();
    if result.is_empty() {
        db.remove(&dest);
    } else {
        db.put_entity(&dest, DataEntity::Set(result));
        db.persist(&dest);
    }
    db.add_aof(aof_line(name, args));
    Frame::Integer(len as i64)
}

fn exec_sinterstore(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    match gather(db, &args[1..]) {
        Ok(sets) => store_result(db, &args[0], inter(sets), args, "SINTERSTORE"),
        Err(e) => e,
    }
}

fn exec_sunionstore(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    match gather(db, &args[1..]) {
        Ok(sets) => store_result(db, &args[0], union(sets), args, "SUNIONSTORE"),
        Err(e) => e,
    }
}

fn exec_sdiffstore(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    match gather(db, &args[1..]) {
        Ok(sets) => store_result(db, &args[0], diff(sets), args, "SDIFFSTORE"),
        Err(e) => e,
    }
}
