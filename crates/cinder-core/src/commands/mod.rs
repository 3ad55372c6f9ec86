//! Command leaves.
//!
//! Each module registers its descriptors into the shared table and
//! implements the executors against the database contract: a command
//! may touch exactly the keys its `prepare` names, and every mutation
//! it applies is mirrored to the AOF sink.

pub mod geo;
pub mod hashes;
pub mod keys;
pub mod lists;
pub mod sets;
pub mod strings;
pub mod zsets;

use std::sync::Arc;

use bytes::Bytes;

use crate::db::Database;
use crate::marshal::{entity_to_cmd, expire_at_cmd};
use cinder_protocol::{CmdLine, Frame};

// ---------------------------------------------------------------
// argument helpers
// ---------------------------------------------------------------

/// Converts a binary argument to the string key form the dicts use.
pub(crate) fn key_of(arg: &Bytes) -> String {
    String::from_utf8_lossy(arg).into_owned()
}

/// Parses an integer argument, or the canonical error reply.
pub(crate) fn parse_i64(arg: &Bytes) -> Result<i64, Frame> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Frame::error("ERR value is not an integer or out of range"))
}

/// Parses a float argument, or the canonical error reply.
pub(crate) fn parse_f64(arg: &Bytes) -> Result<f64, Frame> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Frame::error("ERR value is not a valid float"))
}

/// Builds the command line this execution should append to the AOF.
pub(crate) fn aof_line(name: &str, args: &[Bytes]) -> CmdLine {
    let mut line = Vec::with_capacity(args.len() + 1);
    line.push(Bytes::copy_from_slice(name.as_bytes()));
    line.extend(args.iter().cloned());
    line
}

// ---------------------------------------------------------------
// prepare functions
// ---------------------------------------------------------------

/// The first argument is a read key: GET k, TTL k, ...
pub(crate) fn read_first_key(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), vec![key_of(&args[0])])
}

/// Every argument is a read key: MGET k1 k2, SINTER s1 s2, ...
pub(crate) fn read_all_keys(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), args.iter().map(key_of).collect())
}

/// The first argument is a write key: SET k v, LPUSH k x, ...
pub(crate) fn write_first_key(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (vec![key_of(&args[0])], Vec::new())
}

/// Every argument is a write key: DEL k1 k2 ...
pub(crate) fn write_all_keys(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (args.iter().map(key_of).collect(), Vec::new())
}

/// First argument written, the rest read: SINTERSTORE dst s1 s2 ...
pub(crate) fn write_first_read_rest(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (
        vec![key_of(&args[0])],
        args[1..].iter().map(key_of).collect(),
    )
}

/// Even-positioned arguments are write keys: MSET k1 v1 k2 v2 ...
pub(crate) fn write_even_keys(args: &[Bytes]) -> (Vec<String>, Vec<String>) {
    (
        args.iter().step_by(2).map(key_of).collect(),
        Vec::new(),
    )
}

// ---------------------------------------------------------------
// rollback helpers
// ---------------------------------------------------------------

/// Undo for commands whose only effect is replacing/creating/removing
/// whole keys: snapshot each key as `DEL` + rebuild + deadline.
pub(crate) fn rollback_given_keys(db: &Arc<Database>, keys: &[String]) -> Vec<CmdLine> {
    let mut undo = Vec::new();
    for key in keys {
        match db.entity_snapshot(key) {
            None => undo.push(cinder_protocol::cmdline(["DEL", key.as_str()])),
            Some(entity) => {
                undo.push(cinder_protocol::cmdline(["DEL", key.as_str()]));
                if let Some(rebuild) = entity_to_cmd(key, &entity) {
                    undo.push(rebuild);
                }
                if let Some(deadline) = db.deadline_ms(key) {
                    undo.push(expire_at_cmd(key, deadline));
                }
            }
        }
    }
    undo
}

/// Undo for single-key whole-value commands.
pub(crate) fn rollback_first_key(db: &Arc<Database>, args: &[Bytes]) -> Vec<CmdLine> {
    rollback_given_keys(db, &[key_of(&args[0])])
}

/// Undo for set-membership changes: re-add what was present, remove
/// what wasn't.
pub(crate) fn rollback_set_members(db: &Arc<Database>, key: &str, members: &[String]) -> Vec<CmdLine> {
    let snapshot = db.with_entity(key, |e| e.as_set().map(|s| s.clone()));
    match snapshot {
        None => vec![cinder_protocol::cmdline(["DEL", key])],
        Some(Err(_)) => Vec::new(),
        Some(Ok(set)) => members
            .iter()
            .map(|member| {
                if set.contains(member) {
                    cinder_protocol::cmdline(["SADD", key, member.as_str()])
                } else {
                    cinder_protocol::cmdline(["SREM", key, member.as_str()])
                }
            })
            .collect(),
    }
}

/// Undo for hash-field changes: restore old values, delete new fields.
pub(crate) fn rollback_hash_fields(db: &Arc<Database>, key: &str, fields: &[String]) -> Vec<CmdLine> {
    let snapshot = db.with_entity(key, |e| e.as_hash().map(|h| h.clone()));
    match snapshot {
        None => vec![cinder_protocol::cmdline(["DEL", key])],
        Some(Err(_)) => Vec::new(),
        Some(Ok(hash)) => fields
            .iter()
            .map(|field| match hash.get(field) {
                Some(old) => {
                    let mut line = cinder_protocol::cmdline(["HSET", key, field.as_str()]);
                    line.push(old.clone());
                    line
                }
                None => cinder_protocol::cmdline(["HDEL", key, field.as_str()]),
            })
            .collect(),
    }
}

/// Undo for sorted-set member changes: restore old scores, remove
/// members that were absent.
pub(crate) fn rollback_zset_members(db: &Arc<Database>, key: &str, members: &[String]) -> Vec<CmdLine> {
    let snapshot: Option<Result<Vec<(String, Option<f64>)>, _>> = db.with_entity(key, |e| {
        e.as_zset()
            .map(|z| members.iter().map(|m| (m.clone(), z.score(m))).collect())
    });
    match snapshot {
        None => vec![cinder_protocol::cmdline(["DEL", key])],
        Some(Err(_)) => Vec::new(),
        Some(Ok(scored)) => scored
            .into_iter()
            .map(|(member, score)| match score {
                Some(score) => cinder_protocol::cmdline([
                    "ZADD",
                    key,
                    crate::entity::format_float(score).as_str(),
                    member.as_str(),
                ]),
                None => cinder_protocol::cmdline(["ZREM", key, member.as_str()]),
            })
            .collect(),
    }
}

#[cfg(test)]
pub(crate) fn test_db() -> Arc<Database> {
    use crate::timewheel::TimeWheel;
    use std::time::Duration;
    let wheel = Arc::new(TimeWheel::new(Duration::from_millis(100), 64));
    Database::new(0, wheel)
}
