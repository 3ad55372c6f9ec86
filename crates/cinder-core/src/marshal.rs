//! Rebuilding command lines from live entities.
//!
//! Given a key and its entity, produces the single minimal command that
//! recreates it (`SET` / `RPUSH` / `HSET` / `SADD` / `ZADD`), plus the
//! `PEXPIREAT` line for keys carrying a deadline. Used by the AOF
//! rewrite to emit a compact log, by transaction rollback to restore a
//! key's prior state, and by slot migration to ship keys to their new
//! owner.

use bytes::Bytes;

use crate::entity::{format_float, DataEntity};
use cinder_protocol::CmdLine;

fn arg(s: impl AsRef<[u8]>) -> Bytes {
    Bytes::copy_from_slice(s.as_ref())
}

/// The minimal command line that reconstructs `entity` under `key`,
/// or `None` for an empty collection (which should not exist at all).
pub fn entity_to_cmd(key: &str, entity: &DataEntity) -> Option<CmdLine> {
    if entity.is_empty_collection() {
        return None;
    }
    let line = match entity {
        DataEntity::Bytes(b) => vec![arg("SET"), arg(key), b.clone()],
        DataEntity::List(list) => {
            let mut line = Vec::with_capacity(2 + list.len());
            line.push(arg("RPUSH"));
            line.push(arg(key));
            line.extend(list.iter().cloned());
            line
        }
        DataEntity::Hash(hash) => {
            let mut line = Vec::with_capacity(2 + hash.len() * 2);
            line.push(arg("HSET"));
            line.push(arg(key));
            for (field, value) in hash {
                line.push(arg(field));
                line.push(value.clone());
            }
            line
        }
        DataEntity::Set(set) => {
            let mut line = Vec::with_capacity(2 + set.len());
            line.push(arg("SADD"));
            line.push(arg(key));
            line.extend(set.iter().map(arg));
            line
        }
        DataEntity::SortedSet(zset) => {
            let mut line = Vec::with_capacity(2 + zset.len() * 2);
            line.push(arg("ZADD"));
            line.push(arg(key));
            for (member, score) in zset.iter() {
                line.push(arg(format_float(score)));
                line.push(arg(member));
            }
            line
        }
    };
    Some(line)
}

/// The `PEXPIREAT` line that restores a key's absolute deadline.
pub fn expire_at_cmd(key: &str, deadline_unix_ms: u64) -> CmdLine {
    vec![arg("PEXPIREAT"), arg(key), arg(deadline_unix_ms.to_string())]
}
