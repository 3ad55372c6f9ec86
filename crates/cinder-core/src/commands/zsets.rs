//! Sorted-set commands backed by the span-tracking skiplist.

use std::sync::Arc;

use bytes::Bytes;

use super::{
    aof_line, key_of, parse_f64, parse_i64, read_first_key, rollback_zset_members, write_first_key,
};
use crate::db::Database;
use crate::entity::{format_float, DataEntity};
use crate::registry::{register, Table, UndoFn, FLAG_READ_ONLY, FLAG_WRITE};
use crate::sorted_set::{ScoreBound, SortedSet};
use cinder_protocol::{CmdLine, Frame};

pub fn register_all(table: &mut Table) {
    register(table, "zadd", exec_zadd, Some(write_first_key), Some(undo_zadd as UndoFn), -4, FLAG_WRITE);
    register(table, "zscore", exec_zscore, Some(read_first_key), None, 3, FLAG_READ_ONLY);
    register(table, "zincrby", exec_zincrby, Some(write_first_key), Some(undo_zincrby as UndoFn), 4, FLAG_WRITE);
    register(table, "zcard", exec_zcard, Some(read_first_key), None, 2, FLAG_READ_ONLY);
    register(table, "zrank", exec_zrank, Some(read_first_key), None, 3, FLAG_READ_ONLY);
    register(table, "zrevrank", exec_zrevrank, Some(read_first_key), None, 3, FLAG_READ_ONLY);
    register(table, "zrange", exec_zrange, Some(read_first_key), None, -4, FLAG_READ_ONLY);
    register(table, "zrevrange", exec_zrevrange, Some(read_first_key), None, -4, FLAG_READ_ONLY);
    register(table, "zcount", exec_zcount, Some(read_first_key), None, 4, FLAG_READ_ONLY);
    register(table, "zrangebyscore", exec_zrangebyscore, Some(read_first_key), None, -4, FLAG_READ_ONLY);
    register(table, "zrevrangebyscore", exec_zrevrangebyscore, Some(read_first_key), None, -4, FLAG_READ_ONLY);
    register(table, "zrem", exec_zrem, Some(write_first_key), Some(undo_zrem as UndoFn), -3, FLAG_WRITE);
    register(table, "zremrangebyscore", exec_zremrangebyscore, Some(write_first_key), Some(undo_whole_key as UndoFn), 4, FLAG_WRITE);
    register(table, "zremrangebyrank", exec_zremrangebyrank, Some(write_first_key), Some(undo_whole_key as UndoFn), 4, FLAG_WRITE);
    register(table, "zpopmin", exec_zpopmin, Some(write_first_key), Some(undo_whole_key as UndoFn), -2, FLAG_WRITE);
}

fn undo_zadd(db: &Arc<Database>, args: &[Bytes]) -> Vec<CmdLine> {
    let key = key_of(&args[0]);
    // members sit at the odd positions after the key
    let members: Vec<String> = args[1..].iter().skip(1).step_by(2).map(key_of).collect();
    rollback_zset_members(db, &key, &members)
}

fn undo_zincrby(db: &Arc<Database>, args: &[Bytes]) -> Vec<CmdLine> {
    let key = key_of(&args[0]);
    rollback_zset_members(db, &key, &[key_of(&args[2])])
}

fn undo_zrem(db: &Arc<Database>, args: &[Bytes]) -> Vec<CmdLine> {
    let key = key_of(&args[0]);
    let members: Vec<String> = args[1..].iter().map(key_of).collect();
    rollback_zset_members(db, &key, &members)
}

fn undo_whole_key(db: &Arc<Database>, args: &[Bytes]) -> Vec<CmdLine> {
    super::rollback_given_keys(db, &[key_of(&args[0])])
}

fn with_zset<R>(
    db: &Arc<Database>,
    key: &str,
    f: impl FnOnce(&SortedSet) -> R,
) -> Result<Option<R>, Frame> {
    match db.with_entity(key, |e| e.as_zset().map(f)) {
        None => Ok(None),
        Some(Ok(r)) => Ok(Some(r)),
        Some(Err(wrong)) => Err(Frame::error(wrong.to_string())),
    }
}

fn ensure_zset(db: &Arc<Database>, key: &str) -> Result<(), Frame> {
    match db.with_entity(key, |e| e.as_zset().map(|_| ())) {
        Some(Err(wrong)) => Err(Frame::error(wrong.to_string())),
        _ => Ok(()),
    }
}

fn pairs_reply(pairs: Vec<(String, f64)>, with_scores: bool) -> Frame {
    let mut out = Vec::with_capacity(pairs.len() * if with_scores { 2 } else { 1 });
    for (member, score) in pairs {
        out.push(Frame::bulk(member.into_bytes()));
        if with_scores {
            out.push(Frame::bulk(format_float(score).into_bytes()));
        }
    }
    Frame::Array(out)
}

fn parse_withscores(args: &[Bytes]) -> Result<bool, Frame> {
    match args {
        [] => Ok(false),
        [flag] if flag.eq_ignore_ascii_case(b"WITHSCORES") => Ok(true),
        _ => Err(Frame::error("ERR syntax error")),
    }
}

// ZADD key score member [score member ...]
fn exec_zadd(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    if args[1..].len() % 2 != 0 {
        return Frame::arg_num_error("zadd");
    }
    let key = key_of(&args[0]);
    let mut pairs = Vec::with_capacity(args[1..].len() / 2);
    for chunk in args[1..].chunks(2) {
        let score = match parse_f64(&chunk[0]) {
            Ok(s) => s,
            Err(e) => return e,
        };
        pairs.push((score, key_of(&chunk[1])));
    }
    if let Err(e) = ensure_zset(db, &key) {
        return e;
    }
    let added = db.upsert_entity_with(
        &key,
        || DataEntity::SortedSet(SortedSet::new()),
        |entity| {
            let zset = entity.as_zset_mut().expect("checked zset type");
            pairs
                .iter()
                .filter(|(score, member)| zset.add(member.clone(), *score))
                .count()
        },
    );
    db.add_aof(aof_line("ZADD", args));
    Frame::Integer(added as i64)
}

fn exec_zscore(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let member = key_of(&args[1]);
    match with_zset(db, &key, |z| z.score(&member)) {
        Ok(Some(Some(score))) => Frame::bulk(format_float(score).into_bytes()),
        Ok(_) => Frame::Null,
        Err(e) => e,
    }
}

// ZINCRBY key increment member
fn exec_zincrby(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let delta = match parse_f64(&args[1]) {
        Ok(d) => d,
        Err(e) => return e,
    };
    let member = key_of(&args[2]);
    if let Err(e) = ensure_zset(db, &key) {
        return e;
    }
    let next = db.upsert_entity_with(
        &key,
        || DataEntity::SortedSet(SortedSet::new()),
        |entity| {
            let zset = entity.as_zset_mut().expect("checked zset type");
            let next = zset.score(&member).unwrap_or(0.0) + delta;
            zset.add(member.clone(), next);
            next
        },
    );
    db.add_aof(aof_line("ZINCRBY", args));
    Frame::bulk(format_float(next).into_bytes())
}

fn exec_zcard(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    match with_zset(db, &key, |z| z.len()) {
        Ok(len) => Frame::Integer(len.unwrap_or(0) as i64),
        Err(e) => e,
    }
}

fn rank_reply(db: &Arc<Database>, args: &[Bytes], rev: bool) -> Frame {
    let key = key_of(&args[0]);
    let member = key_of(&args[1]);
    match with_zset(db, &key, |z| z.rank(&member, rev)) {
        Ok(Some(Some(rank))) => Frame::Integer(rank as i64),
        Ok(_) => Frame::Null,
        Err(e) => e,
    }
}

fn exec_zrank(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    rank_reply(db, args, false)
}

fn exec_zrevrank(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    rank_reply(db, args, true)
}

fn range_by_rank(db: &Arc<Database>, args: &[Bytes], rev: bool) -> Frame {
    let key = key_of(&args[0]);
    let start = match parse_i64(&args[1]) {
        Ok(n) => n,
        Err(e) => return e,
    };
    let stop = match parse_i64(&args[2]) {
        Ok(n) => n,
        Err(e) => return e,
    };
    let with_scores = match parse_withscores(&args[3..]) {
        Ok(ws) => ws,
        Err(e) => return e,
    };
    let pairs = match with_zset(db, &key, |z| {
        let len = z.len() as i64;
        let s = if start < 0 { (len + start).max(0) } else { start };
        let e = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if s > e || len == 0 {
            Vec::new()
        } else {
            z.range_by_rank(s as u64, (e + 1) as u64, rev)
        }
    }) {
        Ok(p) => p.unwrap_or_default(),
        Err(e) => return e,
    };
    pairs_reply(pairs, with_scores)
}

fn exec_zrange(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    range_by_rank(db, args, false)
}

fn exec_zrevrange(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    range_by_rank(db, args, true)
}

fn parse_bounds(min_arg: &Bytes, max_arg: &Bytes) -> Result<(ScoreBound, ScoreBound), Frame> {
    let min = ScoreBound::parse(min_arg)
        .ok_or_else(|| Frame::error("ERR min or max is not a float"))?;
    let max = ScoreBound::parse(max_arg)
        .ok_or_else(|| Frame::error("ERR min or max is not a float"))?;
    Ok((min, max))
}

// ZCOUNT key min max. Returns 0 iff the set is absent or empty.
fn exec_zcount(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let (min, max) = match parse_bounds(&args[1], &args[2]) {
        Ok(b) => b,
        Err(e) => return e,
    };
    match with_zset(db, &key, |z| z.count_by_score(&min, &max)) {
        Ok(count) => Frame::Integer(count.unwrap_or(0) as i64),
        Err(e) => e,
    }
}

fn range_by_score(db: &Arc<Database>, args: &[Bytes], rev: bool) -> Frame {
    let key = key_of(&args[0]);
    // ZREVRANGEBYSCORE takes (max, min); normal order is (min, max)
    let (min_arg, max_arg) = if rev {
        (&args[2], &args[1])
    } else {
        (&args[1], &args[2])
    };
    let (min, max) = match parse_bounds(min_arg, max_arg) {
        Ok(b) => b,
        Err(e) => return e,
    };
    let with_scores = match parse_withscores(&args[3..]) {
        Ok(ws) => ws,
        Err(e) => return e,
    };
    match with_zset(db, &key, |z| z.range_by_score(&min, &max, rev)) {
        Ok(pairs) => pairs_reply(pairs.unwrap_or_default(), with_scores),
        Err(e) => e,
    }
}

fn exec_zrangebyscore(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    range_by_score(db, args, false)
}

fn exec_zrevrangebyscore(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    range_by_score(db, args, true)
}

fn exec_zrem(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let removed = match db.with_entity_mut(&key, |e| {
        e.as_zset_mut()
            .map(|z| args[1..].iter().filter(|m| z.remove(&key_of(m))).count())
    }) {
        None => 0,
        Some(Ok(n)) => n,
        Some(Err(wrong)) => return Frame::error(wrong.to_string()),
    };
    if removed > 0 {
        db.remove_if_empty_collection(&key);
        db.add_aof(aof_line("ZREM", args));
    }
    Frame::Integer(removed as i64)
}

fn exec_zremrangebyscore(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let (min, max) = match parse_bounds(&args[1], &args[2]) {
        Ok(b) => b,
        Err(e) => return e,
    };
    let removed = match db.with_entity_mut(&key, |e| {
        e.as_zset_mut().map(|z| z.remove_range_by_score(&min, &max).len())
    }) {
        None => 0,
        Some(Ok(n)) => n,
        Some(Err(wrong)) => return Frame::error(wrong.to_string()),
    };
    if removed > 0 {
        db.remove_if_empty_collection(&key);
        db.add_aof(aof_line("ZREMRANGEBYSCORE", args));
    }
    Frame::Integer(removed as i64)
}

fn exec_zremrangebyrank(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let start = match parse_i64(&args[1]) {
        Ok(n) => n,
        Err(e) => return e,
    };
    let stop = match parse_i64(&args[2]) {
        Ok(n) => n,
        Err(e) => return e,
    };
    let removed = match db.with_entity_mut(&key, |e| {
        e.as_zset_mut().map(|z| {
            let len = z.len() as i64;
            let s = if start < 0 { (len + start).max(0) } else { start };
            let e2 = if stop < 0 { len + stop } else { stop.min(len - 1) };
            if s > e2 || len == 0 {
                0
            } else {
                z.remove_range_by_rank(s as u64, (e2 + 1) as u64).len()
            }
        })
    }) {
        None => 0,
        Some(Ok(n)) => n,
        Some(Err(wrong)) => return Frame::error(wrong.to_string()),
    };
    if removed > 0 {
        db.remove_if_empty_collection(&key);
        db.add_aof(aof_line("ZREMRANGEBYRANK", args));
    }
    Frame::Integer(removed as i64)
}

// ZPOPMIN key [count]
fn exec_zpopmin(db: &Arc<Database>, args: &[Bytes]) -> Frame {
    let key = key_of(&args[0]);
    let count = if args.len() > 1 {
        match parse_i64(&args[1]) {
            Ok(n) if n >= 0 => n as usize,
            Ok(_) => return Frame::error("ERR value is out of range, must be positive"),
            Err(e) => return e,
        }
    } else {
        1
    };
    let popped = match db.with_entity_mut(&key, |e| e.as_zset_mut().map(|z| z.pop_min(count))) {
        None => Vec::new(),
        Some(Ok(p)) => p,
        Some(Err(wrong)) => return Frame::error(wrong.to_string()),
    };
    if !popped.is_empty() {
        db.remove_if_empty_collection(&key);
        let mut line = cinder_protocol::cmdline(["ZREM", key.as_str()]);
        line.extend(
            popped
                .iter()
                .map(|(m, _)| Bytes::copy_from_slice(m.as_bytes())),
        );
        db.add_aof(line);
    }
    pairs_reply(popped, true)
}

#[cfg(test)]
mod tests {
    use super::super::test_db;
    use crate::registry::exec_normal;
    use cinder_protocol::{cmdline, Frame};

    fn strings(reply: Frame) -> Vec<String> {
        let Frame::Array(items) = reply else {
            panic!("expected array, got {reply:?}")
        };
        items
            .into_iter()
            .map(|f| match f {
                Frame::Bulk(b) => String::from_utf8_lossy(&b).into_owned(),
                other => panic!("expected bulk, got {other:?}"),
            })
            .collect()
    }

    fn seed(db: &std::sync::Arc<crate::db::Database>) {
        exec_normal(db, &cmdline(["ZADD", "z", "1", "a", "2", "b", "3", "c"]));
    }

    #[test]
    fn zadd_counts_new_members() {
        let db = test_db();
        assert_eq!(
            exec_normal(&db, &cmdline(["ZADD", "z", "1", "a", "2", "b", "3", "c"])),
            Frame::Integer(3)
        );
        // score update is not a new member
        assert_eq!(
            exec_normal(&db, &cmdline(["ZADD", "z", "5", "a"])),
            Frame::Integer(0)
        );
        assert_eq!(
            exec_normal(&db, &cmdline(["ZSCORE", "z", "a"])),
            Frame::bulk(&b"5"[..])
        );
    }

    #[test]
    fn zscore_missing() {
        let db = test_db();
        seed(&db);
        assert_eq!(exec_normal(&db, &cmdline(["ZSCORE", "z", "zz"])), Frame::Null);
        assert_eq!(exec_normal(&db, &cmdline(["ZSCORE", "ghost", "a"])), Frame::Null);
    }

    #[test]
    fn zincrby_accumulates() {
        let db = test_db();
        assert_eq!(
            exec_normal(&db, &cmdline(["ZINCRBY", "z", "2.5", "m"])),
            Frame::bulk(&b"2.5"[..])
        );
        assert_eq!(
            exec_normal(&db, &cmdline(["ZINCRBY", "z", "2.5", "m"])),
            Frame::bulk(&b"5"[..])
        );
    }

    #[test]
    fn zrank_and_zrevrank() {
        let db = test_db();
        seed(&db);
        assert_eq!(exec_normal(&db, &cmdline(["ZRANK", "z", "a"])), Frame::Integer(0));
        assert_eq!(exec_normal(&db, &cmdline(["ZRANK", "z", "c"])), Frame::Integer(2));
        assert_eq!(
            exec_normal(&db, &cmdline(["ZREVRANK", "z", "c"])),
            Frame::Integer(0)
        );
        assert_eq!(exec_normal(&db, &cmdline(["ZRANK", "z", "zz"])), Frame::Null);
    }

    #[test]
    fn zrange_with_scores() {
        let db = test_db();
        seed(&db);
        assert_eq!(
            strings(exec_normal(&db, &cmdline(["ZRANGE", "z", "0", "-1"]))),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            strings(exec_normal(
                &db,
                &cmdline(["ZRANGE", "z", "0", "1", "WITHSCORES"])
            )),
            vec!["a", "1", "b", "2"]
        );
        assert_eq!(
            strings(exec_normal(&db, &cmdline(["ZREVRANGE", "z", "0", "0"]))),
            vec!["c"]
        );
    }

    #[test]
    fn zrangebyscore_with_scores() {
        let db = test_db();
        seed(&db);
        assert_eq!(
            strings(exec_normal(
                &db,
                &cmdline(["ZRANGEBYSCORE", "z", "2", "3", "WITHSCORES"])
            )),
            vec!["b", "2", "c", "3"]
        );
        assert_eq!(
            strings(exec_normal(
                &db,
                &cmdline(["ZRANGEBYSCORE", "z", "(1", "+inf"])
            )),
            vec!["b", "c"]
        );
        assert_eq!(
            strings(exec_normal(
                &db,
                &cmdline(["ZREVRANGEBYSCORE", "z", "3", "1"])
            )),
            vec!["c", "b", "a"]
        );
    }

    #[test]
    fn zcount_zero_when_absent_or_empty() {
        let db = test_db();
        assert_eq!(
            exec_normal(&db, &cmdline(["ZCOUNT", "ghost", "-inf", "+inf"])),
            Frame::Integer(0)
        );
        seed(&db);
        assert_eq!(
            exec_normal(&db, &cmdline(["ZCOUNT", "z", "-inf", "+inf"])),
            Frame::Integer(3)
        );
        assert_eq!(
            exec_normal(&db, &cmdline(["ZCOUNT", "z", "(1", "3"])),
            Frame::Integer(2)
        );
    }

    #[test]
    fn zrem_and_empty_cleanup() {
        let db = test_db();
        seed(&db);
        assert_eq!(
            exec_normal(&db, &cmdline(["ZREM", "z", "a", "ghost"])),
            Frame::Integer(1)
        );
        exec_normal(&db, &cmdline(["ZREM", "z", "b", "c"]));
        assert_eq!(exec_normal(&db, &cmdline(["EXISTS", "z"])), Frame::Integer(0));
    }

    #[test]
    fn zremrange_variants() {
        let db = test_db();
        seed(&db);
        assert_eq!(
            exec_normal(&db, &cmdline(["ZREMRANGEBYSCORE", "z", "2", "2"])),
            Frame::Integer(1)
        );
        assert_eq!(
            exec_normal(&db, &cmdline(["ZREMRANGEBYRANK", "z", "0", "0"])),
            Frame::Integer(1)
        );
        assert_eq!(
            strings(exec_normal(&db, &cmdline(["ZRANGE", "z", "0", "-1"]))),
            vec!["c"]
        );
    }

    #[test]
    fn zpopmin_returns_pairs() {
        let db = test_db();
        seed(&db);
        assert_eq!(
            strings(exec_normal(&db, &cmdline(["ZPOPMIN", "z", "2"]))),
            vec!["a", "1", "b", "2"]
        );
        assert_eq!(exec_normal(&db, &cmdline(["ZCARD", "z"])), Frame::Integer(1));
    }

    #[test]
    fn wrongtype_against_list() {
        let db = test_db();
        exec_normal(&db, &cmdline(["RPUSH", "l", "x"]));
        let reply = exec_normal(&db, &cmdline(["ZADD", "l", "1", "m"]));
        assert!(matches!(reply, Frame::Error(msg) if msg.starts_with("WRONGTYPE")));
    }
}
