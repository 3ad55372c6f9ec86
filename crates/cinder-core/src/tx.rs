//! MULTI/EXEC/DISCARD/WATCH.
//!
//! A connection in multi state buffers validated commands instead of
//! running them. EXEC takes the union of every queued command's lock
//! sets (plus the watched keys as reads) in one acquisition, rechecks
//! the watched versions, and then runs the bodies via the with-lock
//! fast path. Before each body runs, its undo log is captured; if a
//! body replies with an error, the logs accumulated so far are
//! replayed in reverse and the transaction aborts.

use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;

use crate::db::Database;
use crate::registry::{self, validate_arity};
use crate::session::Session;
use cinder_protocol::{cmd_name, CmdLine, Frame};

const EXEC_ABORT: &str = "EXECABORT Transaction discarded because of previous errors.";

/// MULTI: enter multi state. Nesting is an error.
pub fn start_multi(session: &mut Session) -> Frame {
    if session.in_multi() {
        return Frame::error("ERR MULTI calls can not be nested");
    }
    session.set_multi(true);
    Frame::ok()
}

/// DISCARD: drop the queue and watches, leave multi state.
pub fn discard(session: &mut Session) -> Frame {
    if !session.in_multi() {
        return Frame::error("ERR DISCARD without MULTI");
    }
    session.set_multi(false);
    session.unwatch();
    Frame::ok()
}

/// WATCH key [key ...]: capture each key's current version.
pub fn watch(db: &Arc<Database>, session: &mut Session, args: &[Bytes]) -> Frame {
    if session.in_multi() {
        return Frame::error("ERR WATCH inside MULTI is not allowed");
    }
    for arg in args {
        let key = String::from_utf8_lossy(arg).into_owned();
        let version = db.get_version(&key);
        session.watch(key, version);
    }
    Frame::ok()
}

/// UNWATCH: drop all watches.
pub fn unwatch(session: &mut Session) -> Frame {
    session.unwatch();
    Frame::ok()
}

/// Buffers a command while in multi state. Unknown commands, commands
/// without a prepare function, and arity violations are rejected here
/// and recorded; EXEC will refuse to run a queue with recorded errors.
pub fn enqueue(session: &mut Session, line: CmdLine) -> Frame {
    let Some(name) = cmd_name(&line) else {
        let err = "ERR empty command";
        session.add_tx_error(err);
        return Frame::error(err);
    };
    let Some(spec) = registry::lookup(&name) else {
        let err = format!("ERR unknown command '{name}'");
        session.add_tx_error(err.clone());
        return Frame::error(err);
    };
    if spec.prepare.is_none() {
        let err = format!("ERR command '{name}' cannot be used in MULTI");
        session.add_tx_error(err.clone());
        return Frame::error(err);
    }
    if !validate_arity(spec.arity, line.len()) {
        let err = format!("ERR wrong number of arguments for '{name}' command");
        session.add_tx_error(err.clone());
        return Frame::error(err);
    }
    session.enqueue(line);
    Frame::queued()
}

/// EXEC.
pub fn exec_multi(db: &Arc<Database>, session: &mut Session) -> Frame {
    if !session.in_multi() {
        return Frame::error("ERR EXEC without MULTI");
    }
    let had_errors = session.has_tx_errors();
    let lines = session.take_queue();
    let watching = session.take_watching();
    session.set_multi(false);

    if had_errors {
        return Frame::error(EXEC_ABORT);
    }
    run_transaction(db, watching, &lines)
}

/// Runs a validated command batch atomically against one database.
pub fn run_transaction(
    db: &Arc<Database>,
    watching: AHashMap<String, u32>,
    lines: &[CmdLine],
) -> Frame {
    // union of key sets over the whole batch
    let mut write_keys: Vec<String> = Vec::new();
    let mut read_keys: Vec<String> = Vec::new();
    for line in lines {
        let name = cmd_name(line).unwrap_or_default();
        let Some(spec) = registry::lookup(&name) else {
            return Frame::error(format!("ERR unknown command '{name}'"));
        };
        if let Some(prepare) = spec.prepare {
            let (w, r) = prepare(&line[1..]);
            write_keys.extend(w);
            read_keys.extend(r);
        }
    }
    read_keys.extend(watching.keys().cloned());

    let _guard = db.lock_keys(&write_keys, &read_keys);

    if watch_conflict(db, &watching) {
        return Frame::NullArray;
    }

    let mut results = Vec::with_capacity(lines.len());
    let mut undo_logs: Vec<Vec<CmdLine>> = Vec::with_capacity(lines.len());
    let mut aborted = false;
    for line in lines {
        undo_logs.push(registry::undo_logs(db, line));
        let reply = registry::exec_with_lock(db, line);
        if reply.is_error() {
            // the failing command applied nothing; drop its undo log
            undo_logs.pop();
            aborted = true;
            break;
        }
        results.push(reply);
    }

    if !aborted {
        db.add_version(&write_keys);
        return Frame::Array(results);
    }

    for logs in undo_logs.iter().rev() {
        for line in logs {
            registry::exec_with_lock(db, line);
        }
    }
    Frame::error(EXEC_ABORT)
}

fn watch_conflict(db: &Arc<Database>, watching: &AHashMap<String, u32>) -> bool {
    watching
        .iter()
        .any(|(key, &captured)| db.get_version(key) != captured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_db;
    use crate::registry::exec_normal;
    use cinder_protocol::cmdline;

    fn exec_lines(db: &Arc<Database>, session: &mut Session, lines: &[CmdLine]) -> Frame {
        start_multi(session);
        for line in lines {
            enqueue(session, line.clone());
        }
        exec_multi(db, session)
    }

    #[test]
    fn multi_nesting_is_an_error() {
        let mut s = Session::new();
        assert_eq!(start_multi(&mut s), Frame::ok());
        assert!(start_multi(&mut s).is_error());
    }

    #[test]
    fn discard_without_multi_is_an_error() {
        let mut s = Session::new();
        assert!(discard(&mut s).is_error());
    }

    #[test]
    fn exec_without_multi_is_an_error() {
        let db = test_db();
        let mut s = Session::new();
        assert!(exec_multi(&db, &mut s).is_error());
    }

    #[test]
    fn simple_transaction_applies_in_order() {
        let db = test_db();
        let mut s = Session::new();
        let reply = exec_lines(
            &db,
            &mut s,
            &[cmdline(["INCR", "n"]), cmdline(["INCR", "n"])],
        );
        assert_eq!(
            reply,
            Frame::Array(vec![Frame::Integer(1), Frame::Integer(2)])
        );
        assert_eq!(
            exec_normal(&db, &cmdline(["GET", "n"])),
            Frame::bulk(&b"2"[..])
        );
        assert!(!s.in_multi());
    }

    #[test]
    fn queue_replies_queued() {
        let db = test_db();
        let mut s = Session::new();
        start_multi(&mut s);
        assert_eq!(enqueue(&mut s, cmdline(["SET", "k", "v"])), Frame::queued());
        assert_eq!(s.queued().len(), 1);
        let _ = exec_multi(&db, &mut s);
    }

    #[test]
    fn queue_time_error_aborts_exec() {
        let db = test_db();
        let mut s = Session::new();
        start_multi(&mut s);
        assert!(enqueue(&mut s, cmdline(["NOPE", "x"])).is_error());
        enqueue(&mut s, cmdline(["SET", "k", "v"]));
        let reply = exec_multi(&db, &mut s);
        assert!(matches!(reply, Frame::Error(msg) if msg.starts_with("EXECABORT")));
        // nothing applied
        assert_eq!(exec_normal(&db, &cmdline(["GET", "k"])), Frame::Null);
    }

    #[test]
    fn command_without_prepare_rejected_in_multi() {
        let db = test_db();
        let mut s = Session::new();
        start_multi(&mut s);
        // KEYS registers without a prepare function
        let reply = enqueue(&mut s, cmdline(["KEYS", "*"]));
        assert!(matches!(reply, Frame::Error(msg) if msg.contains("cannot be used in MULTI")));
        let _ = exec_multi(&db, &mut s);
    }

    #[test]
    fn discard_clears_queue() {
        let db = test_db();
        let mut s = Session::new();
        start_multi(&mut s);
        enqueue(&mut s, cmdline(["SET", "k", "v"]));
        assert_eq!(discard(&mut s), Frame::ok());
        assert!(!s.in_multi());
        assert_eq!(exec_normal(&db, &cmdline(["GET", "k"])), Frame::Null);
    }

    #[test]
    fn watch_conflict_aborts_with_null_array() {
        let db = test_db();
        let mut s = Session::new();
        watch(&db, &mut s, &cmdline(["k"]));
        start_multi(&mut s);
        enqueue(&mut s, cmdline(["SET", "k", "mine"]));

        // another connection writes the watched key
        exec_normal(&db, &cmdline(["SET", "k", "theirs"]));

        let reply = exec_multi(&db, &mut s);
        assert_eq!(reply, Frame::NullArray);
        assert_eq!(
            exec_normal(&db, &cmdline(["GET", "k"])),
            Frame::bulk(&b"theirs"[..])
        );
    }

    #[test]
    fn watch_untouched_key_commits() {
        let db = test_db();
        let mut s = Session::new();
        watch(&db, &mut s, &cmdline(["k"]));
        start_multi(&mut s);
        enqueue(&mut s, cmdline(["SET", "k", "mine"]));
        let reply = exec_multi(&db, &mut s);
        assert_eq!(reply, Frame::Array(vec![Frame::ok()]));
        assert_eq!(
            exec_normal(&db, &cmdline(["GET", "k"])),
            Frame::bulk(&b"mine"[..])
        );
    }

    #[test]
    fn watch_missing_key_captures_zero() {
        let db = test_db();
        let mut s = Session::new();
        watch(&db, &mut s, &cmdline(["ghost"]));
        assert_eq!(s.watching().get("ghost"), Some(&0));
    }

    #[test]
    fn failing_body_rolls_back_earlier_commands() {
        let db = test_db();
        exec_normal(&db, &cmdline(["SET", "a", "old"]));
        let v_before = db.get_version("a");

        let mut s = Session::new();
        let reply = exec_lines(
            &db,
            &mut s,
            &[
                cmdline(["SET", "a", "new"]),
                // LPUSH against a string replies WRONGTYPE at run time
                cmdline(["LPUSH", "a", "x"]),
            ],
        );
        assert!(matches!(reply, Frame::Error(msg) if msg.starts_with("EXECABORT")));
        assert_eq!(
            exec_normal(&db, &cmdline(["GET", "a"])),
            Frame::bulk(&b"old"[..])
        );
        // aborted transactions leave versions untouched
        assert_eq!(db.get_version("a"), v_before);
    }

    #[test]
    fn rollback_restores_deleted_keys() {
        let db = test_db();
        exec_normal(&db, &cmdline(["RPUSH", "l", "a", "b"]));
        let mut s = Session::new();
        let reply = exec_lines(
            &db,
            &mut s,
            &[
                cmdline(["DEL", "l"]),
                cmdline(["INCR", "l"]),
                cmdline(["LPUSH", "l", "x"]),
            ],
        );
        // INCR creates "l" as a string counter; LPUSH then fails
        assert!(reply.is_error());
        assert_eq!(
            exec_normal(&db, &cmdline(["LRANGE", "l", "0", "-1"])),
            Frame::Array(vec![Frame::bulk(&b"a"[..]), Frame::bulk(&b"b"[..])])
        );
    }

    #[test]
    fn successful_exec_bumps_write_versions_once() {
        let db = test_db();
        let before = db.get_version("n");
        let mut s = Session::new();
        exec_lines(
            &db,
            &mut s,
            &[cmdline(["INCR", "n"]), cmdline(["INCR", "n"])],
        );
        // the key appears twice in the union; each occurrence bumps
        assert!(db.get_version("n") > before);
    }
}
