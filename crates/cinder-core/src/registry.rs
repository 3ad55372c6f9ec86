//! Command table and dispatch paths.
//!
//! A command descriptor carries its executor, an optional `prepare`
//! that names the write/read keys the command touches, an optional
//! `undo` producing the command lines that restore the prior state,
//! the arity rule, and flags. The table is built once and shared.
//!
//! Two dispatch paths exist:
//! - [`exec_normal`]: prepare → acquire locks → bump write-key
//!   versions → execute. The path every standalone command takes.
//! - [`exec_with_lock`]: validate and execute only, for callers that
//!   already hold the key locks (EXEC bodies, undo replay, AOF load).

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::commands;
use crate::db::Database;
use cinder_protocol::{cmd_name, CmdLine, Frame};

/// Command executor: receives the arguments after the command name.
pub type ExecFn = fn(&Arc<Database>, &[Bytes]) -> Frame;

/// Key analysis: `args → (write_keys, read_keys)`.
pub type PrepareFn = fn(&[Bytes]) -> (Vec<String>, Vec<String>);

/// Rollback generator: produces the command lines that restore every
/// touched key to its pre-command state. Runs before the command.
pub type UndoFn = fn(&Arc<Database>, &[Bytes]) -> Vec<CmdLine>;

pub const FLAG_WRITE: u8 = 0;
pub const FLAG_READ_ONLY: u8 = 1;

/// A registered command.
pub struct CommandSpec {
    pub name: &'static str,
    pub exec: ExecFn,
    pub prepare: Option<PrepareFn>,
    pub undo: Option<UndoFn>,
    /// Positive: exactly this many tokens including the name.
    /// Negative: at least `|arity|` tokens.
    pub arity: i32,
    pub flags: u8,
}

/// The table under construction; passed to each module's `register`.
pub type Table = HashMap<&'static str, CommandSpec>;

/// Registers one command. Mirrors are keyed lowercase.
pub fn register(
    table: &mut Table,
    name: &'static str,
    exec: ExecFn,
    prepare: Option<PrepareFn>,
    undo: Option<UndoFn>,
    arity: i32,
    flags: u8,
) {
    table.insert(
        name,
        CommandSpec {
            name,
            exec,
            prepare,
            undo,
            arity,
            flags,
        },
    );
}

static TABLE: OnceLock<Table> = OnceLock::new();

/// The global command table.
pub fn command_table() -> &'static Table {
    TABLE.get_or_init(|| {
        let mut table = Table::new();
        commands::strings::register_all(&mut table);
        commands::keys::register_all(&mut table);
        commands::lists::register_all(&mut table);
        commands::hashes::register_all(&mut table);
        commands::sets::register_all(&mut table);
        commands::zsets::register_all(&mut table);
        commands::geo::register_all(&mut table);
        table
    })
}

/// Looks up a command by (lowercased) name.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    command_table().get(name)
}

/// `true` if the named command is registered read-only.
pub fn is_read_only(name: &str) -> bool {
    lookup(&name.to_ascii_lowercase())
        .map(|spec| spec.flags & FLAG_READ_ONLY != 0)
        .unwrap_or(false)
}

/// Checks a command line length against an arity rule. The count
/// includes the command name itself.
pub fn validate_arity(arity: i32, token_count: usize) -> bool {
    if arity >= 0 {
        token_count == arity as usize
    } else {
        token_count >= arity.unsigned_abs() as usize
    }
}

/// Full standalone dispatch: analyze keys, lock, bump versions, run.
pub fn exec_normal(db: &Arc<Database>, line: &CmdLine) -> Frame {
    let Some(name) = cmd_name(line) else {
        return Frame::error("ERR empty command");
    };
    let Some(spec) = lookup(&name) else {
        return Frame::error(format!("ERR unknown command '{name}'"));
    };
    if !validate_arity(spec.arity, line.len()) {
        return Frame::arg_num_error(&name);
    }

    let args = &line[1..];
    let (write_keys, read_keys) = match spec.prepare {
        Some(prepare) => prepare(args),
        None => (Vec::new(), Vec::new()),
    };
    let _guard = db.lock_keys(&write_keys, &read_keys);
    db.add_version(&write_keys);
    (spec.exec)(db, args)
}

/// Executes a command assuming the caller already holds the locks for
/// every key it touches. No version bump here: EXEC bumps once for the
/// whole transaction, and replay paths must not disturb versions.
pub fn exec_with_lock(db: &Arc<Database>, line: &CmdLine) -> Frame {
    let Some(name) = cmd_name(line) else {
        return Frame::error("ERR empty command");
    };
    let Some(spec) = lookup(&name) else {
        return Frame::error(format!("ERR unknown command '{name}'"));
    };
    if !validate_arity(spec.arity, line.len()) {
        return Frame::arg_num_error(&name);
    }
    (spec.exec)(db, &line[1..])
}

/// The undo log for a command line, computed against the current
/// state. Empty when the command has no undo function.
pub fn undo_logs(db: &Arc<Database>, line: &CmdLine) -> Vec<CmdLine> {
    let Some(name) = cmd_name(line) else {
        return Vec::new();
    };
    let Some(spec) = lookup(&name) else {
        return Vec::new();
    };
    match spec.undo {
        Some(undo) => undo(db, &line[1..]),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_db;
    use cinder_protocol::cmdline;

    #[test]
    fn arity_rules() {
        assert!(validate_arity(3, 3));
        assert!(!validate_arity(3, 2));
        assert!(!validate_arity(3, 4));
        assert!(validate_arity(-2, 2));
        assert!(validate_arity(-2, 5));
        assert!(!validate_arity(-2, 1));
    }

    #[test]
    fn table_has_the_core_commands() {
        for name in [
            "get", "set", "del", "expire", "lpush", "hset", "sadd", "zadd", "geoadd", "scan",
        ] {
            assert!(lookup(name).is_some(), "missing {name}");
        }
        assert!(lookup("nonesuch").is_none());
    }

    #[test]
    fn read_only_flags() {
        assert!(is_read_only("get"));
        assert!(is_read_only("TTL"));
        assert!(!is_read_only("set"));
        assert!(!is_read_only("nonesuch"));
    }

    #[test]
    fn exec_normal_bumps_write_versions() {
        let db = test_db();
        let before = db.get_version("k");
        let reply = exec_normal(&db, &cmdline(["SET", "k", "v"]));
        assert_eq!(reply, Frame::ok());
        assert_eq!(db.get_version("k"), before + 1);
    }

    #[test]
    fn exec_normal_leaves_read_versions_alone() {
        let db = test_db();
        exec_normal(&db, &cmdline(["SET", "k", "v"]));
        let v = db.get_version("k");
        exec_normal(&db, &cmdline(["GET", "k"]));
        assert_eq!(db.get_version("k"), v);
    }

    #[test]
    fn unknown_command_errors() {
        let db = test_db();
        let reply = exec_normal(&db, &cmdline(["FROB", "k"]));
        assert!(matches!(reply, Frame::Error(msg) if msg.contains("unknown command")));
    }

    #[test]
    fn bad_arity_errors() {
        let db = test_db();
        let reply = exec_normal(&db, &cmdline(["GET"]));
        assert!(matches!(reply, Frame::Error(msg) if msg.contains("wrong number of arguments")));
    }

    #[test]
    fn exec_with_lock_skips_version_bump() {
        let db = test_db();
        let before = db.get_version("k");
        exec_with_lock(&db, &cmdline(["SET", "k", "v"]));
        assert_eq!(db.get_version("k"), before);
    }
}
