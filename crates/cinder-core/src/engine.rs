//! The multi-database engine and top-level dispatcher.
//!
//! Owns the databases and the shared timewheel, gates authentication,
//! handles the global control commands itself (PING, AUTH, SELECT,
//! DBSIZE, FLUSHDB/FLUSHALL, INFO, and the transaction controls), and
//! hands everything else to the command table. Execution is wrapped in
//! a panic guard: a panicking command leaf becomes an unknown-error
//! reply instead of a dead connection.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info};

use crate::db::{AofSink, Database, KeyEventCallback};
use crate::registry;
use crate::session::Session;
use crate::timewheel::TimeWheel;
use crate::tx;
use cinder_protocol::{cmd_name, CmdLine, Frame};

/// Timewheel defaults: one-second ticks over an hour-long ring.
const WHEEL_TICK: Duration = Duration::from_secs(1);
const WHEEL_SLOTS: usize = 3600;

/// Engine construction parameters, carried in the server context.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of logical databases (SELECT range).
    pub databases: usize,
    /// Global password; `None` disables AUTH gating.
    pub password: Option<String>,
    /// Reported by INFO as the server mode.
    pub cluster_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            databases: 16,
            password: None,
            cluster_mode: false,
        }
    }
}

/// A fresh 40-character hex run id, generated once per engine.
fn generate_run_id() -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut rng = rand::rng();
    (0..40)
        .map(|_| HEX[rng.random_range(0..HEX.len())] as char)
        .collect()
}

pub struct Engine {
    dbs: Vec<Arc<Database>>,
    wheel: Arc<TimeWheel>,
    password: Option<String>,
    run_id: String,
    cluster_mode: bool,
}

impl Engine {
    /// Builds the engine and its databases. The timewheel is created
    /// but not ticking; call [`Engine::start_wheel`] once a runtime is
    /// available.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let wheel = Arc::new(TimeWheel::new(WHEEL_TICK, WHEEL_SLOTS));
        let dbs = (0..config.databases.max(1))
            .map(|i| Database::new(i, Arc::clone(&wheel)))
            .collect();
        Arc::new(Self {
            dbs,
            wheel,
            password: config.password,
            run_id: generate_run_id(),
            cluster_mode: config.cluster_mode,
        })
    }

    /// An engine with no persistence or callbacks bound, used to
    /// replay an AOF in isolation during rewrite.
    pub fn auxiliary(databases: usize) -> Arc<Self> {
        Self::new(EngineConfig {
            databases,
            ..EngineConfig::default()
        })
    }

    /// This process's run id, stable for the engine's lifetime.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Starts the expiry ticker.
    pub fn start_wheel(&self) -> tokio::task::JoinHandle<()> {
        info!(
            tick_ms = self.wheel.tick_interval().as_millis() as u64,
            "starting expiry timewheel"
        );
        Arc::clone(&self.wheel).run()
    }

    /// The shared timewheel.
    pub fn wheel(&self) -> &Arc<TimeWheel> {
        &self.wheel
    }

    /// Database by index.
    pub fn database(&self, index: usize) -> Option<&Arc<Database>> {
        self.dbs.get(index)
    }

    /// All databases, index order.
    pub fn databases(&self) -> &[Arc<Database>] {
        &self.dbs
    }

    /// Number of logical databases.
    pub fn db_count(&self) -> usize {
        self.dbs.len()
    }

    /// `true` when AUTH is required.
    pub fn requires_auth(&self) -> bool {
        self.password.is_some()
    }

    /// Installs the AOF sink on every database.
    pub fn bind_aof_sink(&self, sink: AofSink) {
        for db in &self.dbs {
            db.set_aof_sink(Arc::clone(&sink));
        }
    }

    /// Installs the cluster key-event callbacks on every database.
    pub fn bind_key_callbacks(&self, insert: KeyEventCallback, delete: KeyEventCallback) {
        for db in &self.dbs {
            db.set_insert_callback(Arc::clone(&insert));
            db.set_delete_callback(Arc::clone(&delete));
        }
    }

    /// Total live keys across databases.
    pub fn total_keys(&self) -> usize {
        self.dbs.iter().map(|db| db.key_count()).sum()
    }

    /// Top-level command execution for one connection.
    pub fn exec(&self, session: &mut Session, line: &CmdLine) -> Frame {
        let Some(name) = cmd_name(line) else {
            return Frame::error("ERR empty command");
        };

        if name == "auth" {
            return self.exec_auth(session, line);
        }
        if self.requires_auth() && !session.authenticated {
            return Frame::error("NOAUTH Authentication required.");
        }

        match name.as_str() {
            "ping" => return exec_ping(line),
            "select" => return self.exec_select(session, line),
            "dbsize" => {
                let db = &self.dbs[session.db_index];
                return Frame::Integer(db.key_count() as i64);
            }
            "flushdb" => {
                let db = &self.dbs[session.db_index];
                db.flush();
                db.add_aof(line.clone());
                return Frame::ok();
            }
            "flushall" => {
                for db in &self.dbs {
                    db.flush();
                }
                self.dbs[session.db_index].add_aof(line.clone());
                return Frame::ok();
            }
            "info" => return Frame::bulk(self.info().into_bytes()),
            "multi" => {
                if line.len() != 1 {
                    return Frame::arg_num_error("multi");
                }
                return tx::start_multi(session);
            }
            "discard" => {
                if line.len() != 1 {
                    return Frame::arg_num_error("discard");
                }
                return tx::discard(session);
            }
            "exec" => {
                if line.len() != 1 {
                    return Frame::arg_num_error("exec");
                }
                let db = Arc::clone(&self.dbs[session.db_index]);
                return self.guarded(|| tx::exec_multi(&db, session));
            }
            "watch" => {
                if line.len() < 2 {
                    return Frame::arg_num_error("watch");
                }
                let db = Arc::clone(&self.dbs[session.db_index]);
                return tx::watch(&db, session, &line[1..]);
            }
            "unwatch" => return tx::unwatch(session),
            _ => {}
        }

        if session.in_multi() {
            return tx::enqueue(session, line.clone());
        }

        let db = Arc::clone(&self.dbs[session.db_index]);
        self.guarded(|| registry::exec_normal(&db, line))
    }

    /// Runs `f` under the panic guard, converting panics into the
    /// unknown-error reply.
    fn guarded(&self, f: impl FnOnce() -> Frame) -> Frame {
        match std::panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(reply) => reply,
            Err(_) => {
                error!("command execution panicked");
                Frame::error("ERR unknown error")
            }
        }
    }

    fn exec_auth(&self, session: &mut Session, line: &CmdLine) -> Frame {
        if line.len() != 2 {
            return Frame::arg_num_error("auth");
        }
        let Some(expected) = &self.password else {
            return Frame::error("ERR Client sent AUTH, but no password is set");
        };
        let given = String::from_utf8_lossy(&line[1]);
        if given == expected.as_str() {
            session.authenticated = true;
            Frame::ok()
        } else {
            Frame::error("ERR invalid password")
        }
    }

    fn exec_select(&self, session: &mut Session, line: &CmdLine) -> Frame {
        if line.len() != 2 {
            return Frame::arg_num_error("select");
        }
        let parsed = std::str::from_utf8(&line[1])
            .ok()
            .and_then(|s| s.parse::<usize>().ok());
        match parsed {
            Some(n) if n < self.dbs.len() => {
                session.db_index = n;
                Frame::ok()
            }
            _ => Frame::error("ERR DB index is out of range"),
        }
    }

    fn info(&self) -> String {
        let mode = if self.cluster_mode {
            "cluster"
        } else {
            "standalone"
        };
        let mut out = String::new();
        out.push_str("# Server\r\n");
        out.push_str(&format!("run_id:{}\r\n", self.run_id));
        out.push_str(&format!("mode:{mode}\r\n"));
        out.push_str(&format!("databases:{}\r\n", self.dbs.len()));
        out.push_str("# Keyspace\r\n");
        for db in &self.dbs {
            let count = db.key_count();
            if count > 0 {
                out.push_str(&format!("db{}:keys={}\r\n", db.index(), count));
            }
        }
        out
    }
}

fn exec_ping(line: &CmdLine) -> Frame {
    match line.len() {
        1 => Frame::Simple("PONG".into()),
        2 => Frame::Bulk(line[1].clone()),
        _ => Frame::arg_num_error("ping"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_protocol::cmdline;

    fn engine() -> Arc<Engine> {
        Engine::new(EngineConfig::default())
    }

    fn session() -> Session {
        Session::new()
    }

    #[test]
    fn ping_pong() {
        let e = engine();
        let mut s = session();
        assert_eq!(
            e.exec(&mut s, &cmdline(["PING"])),
            Frame::Simple("PONG".into())
        );
        assert_eq!(
            e.exec(&mut s, &cmdline(["PING", "hello"])),
            Frame::bulk(&b"hello"[..])
        );
    }

    #[test]
    fn select_switches_database() {
        let e = engine();
        let mut s = session();
        e.exec(&mut s, &cmdline(["SET", "k", "db0"]));
        assert_eq!(e.exec(&mut s, &cmdline(["SELECT", "1"])), Frame::ok());
        assert_eq!(e.exec(&mut s, &cmdline(["GET", "k"])), Frame::Null);
        e.exec(&mut s, &cmdline(["SELECT", "0"]));
        assert_eq!(
            e.exec(&mut s, &cmdline(["GET", "k"])),
            Frame::bulk(&b"db0"[..])
        );
    }

    #[test]
    fn select_out_of_range() {
        let e = engine();
        let mut s = session();
        assert!(e.exec(&mut s, &cmdline(["SELECT", "99"])).is_error());
        assert!(e.exec(&mut s, &cmdline(["SELECT", "abc"])).is_error());
    }

    #[test]
    fn dbsize_counts_current_db() {
        let e = engine();
        let mut s = session();
        e.exec(&mut s, &cmdline(["SET", "a", "1"]));
        e.exec(&mut s, &cmdline(["SET", "b", "2"]));
        assert_eq!(e.exec(&mut s, &cmdline(["DBSIZE"])), Frame::Integer(2));
        e.exec(&mut s, &cmdline(["SELECT", "1"]));
        assert_eq!(e.exec(&mut s, &cmdline(["DBSIZE"])), Frame::Integer(0));
    }

    #[test]
    fn flushdb_clears_only_selected() {
        let e = engine();
        let mut s = session();
        e.exec(&mut s, &cmdline(["SET", "a", "1"]));
        e.exec(&mut s, &cmdline(["SELECT", "1"]));
        e.exec(&mut s, &cmdline(["SET", "b", "2"]));
        assert_eq!(e.exec(&mut s, &cmdline(["FLUSHDB"])), Frame::ok());
        assert_eq!(e.exec(&mut s, &cmdline(["DBSIZE"])), Frame::Integer(0));
        e.exec(&mut s, &cmdline(["SELECT", "0"]));
        assert_eq!(e.exec(&mut s, &cmdline(["DBSIZE"])), Frame::Integer(1));
    }

    #[test]
    fn flushall_clears_everything() {
        let e = engine();
        let mut s = session();
        e.exec(&mut s, &cmdline(["SET", "a", "1"]));
        e.exec(&mut s, &cmdline(["SELECT", "2"]));
        e.exec(&mut s, &cmdline(["SET", "b", "2"]));
        e.exec(&mut s, &cmdline(["FLUSHALL"]));
        assert_eq!(e.total_keys(), 0);
    }

    #[test]
    fn auth_gate() {
        let e = Engine::new(EngineConfig {
            databases: 2,
            password: Some("hunter2".into()),
            ..EngineConfig::default()
        });
        let mut s = session();
        let reply = e.exec(&mut s, &cmdline(["GET", "k"]));
        assert!(matches!(reply, Frame::Error(msg) if msg.starts_with("NOAUTH")));

        assert!(e.exec(&mut s, &cmdline(["AUTH", "wrong"])).is_error());
        assert_eq!(e.exec(&mut s, &cmdline(["AUTH", "hunter2"])), Frame::ok());
        assert_eq!(e.exec(&mut s, &cmdline(["GET", "k"])), Frame::Null);
    }

    #[test]
    fn auth_without_password_configured() {
        let e = engine();
        let mut s = session();
        assert!(e.exec(&mut s, &cmdline(["AUTH", "x"])).is_error());
    }

    #[test]
    fn unknown_command() {
        let e = engine();
        let mut s = session();
        let reply = e.exec(&mut s, &cmdline(["WIBBLE"]));
        assert!(matches!(reply, Frame::Error(msg) if msg.contains("unknown command")));
    }

    #[test]
    fn multi_queues_through_engine() {
        let e = engine();
        let mut s = session();
        assert_eq!(e.exec(&mut s, &cmdline(["MULTI"])), Frame::ok());
        assert_eq!(
            e.exec(&mut s, &cmdline(["INCR", "n"])),
            Frame::queued()
        );
        assert_eq!(
            e.exec(&mut s, &cmdline(["INCR", "n"])),
            Frame::queued()
        );
        assert_eq!(
            e.exec(&mut s, &cmdline(["EXEC"])),
            Frame::Array(vec![Frame::Integer(1), Frame::Integer(2)])
        );
        assert_eq!(
            e.exec(&mut s, &cmdline(["GET", "n"])),
            Frame::bulk(&b"2"[..])
        );
    }

    #[test]
    fn watch_conflict_via_engine() {
        let e = engine();
        let mut conn_a = session();
        let mut conn_b = session();

        e.exec(&mut conn_a, &cmdline(["WATCH", "k"]));
        e.exec(&mut conn_a, &cmdline(["MULTI"]));
        e.exec(&mut conn_a, &cmdline(["SET", "k", "v1"]));

        e.exec(&mut conn_b, &cmdline(["SET", "k", "vX"]));

        assert_eq!(e.exec(&mut conn_a, &cmdline(["EXEC"])), Frame::NullArray);
        assert_eq!(
            e.exec(&mut conn_a, &cmdline(["GET", "k"])),
            Frame::bulk(&b"vX"[..])
        );
    }

    #[test]
    fn info_mentions_keyspace() {
        let e = engine();
        let mut s = session();
        e.exec(&mut s, &cmdline(["SET", "a", "1"]));
        let Frame::Bulk(body) = e.exec(&mut s, &cmdline(["INFO"])) else {
            panic!("INFO not bulk");
        };
        let text = String::from_utf8_lossy(&body).into_owned();
        assert!(text.contains("db0:keys=1"));
        assert!(text.contains("mode:standalone"));
        assert!(text.contains(&format!("run_id:{}", e.run_id())));
    }

    #[test]
    fn run_id_is_stable_hex() {
        let e = engine();
        let id = e.run_id().to_owned();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        // stable across calls, distinct across engines
        assert_eq!(e.run_id(), id);
        assert_ne!(engine().run_id(), id);
    }

    #[test]
    fn info_reports_cluster_mode() {
        let e = Engine::new(EngineConfig {
            databases: 1,
            cluster_mode: true,
            ..EngineConfig::default()
        });
        let mut s = session();
        let Frame::Bulk(body) = e.exec(&mut s, &cmdline(["INFO"])) else {
            panic!("INFO not bulk");
        };
        assert!(String::from_utf8_lossy(&body).contains("mode:cluster"));
    }
}
