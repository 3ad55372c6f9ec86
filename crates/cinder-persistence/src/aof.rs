//! The append-only file persister.
//!
//! Mutating commands arrive through [`AofPersister::save`] as
//! `(db_index, cmdline)` pairs and cross a bounded channel to a single
//! writer thread. The writer serializes each command in RESP
//! multi-bulk form, emitting a `SELECT n` first whenever the command's
//! database differs from the file's current context, then notifies the
//! registered listeners. The file handle and database context live
//! behind one mutex — the pause mutex — which the rewrite machinery
//! locks to stop the writer cleanly.
//!
//! Fsync policies:
//! - `always`: `save` bypasses the channel and writes synchronously
//!   under the pause mutex, fsyncing before it returns.
//! - `everysec`: a background thread fsyncs once per second.
//! - `no`: the kernel decides; the file is only fsynced at close.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use cinder_core::{CmdLine, Engine, Frame, Session};
use cinder_protocol::{cmd_name, parse_command};

use crate::format::FormatError;
use crate::rdb;

/// Queue depth between command execution and the writer thread.
const CHANNEL_CAPACITY: usize = 1 << 14;

/// Fsync policy names accepted by the configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// fsync after every write; `save` is synchronous.
    Always,
    /// fsync once per second from a background thread.
    #[default]
    EverySec,
    /// never fsync explicitly except at close.
    No,
}

impl FsyncPolicy {
    /// Parses a policy name. Only `always`, `everysec`, `no` exist.
    pub fn parse(input: &str) -> Result<Self, String> {
        match input.to_ascii_lowercase().as_str() {
            "always" => Ok(FsyncPolicy::Always),
            "everysec" => Ok(FsyncPolicy::EverySec),
            "no" => Ok(FsyncPolicy::No),
            _ => Err(format!(
                "unknown fsync policy '{input}'. valid options: always, everysec, no"
            )),
        }
    }
}

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// The rewrite rename failed after the live file was replaced;
    /// continuing would diverge the handle from the file. The server
    /// exits with its fatal-persistence code on this.
    #[error("fatal persistence error: {0}")]
    Fatal(String),
}

/// Receives every command batch after it is written to the file. Used
/// by cluster replication and slot import.
pub trait AofListener: Send + Sync {
    fn on_commands(&self, lines: &[CmdLine]);
}

/// Construction parameters.
#[derive(Debug, Clone)]
pub struct AofConfig {
    /// Data directory; the AOF and its temp files live here.
    pub dir: PathBuf,
    /// AOF file name within `dir`.
    pub filename: String,
    /// Fsync policy.
    pub fsync: FsyncPolicy,
    /// Rewrite emits an RDB preamble instead of command text.
    pub use_rdb_preamble: bool,
}

struct Payload {
    db_index: usize,
    line: CmdLine,
}

/// File-side state guarded by the pause mutex.
pub(crate) struct WriterState {
    pub(crate) file: File,
    pub(crate) current_db: usize,
}

pub struct AofPersister {
    engine: Arc<Engine>,
    config: AofConfig,
    /// Self-handle for the writer/fsync threads and the engine sink.
    me: Weak<AofPersister>,
    pub(crate) state: Mutex<WriterState>,
    listeners: Mutex<Vec<Arc<dyn AofListener>>>,
    tx: Mutex<Option<SyncSender<Payload>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    fsync_handle: Mutex<Option<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
}

impl AofPersister {
    /// Opens (creating if needed) the AOF, optionally replays it into
    /// `engine` first, and starts the writer and fsync machinery.
    ///
    /// Replay happens before any sink is bound to the engine, so
    /// loaded commands never echo back into the file.
    pub fn open(
        engine: Arc<Engine>,
        config: AofConfig,
        load: bool,
    ) -> Result<Arc<Self>, PersistError> {
        let path = config.dir.join(&config.filename);

        let mut current_db = 0;
        if load {
            current_db = load_into(&engine, &path, 0)?;
        }

        std::fs::create_dir_all(&config.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        let persister = Arc::new_cyclic(|me| Self {
            engine,
            config,
            me: me.clone(),
            state: Mutex::new(WriterState { file, current_db }),
            // the listener set always starts empty
            listeners: Mutex::new(Vec::new()),
            tx: Mutex::new(None),
            writer: Mutex::new(None),
            fsync_handle: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
        });
        persister.start();
        Ok(persister)
    }

    fn start(&self) {
        let Some(me) = self.me.upgrade() else { return };
        let (tx, rx) = sync_channel::<Payload>(CHANNEL_CAPACITY);
        *lock(&self.tx) = Some(tx);

        let writer = Arc::clone(&me);
        *lock(&self.writer) = Some(std::thread::spawn(move || writer.writer_loop(rx)));

        if self.config.fsync == FsyncPolicy::EverySec {
            *lock(&self.fsync_handle) = Some(std::thread::spawn(move || {
                while !me.stopping.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_secs(1));
                    me.fsync();
                }
            }));
        }
    }

    fn writer_loop(&self, rx: Receiver<Payload>) {
        for payload in rx {
            self.write_payload(&payload);
        }
    }

    /// Enqueues a command for persistence. In `always` mode the write
    /// and fsync happen on the caller's thread before returning.
    pub fn save(&self, db_index: usize, line: CmdLine) {
        let payload = Payload { db_index, line };
        if self.config.fsync == FsyncPolicy::Always {
            self.write_payload(&payload);
            return;
        }
        let tx = lock(&self.tx).clone();
        if let Some(tx) = tx {
            // FIFO channel: the caller sends while still holding its
            // key locks, so file order matches lock order
            if tx.send(payload).is_err() {
                warn!("aof writer is gone; dropping command");
            }
        }
    }

    /// The sink closure to install on the engine's databases. Holds a
    /// weak handle, so the engine never keeps a closed persister alive.
    pub fn sink(&self) -> cinder_core::db::AofSink {
        let me = self.me.clone();
        Arc::new(move |db_index, line| {
            if let Some(persister) = me.upgrade() {
                persister.save(db_index, line);
            }
        })
    }

    fn write_payload(&self, payload: &Payload) {
        let mut batch: Vec<CmdLine> = Vec::with_capacity(2);
        let mut state = lock(&self.state);

        if payload.db_index != state.current_db {
            let select = cinder_protocol::cmdline(["SELECT", payload.db_index.to_string().as_str()]);
            let bytes = Frame::from_cmdline(&select).to_bytes();
            if let Err(e) = state.file.write_all(&bytes) {
                warn!(error = %e, "aof select write failed");
                return;
            }
            state.current_db = payload.db_index;
            batch.push(select);
        }

        let bytes = Frame::from_cmdline(&payload.line).to_bytes();
        if let Err(e) = state.file.write_all(&bytes) {
            warn!(error = %e, "aof write failed");
            return;
        }
        batch.push(payload.line.clone());

        if self.config.fsync == FsyncPolicy::Always {
            if let Err(e) = state.file.sync_all() {
                warn!(error = %e, "aof fsync failed");
            }
        }
        drop(state);

        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener.on_commands(&batch);
        }
    }

    /// Forces OS-level durability of everything written so far.
    pub fn fsync(&self) {
        let state = lock(&self.state);
        if let Err(e) = state.file.sync_all() {
            error!(error = %e, "fsync failed");
        }
    }

    /// Registers a listener for written command batches.
    pub fn add_listener(&self, listener: Arc<dyn AofListener>) {
        lock(&self.listeners).push(listener);
    }

    /// Removes a previously registered listener.
    pub fn remove_listener(&self, listener: &Arc<dyn AofListener>) {
        lock(&self.listeners).retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Drains the channel, stops the writer and fsync threads, and
    /// flushes the file.
    pub fn close(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        // dropping the sender ends the writer loop after it drains
        lock(&self.tx).take();
        if let Some(handle) = lock(&self.writer).take() {
            let _ = handle.join();
        }
        if let Some(handle) = lock(&self.fsync_handle).take() {
            let _ = handle.join();
        }
        self.fsync();
        info!("aof closed");
    }

    /// The AOF path.
    pub fn path(&self) -> PathBuf {
        self.config.dir.join(&self.config.filename)
    }

    pub(crate) fn config(&self) -> &AofConfig {
        &self.config
    }

    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Writes a standalone RDB snapshot of the current dataset to
    /// `path`, via the same shadow-replay used by rewrite.
    pub fn save_rdb(&self, path: &Path) -> Result<(), PersistError> {
        let shadow = self.shadow_engine()?;
        let mut file = File::create(path)?;
        rdb::encode_engine(&shadow, &mut file)?;
        file.sync_all()?;
        Ok(())
    }

    /// Replays the current file into a fresh engine, fsyncing first so
    /// the replay sees every acknowledged write.
    pub(crate) fn shadow_engine(&self) -> Result<Arc<Engine>, PersistError> {
        let size = {
            let state = lock(&self.state);
            state.file.sync_all()?;
            std::fs::metadata(self.path())?.len()
        };
        let shadow = Engine::auxiliary(self.engine.db_count());
        load_into(&shadow, &self.path(), size as usize)?;
        Ok(shadow)
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Replays an AOF file into an engine.
///
/// Detects an RDB preamble at offset 0 and restores it through the RDB
/// path first. When `max_bytes > 0`, only that many bytes of the file
/// are replayed (the rewrite uses this to stop at its snapshot point).
/// Returns the database index selected by the last `SELECT` in the
/// replayed stream.
pub fn load_into(engine: &Arc<Engine>, path: &Path, max_bytes: usize) -> Result<usize, PersistError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    if max_bytes > 0 && data.len() > max_bytes {
        data.truncate(max_bytes);
    }

    let mut offset = 0;
    if rdb::has_rdb_header(&data) {
        let mut cursor = std::io::Cursor::new(&data[..]);
        match rdb::decode_into(engine, &mut cursor) {
            Ok(consumed) => offset = consumed,
            Err(e) => {
                // not a usable preamble; replay the whole file as RESP
                warn!(error = %e, "rdb preamble rejected, replaying as command text");
                offset = 0;
            }
        }
    }

    let mut session = Session::new();
    session.authenticated = true;
    let mut replayed = 0usize;
    while offset < data.len() {
        match parse_command(&data[offset..]) {
            Ok(Some((line, consumed))) => {
                offset += consumed;
                let reply = engine.exec(&mut session, &line);
                if reply.is_error() {
                    if let Frame::Error(msg) = &reply {
                        warn!(cmd = ?cmd_name(&line), error = %msg, "aof replay command failed");
                    }
                }
                replayed += 1;
            }
            Ok(None) => break, // truncated tail, normal after a crash
            Err(e) => {
                // skip to the next frame boundary and keep going
                warn!(error = %e, offset, "aof parse error, skipping to next record");
                match data[offset + 1..].iter().position(|&b| b == b'*') {
                    Some(next) => offset += next + 1,
                    None => break,
                }
            }
        }
    }
    info!(commands = replayed, "aof replay finished");
    Ok(session.db_index)
}
