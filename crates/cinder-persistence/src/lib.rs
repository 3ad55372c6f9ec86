//! cinder-persistence: durability for the keyspace engine.
//!
//! The append-only file records every mutating command as a RESP
//! multi-bulk array, optionally preceded by an RDB preamble. A single
//! writer thread drains a bounded channel; three fsync policies trade
//! durability against latency. The compacting rewrite replays the
//! current log into a shadow engine and emits the minimal command (or
//! RDB) form of the live dataset.

pub mod aof;
pub mod format;
pub mod rdb;
pub mod rewrite;

pub use aof::{AofConfig, AofListener, AofPersister, FsyncPolicy, PersistError};
