//! Server configuration.
//!
//! CLI flags, validation, and the assembled `ServerContext` every
//! subsystem constructor receives a slice of.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use cinder_core::EngineConfig;
use cinder_persistence::{AofConfig, FsyncPolicy};

/// Exit codes, as documented for operators.
pub mod exit {
    /// Normal shutdown.
    pub const OK: i32 = 0;
    /// Configuration error.
    pub const CONFIG: i32 = 1;
    /// Could not bind the listen address.
    pub const BIND: i32 = 2;
    /// Fatal persistence error (e.g. rewrite rename failure).
    pub const PERSISTENCE: i32 = 3;
}

/// Command-line flags.
#[derive(Debug, Parser)]
#[command(name = "cinder-server", about = "An in-memory key-value store")]
pub struct Cli {
    /// Client port to listen on.
    #[arg(long, default_value_t = 6379)]
    pub port: u16,

    /// Data directory for persistence files.
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Number of logical databases.
    #[arg(long, default_value_t = 16)]
    pub databases: usize,

    /// Enable the append-only file.
    #[arg(long)]
    pub appendonly: bool,

    /// AOF file name within --dir.
    #[arg(long, default_value = "appendonly.aof")]
    pub appendfilename: String,

    /// Fsync policy: always | everysec | no.
    #[arg(long, default_value = "everysec")]
    pub appendfsync: String,

    /// RDB snapshot file name within --dir.
    #[arg(long, default_value = "dump.rdb")]
    pub rdbfilename: String,

    /// Rewrite the AOF with an RDB preamble.
    #[arg(long)]
    pub aof_use_rdb_preamble: bool,

    /// Global password required from clients and peers.
    #[arg(long)]
    pub requirepass: Option<String>,

    /// Run as a cluster node.
    #[arg(long)]
    pub cluster_enable: bool,

    /// This node's raft id (cluster mode).
    #[arg(long, default_value_t = 1)]
    pub node_id: u64,

    /// Raft transport bind address (cluster mode).
    #[arg(long, default_value = "127.0.0.1:16379")]
    pub raft_addr: String,

    /// Address of an existing cluster node to join through.
    #[arg(long)]
    pub join: Option<String>,

    /// Client address advertised to peers; defaults to
    /// 127.0.0.1:<port>.
    #[arg(long)]
    pub announce_addr: Option<String>,

    /// Join as a slave of this master (cluster mode).
    #[arg(long)]
    pub master: Option<String>,
}

/// Validated, assembled settings.
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub listen: SocketAddr,
    pub engine: EngineConfig,
    pub aof: Option<AofConfig>,
    pub rdb_path: PathBuf,
    pub cluster: Option<ClusterSettings>,
}

#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub node_id: u64,
    pub raft_addr: SocketAddr,
    pub announce_addr: String,
    pub join: Option<String>,
    pub master: Option<String>,
    pub password: Option<String>,
}

impl Cli {
    /// Validates flags into a [`ServerContext`].
    pub fn into_context(self) -> Result<ServerContext, String> {
        if self.databases == 0 || self.databases > 64 {
            return Err(format!(
                "--databases must be in 1..=64, got {}",
                self.databases
            ));
        }

        let fsync = FsyncPolicy::parse(&self.appendfsync)?;
        let listen: SocketAddr = format!("0.0.0.0:{}", self.port)
            .parse()
            .map_err(|e| format!("bad listen address: {e}"))?;

        let aof = self.appendonly.then(|| AofConfig {
            dir: self.dir.clone(),
            filename: self.appendfilename.clone(),
            fsync,
            use_rdb_preamble: self.aof_use_rdb_preamble,
        });

        let cluster = if self.cluster_enable {
            let raft_addr: SocketAddr = self
                .raft_addr
                .parse()
                .map_err(|e| format!("bad --raft-addr: {e}"))?;
            Some(ClusterSettings {
                node_id: self.node_id,
                raft_addr,
                announce_addr: self
                    .announce_addr
                    .clone()
                    .unwrap_or_else(|| format!("127.0.0.1:{}", self.port)),
                join: self.join.clone(),
                master: self.master.clone(),
                password: self.requirepass.clone(),
            })
        } else {
            None
        };

        Ok(ServerContext {
            listen,
            engine: EngineConfig {
                databases: if self.cluster_enable { 1 } else { self.databases },
                password: self.requirepass,
                cluster_mode: self.cluster_enable,
            },
            aof,
            rdb_path: self.dir.join(&self.rdbfilename),
            cluster,
        })
    }
}
