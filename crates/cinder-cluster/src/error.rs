//! Cluster error types.

use thiserror::Error;

/// Errors from cluster routing, peers, and coordination.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] cinder_protocol::ProtocolError),

    #[error("peer {addr} unreachable: {reason}")]
    PeerUnreachable { addr: String, reason: String },

    #[error("peer replied with an error: {0}")]
    PeerError(String),

    #[error("response timed out")]
    Timeout,

    #[error("connection pool closed")]
    PoolClosed,

    #[error("not the raft leader")]
    NotLeader,

    #[error("raft error: {0}")]
    Raft(String),

    #[error("keys hash to different slots")]
    CrossSlot,

    #[error("{0}")]
    Config(String),
}
