//! cinder-cluster: distributed coordination.
//!
//! The replicated topology FSM is the single authority on slot
//! ownership, master/slave relationships, and in-flight migration and
//! failover tasks. Every state transition travels through the raft
//! log; nothing mutates the FSM directly. Around it sit the raft node
//! wrapper, the per-peer connection pool, and the thin router that
//! sends each command to the node owning its slot.

mod client;
mod error;
mod fsm;
mod pool;
mod raft;
mod router;
mod slots;

pub use client::{PeerClient, PeerStream};
pub use error::ClusterError;
pub use fsm::{
    FailoverTask, FsmSnapshot, LogEntry, MasterSlave, MigratingTask, NodeId, TopologyFsm,
};
pub use pool::ClientPool;
pub use raft::{ApplyResponse, RaftNode, RaftNodeConfig, Storage, TypeConfig};
pub use router::{Cluster, ClusterConfig, SlotPhase};
pub use slots::{key_slot, SLOT_COUNT};
