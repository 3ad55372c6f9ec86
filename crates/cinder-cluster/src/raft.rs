//! Raft node wrapper.
//!
//! Thin adapter around openraft: an in-memory log/state storage whose
//! state machine is the [`TopologyFsm`], a line-delimited JSON TCP
//! transport for peer RPCs, and the small surface the rest of the
//! system needs — bootstrap, propose, add/remove voters, leadership
//! queries.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;
use std::net::SocketAddr;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::storage::{Adaptor, LogState, RaftLogReader, RaftSnapshotBuilder, Snapshot};
use openraft::{
    BasicNode, ChangeMembers, Config, Entry, EntryPayload, LogId, OptionalSend, RaftStorage,
    RaftTypeConfig, ServerState, SnapshotMeta, StorageError, StorageIOError, StoredMembership,
    Vote,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::ClusterError;
use crate::fsm::{FsmSnapshot, LogEntry as TopologyEntry, TopologyFsm};

/// openraft type configuration.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TypeConfig;

impl RaftTypeConfig for TypeConfig {
    type D = TopologyEntry;
    type R = ApplyResponse;
    type Node = BasicNode;
    type NodeId = u64;
    type Entry = Entry<TypeConfig>;
    type SnapshotData = Cursor<Vec<u8>>;
    type AsyncRuntime = openraft::TokioRuntime;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
}

/// Result of applying a topology entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApplyResponse {
    Ok,
    Error(String),
}

/// Snapshot payload: raft bookkeeping plus the FSM's minimal state.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoredSnapshotData {
    last_applied: Option<LogId<u64>>,
    last_membership: StoredMembership<u64, BasicNode>,
    fsm: FsmSnapshot,
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    meta: SnapshotMeta<u64, BasicNode>,
    data: Vec<u8>,
}

/// In-memory raft log + state storage over the topology FSM.
pub struct Storage {
    vote: RwLock<Option<Vote<u64>>>,
    log: RwLock<BTreeMap<u64, Entry<TypeConfig>>>,
    last_purged: RwLock<Option<LogId<u64>>>,
    last_applied: RwLock<Option<LogId<u64>>>,
    last_membership: RwLock<StoredMembership<u64, BasicNode>>,
    snapshot: RwLock<Option<StoredSnapshot>>,
    fsm: Arc<TopologyFsm>,
}

impl Storage {
    pub fn new(fsm: Arc<TopologyFsm>) -> Self {
        Self {
            vote: RwLock::new(None),
            log: RwLock::new(BTreeMap::new()),
            last_purged: RwLock::new(None),
            last_applied: RwLock::new(None),
            last_membership: RwLock::new(StoredMembership::default()),
            snapshot: RwLock::new(None),
            fsm,
        }
    }

    /// `true` when the store carries any prior raft state. Bootstrap
    /// is only legal on a fresh store.
    pub async fn has_existing_state(&self) -> bool {
        self.vote.read().await.is_some() || !self.log.read().await.is_empty()
    }
}

impl RaftLogReader<TypeConfig> for Arc<Storage> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, v)| v.clone()).collect())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<Storage> {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let last_applied = *self.last_applied.read().await;
        let membership = self.last_membership.read().await.clone();

        let payload = StoredSnapshotData {
            last_applied,
            last_membership: membership.clone(),
            fsm: self.fsm.snapshot(),
        };
        let data =
            serde_json::to_vec(&payload).map_err(|e| StorageIOError::write_snapshot(None, &e))?;

        let snapshot_id = last_applied
            .map(|id| format!("{}-{}", id.leader_id, id.index))
            .unwrap_or_else(|| "0-0".to_string());
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id,
        };

        *self.snapshot.write().await = Some(StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for Arc<Storage> {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<u64>> {
        let log = self.log.read().await;
        let last = log.iter().next_back().map(|(_, e)| e.log_id);
        let purged = *self.last_purged.read().await;
        Ok(LogState {
            last_purged_log_id: purged,
            last_log_id: last,
        })
    }

    async fn save_vote(&mut self, vote: &Vote<u64>) -> Result<(), StorageError<u64>> {
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<u64>>, StorageError<u64>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        Arc::clone(self)
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<u64>,
    ) -> Result<(), StorageError<u64>> {
        let mut log = self.log.write().await;
        let doomed: Vec<_> = log.range(log_id.index..).map(|(k, _)| *k).collect();
        for key in doomed {
            log.remove(&key);
        }
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        let mut log = self.log.write().await;
        let doomed: Vec<_> = log.range(..=log_id.index).map(|(k, _)| *k).collect();
        for key in doomed {
            log.remove(&key);
        }
        *self.last_purged.write().await = Some(log_id);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, StoredMembership<u64, BasicNode>), StorageError<u64>> {
        let last_applied = *self.last_applied.read().await;
        let membership = self.last_membership.read().await.clone();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<ApplyResponse>, StorageError<u64>> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            *self.last_applied.write().await = Some(entry.log_id);
            match &entry.payload {
                EntryPayload::Blank => results.push(ApplyResponse::Ok),
                EntryPayload::Normal(cmd) => match self.fsm.apply(cmd) {
                    Ok(()) => results.push(ApplyResponse::Ok),
                    Err(msg) => results.push(ApplyResponse::Error(msg)),
                },
                EntryPayload::Membership(m) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), m.clone());
                    results.push(ApplyResponse::Ok);
                }
            }
        }
        Ok(results)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Arc::clone(self)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let data = snapshot.into_inner();
        let payload: StoredSnapshotData = serde_json::from_slice(&data)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;

        *self.last_applied.write().await = payload.last_applied;
        *self.last_membership.write().await = payload.last_membership;
        self.fsm.restore(payload.fsm);

        *self.snapshot.write().await = Some(StoredSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        let snap = self.snapshot.read().await;
        Ok(snap.as_ref().map(|s| Snapshot {
            meta: s.meta.clone(),
            snapshot: Box::new(Cursor::new(s.data.clone())),
        }))
    }
}

// ---------------------------------------------------------------------------
// transport: line-delimited JSON over TCP
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
enum RpcRequest {
    Append(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<u64>),
    Snapshot(InstallSnapshotRequest<TypeConfig>),
}

async fn rpc_round_trip<Resp, E>(
    addr: &str,
    req: &RpcRequest,
) -> Result<Result<Resp, E>, std::io::Error>
where
    Resp: serde::de::DeserializeOwned,
    E: serde::de::DeserializeOwned,
{
    let stream = TcpStream::connect(addr).await?;
    let mut reader = BufReader::new(stream);
    let mut body = serde_json::to_vec(req)?;
    body.push(b'\n');
    reader.get_mut().write_all(&body).await?;

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let parsed = serde_json::from_str(&line)?;
    Ok(parsed)
}

/// Connection factory handed to openraft.
#[derive(Default, Clone)]
pub struct Network;

impl RaftNetworkFactory<TypeConfig> for Network {
    type Network = NetworkConnection;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> Self::Network {
        NetworkConnection {
            target,
            addr: node.addr.clone(),
        }
    }
}

pub struct NetworkConnection {
    target: u64,
    addr: String,
}

impl RaftNetwork<TypeConfig> for NetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        let res: Result<AppendEntriesResponse<u64>, RaftError<u64>> =
            rpc_round_trip(&self.addr, &RpcRequest::Append(rpc))
                .await
                .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        res.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, InstallSnapshotError>>,
    > {
        let res: Result<InstallSnapshotResponse<u64>, RaftError<u64, InstallSnapshotError>> =
            rpc_round_trip(&self.addr, &RpcRequest::Snapshot(rpc))
                .await
                .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        res.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        let res: Result<VoteResponse<u64>, RaftError<u64>> =
            rpc_round_trip(&self.addr, &RpcRequest::Vote(rpc))
                .await
                .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        res.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }
}

// ---------------------------------------------------------------------------
// the node wrapper
// ---------------------------------------------------------------------------

/// Construction parameters for a raft node.
#[derive(Debug, Clone)]
pub struct RaftNodeConfig {
    /// This node's raft id.
    pub id: u64,
    /// Address the raft transport listens on and advertises.
    pub addr: SocketAddr,
}

pub struct RaftNode {
    id: u64,
    addr: SocketAddr,
    raft: openraft::Raft<TypeConfig>,
    storage: Arc<Storage>,
    fsm: Arc<TopologyFsm>,
}

impl RaftNode {
    /// Builds the raft instance and starts the transport listener.
    pub async fn start(
        config: RaftNodeConfig,
        fsm: Arc<TopologyFsm>,
    ) -> Result<Arc<Self>, ClusterError> {
        let storage = Arc::new(Storage::new(Arc::clone(&fsm)));
        let (log_store, state_machine) = Adaptor::new(Arc::clone(&storage));

        let raft_config = Arc::new(
            Config {
                heartbeat_interval: 250,
                election_timeout_min: 1000,
                election_timeout_max: 2000,
                ..Default::default()
            }
            .validate()
            .map_err(|e| ClusterError::Config(e.to_string()))?,
        );

        let raft = openraft::Raft::new(
            config.id,
            raft_config,
            Network,
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| ClusterError::Raft(e.to_string()))?;

        let node = Arc::new(Self {
            id: config.id,
            addr: config.addr,
            raft,
            storage,
            fsm,
        });
        Self::spawn_transport(&node).await?;
        Ok(node)
    }

    async fn spawn_transport(node: &Arc<Self>) -> Result<(), ClusterError> {
        let listener = TcpListener::bind(node.addr).await?;
        info!(addr = %node.addr, id = node.id, "raft transport listening");
        let me = Arc::clone(node);
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                let me = Arc::clone(&me);
                tokio::spawn(async move {
                    if let Err(e) = me.serve_rpc(stream).await {
                        warn!(peer = %peer, error = %e, "raft rpc failed");
                    }
                });
            }
        });
        Ok(())
    }

    async fn serve_rpc(&self, stream: TcpStream) -> Result<(), ClusterError> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line.is_empty() {
            return Ok(());
        }
        let request: RpcRequest = serde_json::from_str(&line)
            .map_err(|e| ClusterError::Raft(format!("bad rpc: {e}")))?;

        let mut response = match request {
            RpcRequest::Append(req) => serde_json::to_vec(&self.raft.append_entries(req).await),
            RpcRequest::Vote(req) => serde_json::to_vec(&self.raft.vote(req).await),
            RpcRequest::Snapshot(req) => serde_json::to_vec(&self.raft.install_snapshot(req).await),
        }
        .map_err(|e| ClusterError::Raft(format!("encode response: {e}")))?;
        response.push(b'\n');
        reader.get_mut().write_all(&response).await?;
        Ok(())
    }

    /// This node's raft id.
    pub fn self_id(&self) -> u64 {
        self.id
    }

    /// The topology FSM this node replicates.
    pub fn fsm(&self) -> &Arc<TopologyFsm> {
        &self.fsm
    }

    /// Current server role.
    pub fn state(&self) -> ServerState {
        self.raft.metrics().borrow().state
    }

    /// `true` when this node currently leads.
    pub fn is_leader(&self) -> bool {
        self.state() == ServerState::Leader
    }

    /// The current leader's id, when known.
    pub fn leader_id(&self) -> Option<u64> {
        self.raft.metrics().borrow().current_leader
    }

    /// `true` if the store already carries raft state.
    pub async fn has_existing_state(&self) -> bool {
        self.storage.has_existing_state().await
    }

    /// Initializes a fresh single-node cluster and proposes the seed
    /// assignment of every slot to this node.
    pub async fn bootstrap(
        &self,
        self_node_id: crate::fsm::NodeId,
        slot_count: u32,
    ) -> Result<(), ClusterError> {
        if self.has_existing_state().await {
            return Err(ClusterError::Config(
                "bootstrap requires a fresh raft store".into(),
            ));
        }
        let members = BTreeMap::from([(self.id, BasicNode::new(self.addr.to_string()))]);
        self.raft
            .initialize(members)
            .await
            .map_err(|e| ClusterError::Raft(e.to_string()))?;

        self.propose(TopologyEntry::SeedStart {
            leader: self_node_id,
            slot_count,
        })
        .await?;
        Ok(())
    }

    /// Proposes a topology entry; leader-only. Returns the log index.
    pub async fn propose(&self, entry: TopologyEntry) -> Result<u64, ClusterError> {
        let resp = self
            .raft
            .client_write(entry)
            .await
            .map_err(|e| ClusterError::Raft(e.to_string()))?;
        match resp.data {
            ApplyResponse::Ok => Ok(resp.log_id.index),
            ApplyResponse::Error(msg) => Err(ClusterError::Raft(msg)),
        }
    }

    /// Adds a voting member, replicating the log to it first.
    pub async fn add_voter(&self, id: u64, addr: String) -> Result<(), ClusterError> {
        let node = BasicNode::new(addr);
        self.raft
            .add_learner(id, node.clone(), true)
            .await
            .map_err(|e| ClusterError::Raft(e.to_string()))?;
        self.raft
            .change_membership(ChangeMembers::AddVoters(BTreeMap::from([(id, node)])), false)
            .await
            .map_err(|e| ClusterError::Raft(e.to_string()))?;
        Ok(())
    }

    /// Removes a member from the voting set.
    pub async fn remove_server(&self, id: u64) -> Result<(), ClusterError> {
        self.raft
            .change_membership(
                ChangeMembers::RemoveVoters(std::collections::BTreeSet::from([id])),
                false,
            )
            .await
            .map_err(|e| ClusterError::Raft(e.to_string()))?;
        Ok(())
    }

    /// Blocks until this node becomes leader or the timeout elapses.
    pub async fn wait_for_leadership(&self, timeout: std::time::Duration) -> Result<(), ClusterError> {
        self.raft
            .wait(Some(timeout))
            .state(ServerState::Leader, "wait for leadership")
            .await
            .map_err(|e| ClusterError::Raft(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openraft::CommittedLeaderId;

    fn log_id(term: u64, index: u64) -> LogId<u64> {
        LogId::new(CommittedLeaderId::new(term, 0), index)
    }

    fn entry(index: u64, cmd: TopologyEntry) -> Entry<TypeConfig> {
        Entry {
            log_id: log_id(1, index),
            payload: EntryPayload::Normal(cmd),
        }
    }

    #[tokio::test]
    async fn apply_drives_the_fsm() {
        let fsm = Arc::new(TopologyFsm::new());
        let storage = Arc::new(Storage::new(Arc::clone(&fsm)));
        let mut s = Arc::clone(&storage);

        let results = s
            .apply_to_state_machine(&[entry(
                1,
                TopologyEntry::SeedStart {
                    leader: "n1".into(),
                    slot_count: 16,
                },
            )])
            .await
            .unwrap();
        assert_eq!(results, vec![ApplyResponse::Ok]);
        assert_eq!(fsm.node_of_slot(5).as_deref(), Some("n1"));
    }

    #[tokio::test]
    async fn rejected_entry_reports_error_response() {
        let fsm = Arc::new(TopologyFsm::new());
        let storage = Arc::new(Storage::new(fsm));
        let mut s = Arc::clone(&storage);

        let results = s
            .apply_to_state_machine(&[entry(
                1,
                TopologyEntry::Join {
                    node_id: "s1".into(),
                    master_id: Some("ghost".into()),
                },
            )])
            .await
            .unwrap();
        assert!(matches!(&results[0], ApplyResponse::Error(msg) if msg.contains("not found")));
    }

    #[tokio::test]
    async fn snapshot_restores_into_fresh_fsm() {
        let fsm = Arc::new(TopologyFsm::new());
        let storage = Arc::new(Storage::new(Arc::clone(&fsm)));
        let mut s = Arc::clone(&storage);

        s.apply_to_state_machine(&[
            entry(
                1,
                TopologyEntry::SeedStart {
                    leader: "n1".into(),
                    slot_count: 64,
                },
            ),
            entry(
                2,
                TopologyEntry::Join {
                    node_id: "s1".into(),
                    master_id: Some("n1".into()),
                },
            ),
        ])
        .await
        .unwrap();

        let snapshot = s.build_snapshot().await.unwrap();

        let fsm2 = Arc::new(TopologyFsm::new());
        let storage2 = Arc::new(Storage::new(Arc::clone(&fsm2)));
        let mut s2 = Arc::clone(&storage2);
        s2.install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        assert_eq!(fsm2.node_of_slot(0).as_deref(), Some("n1"));
        assert_eq!(fsm2.master_of("s1").as_deref(), Some("n1"));
        assert_eq!(fsm2.slots_of_node("n1").len(), 64);
    }

    #[tokio::test]
    async fn log_append_and_state() {
        let storage = Arc::new(Storage::new(Arc::new(TopologyFsm::new())));
        let mut s = Arc::clone(&storage);

        assert!(!storage.has_existing_state().await);
        s.append_to_log(vec![Entry::<TypeConfig> {
            log_id: log_id(1, 1),
            payload: EntryPayload::Blank,
        }])
        .await
        .unwrap();
        assert!(storage.has_existing_state().await);

        let state = s.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id, Some(log_id(1, 1)));
    }

    #[tokio::test]
    async fn vote_round_trip() {
        let storage = Arc::new(Storage::new(Arc::new(TopologyFsm::new())));
        let mut s = Arc::clone(&storage);
        let vote = Vote::new(3, 7);
        s.save_vote(&vote).await.unwrap();
        assert_eq!(s.read_vote().await.unwrap(), Some(vote));
    }
}
