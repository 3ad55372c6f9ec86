//! The slot router.
//!
//! Computes the slot of each command's keys, consults the FSM for the
//! owner, and either executes locally or forwards over the peer pool.
//! Multi-key commands whose keys span slots are rejected.
//!
//! Slot migration adds a per-slot phase the router consults. An
//! *exporting* slot still executes writes locally but marks the key
//! dirty and forwards the same command to the target before returning,
//! so the target converges without a stop-the-world copy. An
//! *importing* slot (on the target) serves reads for keys already
//! imported and forwards everything else to the current owner.
//!
//! Migration payloads travel as `migration-*` admin commands that the
//! router executes locally instead of routing, so a shipped key can
//! never bounce back to its source.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use ahash::{AHashMap, AHashSet};
use tracing::{info, warn};

use cinder_core::marshal::{entity_to_cmd, expire_at_cmd};
use cinder_core::{registry, CmdLine, Engine, Frame, Session};
use cinder_protocol::cmd_name;

use crate::error::ClusterError;
use crate::fsm::LogEntry;
use crate::fsm::{MigratingTask, NodeId, TopologyFsm};
use crate::pool::ClientPool;
use crate::raft::RaftNode;
use crate::slots::key_slot;

/// Cluster construction parameters.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// This node's advertised client address; doubles as its FSM id.
    pub self_id: NodeId,
    /// Password used for the peer AUTH handshake.
    pub password: Option<String>,
}

/// Per-slot migration phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotPhase {
    #[default]
    Stable,
    Importing,
    Exporting,
}

#[derive(Default)]
struct SlotState {
    phase: SlotPhase,
    /// Live keys in this slot, maintained by the keyspace callbacks.
    keys: AHashSet<String>,
    /// Keys written while exporting; re-shipped before the migration
    /// finishes.
    dirty: AHashSet<String>,
    /// Keys already landed during import.
    imported: AHashSet<String>,
}

pub struct Cluster {
    engine: Arc<Engine>,
    fsm: Arc<TopologyFsm>,
    raft: Arc<RaftNode>,
    pool: ClientPool,
    self_id: NodeId,
    slots: Arc<RwLock<AHashMap<u32, SlotState>>>,
}

/// Commands the router always executes locally.
fn is_local_command(name: &str) -> bool {
    matches!(
        name,
        "ping"
            | "auth"
            | "select"
            | "dbsize"
            | "flushdb"
            | "flushall"
            | "info"
            | "multi"
            | "exec"
            | "discard"
            | "watch"
            | "unwatch"
            | "keys"
            | "scan"
            | "randomkey"
    )
}

impl Cluster {
    /// Builds the router and installs the slot-membership callbacks on
    /// the engine. Cluster mode keys live in database 0.
    pub fn new(
        engine: Arc<Engine>,
        raft: Arc<RaftNode>,
        config: ClusterConfig,
    ) -> Arc<Self> {
        let fsm = Arc::clone(raft.fsm());
        let slots: Arc<RwLock<AHashMap<u32, SlotState>>> = Arc::default();

        let insert_slots = Arc::clone(&slots);
        let insert = move |db_index: usize, key: &str, _: Option<&cinder_core::DataEntity>| {
            if db_index != 0 {
                return;
            }
            let slot = key_slot(key.as_bytes());
            let mut map = insert_slots.write().unwrap_or_else(PoisonError::into_inner);
            map.entry(slot).or_default().keys.insert(key.to_owned());
        };
        let delete_slots = Arc::clone(&slots);
        let delete = move |db_index: usize, key: &str, _: Option<&cinder_core::DataEntity>| {
            if db_index != 0 {
                return;
            }
            let slot = key_slot(key.as_bytes());
            let mut map = delete_slots.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(state) = map.get_mut(&slot) {
                state.keys.remove(key);
            }
        };
        engine.bind_key_callbacks(Arc::new(insert), Arc::new(delete));

        Arc::new(Self {
            engine,
            fsm,
            raft,
            pool: ClientPool::new(config.password),
            self_id: config.self_id,
            slots,
        })
    }

    /// This node's FSM id.
    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// The replicated topology.
    pub fn fsm(&self) -> &Arc<TopologyFsm> {
        &self.fsm
    }

    /// The raft handle for topology proposals.
    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    /// Registers a callback fired when this node's own master changes
    /// in the FSM (the failover watch).
    pub fn watch_failover(&self, callback: impl Fn(NodeId) + Send + Sync + 'static) {
        let self_id = self.self_id.clone();
        let last = Mutex::new(None::<NodeId>);
        self.fsm.set_changed_hook(move |state| {
            let current = state.slave_masters.get(&self_id).cloned();
            let mut last = last.lock().unwrap_or_else(PoisonError::into_inner);
            if current != *last {
                if let Some(master) = &current {
                    info!(new_master = %master, "own master changed");
                    callback(master.clone());
                }
                *last = current;
            }
        });
    }

    fn phase_of(&self, slot: u32) -> SlotPhase {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&slot)
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    fn set_phase(&self, slots: &[u32], phase: SlotPhase) {
        let mut map = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        for &slot in slots {
            let state = map.entry(slot).or_default();
            state.phase = phase;
            if phase == SlotPhase::Stable {
                state.dirty.clear();
                state.imported.clear();
            }
        }
    }

    /// Live keys currently tracked in a slot.
    pub fn keys_in_slot(&self, slot: u32) -> Vec<String> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&slot)
            .map(|s| s.keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The keys a command line touches, per its prepare function.
    fn keys_of(line: &CmdLine) -> Vec<String> {
        let Some(name) = cmd_name(line) else {
            return Vec::new();
        };
        let Some(spec) = registry::lookup(&name) else {
            return Vec::new();
        };
        let Some(prepare) = spec.prepare else {
            return Vec::new();
        };
        let (mut write, read) = prepare(&line[1..]);
        write.extend(read);
        write
    }

    /// Routes one command. See the module docs for the state machine.
    pub async fn exec(&self, session: &mut Session, line: &CmdLine) -> Frame {
        let Some(name) = cmd_name(line) else {
            return Frame::error("ERR empty command");
        };

        // cluster admin traffic executes here, never routes
        if name == "cluster-meet" {
            return self.exec_meet(line).await;
        }
        if let Some(reply) = self.exec_migration_admin(&name, session, line) {
            return reply;
        }
        if is_local_command(&name) || session.in_multi() {
            return self.engine.exec(session, line);
        }

        let keys = Self::keys_of(line);
        if keys.is_empty() {
            return self.engine.exec(session, line);
        }

        let mut slots: Vec<u32> = keys.iter().map(|k| key_slot(k.as_bytes())).collect();
        slots.sort_unstable();
        slots.dedup();
        if slots.len() > 1 {
            return Frame::error("CROSSSLOT Keys in request don't hash to the same slot");
        }
        let slot = slots[0];

        let owner = self.fsm.node_of_slot(slot);
        let is_owner = owner.as_deref() == Some(self.self_id.as_str());

        match self.phase_of(slot) {
            SlotPhase::Stable => {
                if is_owner {
                    self.engine.exec(session, line)
                } else {
                    match owner {
                        Some(owner) => self.forward(&owner, line).await,
                        None => Frame::error("CLUSTERDOWN Hash slot not served"),
                    }
                }
            }
            SlotPhase::Exporting => {
                let reply = self.engine.exec(session, line);
                if !registry::is_read_only(&name) && !reply.is_error() {
                    self.mark_dirty_and_forward(slot, &keys, line).await;
                }
                reply
            }
            SlotPhase::Importing => {
                let imported = {
                    let map = self.slots.read().unwrap_or_else(PoisonError::into_inner);
                    map.get(&slot)
                        .map(|s| keys.iter().all(|k| s.imported.contains(k)))
                        .unwrap_or(false)
                };
                if registry::is_read_only(&name) && imported {
                    return self.engine.exec(session, line);
                }
                match owner {
                    Some(owner) if !is_owner => self.forward(&owner, line).await,
                    _ => self.engine.exec(session, line),
                }
            }
        }
    }

    async fn forward(&self, owner: &str, line: &CmdLine) -> Frame {
        match self.pool.request(owner, line).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(owner = %owner, error = %e, "forward failed");
                Frame::error(format!("ERR cluster forward failed: {e}"))
            }
        }
    }

    /// Marks every key dirty and ships the triggering command to the
    /// migration target so the importing side stays current.
    async fn mark_dirty_and_forward(&self, slot: u32, keys: &[String], line: &CmdLine) {
        let target = self.fsm.with_state(|s| {
            s.migratings
                .values()
                .find(|t| t.slots.contains(&slot))
                .map(|t| t.target_node.clone())
        });
        {
            let mut map = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(state) = map.get_mut(&slot) {
                state.dirty.extend(keys.iter().cloned());
            }
        }
        if let Some(target) = target {
            let mut wrapped = cinder_protocol::cmdline(["migration-apply"]);
            wrapped.extend(line.iter().cloned());
            if let Err(e) = self.pool.request(&target, &wrapped).await {
                warn!(target = %target, error = %e, "dirty-key forward failed");
            }
        }
    }

    /// CLUSTER-MEET <raft_id> <raft_addr> <node_id> [master_id]:
    /// received by the leader from a joining node. Adds the voter to
    /// the raft membership and proposes the topology Join.
    async fn exec_meet(&self, line: &CmdLine) -> Frame {
        if line.len() < 4 || line.len() > 5 {
            return Frame::arg_num_error("cluster-meet");
        }
        let Some(raft_id) = std::str::from_utf8(&line[1])
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        else {
            return Frame::error("ERR invalid raft id");
        };
        let raft_addr = String::from_utf8_lossy(&line[2]).into_owned();
        let node_id = String::from_utf8_lossy(&line[3]).into_owned();
        let master_id = line.get(4).map(|m| String::from_utf8_lossy(m).into_owned());

        if let Err(e) = self.raft.add_voter(raft_id, raft_addr).await {
            return Frame::error(format!("ERR join failed: {e}"));
        }
        match self
            .raft
            .propose(LogEntry::Join { node_id, master_id })
            .await
        {
            Ok(_) => Frame::ok(),
            Err(e) => Frame::error(format!("ERR join failed: {e}")),
        }
    }

    /// Handles the `migration-*` admin commands the exporting side
    /// sends to the importing side.
    fn exec_migration_admin(
        &self,
        name: &str,
        session: &mut Session,
        line: &CmdLine,
    ) -> Option<Frame> {
        match name {
            // migration-prepare <task_id> <slot> [slot ...]
            "migration-prepare" => {
                if line.len() < 3 {
                    return Some(Frame::arg_num_error(name));
                }
                let mut slots = Vec::with_capacity(line.len() - 2);
                for raw in &line[2..] {
                    match std::str::from_utf8(raw).ok().and_then(|s| s.parse().ok()) {
                        Some(slot) => slots.push(slot),
                        None => return Some(Frame::error("ERR invalid slot")),
                    }
                }
                self.set_phase(&slots, SlotPhase::Importing);
                Some(Frame::ok())
            }
            // migration-apply <wrapped command ...>
            "migration-apply" => {
                if line.len() < 2 {
                    return Some(Frame::arg_num_error(name));
                }
                let inner: CmdLine = line[1..].to_vec();
                let reply = self.engine.exec(session, &inner);
                if !reply.is_error() {
                    for key in Self::keys_of(&inner) {
                        let slot = key_slot(key.as_bytes());
                        let mut map =
                            self.slots.write().unwrap_or_else(PoisonError::into_inner);
                        map.entry(slot).or_default().imported.insert(key);
                    }
                }
                Some(reply)
            }
            // migration-finish <task_id> <slot> [slot ...]
            "migration-finish" => {
                if line.len() < 3 {
                    return Some(Frame::arg_num_error(name));
                }
                let mut slots = Vec::with_capacity(line.len() - 2);
                for raw in &line[2..] {
                    match std::str::from_utf8(raw).ok().and_then(|s| s.parse().ok()) {
                        Some(slot) => slots.push(slot),
                        None => return Some(Frame::error("ERR invalid slot")),
                    }
                }
                self.set_phase(&slots, SlotPhase::Stable);
                Some(Frame::ok())
            }
            _ => None,
        }
    }

    /// Drives a slot migration from this node to `target`.
    ///
    /// Proposes `StartMigrate`, marks the slots exporting, ships every
    /// key (rebuild command plus deadline), re-ships keys dirtied by
    /// concurrent writes, proposes `FinishMigrate`, and finally drops
    /// the moved keys locally.
    pub async fn migrate_slots(&self, task: MigratingTask) -> Result<(), ClusterError> {
        let target = task.target_node.clone();
        self.raft
            .propose(crate::fsm::LogEntry::StartMigrate(task.clone()))
            .await?;

        self.pool
            .request(&target, &prepare_line(&task))
            .await?;
        self.set_phase(&task.slots, SlotPhase::Exporting);

        let db = self
            .engine
            .database(0)
            .expect("cluster engine always has database 0");

        let mut moved: Vec<String> = Vec::new();
        for &slot in &task.slots {
            for key in self.keys_in_slot(slot) {
                self.ship_key(&target, db, &key).await?;
                moved.push(key);
            }
        }

        // one settling pass for keys written during the copy
        loop {
            let dirty: Vec<String> = {
                let mut map = self.slots.write().unwrap_or_else(PoisonError::into_inner);
                let mut dirty = Vec::new();
                for slot in &task.slots {
                    if let Some(state) = map.get_mut(slot) {
                        dirty.extend(std::mem::take(&mut state.dirty));
                    }
                }
                dirty
            };
            if dirty.is_empty() {
                break;
            }
            for key in dirty {
                self.ship_key(&target, db, &key).await?;
            }
        }

        self.raft
            .propose(crate::fsm::LogEntry::FinishMigrate(task.clone()))
            .await?;
        self.pool
            .request(&target, &finish_line(&task))
            .await?;

        self.set_phase(&task.slots, SlotPhase::Stable);
        let _guard = db.lock_keys(&moved, &[] as &[&str]);
        for key in &moved {
            db.remove(key);
        }
        info!(task = %task.id, keys = moved.len(), "migration shipped");
        Ok(())
    }

    /// Ships one key's rebuild command (and deadline) to the target.
    async fn ship_key(
        &self,
        target: &str,
        db: &Arc<cinder_core::Database>,
        key: &str,
    ) -> Result<(), ClusterError> {
        let snapshot = {
            let _guard = db.lock_keys(&[] as &[&str], &[key]);
            db.entity_snapshot(key).map(|e| (e, db.deadline_ms(key)))
        };
        let Some((entity, deadline)) = snapshot else {
            return Ok(()); // deleted while migrating
        };
        if let Some(rebuild) = entity_to_cmd(key, &entity) {
            let mut wrapped = cinder_protocol::cmdline(["migration-apply"]);
            wrapped.extend(rebuild);
            self.expect_ok(target, &wrapped).await?;
        }
        if let Some(at) = deadline {
            let mut wrapped = cinder_protocol::cmdline(["migration-apply"]);
            wrapped.extend(expire_at_cmd(key, at));
            self.expect_ok(target, &wrapped).await?;
        }
        Ok(())
    }

    async fn expect_ok(&self, target: &str, line: &CmdLine) -> Result<(), ClusterError> {
        match self.pool.request(target, line).await? {
            Frame::Error(msg) => Err(ClusterError::PeerError(msg)),
            _ => Ok(()),
        }
    }

    /// Shuts down the peer pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn prepare_line(task: &MigratingTask) -> CmdLine {
    let mut line = cinder_protocol::cmdline(["migration-prepare", task.id.as_str()]);
    line.extend(
        task.slots
            .iter()
            .map(|s| bytes::Bytes::from(s.to_string())),
    );
    line
}

fn finish_line(task: &MigratingTask) -> CmdLine {
    let mut line = cinder_protocol::cmdline(["migration-finish", task.id.as_str()]);
    line.extend(
        task.slots
            .iter()
            .map(|s| bytes::Bytes::from(s.to_string())),
    );
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::RaftNodeConfig;
    use cinder_core::{cmdline, EngineConfig};

    async fn single_node_cluster(client_addr: &str) -> Arc<Cluster> {
        let engine = Engine::new(EngineConfig::default());
        let fsm = Arc::new(TopologyFsm::new());
        let raft = RaftNode::start(
            RaftNodeConfig {
                id: 1,
                addr: "127.0.0.1:0".parse().unwrap(),
            },
            fsm,
        )
        .await;
        // binding 127.0.0.1:0 picks a free port; start cannot fail here
        let raft = raft.expect("raft start");
        Cluster::new(
            engine,
            raft,
            ClusterConfig {
                self_id: client_addr.to_string(),
                password: None,
            },
        )
    }

    #[tokio::test]
    async fn local_execution_when_owner() {
        let cluster = single_node_cluster("127.0.0.1:7001").await;
        cluster
            .fsm()
            .apply(&crate::fsm::LogEntry::SeedStart {
                leader: "127.0.0.1:7001".into(),
                slot_count: crate::slots::SLOT_COUNT,
            })
            .unwrap();

        let mut s = Session::new();
        assert_eq!(
            cluster.exec(&mut s, &cmdline(["SET", "k", "v"])).await,
            Frame::ok()
        );
        assert_eq!(
            cluster.exec(&mut s, &cmdline(["GET", "k"])).await,
            Frame::bulk(&b"v"[..])
        );
    }

    #[tokio::test]
    async fn cross_slot_commands_rejected() {
        let cluster = single_node_cluster("127.0.0.1:7002").await;
        cluster
            .fsm()
            .apply(&crate::fsm::LogEntry::SeedStart {
                leader: "127.0.0.1:7002".into(),
                slot_count: crate::slots::SLOT_COUNT,
            })
            .unwrap();

        let mut s = Session::new();
        // "foo" and "bar" land in different slots
        let reply = cluster
            .exec(&mut s, &cmdline(["MSET", "foo", "1", "bar", "2"]))
            .await;
        assert!(matches!(reply, Frame::Error(msg) if msg.starts_with("CROSSSLOT")));

        // hash tags pin both keys to one slot
        let reply = cluster
            .exec(&mut s, &cmdline(["MSET", "{t}a", "1", "{t}b", "2"]))
            .await;
        assert_eq!(reply, Frame::ok());
    }

    #[tokio::test]
    async fn unserved_slot_reports_clusterdown() {
        let cluster = single_node_cluster("127.0.0.1:7003").await;
        // no seed: the fsm is empty
        let mut s = Session::new();
        let reply = cluster.exec(&mut s, &cmdline(["SET", "k", "v"])).await;
        assert!(matches!(reply, Frame::Error(msg) if msg.starts_with("CLUSTERDOWN")));
    }

    #[tokio::test]
    async fn control_commands_always_local() {
        let cluster = single_node_cluster("127.0.0.1:7004").await;
        let mut s = Session::new();
        assert_eq!(
            cluster.exec(&mut s, &cmdline(["PING"])).await,
            Frame::Simple("PONG".into())
        );
    }

    #[tokio::test]
    async fn key_callbacks_track_slot_membership() {
        let cluster = single_node_cluster("127.0.0.1:7005").await;
        cluster
            .fsm()
            .apply(&crate::fsm::LogEntry::SeedStart {
                leader: "127.0.0.1:7005".into(),
                slot_count: crate::slots::SLOT_COUNT,
            })
            .unwrap();

        let mut s = Session::new();
        cluster.exec(&mut s, &cmdline(["SET", "tracked", "v"])).await;
        let slot = key_slot(b"tracked");
        assert_eq!(cluster.keys_in_slot(slot), vec!["tracked".to_string()]);

        cluster.exec(&mut s, &cmdline(["DEL", "tracked"])).await;
        assert!(cluster.keys_in_slot(slot).is_empty());
    }

    #[tokio::test]
    async fn migration_admin_round_trip() {
        let cluster = single_node_cluster("127.0.0.1:7006").await;
        cluster
            .fsm()
            .apply(&crate::fsm::LogEntry::SeedStart {
                leader: "127.0.0.1:7006".into(),
                slot_count: crate::slots::SLOT_COUNT,
            })
            .unwrap();
        let mut s = Session::new();

        let slot = key_slot(b"incoming");
        let reply = cluster
            .exec(
                &mut s,
                &cmdline(["migration-prepare", "task-1", slot.to_string().as_str()]),
            )
            .await;
        assert_eq!(reply, Frame::ok());
        assert_eq!(cluster.phase_of(slot), SlotPhase::Importing);

        // an applied key lands and is recorded as imported
        let reply = cluster
            .exec(
                &mut s,
                &cmdline(["migration-apply", "SET", "incoming", "payload"]),
            )
            .await;
        assert_eq!(reply, Frame::ok());
        // reads for imported keys are served during import
        assert_eq!(
            cluster.exec(&mut s, &cmdline(["GET", "incoming"])).await,
            Frame::bulk(&b"payload"[..])
        );

        let reply = cluster
            .exec(
                &mut s,
                &cmdline(["migration-finish", "task-1", slot.to_string().as_str()]),
            )
            .await;
        assert_eq!(reply, Frame::ok());
        assert_eq!(cluster.phase_of(slot), SlotPhase::Stable);
    }

    #[tokio::test]
    async fn failover_watch_fires_on_master_change() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let cluster = single_node_cluster("s2").await;
        let fsm = Arc::clone(cluster.fsm());
        fsm.apply(&crate::fsm::LogEntry::SeedStart {
            leader: "m1".into(),
            slot_count: 16,
        })
        .unwrap();
        for node in ["s1", "s2"] {
            fsm.apply(&crate::fsm::LogEntry::Join {
                node_id: node.into(),
                master_id: Some("m1".into()),
            })
            .unwrap();
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        cluster.watch_failover(move |master| {
            assert_eq!(master, "s1");
            h.fetch_add(1, Ordering::SeqCst);
        });

        fsm.apply(&crate::fsm::LogEntry::FinishFailover(
            crate::fsm::FailoverTask {
                id: "fo".into(),
                old_master_id: "m1".into(),
                new_master_id: "s1".into(),
            },
        ))
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
