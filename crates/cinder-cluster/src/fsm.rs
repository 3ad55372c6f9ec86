//! The replicated topology state machine.
//!
//! Holds slot→node ownership, master/slave relationships, and the
//! in-flight migration and failover tasks. Log entries are applied
//! under the write lock; reads take the read lock. `node2slot` and
//! `slave_masters` are derived maps, rebuilt on snapshot restore from
//! the minimal persisted set `{slot2node, migratings, master_slaves}`.
//!
//! A `changed` hook fires after every apply and restore; the router
//! uses it to notice that this node's own master changed and
//! reconfigure.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Cluster nodes are identified by their advertised address.
pub type NodeId = String;

/// An in-flight slot migration. Immutable once proposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigratingTask {
    pub id: String,
    pub src_node: NodeId,
    pub target_node: NodeId,
    pub slots: Vec<u32>,
}

/// An in-flight failover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverTask {
    pub id: String,
    pub old_master_id: NodeId,
    pub new_master_id: NodeId,
}

/// A master and its replica set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterSlave {
    pub master_id: NodeId,
    pub slaves: Vec<NodeId>,
}

/// Replicated log entries. All topology transitions take this form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    /// Assign every slot to the seed leader and register it as a
    /// master with no slaves.
    SeedStart { leader: NodeId, slot_count: u32 },
    /// Add a node; as a master when `master_id` is `None`, else as a
    /// slave of the named master (which must exist).
    Join {
        node_id: NodeId,
        master_id: Option<NodeId>,
    },
    StartMigrate(MigratingTask),
    /// Remove the task and transfer its slots from source to target.
    FinishMigrate(MigratingTask),
    StartFailover(FailoverTask),
    /// Move the old master's slaves and slots to the new master and
    /// demote the old master to a slave of the new one.
    FinishFailover(FailoverTask),
}

/// The mutable state behind the FSM lock.
#[derive(Debug, Default, Clone)]
pub struct FsmState {
    pub slot2node: HashMap<u32, NodeId>,
    /// Derived: node → sorted slot ids.
    pub node2slot: HashMap<NodeId, Vec<u32>>,
    pub master_slaves: HashMap<NodeId, MasterSlave>,
    /// Derived: slave → master.
    pub slave_masters: HashMap<NodeId, NodeId>,
    pub migratings: HashMap<String, MigratingTask>,
    pub failovers: HashMap<String, FailoverTask>,
}

/// The minimal persisted form. Derived maps are rebuilt on restore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsmSnapshot {
    pub slot2node: HashMap<u32, NodeId>,
    pub migratings: HashMap<String, MigratingTask>,
    pub master_slaves: HashMap<NodeId, MasterSlave>,
}

type ChangedHook = Box<dyn Fn(&FsmState) + Send + Sync>;

/// The topology FSM.
#[derive(Default)]
pub struct TopologyFsm {
    state: RwLock<FsmState>,
    changed: RwLock<Option<ChangedHook>>,
}

impl TopologyFsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the hook invoked after every apply and restore.
    pub fn set_changed_hook(&self, hook: impl Fn(&FsmState) + Send + Sync + 'static) {
        *self
            .changed
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    /// Runs `f` with the state under the read lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&FsmState) -> R) -> R {
        f(&self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// The node owning a slot, if assigned.
    pub fn node_of_slot(&self, slot: u32) -> Option<NodeId> {
        self.with_state(|s| s.slot2node.get(&slot).cloned())
    }

    /// The sorted slots owned by a node.
    pub fn slots_of_node(&self, node: &str) -> Vec<u32> {
        self.with_state(|s| s.node2slot.get(node).cloned().unwrap_or_default())
    }

    /// The master a slave replicates, if any.
    pub fn master_of(&self, node: &str) -> Option<NodeId> {
        self.with_state(|s| s.slave_masters.get(node).cloned())
    }

    /// Applies one committed log entry. Returns a description of the
    /// rejection when the entry cannot apply (unknown master, etc.);
    /// re-applying an already-finished task is a no-op, keeping
    /// FinishMigrate/FinishFailover idempotent.
    pub fn apply(&self, entry: &LogEntry) -> Result<(), String> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let result = Self::apply_locked(&mut state, entry);
        if result.is_ok() {
            if let Some(hook) = &*self.changed.read().unwrap_or_else(PoisonError::into_inner) {
                hook(&state);
            }
        }
        result
    }

    fn apply_locked(state: &mut FsmState, entry: &LogEntry) -> Result<(), String> {
        match entry {
            LogEntry::SeedStart { leader, slot_count } => {
                let slots: Vec<u32> = (0..*slot_count).collect();
                for slot in &slots {
                    state.slot2node.insert(*slot, leader.clone());
                }
                state.node2slot.insert(leader.clone(), slots);
                add_node(state, leader, None)?;
                info!(leader = %leader, slots = slot_count, "cluster seeded");
            }
            LogEntry::Join { node_id, master_id } => {
                add_node(state, node_id, master_id.as_deref())?;
                info!(node = %node_id, master = ?master_id, "node joined");
            }
            LogEntry::StartMigrate(task) => {
                state.migratings.insert(task.id.clone(), task.clone());
            }
            LogEntry::FinishMigrate(task) => {
                if state.migratings.remove(&task.id).is_none() {
                    // already applied; finishing twice must be harmless
                    return Ok(());
                }
                add_slots(state, &task.target_node, &task.slots);
                remove_slots(state, &task.src_node, &task.slots);
                info!(task = %task.id, slots = task.slots.len(), "migration finished");
            }
            LogEntry::StartFailover(task) => {
                state.failovers.insert(task.id.clone(), task.clone());
            }
            LogEntry::FinishFailover(task) => {
                failover(state, &task.old_master_id, &task.new_master_id)?;
                let slots = state
                    .node2slot
                    .get(&task.old_master_id)
                    .cloned()
                    .unwrap_or_default();
                add_slots(state, &task.new_master_id, &slots);
                remove_slots(state, &task.old_master_id, &slots);
                state.failovers.remove(&task.id);
                info!(
                    old = %task.old_master_id,
                    new = %task.new_master_id,
                    "failover finished"
                );
            }
        }
        Ok(())
    }

    /// The minimal persistent snapshot of the current state.
    pub fn snapshot(&self) -> FsmSnapshot {
        self.with_state(|s| FsmSnapshot {
            slot2node: s.slot2node.clone(),
            migratings: s.migratings.clone(),
            master_slaves: s.master_slaves.clone(),
        })
    }

    /// Replaces the state from a snapshot, rebuilding the derived maps.
    pub fn restore(&self, snapshot: FsmSnapshot) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let mut node2slot: HashMap<NodeId, Vec<u32>> = HashMap::new();
        for (slot, node) in &snapshot.slot2node {
            node2slot.entry(node.clone()).or_default().push(*slot);
        }
        for slots in node2slot.values_mut() {
            slots.sort_unstable();
        }

        let mut slave_masters = HashMap::new();
        for (master, ms) in &snapshot.master_slaves {
            for slave in &ms.slaves {
                slave_masters.insert(slave.clone(), master.clone());
            }
        }

        *state = FsmState {
            slot2node: snapshot.slot2node,
            node2slot,
            master_slaves: snapshot.master_slaves,
            slave_masters,
            migratings: snapshot.migratings,
            failovers: HashMap::new(),
        };

        if let Some(hook) = &*self.changed.read().unwrap_or_else(PoisonError::into_inner) {
            hook(&state);
        }
    }
}

/// Inserts slots into a node's sorted slot list and points the
/// slot→node map at it.
fn add_slots(state: &mut FsmState, node: &str, slots: &[u32]) {
    let list = state.node2slot.entry(node.to_owned()).or_default();
    for &slot in slots {
        if let Err(pos) = list.binary_search(&slot) {
            list.insert(pos, slot);
        }
        state.slot2node.insert(slot, node.to_owned());
    }
}

/// Removes slots from a node's list; slot→node entries still naming
/// the node are dropped.
fn remove_slots(state: &mut FsmState, node: &str, slots: &[u32]) {
    if let Some(list) = state.node2slot.get_mut(node) {
        for &slot in slots {
            if let Ok(pos) = list.binary_search(&slot) {
                list.remove(pos);
            }
            if state.slot2node.get(&slot).map(String::as_str) == Some(node) {
                state.slot2node.remove(&slot);
            }
        }
    }
}

/// Registers a node: a fresh master, or a slave of an existing master.
fn add_node(state: &mut FsmState, id: &str, master_id: Option<&str>) -> Result<(), String> {
    match master_id {
        None => {
            state
                .master_slaves
                .entry(id.to_owned())
                .or_insert_with(|| MasterSlave {
                    master_id: id.to_owned(),
                    slaves: Vec::new(),
                });
        }
        Some(master_id) => {
            let Some(master) = state.master_slaves.get_mut(master_id) else {
                return Err(format!("master {master_id} not found"));
            };
            if !master.slaves.iter().any(|s| s == id) {
                master.slaves.push(id.to_owned());
            }
            state.slave_masters.insert(id.to_owned(), master_id.to_owned());
        }
    }
    Ok(())
}

/// Moves `old`'s replica set under `new`: surviving slaves re-point to
/// `new`, `old` itself becomes a slave of `new`, and `new` stops being
/// anyone's slave.
fn failover(state: &mut FsmState, old: &str, new: &str) -> Result<(), String> {
    let Some(old_entry) = state.master_slaves.remove(old) else {
        return Err(format!("failover: master {old} not found"));
    };

    let mut new_slaves = Vec::with_capacity(old_entry.slaves.len() + 1);
    for slave in old_entry.slaves {
        if slave != new {
            state.slave_masters.insert(slave.clone(), new.to_owned());
            new_slaves.push(slave);
        }
    }
    state.slave_masters.insert(old.to_owned(), new.to_owned());
    new_slaves.push(old.to_owned());

    state.slave_masters.remove(new);
    state.master_slaves.insert(
        new.to_owned(),
        MasterSlave {
            master_id: new.to_owned(),
            slaves: new_slaves,
        },
    );
    Ok(())
}
