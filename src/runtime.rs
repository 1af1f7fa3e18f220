//! The mutable runtime tree:
//! the per-execution counterpart of the recipe AST. One `Runtime` is built
//! per `Controller::new` call by [`crate::compile`]; it owns every node's
//! state, the storage registry, and the barrier table, and is mutated
//! exclusively by [`crate::scheduler`] on the driver context.

use std::collections::{HashMap, HashSet};

use tokio::task::JoinHandle;

use crate::recipe::{BarrierAdvanceDef, BarrierKey, DoneWith, GroupDef, StorageKey, SyncDef, TaskDef};
use crate::capability::TaskAdapter;
use crate::progress::Progress;
use crate::storage::StorageRegistry;

/// A controller-level storage hook: type erasure is pushed down into
/// the closure itself rather than into this alias, since the generic `T` is
/// only ever known at the `Controller::on_storage_setup`/`on_storage_done`
/// call site — the hook just needs a `&StorageRegistry` to resolve its own
/// active instance through [`crate::storage::StorageRegistry::active`].
pub(crate) type StorageHook = Box<dyn FnOnce(&StorageRegistry) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// `NotStarted → Running → {Succeeded, Failed, Canceled}`. Terminal
/// states are sticky: `is_terminal` is consulted everywhere a transition
/// is about to be applied, to uphold invariant 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Canceled
        )
    }
}

pub(crate) struct RuntimeGroup {
    pub(crate) def: GroupDef,
    pub(crate) children: Vec<NodeId>,
    /// Index of the next not-yet-started child, in declaration order.
    pub(crate) next_to_start: usize,
    /// Children currently `Running` (including ones being cancelled,
    /// pending their acknowledgement).
    pub(crate) running: HashSet<NodeId>,
    pub(crate) any_success: bool,
    pub(crate) any_error: bool,
    pub(crate) first_finished: Option<DoneWith>,
    pub(crate) finished_children: usize,
    /// Set once the policy (or an external force) has decided to stop
    /// starting new children.
    pub(crate) stopping: bool,
    /// Set when this group itself is being cancelled (by a parent's
    /// `StopOn*`, an explicit `cancel()`, or a timeout) rather than
    /// reaching a natural policy-driven outcome.
    pub(crate) force_cancel: bool,
    pub(crate) timer: Option<JoinHandle<()>>,
    /// Whether this group's setup handler returned `Continue` and its
    /// declared storage was actually pushed. Only then must it be popped
    /// again on exit.
    pub(crate) storage_instantiated: bool,
}

pub(crate) struct RuntimeTask {
    pub(crate) def: TaskDef,
    pub(crate) adapter: Option<Box<dyn TaskAdapter>>,
    pub(crate) timer: Option<JoinHandle<()>>,
    /// Set once `request_cancel` has been sent; a later `TaskDone` event
    /// is then treated as the cancellation acknowledgement rather than a
    /// normal outcome.
    pub(crate) cancel_requested: bool,
}

pub(crate) enum RuntimeNodeKind {
    Group(RuntimeGroup),
    Task(RuntimeTask),
    Sync(SyncDef),
    WaitForBarrier(BarrierKey),
    BarrierAdvance(BarrierAdvanceDef),
}

pub(crate) struct RuntimeNode {
    pub(crate) kind: RuntimeNodeKind,
    pub(crate) state: NodeState,
    pub(crate) parent: Option<NodeId>,
}

pub(crate) struct BarrierState {
    pub(crate) required: usize,
    pub(crate) current: usize,
    pub(crate) waiters: HashSet<NodeId>,
}

impl BarrierState {
    pub(crate) fn satisfied(&self) -> bool {
        self.current >= self.required
    }
}

/// The full compiled runtime: node arena, storage registry, barrier
/// table, and progress accounting. Owned exclusively by the driver
/// context; no field here is ever touched from another thread.
pub(crate) struct Runtime {
    pub(crate) nodes: Vec<RuntimeNode>,
    pub(crate) storage: StorageRegistry,
    pub(crate) barriers: HashMap<BarrierKey, BarrierState>,
    pub(crate) progress: Progress,
    pub(crate) root: NodeId,
    /// Hooks registered via `Controller::on_storage_setup`, run once the
    /// root group instantiates its own instance of the matching key. Only ever consulted for `id == root`.
    pub(crate) storage_setup_hooks: HashMap<StorageKey, Vec<StorageHook>>,
    /// Hooks registered via `Controller::on_storage_done`, run on the root
    /// instance just before it is torn down — but only on a natural
    /// terminal transition, never when the controller is dropped mid-run.
    pub(crate) storage_done_hooks: HashMap<StorageKey, Vec<StorageHook>>,
    /// Fallback for a `Group`/`Task` that declared no `with_timeout` of its
    /// own (`EngineConfig::default_timeout`). Applied in
    /// `scheduler::arm_timeout`.
    pub(crate) default_timeout: Option<std::time::Duration>,
}

impl Runtime {
    pub(crate) fn node(&self, id: NodeId) -> &RuntimeNode {
        &self.nodes[id.0 as usize]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut RuntimeNode {
        &mut self.nodes[id.0 as usize]
    }

    pub(crate) fn group_mut(&mut self, id: NodeId) -> &mut RuntimeGroup {
        match &mut self.node_mut(id).kind {
            RuntimeNodeKind::Group(g) => g,
            _ => unreachable!("node {:?} is not a group", id),
        }
    }

    /// Storage keys declared directly on the root node, if it is a group.
    /// Used by `Controller::on_storage_setup`/`on_storage_done` to reject a
    /// key that isn't actually rooted at the top level.
    pub(crate) fn root_storage_keys(&self) -> Vec<StorageKey> {
        match &self.node(self.root).kind {
            RuntimeNodeKind::Group(g) => g.def.storages.iter().map(|d| d.key).collect(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn group(&self, id: NodeId) -> &RuntimeGroup {
        match &self.node(id).kind {
            RuntimeNodeKind::Group(g) => g,
            _ => unreachable!("node {:?} is not a group", id),
        }
    }

    /// `id` followed by every ancestor up to and including the root, nearest
    /// first. This is exactly the search order `StorageRegistry::active`
    /// needs to resolve "the innermost ancestor (including self) that
    /// declared this key" — storage instances are keyed by the `NodeId` of
    /// the group that created them, not by a single global stack, so two
    /// unrelated parallel subtrees can each declare the same key without
    /// clobbering each other.
    pub(crate) fn ancestor_chain(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            chain.push(n);
            cur = self.node(n).parent;
        }
        chain
    }
}
