//! Compiles an immutable [`crate::recipe::RecipeNode`] tree into a fresh
//! [`crate::runtime::Runtime`]: assigns every node a stable
//! `NodeId`, links barrier waiters to the barriers they reference, and
//! counts asynchronous leaves for `progress_maximum`.
//!
//! Validation here is warn-and-fix, never a hard error: a recipe
//! always compiles. Duplicate group-setup/-done handlers and duplicate
//! mode/policy assignments can't actually occur because `GroupDef`'s
//! builder methods overwrite a single field — "last write wins" falls out
//! of that representation for free. The one case that needs an explicit
//! pass is duplicate `StorageDecl`s of the same key declared on one
//! group, since `storages` is a `Vec` that the builder only ever appends
//! to.

use std::collections::HashMap;

use crate::recipe::{BarrierDecl, RecipeNode};
use crate::runtime::{
    BarrierState, NodeId, NodeState, Runtime, RuntimeGroup, RuntimeNode, RuntimeNodeKind,
};
use crate::storage::StorageRegistry;

pub(crate) fn compile(recipe: RecipeNode) -> Runtime {
    let mut nodes = Vec::new();
    let mut barriers: HashMap<crate::recipe::BarrierKey, BarrierState> = HashMap::new();
    let mut progress_maximum = 0usize;

    let root = build_node(
        recipe,
        None,
        &mut nodes,
        &mut barriers,
        &mut progress_maximum,
    );

    Runtime {
        nodes,
        storage: StorageRegistry::new(),
        barriers,
        progress: crate::progress::Progress::new(progress_maximum),
        root,
        storage_setup_hooks: HashMap::new(),
        storage_done_hooks: HashMap::new(),
        default_timeout: None,
    }
}

fn ensure_barrier(
    barriers: &mut HashMap<crate::recipe::BarrierKey, BarrierState>,
    decl: &BarrierDecl,
) {
    barriers.entry(decl.key()).or_insert_with(|| BarrierState {
        required: decl.required_advances(),
        current: 0,
        waiters: Default::default(),
    });
}

fn build_node(
    node: RecipeNode,
    parent: Option<NodeId>,
    nodes: &mut Vec<RuntimeNode>,
    barriers: &mut HashMap<crate::recipe::BarrierKey, BarrierState>,
    progress_maximum: &mut usize,
) -> NodeId {
    match node {
        RecipeNode::Group(mut def) => {
            dedupe_storages(&mut def);
            let id = NodeId(nodes.len() as u32);
            // Reserve the slot so children can be built before we know our
            // own final index... actually we need our own id before
            // recursing so children can record it as `parent`. Push a
            // placeholder, then overwrite once children are built.
            nodes.push(placeholder(parent));
            let mut children = Vec::with_capacity(def.children.len());
            let taken_children = std::mem::take(&mut def.children);
            for child in taken_children {
                children.push(build_node(child, Some(id), nodes, barriers, progress_maximum));
            }
            nodes[id.0 as usize] = RuntimeNode {
                kind: RuntimeNodeKind::Group(RuntimeGroup {
                    def,
                    children,
                    next_to_start: 0,
                    running: Default::default(),
                    any_success: false,
                    any_error: false,
                    first_finished: None,
                    finished_children: 0,
                    stopping: false,
                    force_cancel: false,
                    timer: None,
                    storage_instantiated: false,
                }),
                state: NodeState::NotStarted,
                parent,
            };
            id
        }
        RecipeNode::Task(def) => {
            *progress_maximum += 1;
            let id = NodeId(nodes.len() as u32);
            nodes.push(RuntimeNode {
                kind: RuntimeNodeKind::Task(crate::runtime::RuntimeTask {
                    def,
                    adapter: None,
                    timer: None,
                    cancel_requested: false,
                }),
                state: NodeState::NotStarted,
                parent,
            });
            id
        }
        RecipeNode::Sync(def) => {
            let id = NodeId(nodes.len() as u32);
            nodes.push(RuntimeNode {
                kind: RuntimeNodeKind::Sync(def),
                state: NodeState::NotStarted,
                parent,
            });
            id
        }
        RecipeNode::WaitForBarrier(w) => {
            ensure_barrier(barriers, &w.barrier);
            *progress_maximum += 1;
            let id = NodeId(nodes.len() as u32);
            nodes.push(RuntimeNode {
                kind: RuntimeNodeKind::WaitForBarrier(w.barrier.key()),
                state: NodeState::NotStarted,
                parent,
            });
            id
        }
        RecipeNode::BarrierAdvance(adv) => {
            ensure_barrier(barriers, &adv.barrier);
            let id = NodeId(nodes.len() as u32);
            nodes.push(RuntimeNode {
                kind: RuntimeNodeKind::BarrierAdvance(adv),
                state: NodeState::NotStarted,
                parent,
            });
            id
        }
    }
}

fn placeholder(parent: Option<NodeId>) -> RuntimeNode {
    RuntimeNode {
        kind: RuntimeNodeKind::Group(RuntimeGroup {
            def: crate::recipe::builder::empty_group_def(),
            children: Vec::new(),
            next_to_start: 0,
            running: Default::default(),
            any_success: false,
            any_error: false,
            first_finished: None,
            finished_children: 0,
            stopping: false,
            force_cancel: false,
            timer: None,
            storage_instantiated: false,
        }),
        state: NodeState::NotStarted,
        parent,
    }
}

fn dedupe_storages(def: &mut crate::recipe::GroupDef) {
    let mut seen = std::collections::HashSet::new();
    let before = def.storages.len();
    def.storages.retain(|decl| seen.insert(decl.key));
    if def.storages.len() != before {
        tracing::warn!("dropped duplicate storage declaration(s) on a group");
    }
}
