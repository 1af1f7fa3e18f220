//! The canonical handler context:
//! every handler — group setup/done, task setup/done, Sync — is invoked
//! internally with this single full-argument type, and the builder layer
//! in `recipe::builder` offers narrower zero/one-argument sugar on top of
//! it. Nothing about `HandlerCtx` is serialized or persisted.

use std::cell::{Ref, RefMut};

use crate::recipe::StorageDecl;
use crate::runtime::NodeId;
use crate::storage::StorageRegistry;

pub struct HandlerCtx<'a> {
    pub(crate) storage: &'a StorageRegistry,
    pub(crate) node: NodeId,
    /// `node` then its ancestors up to the root, nearest first — see
    /// `runtime::Runtime::ancestor_chain`.
    pub(crate) chain: Vec<NodeId>,
}

impl<'a> HandlerCtx<'a> {
    pub(crate) fn new(storage: &'a StorageRegistry, node: NodeId, chain: Vec<NodeId>) -> Self {
        HandlerCtx { storage, node, chain }
    }

    /// The node this handler is running for.
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Resolve the active instance of `decl` on the path from root to this
    /// handler's owning node — the innermost ancestor (including self)
    /// that declared it.
    pub fn storage<T: Send + 'static>(&self, decl: &StorageDecl<T>) -> StorageRef<'_, T> {
        StorageRef {
            cell: self.storage.active::<T>(&self.chain, decl.key()),
        }
    }
}

/// Accessor for an active storage instance, mirroring `RefCell`'s own
/// borrow API.
pub struct StorageRef<'a, T> {
    cell: &'a std::cell::RefCell<T>,
}

impl<'a, T> StorageRef<'a, T> {
    pub fn borrow(&self) -> Ref<'_, T> {
        self.cell.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.cell.borrow_mut()
    }
}
