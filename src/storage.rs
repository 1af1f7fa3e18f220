//! Typed storage registry with per-key shadowing. Modeled as an arena
//! indexed by `(NodeId, StorageKey)`: each entry is the one instance the
//! owning group instantiated for that key. Shadowing is resolved by
//! walking the declaring node's ancestor chain (nearest first) and
//! returning the first entry found — keying by owner rather than by a
//! single stack-per-key means two unrelated groups running concurrently
//! (e.g. parallel siblings) can each declare the same key without one
//! clobbering the other's instance.
//!
//! No internal locking: storage is mutated only by handlers, and
//! handlers are totally ordered on the driver context. Each boxed entry's
//! concrete type is `RefCell<T>` (see `recipe::StorageDecl::erase`), so a
//! single downcast at read time yields interior mutability without any
//! registry-wide lock.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;

use crate::recipe::StorageKey;
use crate::runtime::NodeId;

pub(crate) struct StorageRegistry {
    instances: HashMap<(NodeId, StorageKey), Box<dyn Any + Send>>,
}

impl StorageRegistry {
    pub(crate) fn new() -> Self {
        StorageRegistry {
            instances: HashMap::new(),
        }
    }

    /// Instantiate `key` for `owner`. `boxed` must be a `Box<RefCell<T>>`
    /// coerced to `Box<dyn Any + Send>` (see `recipe::ErasedStorageDecl::make`).
    /// Called when a group that declares `key` enters `Running`.
    pub(crate) fn push(&mut self, owner: NodeId, key: StorageKey, boxed: Box<dyn Any + Send>) {
        self.instances.insert((owner, key), boxed);
    }

    /// Destroy `owner`'s instance of `key`. Called when the declaring group
    /// exits, after its done handler runs.
    pub(crate) fn pop(&mut self, owner: NodeId, key: StorageKey) {
        self.instances.remove(&(owner, key));
    }

    /// Resolve the active instance for `key` as seen from `chain` (the
    /// declaring node's own id, then its ancestors, nearest first — see
    /// [`crate::runtime::Runtime::ancestor_chain`]): the first entry
    /// belonging to any node on the chain. Panics if `key` is not active on
    /// this chain at all — a programmer error (the handler referenced a
    /// `StorageDecl` that is not an ancestor of its owning node), analogous
    /// to indexing out of bounds.
    pub(crate) fn active<T: 'static>(&self, chain: &[NodeId], key: StorageKey) -> &RefCell<T> {
        let boxed = chain
            .iter()
            .find_map(|node| self.instances.get(&(*node, key)))
            .unwrap_or_else(|| panic!("storage key not active on this path"));
        boxed
            .downcast_ref::<RefCell<T>>()
            .expect("storage type mismatch for key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadowing_reads_innermost_instance() {
        let key = StorageKey(1);
        let outer = NodeId(0);
        let inner = NodeId(1);
        let mut reg = StorageRegistry::new();
        reg.push(outer, key, Box::new(RefCell::new(1i32)));
        assert_eq!(*reg.active::<i32>(&[outer], key).borrow(), 1);

        // Inner's chain is [inner, outer]: it resolves to its own instance
        // when present, falling through to the ancestor's otherwise.
        reg.push(inner, key, Box::new(RefCell::new(2i32)));
        assert_eq!(*reg.active::<i32>(&[inner, outer], key).borrow(), 2);
        assert_eq!(*reg.active::<i32>(&[outer], key).borrow(), 1);

        reg.pop(inner, key);
        assert_eq!(*reg.active::<i32>(&[inner, outer], key).borrow(), 1);
    }

    #[test]
    fn unrelated_siblings_declaring_same_key_do_not_clobber_each_other() {
        let key = StorageKey(7);
        let sibling_a = NodeId(10);
        let sibling_b = NodeId(11);
        let mut reg = StorageRegistry::new();
        reg.push(sibling_a, key, Box::new(RefCell::new("a".to_string())));
        reg.push(sibling_b, key, Box::new(RefCell::new("b".to_string())));

        assert_eq!(*reg.active::<String>(&[sibling_a], key).borrow(), "a");
        assert_eq!(*reg.active::<String>(&[sibling_b], key).borrow(), "b");
    }
}
