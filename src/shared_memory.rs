//! The per-store list of memory objects attached to a shared WebAssembly
//! memory.
//!
//! The list is doubly linked through indices into an arena of slots. Slot 0
//! is the anchor: it has no owner and no memory object, and it is never
//! removed, so insertion and removal never special-case the head. Freed slots
//! are recycled through a free list.
//!
//! The list is only ever touched while the global registry lock is held.

use crate::instance::{EngineInstance, InstanceId};
use crate::memory_object::MemoryObject;
use std::fmt;
use std::sync::{Arc, Weak};

/// Index of a slot in a [`SharedMemoryList`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct NodeIndex(u32);

impl NodeIndex {
    fn index(self) -> usize {
        self.0 as usize
    }
}

const ANCHOR: NodeIndex = NodeIndex(0);

/// The instance a link node belongs to.
pub(crate) struct Owner {
    pub(crate) id: InstanceId,
    pub(crate) instance: Weak<dyn EngineInstance>,
}

pub(crate) struct Node {
    next: Option<NodeIndex>,
    prev: Option<NodeIndex>,
    /// `None` only for the anchor.
    owner: Option<Owner>,
    /// `None` only for the anchor.
    memory_object: Option<Weak<dyn MemoryObject>>,
}

impl Node {
    pub(crate) fn owner_id(&self) -> Option<InstanceId> {
        self.owner.as_ref().map(|o| o.id)
    }

    pub(crate) fn owner(&self) -> Option<&Owner> {
        self.owner.as_ref()
    }

    /// Resolves the weak memory object reference, if it is still alive.
    pub(crate) fn memory_object(&self) -> Option<Arc<dyn MemoryObject>> {
        self.memory_object.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.memory_object
            .as_ref()
            .is_some_and(|weak| weak.strong_count() == 0)
    }
}

enum Slot {
    Occupied(Node),
    Free,
}

pub(crate) struct SharedMemoryList {
    slots: Vec<Slot>,
    free: Vec<NodeIndex>,
}

impl SharedMemoryList {
    /// Creates a list holding only the anchor.
    pub(crate) fn new() -> SharedMemoryList {
        SharedMemoryList {
            slots: vec![Slot::Occupied(Node {
                next: None,
                prev: None,
                owner: None,
                memory_object: None,
            })],
            free: Vec::new(),
        }
    }

    fn node(&self, index: NodeIndex) -> &Node {
        match &self.slots[index.index()] {
            Slot::Occupied(node) => node,
            Slot::Free => panic!("link node {index:?} is not in use"),
        }
    }

    fn node_mut(&mut self, index: NodeIndex) -> &mut Node {
        match &mut self.slots[index.index()] {
            Slot::Occupied(node) => node,
            Slot::Free => panic!("link node {index:?} is not in use"),
        }
    }

    /// Inserts a node for `owner` immediately after the anchor.
    pub(crate) fn insert_after_anchor(
        &mut self,
        owner: Owner,
        memory_object: Weak<dyn MemoryObject>,
    ) -> NodeIndex {
        let next = self.node(ANCHOR).next;
        let node = Node {
            next,
            prev: Some(ANCHOR),
            owner: Some(owner),
            memory_object: Some(memory_object),
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index.index()] = Slot::Occupied(node);
                index
            }
            None => {
                let index = NodeIndex(
                    u32::try_from(self.slots.len()).expect("too many shared memory link nodes"),
                );
                self.slots.push(Slot::Occupied(node));
                index
            }
        };
        if let Some(next) = next {
            self.node_mut(next).prev = Some(index);
        }
        self.node_mut(ANCHOR).next = Some(index);
        index
    }

    /// Unlinks and frees `index`, returning the node that followed it.
    pub(crate) fn unlink(&mut self, index: NodeIndex) -> Option<NodeIndex> {
        assert!(index != ANCHOR, "the anchor node is never unlinked");
        let (prev, next) = {
            let node = self.node(index);
            (node.prev, node.next)
        };
        if let Some(prev) = prev {
            self.node_mut(prev).next = next;
        }
        if let Some(next) = next {
            self.node_mut(next).prev = prev;
        }
        self.slots[index.index()] = Slot::Free;
        self.free.push(index);
        next
    }

    /// The first node after the anchor.
    pub(crate) fn first(&self) -> Option<NodeIndex> {
        self.node(ANCHOR).next
    }

    /// The node following `index`.
    pub(crate) fn next(&self, index: NodeIndex) -> Option<NodeIndex> {
        self.node(index).next
    }

    pub(crate) fn get(&self, index: NodeIndex) -> &Node {
        self.node(index)
    }

    /// Walks every node after the anchor, unlinking those for which `f`
    /// returns `false`.
    pub(crate) fn retain(&mut self, mut f: impl FnMut(&Node) -> bool) {
        let mut cursor = self.first();
        while let Some(index) = cursor {
            cursor = if f(self.node(index)) {
                self.next(index)
            } else {
                self.unlink(index)
            };
        }
    }

    /// Number of nodes, not counting the anchor.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len() - 1
    }
}

impl fmt::Debug for SharedMemoryList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        let mut cursor = self.first();
        while let Some(index) = cursor {
            list.entry(&self.node(index).owner_id());
            cursor = self.next(index);
        }
        list.finish()
    }
}
