//! LRU Ring Module
//!
//! Arena-backed circular doubly-linked list with a sentinel header.
//!
//! `header.after` is the least recently used node, `header.before` the most
//! recently used. The header always exists; an empty ring has both of its
//! links pointing at itself. A node may live in the arena while unlinked, in
//! which case both of its links are `None`.

/// Stable index of a node in the ring's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// The sentinel header's id.
pub const HEADER: NodeId = NodeId(0);

#[derive(Debug)]
struct Node<T> {
    value: Option<T>,
    before: Option<NodeId>,
    after: Option<NodeId>,
}

// == LRU Ring ==
#[derive(Debug)]
pub struct LruRing<T> {
    nodes: Vec<Node<T>>,
    free: Vec<usize>,
    linked: usize,
}

impl<T> Default for LruRing<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LruRing<T> {
    // == Constructor ==
    /// Creates a ring holding only the header.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                value: None,
                before: Some(HEADER),
                after: Some(HEADER),
            }],
            free: Vec::new(),
            linked: 0,
        }
    }

    // == Allocation ==
    /// Stores `value` in the arena without linking it.
    pub fn insert(&mut self, value: T) -> NodeId {
        let node = Node {
            value: Some(value),
            before: None,
            after: None,
        };
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                NodeId(slot)
            }
            None => {
                self.nodes.push(node);
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    /// Unlinks (if needed) and frees a node, returning its value.
    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        if id == HEADER {
            return None;
        }
        self.unlink(id);
        let value = self.nodes.get_mut(id.0)?.value.take()?;
        self.free.push(id.0);
        Some(value)
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        self.nodes.get(id.0).and_then(|n| n.value.as_ref())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.nodes.get_mut(id.0).and_then(|n| n.value.as_mut())
    }

    // == Linking ==
    /// Links an unlinked node at the most recently used end.
    pub fn link_mru(&mut self, id: NodeId) {
        if id == HEADER || self.is_linked(id) {
            return;
        }
        let last = self.nodes[HEADER.0].before.unwrap_or(HEADER);
        self.nodes[id.0].before = Some(last);
        self.nodes[id.0].after = Some(HEADER);
        self.nodes[last.0].after = Some(id);
        self.nodes[HEADER.0].before = Some(id);
        self.linked += 1;
    }

    /// Unlinks a node, returning the node that followed it.
    ///
    /// Returns `None` when the node was not linked.
    pub fn unlink(&mut self, id: NodeId) -> Option<NodeId> {
        if id == HEADER {
            return None;
        }
        let node = self.nodes.get_mut(id.0)?;
        let (before, after) = (node.before.take()?, node.after.take()?);
        self.nodes[before.0].after = Some(after);
        self.nodes[after.0].before = Some(before);
        self.linked -= 1;
        Some(after)
    }

    /// Moves a node to the most recently used end.
    pub fn touch(&mut self, id: NodeId) {
        self.unlink(id);
        self.link_mru(id);
    }

    pub fn is_linked(&self, id: NodeId) -> bool {
        self.nodes
            .get(id.0)
            .map_or(false, |n| n.before.is_some() && n.after.is_some())
    }

    // == Navigation ==
    /// The least recently used node, if any.
    pub fn lru(&self) -> Option<NodeId> {
        self.after(HEADER).filter(|&id| id != HEADER)
    }

    /// The most recently used node, if any.
    pub fn mru(&self) -> Option<NodeId> {
        self.nodes[HEADER.0].before.filter(|&id| id != HEADER)
    }

    /// The node after `id`; `HEADER` once the end is reached.
    pub fn after(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id.0).and_then(|n| n.after)
    }

    /// Linked node ids from least to most recently used.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids = Vec::with_capacity(self.linked);
        let mut cursor = self.after(HEADER);
        while let Some(id) = cursor.filter(|&id| id != HEADER) {
            ids.push(id);
            cursor = self.after(id);
        }
        ids
    }

    /// Values currently in the arena, linked or not.
    #[cfg(test)]
    fn values(&self) -> impl Iterator<Item = &T> {
        self.nodes.iter().filter_map(|n| n.value.as_ref())
    }

    // == Length ==
    /// Returns the number of linked nodes.
    pub fn len(&self) -> usize {
        self.linked
    }

    // == Is Empty ==
    pub fn is_empty(&self) -> bool {
        self.linked == 0
    }

    /// Drops every node, leaving only the header.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}
