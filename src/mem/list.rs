//! Doubly linked lists whose nodes are named by handles.
//!
//! A [`List`] only stores its ends and length. The links themselves live
//! next to the nodes, and a [`Nodes`] implementation resolves a handle (a
//! page index or the address of a descriptor) to its [`Link`]. This way a
//! page can move between a buddy pool and a per-CPU cache, or a slab between
//! queues, without the list owning any node memory.
//!
//! Links are atomics so the node can be shared, but a link must only be
//! changed by whoever holds the lock protecting the list the node is on.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Marks the end of a list.
const END: usize = usize::MAX - 1;
/// Marks a node that is not on any list.
const DETACHED: usize = usize::MAX;

/// The link of a node.
pub struct Link {
    prev: AtomicUsize,
    next: AtomicUsize,
}

impl Link {
    /// Create a link that is not on any list.
    pub const fn new() -> Self {
        Self {
            prev: AtomicUsize::new(DETACHED),
            next: AtomicUsize::new(DETACHED),
        }
    }

    /// Returns whether the node is currently on a list.
    pub fn is_linked(&self) -> bool {
        self.next.load(Ordering::Relaxed) != DETACHED
    }

    fn prev(&self) -> usize {
        self.prev.load(Ordering::Relaxed)
    }

    fn next(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }

    fn set(&self, prev: usize, next: usize) {
        self.prev.store(prev, Ordering::Relaxed);
        self.next.store(next, Ordering::Relaxed);
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves node handles to their links.
pub trait Nodes {
    /// Returns the link of `node`.
    fn link(&self, node: usize) -> &Link;
}

impl Nodes for [Link] {
    fn link(&self, node: usize) -> &Link {
        &self[node]
    }
}

/// A list of nodes.
#[derive(Debug)]
pub struct List {
    head: usize,
    tail: usize,
    len: usize,
}

impl List {
    /// Create a new, empty list.
    pub const fn new() -> Self {
        Self {
            head: END,
            tail: END,
            len: 0,
        }
    }

    /// Returns the number of nodes on this list.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether this list is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the first node without removing it.
    pub fn front(&self) -> Option<usize> {
        if self.head == END {
            None
        } else {
            Some(self.head)
        }
    }

    /// Appends `node` to the end of this list.
    ///
    /// Panics if `node` is already on a list.
    pub fn push_back<N: Nodes + ?Sized>(&mut self, nodes: &N, node: usize) {
        let link = nodes.link(node);
        assert!(!link.is_linked(), "node {:#x} is already on a list", node);

        link.set(self.tail, END);
        if self.tail == END {
            self.head = node;
        } else {
            nodes.link(self.tail).next.store(node, Ordering::Relaxed);
        }
        self.tail = node;
        self.len += 1;
    }

    /// Removes the first node of this list.
    pub fn pop_front<N: Nodes + ?Sized>(&mut self, nodes: &N) -> Option<usize> {
        let node = self.front()?;
        self.remove(nodes, node);
        Some(node)
    }

    /// Removes the last node of this list.
    pub fn pop_back<N: Nodes + ?Sized>(&mut self, nodes: &N) -> Option<usize> {
        if self.tail == END {
            return None;
        }
        let node = self.tail;
        self.remove(nodes, node);
        Some(node)
    }

    /// Unlinks `node` from this list.
    ///
    /// `node` must be on this list, not on a different one.
    pub fn remove<N: Nodes + ?Sized>(&mut self, nodes: &N, node: usize) {
        let link = nodes.link(node);
        assert!(link.is_linked(), "node {:#x} is not on a list", node);
        self.len = self
            .len
            .checked_sub(1)
            .unwrap_or_else(|| panic!("removing node {:#x} from an empty list", node));

        let (prev, next) = (link.prev(), link.next());
        if prev == END {
            assert_eq!(self.head, node, "node {:#x} is on a different list", node);
            self.head = next;
        } else {
            nodes.link(prev).next.store(next, Ordering::Relaxed);
        }

        if next == END {
            self.tail = prev;
        } else {
            nodes.link(next).prev.store(prev, Ordering::Relaxed);
        }

        link.set(DETACHED, DETACHED);
    }

    /// Returns an iterator over the handles of this list, front to back.
    pub fn iter<'a, N: Nodes + ?Sized>(&'a self, nodes: &'a N) -> Iter<'a, N> {
        Iter {
            nodes,
            next: self.head,
        }
    }
}

impl Default for List {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the handles of a [`List`].
pub struct Iter<'a, N: ?Sized> {
    nodes: &'a N,
    next: usize,
}

impl<N: Nodes + ?Sized> Iterator for Iter<'_, N> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.next == END {
            return None;
        }
        let node = self.next;
        self.next = self.nodes.link(node).next();
        Some(node)
    }
}
