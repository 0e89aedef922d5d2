//! Intrusive-style LRU list.
//!
//! An index-arena doubly linked list. Inserting returns a [`Link`] that the
//! owner stores next to the element's other state; the link removes the
//! element in O(1) without a key lookup. Links carry a generation so that a
//! stale link (element already removed, slot reused) is detected instead of
//! unlinking the wrong element.
//!
//! Front is the least recently inserted end, back the most recent one.

/// Position of an element inside an [`LruList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Link {
    index: usize,
    generation: u64,
}

/// A node in the linked list.
struct Node<T> {
    value: T,
    generation: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly linked list with O(1) removal by [`Link`].
pub struct LruList<T> {
    /// Node storage (using indices instead of pointers).
    nodes: Vec<Option<Node<T>>>,
    /// Free list of node indices.
    free_list: Vec<usize>,
    /// Least recently inserted element.
    head: Option<usize>,
    /// Most recently inserted element.
    tail: Option<usize>,
    len: usize,
    next_generation: u64,
}

impl<T> Default for LruList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LruList<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free_list: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            next_generation: 0,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append at the most recent end.
    pub fn push_back(&mut self, value: T) -> Link {
        let idx = self.allocate_node();
        let generation = self.next_generation;
        self.next_generation += 1;

        self.nodes[idx] = Some(Node {
            value,
            generation,
            prev: self.tail,
            next: None,
        });

        match self.tail {
            Some(tail_idx) => {
                if let Some(ref mut tail_node) = self.nodes[tail_idx] {
                    tail_node.next = Some(idx);
                }
            }
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;

        Link {
            index: idx,
            generation,
        }
    }

    /// Remove the least recent element.
    pub fn pop_front(&mut self) -> Option<T> {
        let idx = self.head?;
        self.unlink_node(idx)
    }

    /// Remove the most recent element.
    pub fn pop_back(&mut self) -> Option<T> {
        let idx = self.tail?;
        self.unlink_node(idx)
    }

    /// Remove the element at `link`. Returns None if the link is stale.
    pub fn remove(&mut self, link: Link) -> Option<T> {
        if !self.contains(link) {
            return None;
        }
        self.unlink_node(link.index)
    }

    /// Check if `link` still points at a live element.
    pub fn contains(&self, link: Link) -> bool {
        matches!(
            self.nodes.get(link.index),
            Some(Some(node)) if node.generation == link.generation
        )
    }

    /// Get the element at `link`.
    pub fn get(&self, link: Link) -> Option<&T> {
        match self.nodes.get(link.index) {
            Some(Some(node)) if node.generation == link.generation => Some(&node.value),
            _ => None,
        }
    }

    /// Get the element at `link` mutably.
    pub fn get_mut(&mut self, link: Link) -> Option<&mut T> {
        match self.nodes.get_mut(link.index) {
            Some(Some(node)) if node.generation == link.generation => Some(&mut node.value),
            _ => None,
        }
    }

    /// Iterate from least to most recent.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Remove every element, least recent first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(value) = self.pop_front() {
            out.push(value);
        }
        self.nodes.clear();
        self.free_list.clear();
        out
    }

    fn allocate_node(&mut self) -> usize {
        if let Some(idx) = self.free_list.pop() {
            idx
        } else {
            let idx = self.nodes.len();
            self.nodes.push(None);
            idx
        }
    }

    fn unlink_node(&mut self, idx: usize) -> Option<T> {
        let (prev, next, value) = {
            let node = self.nodes[idx].take()?;
            (node.prev, node.next, node.value)
        };

        if let Some(prev_idx) = prev {
            if let Some(ref mut prev_node) = self.nodes[prev_idx] {
                prev_node.next = next;
            }
        } else {
            self.head = next;
        }

        if let Some(next_idx) = next {
            if let Some(ref mut next_node) = self.nodes[next_idx] {
                next_node.prev = prev;
            }
        } else {
            self.tail = prev;
        }

        self.free_list.push(idx);
        self.len -= 1;
        Some(value)
    }
}

/// Iterator over an [`LruList`], least recent first.
pub struct Iter<'a, T> {
    list: &'a LruList<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        let node = self.list.nodes[idx].as_ref()?;
        self.cursor = node.next;
        Some(&node.value)
    }
}
