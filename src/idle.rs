//! Idle object storage
//!
//! Idle objects live in a doubly-linked list whose nodes are stored in a
//! slab. Borrowers always take from the front; returns go to the front
//! (LIFO) or the back (FIFO). The evictor walks the list with an
//! [`EvictionCursor`] that survives across runs: it remembers its neighbours
//! by slot key, and a key whose slot has since been reused is detected by its
//! generation and treated as a lost position.

use std::time::{Duration, Instant};

/// A pooled object plus the moment it became idle
#[derive(Debug)]
pub(crate) struct IdleEntry<T> {
    pub value: T,
    pub idle_since: Instant,
}

impl<T> IdleEntry<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            idle_since: Instant::now(),
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.idle_since.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Key {
    index: usize,
    generation: u64,
}

/// Direction of an eviction walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Walk {
    /// Front to back
    Forward,
    /// Back to front
    Backward,
}

impl Walk {
    /// Both disciplines keep the oldest objects at the back (LIFO) or the
    /// front (FIFO); the walk starts there.
    pub fn for_lifo(lifo: bool) -> Self {
        if lifo { Self::Backward } else { Self::Forward }
    }
}

/// Resumable position of the evictor in an [`IdleStore`]
#[derive(Debug, Default)]
pub(crate) struct EvictionCursor {
    ahead: Option<Key>,
    behind: Option<Key>,
}

struct Node<T> {
    entry: IdleEntry<T>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Slot<T> {
    generation: u64,
    node: Option<Node<T>>,
}

pub(crate) struct IdleStore<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> Default for IdleStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IdleStore<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_front(&mut self, entry: IdleEntry<T>) {
        self.link(entry, None, self.head);
    }

    pub fn push_back(&mut self, entry: IdleEntry<T>) {
        self.link(entry, self.tail, None);
    }

    pub fn pop_front(&mut self) -> Option<IdleEntry<T>> {
        self.head.map(|idx| self.unlink(idx))
    }

    /// Remove every entry, front to back
    pub fn drain(&mut self) -> Vec<IdleEntry<T>> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(entry) = self.pop_front() {
            out.push(entry);
        }
        out
    }

    /// Remove the next entry of an eviction walk.
    ///
    /// Starts over from the walk's origin when the cursor is fresh, has run
    /// off the end, or its position was removed by someone else.
    pub fn take_at_cursor(&mut self, cursor: &mut EvictionCursor, walk: Walk) -> Option<IdleEntry<T>> {
        let idx = match cursor.ahead.and_then(|key| self.resolve(key)) {
            Some(idx) => idx,
            None => match walk {
                Walk::Forward => self.head?,
                Walk::Backward => self.tail?,
            },
        };
        let node = self.node(idx);
        let (behind, ahead) = match walk {
            Walk::Forward => (node.prev, node.next),
            Walk::Backward => (node.next, node.prev),
        };
        cursor.behind = behind.map(|i| self.key(i));
        cursor.ahead = ahead.map(|i| self.key(i));
        Some(self.unlink(idx))
    }

    /// Put an entry taken by [`take_at_cursor`](Self::take_at_cursor) back
    /// where it came from, so the walk continues past it.
    pub fn restore_at_cursor(&mut self, cursor: &EvictionCursor, walk: Walk, entry: IdleEntry<T>) {
        if let Some(ahead) = cursor.ahead.and_then(|key| self.resolve(key)) {
            match walk {
                Walk::Forward => self.link(entry, self.node(ahead).prev, Some(ahead)),
                Walk::Backward => self.link(entry, Some(ahead), self.node(ahead).next),
            }
        } else if let Some(behind) = cursor.behind.and_then(|key| self.resolve(key)) {
            match walk {
                Walk::Forward => self.link(entry, Some(behind), self.node(behind).next),
                Walk::Backward => self.link(entry, self.node(behind).prev, Some(behind)),
            }
        } else {
            match walk {
                Walk::Forward => self.push_back(entry),
                Walk::Backward => self.push_front(entry),
            }
        }
    }

    fn key(&self, idx: usize) -> Key {
        Key {
            index: idx,
            generation: self.slots[idx].generation,
        }
    }

    fn resolve(&self, key: Key) -> Option<usize> {
        self.slots
            .get(key.index)
            .filter(|slot| slot.generation == key.generation && slot.node.is_some())
            .map(|_| key.index)
    }

    fn node(&self, idx: usize) -> &Node<T> {
        self.slots[idx].node.as_ref().expect("linked slot is occupied")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<T> {
        self.slots[idx].node.as_mut().expect("linked slot is occupied")
    }

    fn link(&mut self, entry: IdleEntry<T>, prev: Option<usize>, next: Option<usize>) {
        let node = Node { entry, prev, next };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx].node = Some(node);
                idx
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                self.slots.len() - 1
            }
        };
        match prev {
            Some(p) => self.node_mut(p).next = Some(idx),
            None => self.head = Some(idx),
        }
        match next {
            Some(n) => self.node_mut(n).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.len += 1;
    }

    fn unlink(&mut self, idx: usize) -> IdleEntry<T> {
        let slot = &mut self.slots[idx];
        let node = slot.node.take().expect("linked slot is occupied");
        slot.generation += 1;
        match node.prev {
            Some(p) => self.node_mut(p).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.node_mut(n).prev = node.prev,
            None => self.tail = node.prev,
        }
        self.free.push(idx);
        self.len -= 1;
        node.entry
    }
}

// Inspection helpers for tests across the crate
#[cfg(test)]
impl<T> IdleStore<T> {
    pub fn pop_back(&mut self) -> Option<IdleEntry<T>> {
        self.tail.map(|idx| self.unlink(idx))
    }

    /// Iterate front to back
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            store: self,
            cursor: self.head,
        }
    }
}

#[cfg(test)]
pub(crate) struct Iter<'a, T> {
    store: &'a IdleStore<T>,
    cursor: Option<usize>,
}

#[cfg(test)]
impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a IdleEntry<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.store.node(self.cursor?);
        self.cursor = node.next;
        Some(&node.entry)
    }
}
