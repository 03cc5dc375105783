use std::time::Instant;

use crate::ConnectionHandle;

/// Array-backed min-heap of connections keyed by a timestamp
///
/// Backs both the tickable queue (keyed by `last_ticked`) and the outgoing
/// queue (keyed by `last_sent`). Capacity is managed by the engine, which
/// grows both queues in lockstep before admitting a new connection; `insert`
/// itself never allocates.
#[derive(Debug, Default)]
pub(crate) struct ConnHeap {
    els: Vec<(Instant, ConnectionHandle)>,
    nalloc: usize,
}

impl ConnHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.els.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.els.is_empty()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.nalloc
    }

    /// Raise capacity to `nalloc` elements
    pub(crate) fn grow_to(&mut self, nalloc: usize) {
        debug_assert!(nalloc >= self.nalloc);
        self.els.reserve(nalloc - self.els.len());
        self.nalloc = nalloc;
    }

    pub(crate) fn insert(&mut self, key: Instant, handle: ConnectionHandle) {
        debug_assert!(self.els.len() < self.nalloc, "heap insert past capacity");
        self.els.push((key, handle));
        self.sift_up(self.els.len() - 1);
    }

    pub(crate) fn pop(&mut self) -> Option<(Instant, ConnectionHandle)> {
        if self.els.is_empty() {
            return None;
        }
        let root = self.els.swap_remove(0);
        if !self.els.is_empty() {
            self.sift_down(0);
        }
        Some(root)
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.els[parent].0 <= self.els[i].0 {
                break;
            }
            self.els.swap(parent, i);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let mut least = i;
            for child in [2 * i + 1, 2 * i + 2] {
                if child < self.els.len() && self.els[child].0 < self.els[least].0 {
                    least = child;
                }
            }
            if least == i {
                return;
            }
            self.els.swap(i, least);
            i = least;
        }
    }

    /// How many entries reference `handle`; queue membership audits only
    #[cfg(test)]
    pub(crate) fn count_of(&self, handle: ConnectionHandle) -> usize {
        self.els.iter().filter(|(_, h)| *h == handle).count()
    }
}
