use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::ConnectionHandle;

#[derive(Debug, Copy, Clone)]
struct Entry {
    time: Instant,
    handle: ConnectionHandle,
}

/// Advisory tick-time queue
///
/// Min-ordered by each connection's self-reported next tick time. At most
/// one entry per connection; a position map makes removal O(log n) so
/// entries can be rescheduled when a connection changes its mind.
#[derive(Debug, Default)]
pub(crate) struct Attq {
    heap: Vec<Entry>,
    pos: FxHashMap<ConnectionHandle, usize>,
}

impl Attq {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    /// Scheduled tick time for `handle`, if queued
    pub(crate) fn adv_time(&self, handle: ConnectionHandle) -> Option<Instant> {
        self.pos.get(&handle).map(|&i| self.heap[i].time)
    }

    pub(crate) fn contains(&self, handle: ConnectionHandle) -> bool {
        self.pos.contains_key(&handle)
    }

    pub(crate) fn add(&mut self, handle: ConnectionHandle, time: Instant) {
        debug_assert!(!self.pos.contains_key(&handle), "connection already queued");
        self.heap.push(Entry { time, handle });
        let i = self.heap.len() - 1;
        self.pos.insert(handle, i);
        self.sift_up(i);
    }

    pub(crate) fn remove(&mut self, handle: ConnectionHandle) {
        let Some(i) = self.pos.remove(&handle) else {
            debug_assert!(false, "removing connection that is not queued");
            return;
        };
        let last = self.heap.len() - 1;
        if i != last {
            self.heap.swap(i, last);
            self.pos.insert(self.heap[i].handle, i);
        }
        self.heap.pop();
        if i < self.heap.len() {
            // The displaced element may have to move either way
            self.sift_up(i);
            self.sift_down(i);
        }
    }

    /// Pop the head entry if its tick time is at or before `now`
    pub(crate) fn pop(&mut self, now: Instant) -> Option<ConnectionHandle> {
        let head = self.heap.first()?;
        if head.time > now {
            return None;
        }
        let handle = head.handle;
        self.remove(handle);
        Some(handle)
    }

    /// Tick time of the earliest entry
    pub(crate) fn next_time(&self) -> Option<Instant> {
        self.heap.first().map(|e| e.time)
    }

    /// Number of entries scheduled strictly before `time`
    pub(crate) fn count_before(&self, time: Instant) -> usize {
        self.heap.iter().filter(|e| e.time < time).count()
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].time <= self.heap[i].time {
                break;
            }
            self.swap(parent, i);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let mut least = i;
            for child in [2 * i + 1, 2 * i + 2] {
                if child < self.heap.len() && self.heap[child].time < self.heap[least].time {
                    least = child;
                }
            }
            if least == i {
                return;
            }
            self.swap(i, least);
            i = least;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.pos.insert(self.heap[a].handle, a);
        self.pos.insert(self.heap[b].handle, b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(base: Instant, micros: u64) -> Instant {
        base + Duration::from_micros(micros)
    }

    #[test]
    fn pops_due_entries_in_order() {
        let base = Instant::now();
        let mut attq = Attq::new();
        attq.add(ConnectionHandle(1), at(base, 300));
        attq.add(ConnectionHandle(2), at(base, 100));
        attq.add(ConnectionHandle(3), at(base, 200));

        assert_eq!(attq.next_time(), Some(at(base, 100)));
        assert_eq!(attq.pop(at(base, 250)), Some(ConnectionHandle(2)));
        assert_eq!(attq.pop(at(base, 250)), Some(ConnectionHandle(3)));
        assert_eq!(attq.pop(at(base, 250)), None);
        assert_eq!(attq.len(), 1);
    }

    #[test]
    fn entry_due_exactly_now_pops() {
        let base = Instant::now();
        let mut attq = Attq::new();
        attq.add(ConnectionHandle(7), at(base, 100));
        assert_eq!(attq.pop(at(base, 100)), Some(ConnectionHandle(7)));
    }

    #[test]
    fn remove_from_middle_keeps_order() {
        let base = Instant::now();
        let mut attq = Attq::new();
        for i in 0..10usize {
            attq.add(ConnectionHandle(i), at(base, (i as u64 * 37) % 100));
        }
        attq.remove(ConnectionHandle(4));
        attq.remove(ConnectionHandle(0));
        assert_eq!(attq.len(), 8);

        let mut last = None;
        while let Some(next) = attq.next_time() {
            if let Some(prev) = last {
                assert!(next >= prev);
            }
            last = Some(next);
            attq.pop(at(base, 1000)).unwrap();
        }
    }

    #[test]
    fn reschedule_via_remove_and_add() {
        let base = Instant::now();
        let mut attq = Attq::new();
        attq.add(ConnectionHandle(1), at(base, 500));
        assert_eq!(attq.adv_time(ConnectionHandle(1)), Some(at(base, 500)));
        attq.remove(ConnectionHandle(1));
        attq.add(ConnectionHandle(1), at(base, 50));
        assert_eq!(attq.adv_time(ConnectionHandle(1)), Some(at(base, 50)));
        assert_eq!(attq.next_time(), Some(at(base, 50)));
    }

    #[test]
    fn count_before_is_strict() {
        let base = Instant::now();
        let mut attq = Attq::new();
        attq.add(ConnectionHandle(1), at(base, 100));
        attq.add(ConnectionHandle(2), at(base, 200));
        attq.add(ConnectionHandle(3), at(base, 300));
        assert_eq!(attq.count_before(at(base, 200)), 1);
        assert_eq!(attq.count_before(at(base, 201)), 2);
        assert_eq!(attq.count_before(at(base, 1000)), 3);
    }
}
