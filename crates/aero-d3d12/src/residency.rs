//! Residency bookkeeping for GPU heap allocations.
//!
//! Every native allocation that can be paged out under memory pressure
//! carries a [`Pageable`]: the serials of its last recorded use and last
//! submission, a lock refcount that pins it resident while a command list
//! actively binds it, and a membership flag for the residency LRU.
//!
//! Usage and submission serials are tracked separately on purpose: command
//! recording touches a heap long before the command list is submitted, so
//! eviction decisions must key off the submission serial; evicting against
//! the usage serial could page out memory a not-yet-submitted command list
//! still depends on.

use std::collections::VecDeque;

use hashbrown::HashMap;

use crate::device::HeapId;
use crate::serial::Serial;

/// Residency state embedded in each evictable GPU object.
#[derive(Debug, Default)]
pub struct Pageable {
    last_usage: Serial,
    last_submission: Serial,
    lock_count: u32,
    in_lru: bool,
}

impl Pageable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin this object resident. Balanced by [`decrement_residency_lock`].
    ///
    /// [`decrement_residency_lock`]: Pageable::decrement_residency_lock
    pub fn increment_residency_lock(&mut self) {
        self.lock_count += 1;
    }

    pub fn decrement_residency_lock(&mut self) {
        assert!(self.lock_count > 0, "residency lock underflow");
        self.lock_count -= 1;
    }

    pub fn is_residency_locked(&self) -> bool {
        self.lock_count > 0
    }

    pub fn set_last_usage(&mut self, serial: Serial) {
        debug_assert!(serial >= self.last_usage);
        self.last_usage = serial;
    }

    pub fn last_usage(&self) -> Serial {
        self.last_usage
    }

    pub fn set_last_submission(&mut self, serial: Serial) {
        debug_assert!(serial >= self.last_submission);
        self.last_submission = serial;
    }

    pub fn last_submission(&self) -> Serial {
        self.last_submission
    }

    pub fn set_in_residency_lru(&mut self, in_lru: bool) {
        self.in_lru = in_lru;
    }

    pub fn is_in_residency_lru(&self) -> bool {
        self.in_lru
    }

    /// Whether the GPU is guaranteed done with this object.
    pub fn is_retired(&self, completed: Serial) -> bool {
        self.last_submission <= completed
    }
}

/// Ordered residency membership, least-recently-used first.
///
/// Keys are heap identities rather than pointers: removal is always safe,
/// including from drop paths, and removing an id that was already evicted is
/// a silent no-op (eviction racing destruction is expected under real
/// workloads, not a bug).
#[derive(Debug, Default)]
pub struct ResidencySet {
    order: VecDeque<HeapId>,
    index: HashMap<HeapId, usize>,
}

impl ResidencySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: HeapId) -> bool {
        self.index.contains_key(&id)
    }

    /// Insert or move `id` to the most-recently-used position.
    pub fn touch(&mut self, id: HeapId) {
        if let Some(&pos) = self.index.get(&id) {
            self.order.remove(pos);
            self.rebuild_index();
        }
        self.order.push_back(id);
        self.index.insert(id, self.order.len() - 1);
    }

    /// Remove `id`. Returns whether it was present; absence is not an error.
    pub fn remove(&mut self, id: HeapId) -> bool {
        let Some(&pos) = self.index.get(&id) else {
            return false;
        };
        self.order.remove(pos);
        self.rebuild_index();
        true
    }

    /// Pop the least-recently-used id.
    pub fn pop_oldest(&mut self) -> Option<HeapId> {
        let id = self.order.pop_front()?;
        self.rebuild_index();
        Some(id)
    }

    /// Least-recently-used id without removing it.
    pub fn peek_oldest(&self) -> Option<HeapId> {
        self.order.front().copied()
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, id) in self.order.iter().enumerate() {
            self.index.insert(*id, i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn residency_set_orders_by_touch() {
        let mut set = ResidencySet::new();
        set.touch(HeapId(1));
        set.touch(HeapId(2));
        set.touch(HeapId(3));
        set.touch(HeapId(2));

        assert_eq!(set.pop_oldest(), Some(HeapId(1)));
        assert_eq!(set.pop_oldest(), Some(HeapId(3)));
        assert_eq!(set.pop_oldest(), Some(HeapId(2)));
        assert_eq!(set.pop_oldest(), None);
    }

    #[test]
    fn remove_of_absent_id_is_silent() {
        let mut set = ResidencySet::new();
        set.touch(HeapId(7));
        assert!(set.remove(HeapId(7)));
        assert!(!set.remove(HeapId(7)));
        assert!(set.is_empty());
    }

    #[test]
    fn residency_lock_pins_and_unpins() {
        let mut pageable = Pageable::new();
        assert!(!pageable.is_residency_locked());
        pageable.increment_residency_lock();
        pageable.increment_residency_lock();
        pageable.decrement_residency_lock();
        assert!(pageable.is_residency_locked());
        pageable.decrement_residency_lock();
        assert!(!pageable.is_residency_locked());
    }

    #[test]
    fn retirement_keys_off_submission_serial() {
        let mut pageable = Pageable::new();
        pageable.set_last_usage(Serial(5));
        pageable.set_last_submission(Serial(3));

        // Usage ran ahead of submission; only submission matters.
        assert!(pageable.is_retired(Serial(3)));
        assert!(!pageable.is_retired(Serial(2)));
    }
}
