//! Deadline-ordered timer queue for the sender event loop.
//!
//! The event loop is single-threaded and cooperative; scheduled actions
//! run in deadline order at the next `timer()` tick. Timestamps are
//! explicit microsecond values supplied by the caller, which keeps the
//! queue deterministic under test.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use slab::Slab;

/// Deadline-ordered action queue.
pub struct TimerQueue<A> {
    actions: Slab<A>,
    deadlines: BinaryHeap<Reverse<(u64, usize)>>,
}

impl<A> TimerQueue<A> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            actions: Slab::new(),
            deadlines: BinaryHeap::new(),
        }
    }

    /// Schedule `action` to fire at `deadline_us`.
    pub fn add(&mut self, action: A, deadline_us: u64) {
        let key = self.actions.insert(action);
        self.deadlines.push(Reverse((deadline_us, key)));
    }

    /// Pop all actions with deadlines `<= now_us` into `out`, in
    /// deadline order.
    pub fn timer(&mut self, now_us: u64, out: &mut Vec<A>) {
        while let Some(Reverse((deadline, key))) = self.deadlines.peek().copied() {
            if deadline > now_us {
                break;
            }
            self.deadlines.pop();
            out.push(self.actions.remove(key));
        }
    }

    /// Deadline of the next scheduled action.
    pub fn next_deadline(&self) -> Option<u64> {
        self.deadlines.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Number of scheduled actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Check if no actions are scheduled.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl<A> Default for TimerQueue<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_in_deadline_order() {
        let mut queue = TimerQueue::new();
        queue.add("late", 300);
        queue.add("early", 100);
        queue.add("middle", 200);

        let mut fired = Vec::new();
        queue.timer(250, &mut fired);
        assert_eq!(fired, vec!["early", "middle"]);
        assert_eq!(queue.len(), 1);

        fired.clear();
        queue.timer(300, &mut fired);
        assert_eq!(fired, vec!["late"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_nothing_due() {
        let mut queue = TimerQueue::new();
        queue.add((), 1000);
        let mut fired = Vec::new();
        queue.timer(999, &mut fired);
        assert!(fired.is_empty());
        assert_eq!(queue.next_deadline(), Some(1000));
    }

    #[test]
    fn test_readd_fires_next_tick() {
        let mut queue = TimerQueue::new();
        queue.add(1, 10);
        let mut fired = Vec::new();
        queue.timer(10, &mut fired);
        assert_eq!(fired, vec![1]);
        // re-adding with the current timestamp fires on the next tick,
        // not within the same one
        queue.add(2, 10);
        fired.clear();
        queue.timer(10, &mut fired);
        assert_eq!(fired, vec![2]);
    }

    #[test]
    fn test_equal_deadlines() {
        let mut queue = TimerQueue::new();
        for i in 0..4 {
            queue.add(i, 50);
        }
        let mut fired = Vec::new();
        queue.timer(50, &mut fired);
        fired.sort();
        assert_eq!(fired, vec![0, 1, 2, 3]);
    }
}
