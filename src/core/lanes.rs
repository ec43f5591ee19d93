// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Priority lane queue: one FIFO lane per priority class.

use super::task::{Priority, Task};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// Items that can be queued in a [`LaneQueue`].
pub trait Prioritized {
    /// Class of the lane this item goes into.
    fn priority(&self) -> Priority;
}

impl Prioritized for Arc<Task> {
    fn priority(&self) -> Priority {
        Task::priority(self)
    }
}

/// A task waiting in the delayed queue until its deadline.
pub struct DelayedTask {
    /// Earliest time at which the task may be promoted to the ready queue.
    pub deadline: Instant,
    /// Priority the task was queued with.
    pub priority: Priority,
    /// The delayed task.
    pub task: Arc<Task>,
}

impl Prioritized for DelayedTask {
    fn priority(&self) -> Priority {
        self.priority
    }
}

/// Four independent FIFO lanes, popped in priority order.
///
/// Pushing appends to the lane of the item's class; popping takes from the
/// front of the highest-priority non-empty lane. Two items of the same class
/// therefore come out in insertion order, and a high-priority item overtakes
/// any queued item of a lower class.
pub struct LaneQueue<T> {
    lanes: [VecDeque<T>; 4],
}

impl<T: Prioritized> LaneQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            lanes: Default::default(),
        }
    }

    /// Appends an item to the lane of its class.
    pub fn push(&mut self, item: T) {
        self.push_to(item.priority(), item);
    }

    /// Appends an item to the lane of the given class, regardless of the
    /// item's current class.
    pub fn push_to(&mut self, priority: Priority, item: T) {
        self.lanes[priority.lane()].push_back(item);
    }

    /// Returns the item that [`pop()`](Self::pop) would remove.
    pub fn front(&self) -> Option<&T> {
        self.lanes.iter().find_map(|lane| lane.front())
    }

    /// Removes the front item of the highest-priority non-empty lane.
    pub fn pop(&mut self) -> Option<T> {
        self.lanes.iter_mut().find_map(|lane| lane.pop_front())
    }

    /// Total number of queued items.
    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    /// Returns whether all the lanes are empty.
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    /// Number of items queued in the lane of the given class.
    pub fn lane_len(&self, priority: Priority) -> usize {
        self.lanes[priority.lane()].len()
    }

    /// Iterates over the items, in pop order.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.lanes.iter().flatten()
    }

    /// Removes all the items, in pop order.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.lanes.iter_mut().flat_map(|lane| lane.drain(..))
    }

    /// Removes all the items matching the predicate, in pop order.
    ///
    /// Items that remain keep their relative order.
    pub fn drain_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut removed = Vec::new();
        for lane in self.lanes.iter_mut() {
            if !lane.iter().any(&mut predicate) {
                continue;
            }
            let mut kept = VecDeque::with_capacity(lane.len());
            for item in lane.drain(..) {
                if predicate(&item) {
                    removed.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            *lane = kept;
        }
        removed
    }
}

impl<T: Prioritized> Default for LaneQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha12Rng;

    /// Minimal item tagged with its insertion index.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Item(Priority, usize);

    impl Prioritized for Item {
        fn priority(&self) -> Priority {
            self.0
        }
    }

    #[test]
    fn empty_queue() {
        let mut queue = LaneQueue::<Item>::new();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.front(), None);
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn pop_highest_lane_first() {
        let mut queue = LaneQueue::new();
        queue.push(Item(Priority::Normal, 0));
        queue.push(Item(Priority::Dropable, 1));
        queue.push(Item(Priority::Low, 2));
        queue.push(Item(Priority::High, 3));

        assert_eq!(queue.len(), 4);
        assert_eq!(queue.lane_len(Priority::Low), 1);
        assert_eq!(queue.front(), Some(&Item(Priority::High, 3)));

        assert_eq!(queue.pop(), Some(Item(Priority::High, 3)));
        assert_eq!(queue.pop(), Some(Item(Priority::Normal, 0)));
        assert_eq!(queue.pop(), Some(Item(Priority::Low, 2)));
        assert_eq!(queue.pop(), Some(Item(Priority::Dropable, 1)));
        assert!(queue.is_empty());
    }

    #[test]
    fn fifo_within_lane() {
        let mut queue = LaneQueue::new();
        for i in 0..5 {
            queue.push(Item(Priority::Low, i));
        }
        let order = std::iter::from_fn(|| queue.pop())
            .map(|item| item.1)
            .collect::<Vec<_>>();
        assert_eq!(order, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn random_sequence_matches_stable_sort() {
        let mut rng = ChaCha12Rng::seed_from_u64(42);
        let items = (0..1000)
            .map(|i| Item(Priority::DESCENDING[rng.random_range(0..4)], i))
            .collect::<Vec<_>>();

        let mut queue = LaneQueue::new();
        for &item in &items {
            queue.push(item);
        }
        assert_eq!(queue.len(), items.len());
        for priority in Priority::DESCENDING {
            assert_eq!(
                queue.lane_len(priority),
                items.iter().filter(|item| item.0 == priority).count()
            );
        }

        let mut expected = items.clone();
        expected.sort_by_key(|item| std::cmp::Reverse(item.0));
        let actual = std::iter::from_fn(|| queue.pop()).collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[test]
    fn drain_in_pop_order() {
        let mut queue = LaneQueue::new();
        queue.push(Item(Priority::Low, 0));
        queue.push(Item(Priority::High, 1));
        queue.push(Item(Priority::Low, 2));
        let drained = queue.drain().collect::<Vec<_>>();
        assert_eq!(
            drained,
            [
                Item(Priority::High, 1),
                Item(Priority::Low, 0),
                Item(Priority::Low, 2)
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_where_keeps_order() {
        let mut queue = LaneQueue::new();
        for i in 0..10 {
            let priority = if i % 3 == 0 {
                Priority::High
            } else {
                Priority::Normal
            };
            queue.push(Item(priority, i));
        }

        let removed = queue.drain_where(|item| item.1 % 2 == 0);
        assert_eq!(
            removed.iter().map(|item| item.1).collect::<Vec<_>>(),
            [0, 6, 2, 4, 8]
        );
        let remaining = std::iter::from_fn(|| queue.pop())
            .map(|item| item.1)
            .collect::<Vec<_>>();
        assert_eq!(remaining, [3, 9, 1, 5, 7]);
    }

    #[test]
    fn drain_where_nothing_matches() {
        let mut queue = LaneQueue::new();
        queue.push(Item(Priority::Dropable, 0));
        assert!(queue.drain_where(|_| false).is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn delayed_task_lane() {
        let task = Arc::new(Task::new(Priority::Low, || ()));

        let mut delayed = LaneQueue::new();
        delayed.push(DelayedTask {
            deadline: Instant::now(),
            priority: Priority::High,
            task: task.clone(),
        });
        assert_eq!(delayed.lane_len(Priority::High), 1);

        let mut ready = LaneQueue::new();
        ready.push(task);
        assert_eq!(ready.lane_len(Priority::Low), 1);
    }

    #[test]
    fn push_to_ignores_item_class() {
        let mut queue = LaneQueue::new();
        queue.push(Item(Priority::Normal, 0));
        queue.push_to(Priority::Low, Item(Priority::High, 1));
        assert_eq!(queue.lane_len(Priority::Low), 1);
        assert_eq!(queue.lane_len(Priority::High), 0);
        assert_eq!(queue.pop(), Some(Item(Priority::Normal, 0)));
        assert_eq!(queue.pop(), Some(Item(Priority::High, 1)));
    }
}
