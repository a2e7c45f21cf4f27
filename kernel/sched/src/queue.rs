//! Intrusive per-CPU run queue.
//!
//! A FIFO of ready tasks linked through [`Task::queue_next`]. All
//! operations are O(1): enqueue at tail, dequeue at head, peek at head.
//! The queue itself is not synchronized; callers wrap it in an
//! `IrqSpinLock` and hold the lock for every call.

use core::ptr::{self, NonNull};

use crate::task::{Affinity, Task};

/// FIFO of ready tasks.
pub struct RunQueue {
    head: *mut Task,
    tail: *mut Task,
    len: u32,
}

// SAFETY: The queue stores raw task pointers; exclusive access is enforced
// by the lock around every queue (tasks themselves are Send-able payloads).
unsafe impl Send for RunQueue {}

impl RunQueue {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    /// Returns the number of queued tasks.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Returns `true` if no task is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Enqueues a task at the tail.
    ///
    /// # Panics
    ///
    /// In debug builds, if the task is already in a queue (a task belongs
    /// to at most one run queue at any time).
    pub fn push_back(&mut self, mut task: NonNull<Task>) {
        // SAFETY: The caller holds the queue lock and owns the task pointer.
        let t = unsafe { task.as_mut() };
        debug_assert!(!t.in_queue, "task enqueued twice");
        t.queue_next = ptr::null_mut();
        t.in_queue = true;

        if self.tail.is_null() {
            self.head = task.as_ptr();
        } else {
            // SAFETY: `tail` is a valid queued task under the same lock.
            unsafe { (*self.tail).queue_next = task.as_ptr() };
        }
        self.tail = task.as_ptr();
        self.len += 1;
    }

    /// Dequeues the head task.
    pub fn pop_front(&mut self) -> Option<NonNull<Task>> {
        let mut task = NonNull::new(self.head)?;
        // SAFETY: The caller holds the queue lock; head is live and queued.
        let t = unsafe { task.as_mut() };
        self.head = t.queue_next;
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        t.queue_next = ptr::null_mut();
        t.in_queue = false;
        self.len -= 1;
        Some(task)
    }

    /// Returns the head task's affinity without dequeuing.
    ///
    /// Stealers use this to skip queues whose next runnable work is pinned
    /// elsewhere.
    #[must_use]
    pub fn head_affinity(&self) -> Option<Affinity> {
        NonNull::new(self.head)
            // SAFETY: The caller holds the queue lock; head is live.
            .map(|task| unsafe { task.as_ref() }.affinity)
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon_core::id::CpuId;

    fn nop(_arg: *mut ()) {}

    fn mk(affinity: Affinity) -> NonNull<Task> {
        Task::allocate(nop, ptr::null_mut(), affinity).unwrap()
    }

    fn free(task: NonNull<Task>) {
        // SAFETY: Test-owned, dequeued task.
        unsafe { Task::destroy(task) };
    }

    #[test]
    fn fifo_order() {
        let mut rq = RunQueue::new();
        let a = mk(Affinity::Any);
        let b = mk(Affinity::Any);
        let c = mk(Affinity::Any);
        rq.push_back(a);
        rq.push_back(b);
        rq.push_back(c);
        assert_eq!(rq.len(), 3);

        assert_eq!(rq.pop_front(), Some(a));
        assert_eq!(rq.pop_front(), Some(b));
        assert_eq!(rq.pop_front(), Some(c));
        assert_eq!(rq.pop_front(), None);
        assert!(rq.is_empty());

        for t in [a, b, c] {
            free(t);
        }
    }

    #[test]
    fn membership_flag_tracks_queue() {
        let mut rq = RunQueue::new();
        let t = mk(Affinity::Any);
        rq.push_back(t);
        // SAFETY: Queue lock is this test's exclusive ownership.
        assert!(unsafe { t.as_ref() }.in_queue);
        let popped = rq.pop_front().unwrap();
        assert!(!unsafe { popped.as_ref() }.in_queue);
        free(t);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "task enqueued twice")]
    fn double_enqueue_panics() {
        let mut rq = RunQueue::new();
        let t = mk(Affinity::Any);
        rq.push_back(t);
        rq.push_back(t);
    }

    #[test]
    fn head_affinity_peek() {
        let mut rq = RunQueue::new();
        assert_eq!(rq.head_affinity(), None);
        let t = mk(Affinity::Pinned(CpuId::new(1)));
        rq.push_back(t);
        assert_eq!(rq.head_affinity(), Some(Affinity::Pinned(CpuId::new(1))));
        rq.pop_front();
        free(t);
    }
}
