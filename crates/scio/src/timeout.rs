// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ordered queue of deadline callbacks, ticked by the owning reactor loop.
//!
//! Tasks are keyed by (absolute deadline in reactor-clock milliseconds,
//! insertion sequence), so same-deadline tasks fire in schedule order.
//! `schedule` and `cancel` may be called from any thread; `tick` is called
//! from exactly one thread per queue (the selector loop that owns it).
//! The queue lock covers only the map itself - callbacks always run after
//! the lock is released, so a slow callback cannot block schedulers.

use std::collections::BTreeMap;

use parking_lot::Mutex;

type Callback = Box<dyn FnOnce() + Send>;

/// Handle for cancelling a scheduled task. Cancelling a task that has
/// already fired (or was already cancelled) is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutHandle {
    key: (u64, u64),
}

struct Inner {
    tasks: BTreeMap<(u64, u64), Callback>,
    next_seq: u64,
}

/// Coarse-locked deadline queue.
pub struct TimeoutQueue {
    inner: Mutex<Inner>,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: BTreeMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Schedule `callback` to fire at `deadline_ms` (reactor clock).
    pub fn schedule(&self, deadline_ms: u64, callback: Callback) -> TimeoutHandle {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let key = (deadline_ms, seq);
        inner.tasks.insert(key, callback);
        TimeoutHandle { key }
    }

    /// Remove a scheduled task. Returns `true` if it had not fired yet.
    pub fn cancel(&self, handle: &TimeoutHandle) -> bool {
        self.inner.lock().tasks.remove(&handle.key).is_some()
    }

    /// Fire every task whose deadline is at or before `now_ms`.
    ///
    /// Returns the number of tasks fired. Callbacks run outside the queue
    /// lock, on the calling (loop) thread.
    pub fn tick(&self, now_ms: u64) -> usize {
        let due: Vec<Callback> = {
            let mut inner = self.inner.lock();
            let later = inner.tasks.split_off(&(now_ms + 1, 0));
            let due = std::mem::replace(&mut inner.tasks, later);
            due.into_values().collect()
        };
        let fired = due.len();
        for callback in due {
            callback();
        }
        fired
    }

    /// Deadline of the soonest task, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.inner.lock().tasks.keys().next().map(|&(ms, _)| ms)
    }

    /// Drop every outstanding task without firing it.
    ///
    /// Used at reactor teardown so no callback can run against a stopped
    /// selector set. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let dropped = std::mem::take(&mut self.inner.lock().tasks);
        dropped.len()
    }

    /// Number of outstanding tasks.
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimeoutQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TimeoutQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutQueue")
            .field("outstanding", &self.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
