// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker pool for connection handling.
//!
//! Fixed set of threads draining a bounded channel. `dispatch` never
//! blocks: a full queue (or a stopped pool) returns `false`, and the
//! caller is responsible for not losing the work - the reactor responds
//! to a rejection by re-arming readiness on the endpoint.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send>;

enum Message {
    Run(Job),
    Shutdown,
}

/// Bounded worker pool with non-blocking dispatch.
pub struct WorkerPool {
    tx: Sender<Message>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    threads: usize,
}

impl WorkerPool {
    /// Spawn `threads` workers sharing a queue of `queue_capacity` jobs.
    pub fn new(threads: usize, queue_capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = bounded::<Message>(queue_capacity);
        let running = Arc::new(AtomicBool::new(true));
        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("scio-worker-{}", id))
                .spawn(move || worker_loop(id, rx))?;
            workers.push(handle);
        }
        Ok(Self {
            tx,
            workers: Mutex::new(workers),
            running,
            threads,
        })
    }

    /// Hand a job to the pool. Returns `false` if the pool is stopped or
    /// the queue is full; the job is returned to the caller's
    /// responsibility, never silently dropped.
    pub fn dispatch(&self, job: Job) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        self.tx.try_send(Message::Run(job)).is_ok()
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Stop accepting work, drain, and join the workers. Idempotent.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for _ in 0..self.threads {
            // Queued jobs ahead of the sentinel still run.
            let _ = self.tx.send(Message::Shutdown);
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                log::warn!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, rx: Receiver<Message>) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Run(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    log::error!("worker {} caught a panic in a connection handler", id);
                }
            }
            Message::Shutdown => break,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_jobs_run() {
        let pool = WorkerPool::new(2, 16).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = Arc::clone(&count);
            assert!(pool.dispatch(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })));
        }
        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_full_queue_rejects() {
        let pool = WorkerPool::new(1, 1).unwrap();
        let gate = Arc::new(AtomicBool::new(false));

        // Occupy the single worker.
        let g = Arc::clone(&gate);
        assert!(pool.dispatch(Box::new(move || {
            while !g.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
        })));
        // Fill the queue slot, then observe rejection.
        let mut accepted = 0;
        let mut rejected = 0;
        for _ in 0..50 {
            if pool.dispatch(Box::new(|| {})) {
                accepted += 1;
            } else {
                rejected += 1;
            }
        }
        assert!(rejected > 0, "bounded queue must reject when saturated");
        assert!(accepted <= 2);

        gate.store(true, Ordering::Release);
        pool.shutdown();
    }

    #[test]
    fn test_dispatch_after_shutdown_fails() {
        let pool = WorkerPool::new(1, 4).unwrap();
        pool.shutdown();
        assert!(!pool.dispatch(Box::new(|| {})));
        // Shutdown is idempotent.
        pool.shutdown();
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1, 16).unwrap();
        assert!(pool.dispatch(Box::new(|| panic!("boom"))));
        let done = Arc::new(AtomicBool::new(false));
        let d = Arc::clone(&done);
        assert!(pool.dispatch(Box::new(move || d.store(true, Ordering::SeqCst))));
        pool.shutdown();
        assert!(done.load(Ordering::SeqCst));
    }
}
