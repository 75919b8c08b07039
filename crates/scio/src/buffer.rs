// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reusable I/O buffers and the shared buffer pool.
//!
//! [`IoBuffer`] is a fixed-capacity byte buffer with explicit get/put
//! indices: content lives in `data[get..put]`, free space in
//! `data[put..capacity]`. Partial socket writes advance `get`, partial
//! reads advance `put`, and `compact()` moves unread content back to the
//! front so the full capacity becomes usable again.
//!
//! [`BufferPool`] leases buffers by size class and takes them back when a
//! connection is done with them. It is safe to call from any thread; each
//! size class keeps a bounded free list and falls back to plain allocation
//! when the list is empty (and to dropping when it is full).

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

// ============================================================================
// IoBuffer
// ============================================================================

/// Fixed-capacity byte buffer with get/put indices.
#[derive(Debug)]
pub struct IoBuffer {
    data: Box<[u8]>,
    get: usize,
    put: usize,
}

impl IoBuffer {
    /// Create a buffer with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            get: 0,
            put: 0,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of unread content bytes.
    pub fn len(&self) -> usize {
        self.put - self.get
    }

    /// True if there is no unread content.
    pub fn is_empty(&self) -> bool {
        self.get == self.put
    }

    /// True if there is unread content.
    pub fn has_content(&self) -> bool {
        self.get < self.put
    }

    /// Free space after the put index.
    pub fn space(&self) -> usize {
        self.data.len() - self.put
    }

    /// Unread content.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.get..self.put]
    }

    /// Consume up to `n` content bytes; returns how many were skipped.
    ///
    /// When the buffer becomes empty both indices reset to zero.
    pub fn skip(&mut self, n: usize) -> usize {
        let n = n.min(self.len());
        self.get += n;
        if self.get == self.put {
            self.clear();
        }
        n
    }

    /// Append as much of `src` as fits; returns the number of bytes copied.
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.space());
        self.data[self.put..self.put + n].copy_from_slice(&src[..n]);
        self.put += n;
        n
    }

    /// The writable tail of the buffer.
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.put..]
    }

    /// Mark `n` bytes of the writable tail as filled.
    pub fn advance_put(&mut self, n: usize) {
        debug_assert!(n <= self.space());
        self.put += n;
    }

    /// Discard all content.
    pub fn clear(&mut self) {
        self.get = 0;
        self.put = 0;
    }

    /// Move unread content to the front of the buffer.
    pub fn compact(&mut self) {
        if self.get == 0 {
            return;
        }
        if self.get == self.put {
            self.clear();
            return;
        }
        self.data.copy_within(self.get..self.put, 0);
        self.put -= self.get;
        self.get = 0;
    }
}

// ============================================================================
// BufferPool
// ============================================================================

/// How many buffers a size class retains before releases start dropping.
const DEFAULT_MAX_POOLED: usize = 64;

struct SizeClass {
    capacity: usize,
    free: Mutex<Vec<IoBuffer>>,
    max_pooled: usize,
}

/// Thread-safe lease/release pool of [`IoBuffer`]s, keyed by size class.
///
/// `lease(n)` returns a buffer from the smallest class whose capacity is
/// at least `n`; requests larger than every class get an exact-size,
/// unpooled allocation. `release` returns a buffer to its class (matched
/// by capacity) or drops it.
pub struct BufferPool {
    classes: Vec<SizeClass>,
    leased: AtomicU64,
    released: AtomicU64,
}

impl BufferPool {
    /// Create a pool with the given class capacities.
    ///
    /// Capacities are sorted and deduplicated; zero entries are ignored.
    pub fn new(capacities: &[usize]) -> Self {
        let mut caps: Vec<usize> = capacities.iter().copied().filter(|&c| c > 0).collect();
        caps.sort_unstable();
        caps.dedup();
        Self {
            classes: caps
                .into_iter()
                .map(|capacity| SizeClass {
                    capacity,
                    free: Mutex::new(Vec::new()),
                    max_pooled: DEFAULT_MAX_POOLED,
                })
                .collect(),
            leased: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Lease a buffer with capacity at least `capacity`.
    pub fn lease(&self, capacity: usize) -> IoBuffer {
        self.leased.fetch_add(1, Ordering::Relaxed);
        for class in &self.classes {
            if class.capacity >= capacity {
                if let Some(mut buf) = class.free.lock().pop() {
                    buf.clear();
                    return buf;
                }
                return IoBuffer::with_capacity(class.capacity);
            }
        }
        // Oversized request: exact allocation, never retained.
        IoBuffer::with_capacity(capacity)
    }

    /// Return a leased buffer to the pool.
    pub fn release(&self, buf: IoBuffer) {
        self.released.fetch_add(1, Ordering::Relaxed);
        for class in &self.classes {
            if class.capacity == buf.capacity() {
                let mut free = class.free.lock();
                if free.len() < class.max_pooled {
                    free.push(buf);
                }
                return;
            }
        }
    }

    /// Total buffers leased since creation.
    pub fn leased_count(&self) -> u64 {
        self.leased.load(Ordering::Relaxed)
    }

    /// Total buffers released since creation.
    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Buffers currently out on lease.
    pub fn outstanding(&self) -> u64 {
        self.leased_count() - self.released_count()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field(
                "classes",
                &self.classes.iter().map(|c| c.capacity).collect::<Vec<_>>(),
            )
            .field("leased", &self.leased_count())
            .field("released", &self.released_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
