// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The endpoint abstraction: non-blocking fill/flush over one connection.
//!
//! [`EndPoint`] is the seam between the reactor and the protocol layer.
//! A plain implementation reads and writes a socket directly
//! ([`ChannelEndPoint`](super::channel::ChannelEndPoint)); the TLS
//! decorator wraps another endpoint and carries plaintext across the same
//! contract. Decoration is by composition over this trait, never by
//! sharing a concrete base type, so buffer ownership stays unambiguous.
//!
//! # Contract
//!
//! - `fill` is non-blocking: it returns whatever is currently available,
//!   [`Fill::WouldBlock`] when nothing is (not an error), or
//!   [`Fill::Eof`] once the peer has closed.
//! - `flush` is a non-blocking partial write: it returns how many bytes
//!   the transport accepted; `0` means "not writable right now".
//! - `close` is idempotent.
//! - `block_readable`/`block_writable` park the calling thread until the
//!   reactor reports readiness (endpoints that are not reactor-scheduled
//!   return `true` immediately).

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::buffer::IoBuffer;

/// Outcome of a non-blocking fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// Bytes were read into the buffer.
    Bytes(usize),
    /// Nothing available right now; retry or park.
    WouldBlock,
    /// The peer closed the stream.
    Eof,
}

impl Fill {
    /// Bytes read, or zero for `WouldBlock`/`Eof`.
    pub fn bytes(&self) -> usize {
        match self {
            Fill::Bytes(n) => *n,
            _ => 0,
        }
    }

    /// True if this is end-of-stream.
    pub fn is_eof(&self) -> bool {
        matches!(self, Fill::Eof)
    }
}

/// Error used when an operation runs into a closed or half-closed stream.
pub(crate) fn eof_error() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream")
}

/// Error used when a blocking wait is torn down by a forced cancellation.
pub(crate) fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "operation cancelled")
}

/// Abstraction over one connected, non-blocking byte stream.
pub trait EndPoint: Send {
    /// Read currently-available bytes into `buf`.
    fn fill(&mut self, buf: &mut IoBuffer) -> io::Result<Fill>;

    /// Write as much of `buf` as the transport will take; consumed bytes
    /// are skipped from `buf`.
    fn flush(&mut self, buf: &mut IoBuffer) -> io::Result<usize>;

    /// Close the endpoint. Idempotent.
    fn close(&mut self) -> io::Result<()>;

    /// True until `close` (or a fatal error) has taken effect.
    fn is_open(&self) -> bool;

    /// True once the read side has seen EOF or been shut down.
    fn is_input_shutdown(&self) -> bool;

    /// True once the write side has been shut down.
    fn is_output_shutdown(&self) -> bool;

    /// Local socket address, if known.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Remote socket address, if known.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Park the calling thread until readable, closed, or `timeout`
    /// elapses. Returns `false` only on a genuine timeout.
    fn block_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    /// Park the calling thread until writable, closed, or `timeout`
    /// elapses. Returns `false` only on a genuine timeout.
    fn block_writable(&mut self, timeout: Duration) -> io::Result<bool>;
}

// ============================================================================
// Boxed EndPoint
// ============================================================================

/// Type alias for a boxed endpoint.
pub type BoxedEndPoint = Box<dyn EndPoint>;

impl EndPoint for BoxedEndPoint {
    fn fill(&mut self, buf: &mut IoBuffer) -> io::Result<Fill> {
        (**self).fill(buf)
    }

    fn flush(&mut self, buf: &mut IoBuffer) -> io::Result<usize> {
        (**self).flush(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn is_input_shutdown(&self) -> bool {
        (**self).is_input_shutdown()
    }

    fn is_output_shutdown(&self) -> bool {
        (**self).is_output_shutdown()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        (**self).local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        (**self).peer_addr()
    }

    fn block_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        (**self).block_readable(timeout)
    }

    fn block_writable(&mut self, timeout: Duration) -> io::Result<bool> {
        (**self).block_writable(timeout)
    }
}

// ============================================================================
// Test pipe endpoint
// ============================================================================

#[cfg(test)]
pub(crate) mod pipe {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// One direction of an in-memory pipe.
    struct Lane {
        data: Mutex<VecDeque<u8>>,
        closed: AtomicBool,
    }

    impl Lane {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                data: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
            })
        }
    }

    /// In-memory endpoint for exercising protocol state machines without
    /// sockets. Supports partial-write injection via `max_write` and
    /// one-shot error injection on either direction.
    pub(crate) struct PipeEndPoint {
        incoming: Arc<Lane>,
        outgoing: Arc<Lane>,
        /// Cap on bytes accepted per flush call (partial-write injection).
        pub(crate) max_write: usize,
        open: bool,
        output_shutdown: bool,
        pub(crate) fill_error: Option<io::ErrorKind>,
        pub(crate) flush_error: Option<io::ErrorKind>,
    }

    impl PipeEndPoint {
        /// Create a connected pair of pipe endpoints.
        pub(crate) fn pair() -> (PipeEndPoint, PipeEndPoint) {
            let a_to_b = Lane::new();
            let b_to_a = Lane::new();
            let a = PipeEndPoint {
                incoming: Arc::clone(&b_to_a),
                outgoing: Arc::clone(&a_to_b),
                max_write: usize::MAX,
                open: true,
                output_shutdown: false,
                fill_error: None,
                flush_error: None,
            };
            let b = PipeEndPoint {
                incoming: a_to_b,
                outgoing: b_to_a,
                max_write: usize::MAX,
                open: true,
                output_shutdown: false,
                fill_error: None,
                flush_error: None,
            };
            (a, b)
        }

        /// Bytes queued toward the peer.
        pub(crate) fn pending_out(&self) -> usize {
            self.outgoing.data.lock().len()
        }

        /// Queue bytes for the local side to read.
        pub(crate) fn feed(&self, data: &[u8]) {
            self.incoming.data.lock().extend(data);
        }
    }

    impl EndPoint for PipeEndPoint {
        fn fill(&mut self, buf: &mut IoBuffer) -> io::Result<Fill> {
            if let Some(kind) = self.fill_error.take() {
                return Err(io::Error::new(kind, "injected fill error"));
            }
            if !self.open {
                return Err(eof_error());
            }
            let mut data = self.incoming.data.lock();
            if data.is_empty() {
                if self.incoming.closed.load(Ordering::Acquire) {
                    return Ok(Fill::Eof);
                }
                return Ok(Fill::WouldBlock);
            }
            let n = data.len().min(buf.space());
            if n == 0 {
                return Ok(Fill::WouldBlock);
            }
            for (i, byte) in data.drain(..n).enumerate() {
                buf.unfilled_mut()[i] = byte;
            }
            buf.advance_put(n);
            Ok(Fill::Bytes(n))
        }

        fn flush(&mut self, buf: &mut IoBuffer) -> io::Result<usize> {
            if let Some(kind) = self.flush_error.take() {
                return Err(io::Error::new(kind, "injected flush error"));
            }
            if !self.open || self.output_shutdown {
                return Err(eof_error());
            }
            let n = buf.len().min(self.max_write);
            if n == 0 {
                return Ok(0);
            }
            self.outgoing.data.lock().extend(&buf.as_slice()[..n]);
            buf.skip(n);
            Ok(n)
        }

        fn close(&mut self) -> io::Result<()> {
            self.open = false;
            self.output_shutdown = true;
            self.outgoing.closed.store(true, Ordering::Release);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn is_input_shutdown(&self) -> bool {
            !self.open
        }

        fn is_output_shutdown(&self) -> bool {
            self.output_shutdown
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn block_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
            Ok(true)
        }

        fn block_writable(&mut self, _timeout: Duration) -> io::Result<bool> {
            Ok(true)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
