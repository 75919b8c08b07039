// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLS termination endpoint.
//!
//! Decorates an inner [`EndPoint`] carrying ciphertext and exposes the
//! same fill/flush contract carrying plaintext. Every `fill`/`flush` call
//! re-enters the engine's handshake state machine, so the handshake makes
//! progress no matter which direction the application drives.
//!
//! Two invariants shape the code:
//!
//! - The outbound ciphertext buffer is fully drained to the socket before
//!   the engine is asked to produce more output for the same logical
//!   write. A partial socket write is never dropped; the residue is
//!   retried on every subsequent call and `is_buffering_output` tells the
//!   reactor to keep WRITE interest armed.
//! - One unproductive unwrap pass per call: if the engine consumes and
//!   produces nothing on a fresh pass, the call returns and the caller
//!   waits for more ciphertext instead of spinning.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::buffer::{BufferPool, IoBuffer};
use crate::io::endpoint::{eof_error, EndPoint, Fill};

use super::engine::{EngineStatus, HandshakeStatus, TlsEngine};

/// Flush retries during close before giving up on a clogged socket.
const CLOSE_FLUSH_RETRIES: u32 = 8;

/// Base backoff between close-time flush retries.
const CLOSE_FLUSH_BACKOFF: Duration = Duration::from_millis(2);

/// Upper bound on close-sequence state machine passes.
const CLOSE_MAX_PASSES: u32 = 16;

/// An endpoint that terminates TLS in front of an inner endpoint.
pub struct TlsEndPoint<E: EndPoint = crate::io::endpoint::BoxedEndPoint> {
    inner: E,
    engine: Box<dyn TlsEngine>,
    pool: Arc<BufferPool>,
    in_ciphertext: Option<IoBuffer>,
    out_ciphertext: Option<IoBuffer>,
    /// Outbound close alert sent; full shutdown not yet complete.
    closing: bool,
    closed: bool,
}

impl<E: EndPoint> TlsEndPoint<E> {
    /// Lease ciphertext buffers and wrap `inner`.
    pub fn new(inner: E, engine: Box<dyn TlsEngine>, pool: Arc<BufferPool>) -> Self {
        let packet = engine.packet_buffer_size();
        let in_ciphertext = Some(pool.lease(packet));
        let out_ciphertext = Some(pool.lease(packet));
        Self {
            inner,
            engine,
            pool,
            in_ciphertext,
            out_ciphertext,
            closing: false,
            closed: false,
        }
    }

    /// Ciphertext produced but not yet accepted by the socket.
    pub fn is_buffering_output(&self) -> bool {
        self.out_ciphertext
            .as_ref()
            .map(|b| b.has_content())
            .unwrap_or(false)
    }

    /// Ciphertext received but not yet consumed by the engine.
    pub fn is_buffering_input(&self) -> bool {
        self.in_ciphertext
            .as_ref()
            .map(|b| b.has_content())
            .unwrap_or(false)
    }

    pub fn engine(&self) -> &dyn TlsEngine {
        &*self.engine
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Push buffered ciphertext toward the socket (partial ok).
    fn flush_ciphertext(&mut self) -> io::Result<usize> {
        let out = match self.out_ciphertext.as_mut() {
            Some(b) if b.has_content() => b,
            _ => return Ok(0),
        };
        self.inner.flush(out)
    }

    /// Pull ciphertext from the inner endpoint and run one engine unwrap.
    ///
    /// Returns whether any forward progress was made (bytes filled,
    /// consumed, or produced).
    fn unwrap_some(&mut self, dst: &mut IoBuffer) -> io::Result<bool> {
        let inb = self.in_ciphertext.as_mut().ok_or_else(eof_error)?;
        if inb.has_content() {
            inb.compact();
        } else {
            inb.clear();
        }

        let mut total_filled = 0usize;
        while inb.space() > 0 && self.inner.is_open() {
            match self.inner.fill(inb) {
                Ok(Fill::Bytes(n)) => total_filled += n,
                Ok(Fill::WouldBlock) | Ok(Fill::Eof) => break,
                Err(e) => {
                    if inb.is_empty() {
                        return Err(e);
                    }
                    break;
                }
            }
        }

        if inb.is_empty() {
            if !self.inner.is_open() {
                return Err(eof_error());
            }
            return Ok(false);
        }

        let result = self.engine.unwrap(inb.as_slice(), dst)?;
        inb.skip(result.consumed);
        log::trace!(
            "tls unwrap: filled={} consumed={} produced={} status={:?}",
            total_filled,
            result.consumed,
            result.produced,
            result.status
        );
        match result.status {
            EngineStatus::BufferUnderflow | EngineStatus::BufferOverflow => Ok(total_filled > 0),
            EngineStatus::Closed => {
                self.closing = true;
                Ok(total_filled > 0 || result.consumed > 0 || result.produced > 0)
            }
            EngineStatus::Ok => {
                Ok(total_filled > 0 || result.consumed > 0 || result.produced > 0)
            }
        }
    }

    /// Ask the engine for handshake ciphertext (no plaintext input) and
    /// append it to the outbound buffer.
    fn wrap_handshake(&mut self) -> io::Result<()> {
        let out = self.out_ciphertext.as_mut().ok_or_else(eof_error)?;
        out.compact();
        let result = self.engine.wrap(&[], out)?;
        log::trace!(
            "tls handshake wrap: produced={} status={:?}",
            result.produced,
            result.status
        );
        if result.status != EngineStatus::Ok {
            if result.status != EngineStatus::Closed {
                log::warn!("tls handshake wrap: {:?}", result.status);
            }
            self.closing = true;
        }
        Ok(())
    }

    /// Encrypt application plaintext. The outbound buffer is empty when
    /// this is called (the caller drains it first), so the engine output
    /// never interleaves with a previous record's residue.
    fn wrap_app(&mut self, src: &mut IoBuffer) -> io::Result<usize> {
        let out = self.out_ciphertext.as_mut().ok_or_else(eof_error)?;
        debug_assert!(!out.has_content());
        out.clear();
        let result = self.engine.wrap(src.as_slice(), out)?;
        if result.status == EngineStatus::Closed {
            self.closing = true;
        }
        src.skip(result.consumed);
        self.flush_ciphertext()?;
        Ok(result.consumed)
    }

    /// Retry buffered close-time flushes with bounded backoff instead of
    /// spinning on an unwritable socket.
    fn drain_output_bounded(&mut self) {
        let mut attempt = 0u32;
        while self.is_buffering_output() && self.inner.is_open() {
            if self.flush_ciphertext().is_err() {
                return;
            }
            if !self.is_buffering_output() {
                return;
            }
            attempt += 1;
            if attempt >= CLOSE_FLUSH_RETRIES {
                log::debug!("tls close: output still buffered after {} retries", attempt);
                return;
            }
            thread::sleep(CLOSE_FLUSH_BACKOFF * attempt);
        }
    }

    /// Drive the engine through the close alert exchange.
    fn close_handshake(&mut self) {
        self.drain_output_bounded();
        self.engine.close_outbound();

        let mut passes = 0u32;
        while self.inner.is_open()
            && !(self.engine.is_inbound_done() && self.engine.is_outbound_done())
        {
            passes += 1;
            if passes > CLOSE_MAX_PASSES {
                log::debug!("tls close: giving up after {} passes", passes);
                break;
            }
            self.drain_output_bounded();
            match self.engine.handshake_status() {
                HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => break,
                HandshakeStatus::NeedUnwrap => {
                    let mut scratch = self.pool.lease(self.engine.application_buffer_size());
                    let progress = self.unwrap_some(&mut scratch);
                    self.pool.release(scratch);
                    match progress {
                        Ok(false)
                            if self.engine.handshake_status() == HandshakeStatus::NeedUnwrap =>
                        {
                            break
                        }
                        Ok(_) => {}
                        // Close-time errors never abort cleanup.
                        Err(e) => {
                            log::debug!("tls close: unwrap failed: {}", e);
                            break;
                        }
                    }
                }
                HandshakeStatus::NeedTask => self.engine.run_tasks(),
                HandshakeStatus::NeedWrap => {
                    if let Err(e) = self.wrap_handshake() {
                        log::debug!("tls close: wrap failed: {}", e);
                        break;
                    }
                }
            }
        }
        self.drain_output_bounded();
    }

    /// Return both ciphertext buffers to the pool. Idempotent.
    fn release_buffers(&mut self) {
        if let Some(buf) = self.in_ciphertext.take() {
            self.pool.release(buf);
        }
        if let Some(buf) = self.out_ciphertext.take() {
            self.pool.release(buf);
        }
    }
}

impl<E: EndPoint> EndPoint for TlsEndPoint<E> {
    fn fill(&mut self, buf: &mut IoBuffer) -> io::Result<Fill> {
        if self.closed {
            return Err(eof_error());
        }
        let before = buf.len();
        let initial_status = self.engine.handshake_status();
        let mut eof = false;

        match self.unwrap_some(buf) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => eof = true,
            Err(e) => return Err(e),
        }

        let mut wraps = 0u32;
        if !eof {
            loop {
                if self.is_buffering_output() {
                    self.flush_ciphertext()?;
                    if self.is_buffering_output() {
                        break;
                    }
                }
                match self.engine.handshake_status() {
                    HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => {
                        if self.closing {
                            eof = true;
                        }
                        break;
                    }
                    HandshakeStatus::NeedUnwrap => {
                        let progress = match self.unwrap_some(buf) {
                            Ok(p) => p,
                            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                                eof = true;
                                break;
                            }
                            Err(e) => return Err(e),
                        };
                        if !progress
                            && self.engine.handshake_status() == HandshakeStatus::NeedUnwrap
                        {
                            break;
                        }
                    }
                    HandshakeStatus::NeedTask => {
                        self.engine.run_tasks();
                        if initial_status == HandshakeStatus::NotHandshaking
                            && self.engine.handshake_status() == HandshakeStatus::NeedUnwrap
                            && wraps == 0
                        {
                            // Broken-client signature: the engine demands
                            // more handshake data right after reporting no
                            // handshake was in flight, without ever
                            // wrapping. Fail fast instead of looping.
                            // Legacy compatibility logic; stock engines do
                            // not reach this state.
                            log::warn!("tls: malformed initial handshake, failing connection");
                            eof = true;
                            break;
                        }
                    }
                    HandshakeStatus::NeedWrap => {
                        wraps += 1;
                        self.wrap_handshake()?;
                        self.flush_ciphertext()?;
                    }
                }
            }
        }

        let gained = buf.len() - before;
        if gained > 0 {
            Ok(Fill::Bytes(gained))
        } else if eof {
            Ok(Fill::Eof)
        } else {
            Ok(Fill::WouldBlock)
        }
    }

    fn flush(&mut self, buf: &mut IoBuffer) -> io::Result<usize> {
        if self.closed {
            return Err(eof_error());
        }
        let mut consumed = 0usize;
        loop {
            if self.is_buffering_output() {
                self.flush_ciphertext()?;
                if self.is_buffering_output() {
                    break;
                }
            }
            match self.engine.handshake_status() {
                HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => {
                    if self.closing {
                        if consumed == 0 {
                            return Err(eof_error());
                        }
                        break;
                    }
                    if buf.is_empty() {
                        break;
                    }
                    let n = self.wrap_app(buf)?;
                    if n == 0 {
                        break;
                    }
                    consumed += n;
                }
                HandshakeStatus::NeedUnwrap => {
                    let mut scratch = self.pool.lease(self.engine.application_buffer_size());
                    let progress = self.unwrap_some(&mut scratch);
                    self.pool.release(scratch);
                    let progress = progress?;
                    if !progress && self.engine.handshake_status() == HandshakeStatus::NeedUnwrap {
                        break;
                    }
                }
                HandshakeStatus::NeedTask => self.engine.run_tasks(),
                HandshakeStatus::NeedWrap => {
                    self.wrap_handshake()?;
                    self.flush_ciphertext()?;
                    if self.is_buffering_output() {
                        break;
                    }
                }
            }
        }
        Ok(consumed)
    }

    /// Orderly TLS shutdown, then the inner close. Buffers go back to the
    /// pool exactly once, on every exit path.
    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closing = true;
        self.close_handshake();
        self.release_buffers();
        self.closed = true;
        self.inner.close()
    }

    fn is_open(&self) -> bool {
        !self.closed && self.inner.is_open()
    }

    fn is_input_shutdown(&self) -> bool {
        self.closing || self.inner.is_input_shutdown()
    }

    fn is_output_shutdown(&self) -> bool {
        self.closing || self.inner.is_output_shutdown()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }

    fn block_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        self.inner.block_readable(timeout)
    }

    fn block_writable(&mut self, timeout: Duration) -> io::Result<bool> {
        self.inner.block_writable(timeout)
    }
}

impl<E: EndPoint> Drop for TlsEndPoint<E> {
    fn drop(&mut self) {
        // Backstop for teardown paths that never called close().
        self.release_buffers();
    }
}

impl<E: EndPoint> std::fmt::Debug for TlsEndPoint<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEndPoint")
            .field("status", &self.engine.handshake_status())
            .field("closing", &self.closing)
            .field("closed", &self.closed)
            .field("buffering_in", &self.is_buffering_input())
            .field("buffering_out", &self.is_buffering_output())
            .finish()
    }
}
