// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The selector-scheduled endpoint.
//!
//! [`SelectEndPoint`] couples one socket with its reactor bookkeeping:
//! dispatch state, desired readiness interest, idle tracking, and the
//! blocking facade that lets synchronous protocol code park until the
//! selector reports readiness.
//!
//! # Dispatch exclusivity
//!
//! At most one worker thread runs the connection's `handle()` at a time.
//! A readiness event that arrives while a worker is active sets
//! `redispatched` instead of spawning a second handler; the active worker
//! replays it by looping until `undispatch()` reports no pending
//! redispatch.
//!
//! # Interest changes
//!
//! Threads never touch the live poll registration. They record the state
//! that determines the desired interest and push an update request onto
//! the owning selector set's change list; the loop thread recomputes and
//! applies the interest. Desired interest:
//!
//! ```text
//! READ  = !input_shutdown  && (!dispatched || read_blocked)
//! WRITE = !output_shutdown && (!writable   || write_blocked)
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Token};
use parking_lot::{Condvar, Mutex};

use crate::buffer::IoBuffer;
use crate::io::channel::ChannelEndPoint;
use crate::io::connection::Connection;
use crate::io::endpoint::{cancelled_error, eof_error, EndPoint, Fill};
use crate::timeout::TimeoutHandle;

use super::select_set::{Change, SetShared};

/// Scheduling state, guarded by one mutex per endpoint.
#[derive(Debug)]
struct ScheduleState {
    /// A worker thread currently owns this endpoint's `handle()`.
    dispatched: bool,
    /// A readiness event arrived while dispatched; must be replayed.
    redispatched: bool,
    /// Last write attempt was fully consumed by the socket.
    writable: bool,
    /// A thread is parked in `block_readable`.
    read_blocked: bool,
    /// A thread is parked in `block_writable`.
    write_blocked: bool,
}

impl Default for ScheduleState {
    fn default() -> Self {
        Self {
            dispatched: false,
            redispatched: false,
            writable: true,
            read_blocked: false,
            write_blocked: false,
        }
    }
}

/// An endpoint that can be scheduled by a selector set.
pub struct SelectEndPoint {
    token: Token,
    channel: ChannelEndPoint,
    set: Arc<SetShared>,
    weak_self: Weak<SelectEndPoint>,
    state: Mutex<ScheduleState>,
    wake: Condvar,
    connection: Mutex<Option<Box<dyn Connection>>>,
    /// Reactor-clock ms of the last idle-eligible moment; 0 = tracking off.
    idle_timestamp: AtomicU64,
    max_idle_ms: AtomicU64,
    /// Tripped by an expired explicit deadline; parked threads bail out.
    cancelled: AtomicBool,
}

impl SelectEndPoint {
    pub(crate) fn new(stream: TcpStream, token: Token, set: Arc<SetShared>) -> Arc<Self> {
        let max_idle_ms = set.manager().config().max_idle_time.as_millis() as u64;
        Arc::new_cyclic(|weak_self| Self {
            token,
            channel: ChannelEndPoint::new(stream),
            set,
            weak_self: weak_self.clone(),
            state: Mutex::new(ScheduleState::default()),
            wake: Condvar::new(),
            connection: Mutex::new(None),
            idle_timestamp: AtomicU64::new(0),
            max_idle_ms: AtomicU64::new(max_idle_ms),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.channel.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.channel.peer_addr()
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub fn is_input_shutdown(&self) -> bool {
        self.channel.is_input_shutdown()
    }

    pub fn is_output_shutdown(&self) -> bool {
        self.channel.is_output_shutdown()
    }

    /// True once an explicit deadline expired and forced this endpoint
    /// closed.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // fill / flush
    // ------------------------------------------------------------------

    /// Non-blocking read from the socket.
    pub fn fill(&self, buf: &mut IoBuffer) -> io::Result<Fill> {
        let result = self.channel.fill(buf)?;
        if result.bytes() > 0 {
            self.touch_idle();
        }
        Ok(result)
    }

    /// Non-blocking partial write. A write that consumes less than
    /// offered marks the endpoint not-writable and asks the reactor for
    /// WRITE interest; a full drain clears both again.
    pub fn flush(&self, buf: &mut IoBuffer) -> io::Result<usize> {
        let offered = buf.len();
        let written = self.channel.flush(buf)?;
        let mut need_update = false;
        {
            let mut st = self.state.lock();
            if written < offered {
                st.writable = false;
                need_update = !st.dispatched;
            } else if !st.writable {
                st.writable = true;
                need_update = !st.dispatched;
            }
        }
        if need_update {
            self.request_update();
        }
        if written > 0 {
            self.touch_idle();
        }
        Ok(written)
    }

    /// Close the socket and always drop the reactor registration, even if
    /// the socket-level close failed.
    pub fn close(&self) -> io::Result<()> {
        let result = self.channel.close();
        self.cancel_idle();
        {
            let mut st = self.state.lock();
            st.read_blocked = false;
            st.write_blocked = false;
            self.wake.notify_all();
        }
        self.set.request(Change::Close(self.token));
        result
    }

    // ------------------------------------------------------------------
    // Blocking facade
    // ------------------------------------------------------------------

    /// Park the calling thread until the selector reports the socket
    /// readable, the endpoint closes, cancellation fires, or `timeout`
    /// elapses. Returns `false` only on a genuine timeout; a timeout does
    /// not close the connection.
    pub fn block_readable(&self, timeout: Duration) -> io::Result<bool> {
        if self.is_cancelled() {
            return Err(cancelled_error());
        }
        if !self.channel.is_open() || self.channel.is_input_shutdown() {
            return Err(eof_error());
        }
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        st.read_blocked = true;
        let mut timed_out = false;
        while st.read_blocked {
            if !self.channel.is_open() {
                st.read_blocked = false;
                return Err(eof_error());
            }
            self.set.request(Change::Update(self.token));
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                st.read_blocked = false;
                timed_out = true;
                break;
            }
            let waited = self.wake.wait_for(&mut st, remaining);
            if self.is_cancelled() {
                st.read_blocked = false;
                return Err(cancelled_error());
            }
            if waited.timed_out() && st.read_blocked {
                st.read_blocked = false;
                timed_out = true;
                break;
            }
        }
        drop(st);
        if !self.channel.is_open() {
            return Err(eof_error());
        }
        Ok(!timed_out)
    }

    /// Park the calling thread until the selector reports the socket
    /// writable. Fails fast if the write side is already shut down.
    pub fn block_writable(&self, timeout: Duration) -> io::Result<bool> {
        if self.is_cancelled() {
            return Err(cancelled_error());
        }
        if !self.channel.is_open() || self.channel.is_output_shutdown() {
            return Err(eof_error());
        }
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        st.write_blocked = true;
        let mut timed_out = false;
        while st.write_blocked {
            if !self.channel.is_open() || self.channel.is_output_shutdown() {
                st.write_blocked = false;
                return Err(eof_error());
            }
            self.set.request(Change::Update(self.token));
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                st.write_blocked = false;
                timed_out = true;
                break;
            }
            let waited = self.wake.wait_for(&mut st, remaining);
            if self.is_cancelled() {
                st.write_blocked = false;
                return Err(cancelled_error());
            }
            if waited.timed_out() && st.write_blocked {
                st.write_blocked = false;
                timed_out = true;
                break;
            }
        }
        drop(st);
        self.touch_idle();
        if !self.channel.is_open() {
            return Err(eof_error());
        }
        Ok(!timed_out)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Hand this endpoint to a worker, or mark it for replay if a worker
    /// already owns it.
    pub fn dispatch(&self) {
        let mut st = self.state.lock();
        self.dispatch_locked(&mut st);
    }

    fn dispatch_locked(&self, st: &mut ScheduleState) {
        if st.dispatched {
            st.redispatched = true;
            return;
        }
        st.dispatched = true;
        self.cancel_idle();
        let Some(ep) = self.weak_self.upgrade() else {
            st.dispatched = false;
            return;
        };
        let manager = self.set.manager();
        if manager.dispatch(Box::new(move || ep.handle())) {
            manager.metrics().record_dispatch();
        } else {
            // Pool saturated. Revert and fall back to re-arming
            // readiness so the event is replayed, not dropped.
            st.dispatched = false;
            self.schedule_idle();
            manager.metrics().record_dispatch_rejected();
            log::warn!("dispatch rejected for {:?}; re-arming interest", self.token);
            self.set.request(Change::Update(self.token));
        }
    }

    /// Called by a worker when it finishes a `handle()` pass.
    ///
    /// Returns `false` when a redispatch arrived meanwhile: the same
    /// thread must keep handling the endpoint.
    fn undispatch(&self) -> bool {
        let mut st = self.state.lock();
        if st.redispatched {
            st.redispatched = false;
            return false;
        }
        st.dispatched = false;
        self.schedule_idle();
        drop(st);
        self.set.request(Change::Update(self.token));
        true
    }

    /// Worker entry point: run the connection until it yields, then
    /// replay any redispatch that arrived while it ran.
    pub(crate) fn handle(&self) {
        loop {
            let taken = self.connection.lock().take();
            if let Some(mut conn) = taken {
                loop {
                    match conn.handle() {
                        Ok(Some(next)) => {
                            log::debug!("{:?}: connection upgraded", self.token);
                            conn = next;
                        }
                        Ok(None) => break,
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                            log::debug!("{:?}: eof: {}", self.token, e);
                            let _ = self.close();
                            break;
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                            log::debug!("{:?}: handler cancelled", self.token);
                            let _ = self.close();
                            break;
                        }
                        Err(e) => {
                            log::warn!("{:?}: handler failed: {}", self.token, e);
                            let _ = self.close();
                            break;
                        }
                    }
                }
                // Put the (possibly upgraded) connection back only while
                // the endpoint is still alive; a connection whose endpoint
                // closed under it is dropped here, which releases its
                // leased buffers. The open check happens under the slot
                // lock so teardown's take cannot interleave.
                let mut slot = self.connection.lock();
                if self.is_open() {
                    *slot = Some(conn);
                }
            }
            if self.undispatch() {
                break;
            }
        }
    }

    /// Readiness callback, run on the owning selector loop thread.
    pub(crate) fn schedule(&self, readable: bool, writable: bool) {
        let mut st = self.state.lock();
        if !self.channel.is_open() {
            st.read_blocked = false;
            st.write_blocked = false;
            self.wake.notify_all();
            return;
        }
        if st.read_blocked || st.write_blocked {
            if st.read_blocked && readable {
                st.read_blocked = false;
            }
            if st.write_blocked && writable {
                st.write_blocked = false;
            }
            // Waking the parked thread stands in for a dispatch.
            self.wake.notify_all();
            return;
        }
        if writable && !st.writable {
            // Socket drained; pending writes can progress again.
            st.writable = true;
        }
        if st.dispatched || self.connection_suspended() {
            return;
        }
        self.dispatch_locked(&mut st);
    }

    fn connection_suspended(&self) -> bool {
        // try_lock: the connection mutex is held while a worker runs
        // handle(), and in that case `dispatched` already blocks us.
        match self.connection.try_lock() {
            Some(conn) => conn.as_ref().map(|c| c.is_suspended()).unwrap_or(false),
            None => true,
        }
    }

    /// Desired readiness interest, derived from the current state.
    /// Applied only by the owning selector loop.
    pub(crate) fn desired_interest(&self) -> Option<Interest> {
        let st = self.state.lock();
        if !self.channel.is_open() {
            return None;
        }
        let read = !self.channel.is_input_shutdown() && (!st.dispatched || st.read_blocked);
        let write = !self.channel.is_output_shutdown() && (!st.writable || st.write_blocked);
        match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn request_update(&self) {
        self.set.request(Change::Update(self.token));
    }

    // ------------------------------------------------------------------
    // Connection ownership
    // ------------------------------------------------------------------

    /// Install or replace the protocol connection.
    pub(crate) fn set_connection(&self, connection: Box<dyn Connection>) {
        *self.connection.lock() = Some(connection);
    }

    pub(crate) fn take_connection(&self) -> Option<Box<dyn Connection>> {
        self.connection.lock().take()
    }

    // ------------------------------------------------------------------
    // Idle tracking
    // ------------------------------------------------------------------

    /// (Re)start idle tracking from now. Resetting the timestamp is
    /// equivalent to cancelling and rescheduling the expiry.
    pub fn schedule_idle(&self) {
        self.idle_timestamp
            .store(self.set.now_ms(), Ordering::Release);
    }

    /// Disable idle tracking (used while a dispatch is active).
    pub fn cancel_idle(&self) {
        self.idle_timestamp.store(0, Ordering::Release);
    }

    fn touch_idle(&self) {
        if self.idle_timestamp.load(Ordering::Acquire) != 0 {
            self.schedule_idle();
        }
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms.load(Ordering::Relaxed))
    }

    pub fn set_max_idle_time(&self, max_idle: Duration) {
        self.max_idle_ms
            .store(max_idle.as_millis() as u64, Ordering::Relaxed);
    }

    fn effective_max_idle_ms(&self) -> u64 {
        let normal = self.max_idle_ms.load(Ordering::Relaxed);
        let manager = self.set.manager();
        if manager.is_low_on_resources() {
            let low = manager.config().low_resources_max_idle_time.as_millis() as u64;
            if low > 0 && (normal == 0 || low < normal) {
                return low;
            }
        }
        normal
    }

    /// Idle scan, run once per loop iteration with the loop's `now`.
    pub(crate) fn check_idle(&self, now_ms: u64) {
        let stamp = self.idle_timestamp.load(Ordering::Acquire);
        if stamp == 0 {
            return;
        }
        let max = self.effective_max_idle_ms();
        if max > 0 && now_ms > stamp + max {
            self.idle_expired();
        }
    }

    fn idle_expired(&self) {
        // One shot per idle period; activity re-arms it.
        self.cancel_idle();
        let manager = self.set.manager();
        manager.metrics().record_idle_expired();
        log::debug!("{:?}: idle expired", self.token);
        let Some(ep) = self.weak_self.upgrade() else {
            return;
        };
        // The connection callback runs on a worker so a slow
        // implementation cannot stall the selector loop.
        let dispatched = manager.dispatch(Box::new(move || {
            let notified = {
                let mut slot = ep.connection.lock();
                match slot.as_mut() {
                    Some(conn) => {
                        conn.idle_expired();
                        true
                    }
                    None => false,
                }
            };
            if !notified {
                let _ = ep.close();
            }
        }));
        if !dispatched {
            let _ = self.close();
        }
    }

    // ------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------

    /// Schedule a callback on this endpoint's selector set.
    pub fn schedule_timeout(
        &self,
        delay: Duration,
        callback: Box<dyn FnOnce() + Send>,
    ) -> TimeoutHandle {
        self.set.schedule_timeout_in(delay, callback)
    }

    /// Cancel a scheduled callback; no-op if it already fired.
    pub fn cancel_timeout(&self, handle: &TimeoutHandle) -> bool {
        self.set.cancel_timeout(handle)
    }

    /// Arm a processing deadline. On expiry the endpoint is force-closed
    /// and its cancellation token trips, so parked facade threads bail
    /// out. A drastic safety valve for runaway requests: output may be
    /// left incomplete. Cancel on normal completion.
    pub fn schedule_deadline(&self, delay: Duration) -> TimeoutHandle {
        let weak = self.weak_self.clone();
        self.set.schedule_timeout_in(
            delay,
            Box::new(move || {
                let Some(ep) = weak.upgrade() else { return };
                log::warn!("{:?}: processing deadline expired, forcing close", ep.token);
                ep.cancelled.store(true, Ordering::Release);
                ep.set.manager().metrics().record_forced_close();
                let _ = ep.close();
            }),
        )
    }

    // ------------------------------------------------------------------
    // Teardown (selector loop only)
    // ------------------------------------------------------------------

    /// Final cleanup when the owning set drops this endpoint.
    pub(crate) fn on_destroyed(&self) {
        let _ = self.channel.close();
        self.cancel_idle();
        let mut st = self.state.lock();
        st.read_blocked = false;
        st.write_blocked = false;
        self.wake.notify_all();
    }

    pub(crate) fn with_stream_mut<R>(&self, f: impl FnOnce(&mut TcpStream) -> R) -> R {
        self.channel.with_stream_mut(f)
    }
}

impl std::fmt::Debug for SelectEndPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("SelectEndPoint")
            .field("token", &self.token)
            .field("open", &self.channel.is_open())
            .field("dispatched", &st.dispatched)
            .field("redispatched", &st.redispatched)
            .field("writable", &st.writable)
            .field("read_blocked", &st.read_blocked)
            .field("write_blocked", &st.write_blocked)
            .finish()
    }
}

// ============================================================================
// PlainEndPoint
// ============================================================================

/// [`EndPoint`] view over a scheduled endpoint, handed to the protocol
/// layer (directly, or wrapped by the TLS decorator).
pub struct PlainEndPoint {
    endpoint: Arc<SelectEndPoint>,
}

impl PlainEndPoint {
    pub fn new(endpoint: Arc<SelectEndPoint>) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Arc<SelectEndPoint> {
        &self.endpoint
    }
}

impl EndPoint for PlainEndPoint {
    fn fill(&mut self, buf: &mut IoBuffer) -> io::Result<Fill> {
        self.endpoint.fill(buf)
    }

    fn flush(&mut self, buf: &mut IoBuffer) -> io::Result<usize> {
        self.endpoint.flush(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        self.endpoint.close()
    }

    fn is_open(&self) -> bool {
        self.endpoint.is_open()
    }

    fn is_input_shutdown(&self) -> bool {
        self.endpoint.is_input_shutdown()
    }

    fn is_output_shutdown(&self) -> bool {
        self.endpoint.is_output_shutdown()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.endpoint.peer_addr()
    }

    fn block_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        self.endpoint.block_readable(timeout)
    }

    fn block_writable(&mut self, timeout: Duration) -> io::Result<bool> {
        self.endpoint.block_writable(timeout)
    }
}
