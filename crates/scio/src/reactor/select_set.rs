// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One selector set: a poll instance, its registered endpoints, and the
//! loop thread that owns them.
//!
//! # Loop iteration
//!
//! ```text
//! +---------------------------------------------------------------+
//! | 1. apply pending changes (register / interest update / close) |
//! | 2. poll, bounded by the soonest timeout-queue deadline        |
//! | 3. per ready endpoint: wake a parked facade thread, or        |
//! |    dispatch a worker                                          |
//! | 4. tick the timeout queue + scan idle timestamps              |
//! +---------------------------------------------------------------+
//! ```
//!
//! Live poll registrations are mutated only here, on the loop thread.
//! Other threads append to the change list and wake the poll. Every
//! applied change re-registers the source, which also re-arms the
//! edge-triggered selector - a parked reader that re-requests READ always
//! observes readiness that predates the request.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use crate::timeout::{TimeoutHandle, TimeoutQueue};

use super::endpoint::SelectEndPoint;
use super::manager::ManagerShared;

/// Token reserved for the set's waker.
const WAKER_TOKEN: Token = Token(0);

/// First token handed to endpoints.
const ENDPOINT_TOKEN_START: usize = 1;

/// Upper bound on one poll wait; also the idle-scan period.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum events drained per poll.
const MAX_EVENTS: usize = 128;

/// Request queued for the loop thread.
pub(crate) enum Change {
    /// Adopt a freshly accepted socket.
    Register(TcpStream),
    /// Recompute and apply an endpoint's desired interest.
    Update(Token),
    /// Drop an endpoint's registration and destroy it.
    Close(Token),
}

// ============================================================================
// Shared half
// ============================================================================

/// The part of a selector set shared with endpoints and the manager.
pub(crate) struct SetShared {
    id: usize,
    waker: Waker,
    changes: Mutex<Vec<Change>>,
    timeouts: TimeoutQueue,
    epoch: Instant,
    running: AtomicBool,
    manager: Arc<ManagerShared>,
}

impl SetShared {
    pub(crate) fn new(id: usize, waker: Waker, manager: Arc<ManagerShared>) -> Self {
        Self {
            id,
            waker,
            changes: Mutex::new(Vec::new()),
            timeouts: TimeoutQueue::new(),
            epoch: Instant::now(),
            running: AtomicBool::new(true),
            manager,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn manager(&self) -> &ManagerShared {
        &self.manager
    }

    /// Reactor clock in milliseconds. Starts at 1 so that 0 stays free as
    /// the idle-tracking-disabled sentinel.
    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the loop thread to apply `change` and wake the poll.
    pub(crate) fn request(&self, change: Change) {
        self.changes.lock().push(change);
        if let Err(e) = self.waker.wake() {
            log::debug!("set {}: waker failed: {}", self.id, e);
        }
    }

    fn take_changes(&self) -> Vec<Change> {
        std::mem::take(&mut *self.changes.lock())
    }

    pub(crate) fn schedule_timeout_in(
        &self,
        delay: Duration,
        callback: Box<dyn FnOnce() + Send>,
    ) -> TimeoutHandle {
        let deadline = self.now_ms() + delay.as_millis() as u64;
        let handle = self.timeouts.schedule(deadline, callback);
        // The loop may be sleeping past this deadline; recompute.
        let _ = self.waker.wake();
        handle
    }

    pub(crate) fn cancel_timeout(&self, handle: &TimeoutHandle) -> bool {
        self.timeouts.cancel(handle)
    }

    /// Stop the loop. Idempotent; outstanding timeout tasks are cleared
    /// by the loop on its way out so none can fire against a stopped set.
    pub(crate) fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _ = self.waker.wake();
        }
    }
}

// ============================================================================
// Loop half
// ============================================================================

struct Registered {
    endpoint: Arc<SelectEndPoint>,
    /// Interest currently applied to the poll; `None` = deregistered.
    applied: Option<Interest>,
}

/// The loop-thread-owned half of a selector set.
pub(crate) struct SelectSet {
    poll: Poll,
    events: Events,
    endpoints: HashMap<Token, Registered>,
    next_token: usize,
    shared: Arc<SetShared>,
}

impl SelectSet {
    pub(crate) fn new(manager: Arc<ManagerShared>, id: usize) -> io::Result<(Self, Arc<SetShared>)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let shared = Arc::new(SetShared::new(id, waker, manager));
        let set = Self {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            endpoints: HashMap::new(),
            next_token: ENDPOINT_TOKEN_START,
            shared: Arc::clone(&shared),
        };
        Ok((set, shared))
    }

    /// Run the selection loop until the set is stopped.
    pub(crate) fn run(mut self) {
        log::debug!("selector set {} started", self.shared.id());
        while self.shared.is_running() {
            self.apply_changes();
            if !self.shared.is_running() {
                break;
            }
            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::warn!("set {}: poll error: {}", self.shared.id(), e);
                }
                continue;
            }
            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .filter(|event| event.token() != WAKER_TOKEN)
                .map(|event| (event.token(), event.is_readable(), event.is_writable()))
                .collect();
            for (token, readable, writable) in ready {
                let endpoint = match self.endpoints.get(&token) {
                    Some(reg) => Arc::clone(&reg.endpoint),
                    None => continue,
                };
                endpoint.schedule(readable, writable);
                self.apply_interest(token);
            }
            self.tick();
        }
        self.shutdown();
    }

    fn poll_timeout(&self) -> Duration {
        match self.shared.timeouts.next_deadline() {
            Some(deadline) => {
                let now = self.shared.now_ms();
                Duration::from_millis(deadline.saturating_sub(now)).min(DEFAULT_POLL_TIMEOUT)
            }
            None => DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Apply every queued change. The only place live registrations are
    /// touched.
    fn apply_changes(&mut self) {
        for change in self.shared.take_changes() {
            match change {
                Change::Register(stream) => self.register_endpoint(stream),
                Change::Update(token) => self.apply_interest(token),
                Change::Close(token) => self.destroy_endpoint(token),
            }
        }
    }

    fn register_endpoint(&mut self, stream: TcpStream) {
        let token = Token(self.next_token);
        self.next_token += 1;

        let endpoint = SelectEndPoint::new(stream, token, Arc::clone(&self.shared));
        let registry = self.poll.registry();
        if let Err(e) =
            endpoint.with_stream_mut(|s| registry.register(s, token, Interest::READABLE))
        {
            log::warn!(
                "set {}: failed to register accepted connection: {}",
                self.shared.id(),
                e
            );
            let _ = endpoint.close();
            return;
        }

        let manager = self.shared.manager();
        let transport = match manager.new_transport(&endpoint) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("set {}: transport setup failed: {}", self.shared.id(), e);
                let _ = endpoint.with_stream_mut(|s| self.poll.registry().deregister(s));
                let _ = endpoint.close();
                return;
            }
        };
        let connection = manager.factory().new_connection(transport, &endpoint);
        endpoint.set_connection(connection);
        endpoint.schedule_idle();

        manager.endpoint_opened();
        manager.metrics().record_accepted();
        log::trace!(
            "set {}: registered {:?} from {:?}",
            self.shared.id(),
            token,
            endpoint.peer_addr()
        );
        self.endpoints.insert(
            token,
            Registered {
                endpoint,
                applied: Some(Interest::READABLE),
            },
        );
    }

    fn apply_interest(&mut self, token: Token) {
        let outcome = match self.endpoints.get_mut(&token) {
            None => return,
            Some(reg) => {
                if !reg.endpoint.is_open() {
                    Err(())
                } else {
                    let desired = reg.endpoint.desired_interest();
                    let registry = self.poll.registry();
                    let applied = reg.applied;
                    let result = reg.endpoint.with_stream_mut(|s| match (applied, desired) {
                        (None, None) => Ok(()),
                        (Some(_), None) => registry.deregister(s),
                        (None, Some(interest)) => registry.register(s, token, interest),
                        // Unconditional re-register: re-arms the
                        // edge-triggered selector for parked waiters.
                        (Some(_), Some(interest)) => registry.reregister(s, token, interest),
                    });
                    match result {
                        Ok(()) => {
                            reg.applied = desired;
                            Ok(())
                        }
                        Err(e) => {
                            log::debug!(
                                "set {}: interest update failed on {:?}: {}",
                                self.shared.id(),
                                token,
                                e
                            );
                            Err(())
                        }
                    }
                }
            }
        };
        if outcome.is_err() {
            self.destroy_endpoint(token);
        }
    }

    fn destroy_endpoint(&mut self, token: Token) {
        let Some(reg) = self.endpoints.remove(&token) else {
            return;
        };
        if reg.applied.is_some() {
            let registry = self.poll.registry();
            let _ = reg.endpoint.with_stream_mut(|s| registry.deregister(s));
        }
        reg.endpoint.on_destroyed();
        // Dropping the connection releases any buffers it leased.
        drop(reg.endpoint.take_connection());
        let manager = self.shared.manager();
        manager.endpoint_closed();
        manager.metrics().record_closed();
        log::trace!("set {}: destroyed {:?}", self.shared.id(), token);
    }

    /// Fire due timeout tasks and expire idle endpoints, all against one
    /// `now` snapshot.
    fn tick(&mut self) {
        let now = self.shared.now_ms();
        self.shared.timeouts.tick(now);
        for reg in self.endpoints.values() {
            reg.endpoint.check_idle(now);
        }
    }

    fn shutdown(&mut self) {
        let cleared = self.shared.timeouts.clear();
        if cleared > 0 {
            log::debug!(
                "set {}: cleared {} outstanding timeout tasks",
                self.shared.id(),
                cleared
            );
        }
        let tokens: Vec<Token> = self.endpoints.keys().copied().collect();
        for token in tokens {
            self.destroy_endpoint(token);
        }
        log::debug!("selector set {} stopped", self.shared.id());
    }
}
