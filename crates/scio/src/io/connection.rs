// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The protocol-layer collaborator interface.
//!
//! The connection layer does not parse bytes itself; it hands each
//! accepted socket to a [`Connection`] produced by the server's
//! [`ConnectionFactory`]. The reactor drives the connection by invoking
//! `handle()` on a worker thread whenever the endpoint becomes ready, and
//! notifies it of idle expiry. A connection may replace itself from
//! `handle()` (protocol upgrade); subsequent dispatches go to the
//! replacement.

use std::io;
use std::sync::Arc;

use crate::reactor::SelectEndPoint;

use super::endpoint::BoxedEndPoint;

/// One protocol session over an endpoint, driven by the reactor.
pub trait Connection: Send {
    /// Consume/produce whatever is currently possible on the transport.
    ///
    /// Called on a worker thread with the endpoint's dispatch right held;
    /// at most one thread runs `handle` for a given endpoint at a time.
    /// Returning `Ok(Some(next))` replaces this connection with `next`
    /// (e.g. a protocol upgrade); `Ok(None)` keeps it. Errors close the
    /// connection.
    fn handle(&mut self) -> io::Result<Option<Box<dyn Connection>>>;

    /// The endpoint sat idle past its limit. Most implementations close.
    fn idle_expired(&mut self);

    /// True while the connection has suspended itself and must not be
    /// dispatched on readiness (it will be resumed by a scheduled
    /// timeout or an explicit dispatch).
    fn is_suspended(&self) -> bool {
        false
    }
}

/// Creates the protocol connection for each accepted socket.
///
/// `transport` carries application bytes (plaintext; the TLS decorator is
/// already applied when termination is enabled). `endpoint` is the
/// reactor-side handle, used for scheduling timeouts and explicit
/// dispatch.
pub trait ConnectionFactory: Send + Sync {
    fn new_connection(
        &self,
        transport: BoxedEndPoint,
        endpoint: &Arc<SelectEndPoint>,
    ) -> Box<dyn Connection>;
}

impl<F> ConnectionFactory for F
where
    F: Fn(BoxedEndPoint, &Arc<SelectEndPoint>) -> Box<dyn Connection> + Send + Sync,
{
    fn new_connection(
        &self,
        transport: BoxedEndPoint,
        endpoint: &Arc<SelectEndPoint>,
    ) -> Box<dyn Connection> {
        self(transport, endpoint)
    }
}
