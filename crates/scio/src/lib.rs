// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # scio - selector-driven connection layer
//!
//! The asynchronous substrate beneath an HTTP/HTTPS server: a
//! selector-driven reactor that multiplexes many sockets over a small
//! worker pool, a blocking-style read/write facade for protocol code
//! written against a synchronous API, and a TLS termination layer that
//! turns encrypted bytes into plaintext application bytes and back.
//!
//! The protocol layer itself (HTTP parsing, request dispatch) is not
//! here; it plugs in through the [`Connection`] and [`ConnectionFactory`]
//! traits and talks to the network through an [`EndPoint`].
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                             Connector                                |
//! |   listen socket -> accept loop -> round-robin across selector sets  |
//! +---------------------------------------------------------------------+
//! |                          SelectorManager                             |
//! |   SelectSet 0 .. SelectSet N-1 (one mio::Poll + loop thread each)   |
//! |   WorkerPool (M threads, bounded dispatch queue)                    |
//! +---------------------------------------------------------------------+
//! |                           SelectEndPoint                             |
//! |   dispatch state | blocking facade | idle timestamps | timeouts     |
//! +---------------------------------------------------------------------+
//! |        PlainEndPoint            |         TlsEndPoint               |
//! |        (raw bytes)              |   (rustls engine, plaintext)      |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use scio::{Connector, ConnectorConfig, Connection, BoxedEndPoint};
//!
//! let factory = |transport: BoxedEndPoint, _ep: &_| -> Box<dyn Connection> {
//!     Box::new(MyHttpConnection::new(transport))
//! };
//! let connector = Connector::new(ConnectorConfig::default(), Box::new(factory))?;
//! connector.start()?;
//! ```
//!
//! ## Modules
//!
//! - [`io`] - endpoint and connection abstractions
//! - [`reactor`] - selector sets, scheduled endpoints, worker pool
//! - [`buffer`] - reusable buffers and the shared pool
//! - [`timeout`] - deadline queue ticked by the reactor loops
//! - [`tls`] - TLS termination (requires the `tls` feature, default-on)
//! - [`connector`] - the accept layer

pub mod buffer;
pub mod config;
pub mod connector;
pub mod io;
pub mod metrics;
pub mod reactor;
pub mod timeout;

#[cfg(feature = "tls")]
pub mod tls;

// ============================================================================
// Re-exports
// ============================================================================

pub use buffer::{BufferPool, IoBuffer};
pub use config::ConnectorConfig;
pub use connector::Connector;
pub use io::{BoxedEndPoint, ChannelEndPoint, Connection, ConnectionFactory, EndPoint, Fill};
pub use metrics::{ConnectorMetrics, MetricsSnapshot};
pub use reactor::{PlainEndPoint, SelectEndPoint, SelectorManager};
pub use timeout::{TimeoutHandle, TimeoutQueue};

#[cfg(feature = "tls")]
pub use tls::{TlsConfig, TlsEndPoint, TlsEngine};
