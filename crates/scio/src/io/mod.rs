// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Endpoint and connection abstractions.
//!
//! - `endpoint` - the non-blocking fill/flush trait and its result type
//! - `channel` - plain socket endpoint over `mio::net::TcpStream`
//! - `connection` - the protocol-layer collaborator traits

pub mod channel;
pub mod connection;
pub mod endpoint;

pub use channel::ChannelEndPoint;
pub use connection::{Connection, ConnectionFactory};
pub use endpoint::{BoxedEndPoint, EndPoint, Fill};
