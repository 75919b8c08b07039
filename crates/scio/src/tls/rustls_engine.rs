// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `rustls`-backed implementation of the [`TlsEngine`] capability.
//!
//! Mapping onto the rustls API:
//!
//! | engine call      | rustls sequence                                   |
//! |------------------|---------------------------------------------------|
//! | `unwrap`         | `read_tls` -> `process_new_packets` -> `reader()` |
//! | `wrap`           | `writer()` (plaintext in) -> `write_tls` (out)    |
//! | `close_outbound` | `send_close_notify`                               |
//!
//! rustls runs no delegated background tasks, so `NeedTask` is never
//! reported and `run_tasks` is a no-op; the engine-agnostic endpoint
//! still handles that status for implementations that do.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

use crate::buffer::IoBuffer;

use super::engine::{EngineResult, EngineStatus, HandshakeStatus, TlsEngine};

/// One full TLS record (16 KiB payload) plus header/MAC/padding overhead.
pub const TLS_RECORD_BUFFER_SIZE: usize = 18 * 1024;

/// Plaintext chunk size handed to the application layer.
pub const TLS_APPLICATION_BUFFER_SIZE: usize = 16 * 1024;

/// [`TlsEngine`] over a rustls client or server connection.
pub struct RustlsEngine {
    conn: Connection,
    sent_close: bool,
    peer_closed: bool,
}

impl RustlsEngine {
    /// Server-side engine for one accepted connection.
    pub fn server(config: Arc<ServerConfig>) -> Result<Self, rustls::Error> {
        Ok(Self::from_connection(Connection::Server(
            ServerConnection::new(config)?,
        )))
    }

    /// Client-side engine; `server_name` drives SNI and verification.
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> io::Result<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let conn = ClientConnection::new(config, name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Self::from_connection(Connection::Client(conn)))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            sent_close: false,
            peer_closed: false,
        }
    }

    /// Negotiated ALPN protocol, once the handshake has completed.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }
}

/// `io::Write` adapter appending to an [`IoBuffer`].
struct BufSink<'a>(&'a mut IoBuffer);

impl Write for BufSink<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.0.put_slice(data);
        if n == 0 && !data.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "ciphertext buffer full",
            ));
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl TlsEngine for RustlsEngine {
    fn handshake_status(&self) -> HandshakeStatus {
        if self.conn.is_handshaking() {
            if self.conn.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            }
        } else if self.conn.wants_write() {
            // Records still queued inside rustls: session tickets, the
            // tail of a multi-record write, or the close alert.
            HandshakeStatus::NeedWrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut IoBuffer) -> io::Result<EngineResult> {
        let mut reader = src;
        let consumed = self.conn.read_tls(&mut reader)?;
        let state = self
            .conn
            .process_new_packets()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        if state.peer_has_closed() {
            self.peer_closed = true;
        }

        let mut produced = 0;
        while dst.space() > 0 {
            match self.conn.reader().read(dst.unfilled_mut()) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => {
                    dst.advance_put(n);
                    produced += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.peer_closed = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let status = if self.peer_closed {
            EngineStatus::Closed
        } else if consumed == 0 && produced == 0 {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(status, consumed, produced))
    }

    fn wrap(&mut self, src: &[u8], dst: &mut IoBuffer) -> io::Result<EngineResult> {
        // Application plaintext is only accepted once the handshake is
        // done; handshake-advancing wraps pass an empty source.
        let consumed = if !src.is_empty() && !self.conn.is_handshaking() && !self.sent_close {
            self.conn.writer().write(src)?
        } else {
            0
        };

        let mut produced = 0;
        while self.conn.wants_write() && dst.space() > 0 {
            match self.conn.write_tls(&mut BufSink(dst)) {
                Ok(0) => break,
                Ok(n) => produced += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        let status = if self.conn.wants_write() && dst.space() == 0 {
            EngineStatus::BufferOverflow
        } else if self.sent_close && !self.conn.wants_write() {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(status, consumed, produced))
    }

    fn run_tasks(&mut self) {
        // rustls has no delegated tasks.
    }

    fn close_outbound(&mut self) {
        if !self.sent_close {
            self.conn.send_close_notify();
            self.sent_close = true;
        }
    }

    fn is_inbound_done(&self) -> bool {
        self.peer_closed
    }

    fn is_outbound_done(&self) -> bool {
        self.sent_close && !self.conn.wants_write()
    }

    fn packet_buffer_size(&self) -> usize {
        TLS_RECORD_BUFFER_SIZE
    }

    fn application_buffer_size(&self) -> usize {
        TLS_APPLICATION_BUFFER_SIZE
    }
}

impl std::fmt::Debug for RustlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsEngine")
            .field("handshaking", &self.conn.is_handshaking())
            .field("sent_close", &self.sent_close)
            .field("peer_closed", &self.peer_closed)
            .finish()
    }
}
