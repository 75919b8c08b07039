// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Plain socket endpoint over a non-blocking `mio` TCP stream.
//!
//! Maps the raw socket semantics onto the [`EndPoint`] contract:
//! `WouldBlock` is transient non-progress, `read() == 0` is end-of-stream
//! (reported once, then latched via the input-shutdown flag),
//! `Interrupted` is retried in place. `close` is idempotent and shuts the
//! socket down in both directions; the file descriptor itself is released
//! when the owning selector set drops its registration.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mio::net::TcpStream;
use parking_lot::Mutex;

use crate::buffer::IoBuffer;

use super::endpoint::{eof_error, EndPoint, Fill};

/// Endpoint over one connected, non-blocking socket.
pub struct ChannelEndPoint {
    stream: Mutex<TcpStream>,
    open: AtomicBool,
    input_shutdown: AtomicBool,
    output_shutdown: AtomicBool,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl ChannelEndPoint {
    /// Wrap an already-connected non-blocking stream.
    pub fn new(stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        Self {
            stream: Mutex::new(stream),
            open: AtomicBool::new(true),
            input_shutdown: AtomicBool::new(false),
            output_shutdown: AtomicBool::new(false),
            local_addr,
            peer_addr,
        }
    }

    /// Non-blocking read of whatever the socket currently has.
    pub fn fill(&self, buf: &mut IoBuffer) -> io::Result<Fill> {
        if !self.is_open() {
            return Err(eof_error());
        }
        if self.is_input_shutdown() {
            return Ok(Fill::Eof);
        }
        if buf.space() == 0 {
            buf.compact();
            if buf.space() == 0 {
                return Ok(Fill::WouldBlock);
            }
        }
        let mut stream = self.stream.lock();
        loop {
            match stream.read(buf.unfilled_mut()) {
                Ok(0) => {
                    self.input_shutdown.store(true, Ordering::Release);
                    return Ok(Fill::Eof);
                }
                Ok(n) => {
                    buf.advance_put(n);
                    return Ok(Fill::Bytes(n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Non-blocking partial write; consumed bytes are skipped from `buf`.
    pub fn flush(&self, buf: &mut IoBuffer) -> io::Result<usize> {
        if !self.is_open() || self.is_output_shutdown() {
            return Err(eof_error());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let mut stream = self.stream.lock();
        loop {
            match stream.write(buf.as_slice()) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    buf.skip(n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Shut down the write side; the read side stays usable.
    pub fn shutdown_output(&self) -> io::Result<()> {
        if self.output_shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.input_shutdown.load(Ordering::Acquire) {
            return self.close();
        }
        self.stream.lock().shutdown(Shutdown::Write)
    }

    /// Close the socket. Idempotent; `NotConnected` from the OS is not an
    /// error here (the peer may have torn the connection down first).
    pub fn close(&self) -> io::Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.input_shutdown.store(true, Ordering::Release);
        self.output_shutdown.store(true, Ordering::Release);
        match self.stream.lock().shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_input_shutdown(&self) -> bool {
        self.input_shutdown.load(Ordering::Acquire)
    }

    pub fn is_output_shutdown(&self) -> bool {
        self.output_shutdown.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Run `f` with exclusive access to the underlying stream.
    ///
    /// Used by the owning selector set for poll registration; nothing else
    /// should reach for the raw stream.
    pub(crate) fn with_stream_mut<R>(&self, f: impl FnOnce(&mut TcpStream) -> R) -> R {
        f(&mut self.stream.lock())
    }
}

impl EndPoint for ChannelEndPoint {
    fn fill(&mut self, buf: &mut IoBuffer) -> io::Result<Fill> {
        ChannelEndPoint::fill(self, buf)
    }

    fn flush(&mut self, buf: &mut IoBuffer) -> io::Result<usize> {
        ChannelEndPoint::flush(self, buf)
    }

    fn close(&mut self) -> io::Result<()> {
        ChannelEndPoint::close(self)
    }

    fn is_open(&self) -> bool {
        ChannelEndPoint::is_open(self)
    }

    fn is_input_shutdown(&self) -> bool {
        ChannelEndPoint::is_input_shutdown(self)
    }

    fn is_output_shutdown(&self) -> bool {
        ChannelEndPoint::is_output_shutdown(self)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        ChannelEndPoint::local_addr(self)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        ChannelEndPoint::peer_addr(self)
    }

    fn block_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
        // Not reactor-scheduled: nothing to park on.
        Ok(true)
    }

    fn block_writable(&mut self, _timeout: Duration) -> io::Result<bool> {
        Ok(true)
    }
}

impl std::fmt::Debug for ChannelEndPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEndPoint")
            .field("local", &self.local_addr)
            .field("peer", &self.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;

    /// Connected (mio accepted, std client) socket pair on loopback.
    fn socket_pair() -> (ChannelEndPoint, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(accepted);
        (ChannelEndPoint::new(stream), client)
    }

    #[test]
    fn test_fill_would_block_then_data() {
        let (ep, mut client) = socket_pair();
        let mut buf = IoBuffer::with_capacity(64);
        assert_eq!(ep.fill(&mut buf).unwrap(), Fill::WouldBlock);

        client.write_all(b"hello").unwrap();
        // Give the kernel a moment to deliver.
        let mut got = 0;
        for _ in 0..100 {
            match ep.fill(&mut buf).unwrap() {
                Fill::Bytes(n) => {
                    got += n;
                    break;
                }
                Fill::WouldBlock => std::thread::sleep(Duration::from_millis(5)),
                Fill::Eof => panic!("unexpected EOF"),
            }
        }
        assert_eq!(got, 5);
        assert_eq!(buf.as_slice(), b"hello");
    }

    #[test]
    fn test_fill_eof_on_peer_close() {
        let (ep, client) = socket_pair();
        drop(client);
        let mut buf = IoBuffer::with_capacity(64);
        let mut result = Fill::WouldBlock;
        for _ in 0..100 {
            result = ep.fill(&mut buf).unwrap();
            if result != Fill::WouldBlock {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(result, Fill::Eof);
        assert!(ep.is_input_shutdown());
        // EOF is latched.
        assert_eq!(ep.fill(&mut buf).unwrap(), Fill::Eof);
    }

    #[test]
    fn test_flush_writes_bytes() {
        use std::io::Read as _;

        let (ep, mut client) = socket_pair();
        let mut out = IoBuffer::with_capacity(64);
        out.put_slice(b"response");
        assert_eq!(ep.flush(&mut out).unwrap(), 8);
        assert!(out.is_empty());

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut received = [0u8; 8];
        client.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"response");
    }

    #[test]
    fn test_close_idempotent() {
        let (ep, _client) = socket_pair();
        ep.close().unwrap();
        assert!(!ep.is_open());
        // Second close is a no-op, not an error.
        ep.close().unwrap();

        let mut buf = IoBuffer::with_capacity(8);
        assert!(ep.fill(&mut buf).is_err());
        let mut out = IoBuffer::with_capacity(8);
        out.put_slice(b"x");
        assert!(ep.flush(&mut out).is_err());
    }

    #[test]
    fn test_addresses_known() {
        let (ep, client) = socket_pair();
        assert_eq!(ep.peer_addr().unwrap(), client.local_addr().unwrap());
        assert_eq!(ep.local_addr().unwrap(), client.peer_addr().unwrap());
    }
}
