// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLS termination tests: scripted-engine state machine coverage plus
//! real rustls round trips over pipes and over a loopback socket.

use std::io::{Read as _, Write as _};
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::{BufferPool, IoBuffer};
use crate::config::ConnectorConfig;
use crate::connector::Connector;
use crate::io::connection::Connection;
use crate::io::endpoint::pipe::PipeEndPoint;
use crate::io::endpoint::{BoxedEndPoint, EndPoint, Fill};
use crate::reactor::SelectEndPoint;

use super::config::TlsConfig;
use super::endpoint::TlsEndPoint;
use super::engine::mock::MockEngine;
use super::engine::{EngineResult, HandshakeStatus, TlsEngine};
use super::rustls_engine::RustlsEngine;

fn test_pool() -> Arc<BufferPool> {
    Arc::new(BufferPool::new(&[1024, super::TLS_RECORD_BUFFER_SIZE]))
}

fn self_signed() -> (TlsConfig, TlsConfig) {
    let key = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let server = TlsConfig::server()
        .with_cert_pem(key.cert.pem())
        .with_key_pem(key.key_pair.serialize_pem())
        .build()
        .unwrap();
    let client = TlsConfig::client()
        .dangerous_disable_verification()
        .build()
        .unwrap();
    (server, client)
}

// ============================================================================
// Scripted-engine state machine
// ============================================================================

#[test]
fn test_malformed_initial_handshake_fails_fast() {
    // The legacy broken-client signature: the engine starts out not
    // handshaking, demands a task after the first unwrap, and then asks
    // for more handshake data although nothing was ever wrapped.
    let mut engine = MockEngine::with_status(HandshakeStatus::NotHandshaking);
    engine.after_unwrap.push_back((
        EngineResult::underflow(),
        HandshakeStatus::NeedTask,
    ));
    engine.after_task.push_back(HandshakeStatus::NeedUnwrap);

    let (peer, pipe) = PipeEndPoint::pair();
    pipe.feed(b"\x16\x03\x00");
    drop(peer);
    let mut tls = TlsEndPoint::new(pipe, Box::new(engine), test_pool());

    let mut buf = IoBuffer::with_capacity(256);
    assert_eq!(tls.fill(&mut buf).unwrap(), Fill::Eof);
}

/// Passthrough engine that counts wrap calls through a shared handle.
struct CountingEngine {
    inner: MockEngine,
    wraps: Arc<std::sync::atomic::AtomicUsize>,
}

impl super::engine::TlsEngine for CountingEngine {
    fn handshake_status(&self) -> HandshakeStatus {
        self.inner.handshake_status()
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut IoBuffer) -> std::io::Result<EngineResult> {
        self.inner.unwrap(src, dst)
    }

    fn wrap(&mut self, src: &[u8], dst: &mut IoBuffer) -> std::io::Result<EngineResult> {
        self.wraps.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.wrap(src, dst)
    }

    fn run_tasks(&mut self) {
        self.inner.run_tasks()
    }

    fn close_outbound(&mut self) {
        self.inner.close_outbound()
    }

    fn is_inbound_done(&self) -> bool {
        self.inner.is_inbound_done()
    }

    fn is_outbound_done(&self) -> bool {
        self.inner.is_outbound_done()
    }

    fn packet_buffer_size(&self) -> usize {
        self.inner.packet_buffer_size()
    }

    fn application_buffer_size(&self) -> usize {
        self.inner.application_buffer_size()
    }
}

#[test]
fn test_flush_retries_partial_writes_without_rewrapping() {
    let wraps = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let engine = CountingEngine {
        inner: MockEngine::passthrough(),
        wraps: Arc::clone(&wraps),
    };
    let (mut a, mut b) = PipeEndPoint::pair();
    a.max_write = 7;
    let mut tls = TlsEndPoint::new(a, Box::new(engine), test_pool());

    let payload = b"thirty bytes of payload data!!";
    assert_eq!(payload.len(), 30);
    let mut out = IoBuffer::with_capacity(64);
    out.put_slice(payload);
    assert_eq!(tls.flush(&mut out).unwrap(), 30);
    assert!(tls.is_buffering_output());

    // Keep calling flush until the residue drains; the engine must not
    // be asked to wrap again while output is buffered.
    let mut empty = IoBuffer::with_capacity(1);
    let mut rounds = 0;
    while tls.is_buffering_output() {
        rounds += 1;
        assert!(rounds < 32, "output never drained");
        tls.flush(&mut empty).unwrap();
    }

    let mut received = Vec::new();
    let mut buf = IoBuffer::with_capacity(64);
    while let Fill::Bytes(_) = b.fill(&mut buf).unwrap() {
        received.extend_from_slice(buf.as_slice());
        buf.clear();
    }
    assert_eq!(received, payload, "bytes lost or reordered across partial writes");
    assert_eq!(
        wraps.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "engine was asked for more ciphertext before the buffer drained"
    );
}

#[test]
fn test_close_releases_buffers_exactly_once() {
    let pool = test_pool();
    let engine = MockEngine::passthrough();
    let (a, _b) = PipeEndPoint::pair();
    let before = pool.outstanding();

    let mut tls = TlsEndPoint::new(a, Box::new(engine), Arc::clone(&pool));
    assert_eq!(pool.outstanding(), before + 2);

    tls.close().unwrap();
    assert_eq!(pool.outstanding(), before);
    assert!(!tls.is_open());

    // Second close: no error, no double release.
    tls.close().unwrap();
    assert_eq!(pool.outstanding(), before);

    let mut buf = IoBuffer::with_capacity(16);
    assert!(tls.fill(&mut buf).is_err());
    assert!(tls.flush(&mut buf).is_err());
}

#[test]
fn test_close_mid_handshake_is_clean() {
    let pool = test_pool();
    let engine = MockEngine::with_status(HandshakeStatus::NeedUnwrap);
    let (a, _b) = PipeEndPoint::pair();
    let before = pool.outstanding();

    let mut tls = TlsEndPoint::new(a, Box::new(engine), Arc::clone(&pool));
    tls.close().unwrap();
    tls.close().unwrap();
    assert_eq!(pool.outstanding(), before);
}

#[test]
fn test_drop_without_close_returns_buffers() {
    let pool = test_pool();
    let before = pool.outstanding();
    {
        let engine = MockEngine::passthrough();
        let (a, _b) = PipeEndPoint::pair();
        let _tls = TlsEndPoint::new(a, Box::new(engine), Arc::clone(&pool));
        assert_eq!(pool.outstanding(), before + 2);
    }
    assert_eq!(pool.outstanding(), before);
}

// ============================================================================
// rustls round trip over pipes
// ============================================================================

fn tls_pipe_pair() -> (TlsEndPoint<PipeEndPoint>, TlsEndPoint<PipeEndPoint>) {
    let (server_config, client_config) = self_signed();
    let (client_pipe, server_pipe) = PipeEndPoint::pair();
    let server_engine = RustlsEngine::server(server_config.server_config().unwrap()).unwrap();
    let client_engine =
        RustlsEngine::client(client_config.client_config().unwrap(), "localhost").unwrap();
    let client = TlsEndPoint::new(client_pipe, Box::new(client_engine), test_pool());
    let server = TlsEndPoint::new(server_pipe, Box::new(server_engine), test_pool());
    (client, server)
}

/// Alternate fills until both engines report the handshake done.
fn pump_handshake(client: &mut TlsEndPoint<PipeEndPoint>, server: &mut TlsEndPoint<PipeEndPoint>) {
    let mut scratch = IoBuffer::with_capacity(1024);
    for _ in 0..32 {
        let _ = client.fill(&mut scratch).unwrap();
        let _ = server.fill(&mut scratch).unwrap();
        assert!(scratch.is_empty(), "application data during handshake");
        if client.engine().handshake_status() == HandshakeStatus::NotHandshaking
            && server.engine().handshake_status() == HandshakeStatus::NotHandshaking
        {
            return;
        }
    }
    panic!(
        "handshake did not complete: client={:?} server={:?}",
        client.engine().handshake_status(),
        server.engine().handshake_status()
    );
}

/// Push `payload` through `src` and read it back out of `dst`.
fn transfer(
    src: &mut TlsEndPoint<PipeEndPoint>,
    dst: &mut TlsEndPoint<PipeEndPoint>,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = IoBuffer::with_capacity(payload.len().max(1));
    assert_eq!(out.put_slice(payload), payload.len());
    let mut empty = IoBuffer::with_capacity(1);
    let mut read_buf = IoBuffer::with_capacity(32 * 1024);
    let mut received = Vec::new();
    let mut rounds = 0;
    loop {
        if out.has_content() {
            src.flush(&mut out).unwrap();
        } else {
            // Drive any records still queued inside the engine.
            src.flush(&mut empty).unwrap();
        }
        if let Fill::Bytes(_) = dst.fill(&mut read_buf).unwrap() {
            received.extend_from_slice(read_buf.as_slice());
            read_buf.clear();
        }
        if received.len() >= payload.len() && !out.has_content() && !src.is_buffering_output() {
            return received;
        }
        rounds += 1;
        assert!(rounds < 10_000, "transfer made no progress");
    }
}

#[test]
fn test_rustls_round_trip_various_sizes() {
    let (mut client, mut server) = tls_pipe_pair();
    pump_handshake(&mut client, &mut server);

    // Zero bytes to several multiples of the record size, both ways.
    let record = 16 * 1024;
    for size in [0usize, 1, 5, 1000, record - 1, record, 3 * record + 17] {
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let received = transfer(&mut client, &mut server, &payload);
        assert_eq!(received, payload, "client->server size {}", size);
        let received = transfer(&mut server, &mut client, &payload);
        assert_eq!(received, payload, "server->client size {}", size);
    }
}

#[test]
fn test_rustls_close_notify_reaches_peer_as_eof() {
    let (mut client, mut server) = tls_pipe_pair();
    pump_handshake(&mut client, &mut server);

    let received = transfer(&mut client, &mut server, b"goodbye");
    assert_eq!(received, b"goodbye");

    client.close().unwrap();
    let mut buf = IoBuffer::with_capacity(1024);
    let mut result = Fill::WouldBlock;
    for _ in 0..16 {
        result = server.fill(&mut buf).unwrap();
        if result == Fill::Eof {
            break;
        }
    }
    assert_eq!(result, Fill::Eof);
}

#[test]
fn test_rustls_engine_initial_statuses() {
    let (server_config, client_config) = self_signed();
    let server = RustlsEngine::server(server_config.server_config().unwrap()).unwrap();
    let client =
        RustlsEngine::client(client_config.client_config().unwrap(), "localhost").unwrap();

    // Client opens with a flight to send; server waits for it.
    assert_eq!(client.handshake_status(), HandshakeStatus::NeedWrap);
    assert_eq!(server.handshake_status(), HandshakeStatus::NeedUnwrap);
}

// ============================================================================
// Full stack: TLS echo over a real socket
// ============================================================================

struct EchoConnection {
    transport: BoxedEndPoint,
    buf: IoBuffer,
}

impl Connection for EchoConnection {
    fn handle(&mut self) -> std::io::Result<Option<Box<dyn Connection>>> {
        loop {
            if self.buf.has_content() {
                let n = self.transport.flush(&mut self.buf)?;
                if n == 0 && !self.transport.block_writable(Duration::from_secs(2))? {
                    return Ok(None);
                }
                continue;
            }
            match self.transport.fill(&mut self.buf)? {
                Fill::Bytes(_) => continue,
                Fill::WouldBlock => return Ok(None),
                Fill::Eof => {
                    let _ = self.transport.close();
                    return Ok(None);
                }
            }
        }
    }

    fn idle_expired(&mut self) {
        let _ = self.transport.close();
    }
}

#[test]
fn test_tls_echo_over_loopback_socket() {
    let (server_config, client_config) = self_signed();
    let config = ConnectorConfig {
        bind_address: [127, 0, 0, 1].into(),
        port: 0,
        selector_sets: 1,
        worker_threads: 2,
        tls_enabled: true,
        tls_config: Some(server_config),
        ..Default::default()
    };
    let factory = Box::new(
        |transport: BoxedEndPoint, _ep: &Arc<SelectEndPoint>| -> Box<dyn Connection> {
            Box::new(EchoConnection {
                transport,
                buf: IoBuffer::with_capacity(32 * 1024),
            })
        },
    );
    let connector = Connector::new(config, factory).unwrap();
    connector.start().unwrap();
    let addr = connector.local_addr().unwrap();

    let mut socket = std::net::TcpStream::connect(addr).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut conn = rustls::ClientConnection::new(
        client_config.client_config().unwrap(),
        rustls::pki_types::ServerName::try_from("localhost").unwrap(),
    )
    .unwrap();
    let mut tls = rustls::Stream::new(&mut conn, &mut socket);

    let large = vec![7u8; 40_000];
    for message in [&b"over tls"[..], &b"second"[..], &large[..]] {
        tls.write_all(message).unwrap();
        let mut received = vec![0u8; message.len()];
        tls.read_exact(&mut received).unwrap();
        assert_eq!(&received, message);
    }
    connector.stop();
}
