// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The TLS engine capability.
//!
//! The termination endpoint never talks to a TLS library directly; it
//! drives a [`TlsEngine`], a cipher/record-layer state machine that turns
//! ciphertext into plaintext and back and reports what it needs next via
//! [`HandshakeStatus`]. The production implementation is
//! [`RustlsEngine`](super::rustls_engine::RustlsEngine); tests use a
//! scripted mock.

use std::io;

use crate::buffer::IoBuffer;

/// What the engine needs before application data can move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The engine must produce handshake ciphertext (no plaintext input).
    NeedWrap,
    /// The engine needs more ciphertext from the peer.
    NeedUnwrap,
    /// The engine has background tasks to run before continuing.
    NeedTask,
    /// The handshake just completed.
    Finished,
    /// No handshake in progress.
    NotHandshaking,
}

/// Result status of a single wrap/unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Progress was made (or nothing was pending).
    Ok,
    /// Not enough source data for a full record.
    BufferUnderflow,
    /// Destination buffer has no room for the result.
    BufferOverflow,
    /// The close alert has been seen or fully sent.
    Closed,
}

/// Outcome of a wrap/unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    /// Source bytes consumed.
    pub consumed: usize,
    /// Destination bytes produced.
    pub produced: usize,
}

impl EngineResult {
    pub fn new(status: EngineStatus, consumed: usize, produced: usize) -> Self {
        Self {
            status,
            consumed,
            produced,
        }
    }

    /// Convenience for "nothing happened, need more input".
    pub fn underflow() -> Self {
        Self::new(EngineStatus::BufferUnderflow, 0, 0)
    }
}

/// A cipher/record-layer engine: ciphertext in, plaintext out, and back.
///
/// All calls are non-blocking. The caller owns the ciphertext buffers and
/// is responsible for moving them to and from the socket.
pub trait TlsEngine: Send {
    /// What the handshake state machine needs next.
    fn handshake_status(&self) -> HandshakeStatus;

    /// Feed ciphertext (`src`) in; decrypted plaintext is appended to
    /// `dst`. Handshake records are consumed internally.
    fn unwrap(&mut self, src: &[u8], dst: &mut IoBuffer) -> io::Result<EngineResult>;

    /// Encrypt plaintext (`src`, may be empty to advance the handshake)
    /// and append the resulting ciphertext to `dst`.
    fn wrap(&mut self, src: &[u8], dst: &mut IoBuffer) -> io::Result<EngineResult>;

    /// Run any pending background tasks synchronously.
    fn run_tasks(&mut self);

    /// Queue the outbound close alert. Idempotent.
    fn close_outbound(&mut self);

    /// The peer's close alert has been received.
    fn is_inbound_done(&self) -> bool;

    /// Our close alert has been produced and nothing more is pending.
    fn is_outbound_done(&self) -> bool;

    /// Recommended capacity for ciphertext buffers (one full record).
    fn packet_buffer_size(&self) -> usize;

    /// Recommended capacity for plaintext buffers.
    fn application_buffer_size(&self) -> usize;
}

// ============================================================================
// Scripted mock engine
// ============================================================================


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::mock::MockEngine;
    use super::*;

    #[test]
    fn test_engine_result_underflow() {
        let r = EngineResult::underflow();
        assert_eq!(r.status, EngineStatus::BufferUnderflow);
        assert_eq!(r.consumed, 0);
        assert_eq!(r.produced, 0);
    }

    #[test]
    fn test_mock_passthrough_round_trip() {
        let mut engine = MockEngine::passthrough();
        let mut ciphertext = IoBuffer::with_capacity(64);
        let r = engine.wrap(b"secret", &mut ciphertext).unwrap();
        assert_eq!(r.consumed, 6);
        assert_eq!(ciphertext.as_slice(), b"secret");

        let mut plaintext = IoBuffer::with_capacity(64);
        let r = engine.unwrap(ciphertext.as_slice(), &mut plaintext).unwrap();
        assert_eq!(r.produced, 6);
        assert_eq!(plaintext.as_slice(), b"secret");
    }

    #[test]
    fn test_mock_scripted_transitions() {
        let mut engine = MockEngine::with_status(HandshakeStatus::NeedUnwrap);
        engine.after_unwrap.push_back((
            EngineResult::new(EngineStatus::Ok, 5, 0),
            HandshakeStatus::NeedWrap,
        ));
        engine
            .after_wrap
            .push_back((EngineResult::new(EngineStatus::Ok, 0, 3), HandshakeStatus::Finished));

        let mut buf = IoBuffer::with_capacity(16);
        engine.unwrap(b"hello", &mut buf).unwrap();
        assert_eq!(engine.handshake_status(), HandshakeStatus::NeedWrap);
        engine.wrap(&[], &mut buf).unwrap();
        assert_eq!(engine.handshake_status(), HandshakeStatus::Finished);
        assert_eq!(engine.unwrap_calls, 1);
        assert_eq!(engine.wrap_calls, 1);
    }
}
