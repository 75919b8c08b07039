// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The accept layer.
//!
//! Binds the listen socket (reuse-addr, backlog from the accept queue
//! size), runs a dedicated accept loop on its own small poll (listener +
//! shutdown waker), configures each accepted socket, and hands it to the
//! selector manager, which shards connections round-robin across its
//! selector sets.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::ConnectorConfig;
use crate::io::connection::ConnectionFactory;
use crate::reactor::SelectorManager;

const LISTENER_TOKEN: Token = Token(0);
const SHUTDOWN_TOKEN: Token = Token(1);
const ACCEPT_EVENTS: usize = 16;

/// A listening connector: accept loop plus its selector manager.
pub struct Connector {
    config: ConnectorConfig,
    manager: Arc<SelectorManager>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    shutdown_waker: Mutex<Option<Arc<Waker>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: Arc<AtomicBool>,
    started: AtomicBool,
}

impl Connector {
    /// Create a connector; `start()` binds and begins accepting.
    pub fn new(config: ConnectorConfig, factory: Box<dyn ConnectionFactory>) -> io::Result<Self> {
        let manager = Arc::new(SelectorManager::new(config.clone(), factory)?);
        Ok(Self {
            config,
            manager,
            accept_thread: Mutex::new(None),
            shutdown_waker: Mutex::new(None),
            local_addr: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            started: AtomicBool::new(false),
        })
    }

    /// Bind the listen socket and start the reactor and accept loop.
    /// Idempotent.
    pub fn start(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.manager.start()?;

        let bind_addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let socket = Socket::new(
            Domain::for_address(bind_addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&bind_addr.into())?;
        socket.listen(self.config.accept_queue_size as i32)?;
        socket.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(socket.into());
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), SHUTDOWN_TOKEN)?);
        *self.shutdown_waker.lock() = Some(Arc::clone(&waker));

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let manager = Arc::clone(&self.manager);
        let nodelay = self.config.nodelay;
        let thread = thread::Builder::new()
            .name("scio-acceptor".to_string())
            .spawn(move || accept_loop(poll, listener, manager, running, nodelay))?;
        *self.accept_thread.lock() = Some(thread);

        log::debug!("connector listening on {}", local_addr);
        Ok(())
    }

    /// Stop accepting, join the accept loop, and stop the reactor.
    /// Idempotent.
    pub fn stop(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        if self.running.swap(false, Ordering::AcqRel) {
            if let Some(waker) = self.shutdown_waker.lock().take() {
                let _ = waker.wake();
            }
            if let Some(thread) = self.accept_thread.lock().take() {
                if thread.join().is_err() {
                    log::warn!("acceptor thread panicked");
                }
            }
        }
        self.manager.stop();
        log::debug!("connector stopped");
    }

    /// Bound address, once started. With port 0 this is where the OS put
    /// us.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn manager(&self) -> &Arc<SelectorManager> {
        &self.manager
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("local_addr", &self.local_addr())
            .field("running", &self.running.load(Ordering::Acquire))
            .finish()
    }
}

fn accept_loop(
    mut poll: Poll,
    listener: TcpListener,
    manager: Arc<SelectorManager>,
    running: Arc<AtomicBool>,
    nodelay: bool,
) {
    let mut events = Events::with_capacity(ACCEPT_EVENTS);
    while running.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() != io::ErrorKind::Interrupted {
                log::warn!("acceptor poll error: {}", e);
            }
            continue;
        }
        for event in events.iter() {
            if event.token() != LISTENER_TOKEN {
                continue;
            }
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        if nodelay {
                            let _ = stream.set_nodelay(true);
                        }
                        if let Err(e) = manager.register(stream) {
                            log::warn!("failed to hand off connection from {}: {}", peer, e);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("accept error: {}", e);
                        break;
                    }
                }
            }
        }
    }
    log::debug!("acceptor stopped");
}
