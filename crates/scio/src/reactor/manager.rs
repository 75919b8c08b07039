// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The selector manager: owns the selector sets, the worker pool, and the
//! connection factory.
//!
//! Accepted sockets enter through [`SelectorManager::register`] and are
//! sharded round-robin across the sets; each set runs independently and
//! there is no cross-set coordination. `stop()` is idempotent: it
//! interrupts every loop thread, joins them (each set clears its timeout
//! queue and destroys its endpoints on the way out), then shuts the
//! worker pool down.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::net::TcpStream;
use parking_lot::Mutex;

use crate::buffer::BufferPool;
use crate::config::ConnectorConfig;
use crate::io::connection::ConnectionFactory;
use crate::io::endpoint::BoxedEndPoint;
use crate::metrics::ConnectorMetrics;

use super::endpoint::{PlainEndPoint, SelectEndPoint};
use super::select_set::{Change, SelectSet, SetShared};
use super::worker::WorkerPool;

// ============================================================================
// Shared state
// ============================================================================

/// State shared by the manager, its sets, and their endpoints.
pub(crate) struct ManagerShared {
    config: ConnectorConfig,
    pool: WorkerPool,
    factory: Box<dyn ConnectionFactory>,
    buffers: Arc<BufferPool>,
    #[cfg(feature = "tls")]
    tls_server: Option<Arc<rustls::ServerConfig>>,
    endpoint_count: AtomicUsize,
    metrics: Arc<ConnectorMetrics>,
}

impl ManagerShared {
    pub(crate) fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub(crate) fn factory(&self) -> &dyn ConnectionFactory {
        &*self.factory
    }

    pub(crate) fn metrics(&self) -> &ConnectorMetrics {
        &self.metrics
    }

    /// Submit a job to the worker pool; `false` = rejected.
    pub(crate) fn dispatch(&self, job: Box<dyn FnOnce() + Send>) -> bool {
        self.pool.dispatch(job)
    }

    pub(crate) fn endpoint_opened(&self) {
        self.endpoint_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn endpoint_closed(&self) {
        self.endpoint_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn endpoint_count(&self) -> usize {
        self.endpoint_count.load(Ordering::Acquire)
    }

    /// Above the configured connection threshold, idle limits shrink so
    /// stale connections are reaped quickly.
    pub(crate) fn is_low_on_resources(&self) -> bool {
        let threshold = self.config.low_resources_connections;
        threshold > 0 && self.endpoint_count() > threshold
    }

    /// Build the transport handed to the connection factory: the plain
    /// endpoint view, or the TLS decorator when termination is enabled.
    pub(crate) fn new_transport(
        &self,
        endpoint: &Arc<SelectEndPoint>,
    ) -> io::Result<BoxedEndPoint> {
        #[cfg(feature = "tls")]
        if let Some(server_config) = &self.tls_server {
            let engine = crate::tls::RustlsEngine::server(Arc::clone(server_config))
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let plain: BoxedEndPoint = Box::new(PlainEndPoint::new(Arc::clone(endpoint)));
            return Ok(Box::new(crate::tls::TlsEndPoint::new(
                plain,
                Box::new(engine),
                Arc::clone(&self.buffers),
            )));
        }
        Ok(Box::new(PlainEndPoint::new(Arc::clone(endpoint))))
    }
}

// ============================================================================
// SelectorManager
// ============================================================================

struct SetHandle {
    shared: Arc<SetShared>,
    thread: Option<JoinHandle<()>>,
}

/// Owns N selector sets and the worker pool they dispatch to.
pub struct SelectorManager {
    shared: Arc<ManagerShared>,
    sets: Mutex<Vec<SetHandle>>,
    next_set: AtomicUsize,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl SelectorManager {
    /// Create a manager; `start()` must be called before registering
    /// connections.
    pub fn new(config: ConnectorConfig, factory: Box<dyn ConnectionFactory>) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        #[cfg(feature = "tls")]
        let buffers = Arc::new(BufferPool::new(&[
            config.buffer_size,
            crate::tls::TLS_RECORD_BUFFER_SIZE,
        ]));
        #[cfg(not(feature = "tls"))]
        let buffers = Arc::new(BufferPool::new(&[config.buffer_size]));

        #[cfg(feature = "tls")]
        let tls_server = if config.tls_enabled {
            // validate() guarantees a server-mode configuration is present.
            config.tls_config.as_ref().and_then(|c| c.server_config())
        } else {
            None
        };

        let pool = WorkerPool::new(config.worker_threads, config.dispatch_queue_capacity)?;
        let shared = Arc::new(ManagerShared {
            config,
            pool,
            factory,
            buffers,
            #[cfg(feature = "tls")]
            tls_server,
            endpoint_count: AtomicUsize::new(0),
            metrics: Arc::new(ConnectorMetrics::new()),
        });
        Ok(Self {
            shared,
            sets: Mutex::new(Vec::new()),
            next_set: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Spawn the selector loop threads. Idempotent.
    pub fn start(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut sets = self.sets.lock();
        for id in 0..self.shared.config.selector_sets {
            let (set, set_shared) = SelectSet::new(Arc::clone(&self.shared), id)?;
            let thread = thread::Builder::new()
                .name(format!("scio-selector-{}", id))
                .spawn(move || set.run())?;
            sets.push(SetHandle {
                shared: set_shared,
                thread: Some(thread),
            });
        }
        log::debug!(
            "selector manager started: {} sets, {} workers",
            sets.len(),
            self.shared.pool.threads()
        );
        Ok(())
    }

    /// Adopt an accepted non-blocking socket, sharding it round-robin
    /// across the selector sets.
    pub fn register(&self, stream: TcpStream) -> io::Result<()> {
        if !self.is_running() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "selector manager is not running",
            ));
        }
        let sets = self.sets.lock();
        if sets.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "selector manager has no selector sets",
            ));
        }
        let index = self.next_set.fetch_add(1, Ordering::Relaxed) % sets.len();
        sets[index].shared.request(Change::Register(stream));
        Ok(())
    }

    /// Stop every selector set and the worker pool. Idempotent.
    pub fn stop(&self) {
        if !self.started.load(Ordering::Acquire) || self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut sets = self.sets.lock();
        for set in sets.iter() {
            set.shared.stop();
        }
        for set in sets.iter_mut() {
            if let Some(thread) = set.thread.take() {
                if thread.join().is_err() {
                    log::warn!("selector loop thread panicked");
                }
            }
        }
        self.shared.pool.shutdown();
        log::debug!("selector manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    /// Connections currently registered across all sets.
    pub fn connection_count(&self) -> usize {
        self.shared.endpoint_count()
    }

    pub fn is_low_on_resources(&self) -> bool {
        self.shared.is_low_on_resources()
    }

    pub fn metrics(&self) -> Arc<ConnectorMetrics> {
        Arc::clone(&self.shared.metrics)
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        Arc::clone(&self.shared.buffers)
    }
}

impl Drop for SelectorManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SelectorManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorManager")
            .field("running", &self.is_running())
            .field("connections", &self.connection_count())
            .finish()
    }
}
