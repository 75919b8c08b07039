// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connector configuration.
//!
//! # Example
//!
//! ```
//! use scio::ConnectorConfig;
//! use std::time::Duration;
//!
//! let config = ConnectorConfig {
//!     port: 8080,
//!     max_idle_time: Duration::from_secs(30),
//!     ..Default::default()
//! };
//! ```

use std::net::IpAddr;
use std::time::Duration;

/// Configuration for the connection layer.
///
/// One `ConnectorConfig` covers the accept channel, the selector sets,
/// the worker pool, buffering, and idle policy.
#[derive(Clone, Debug)]
pub struct ConnectorConfig {
    // === Listener ===
    /// Address to bind for listening.
    pub bind_address: IpAddr,

    /// Listen port (0 = ephemeral port assigned by the OS).
    pub port: u16,

    /// Accept queue size (TCP listen backlog).
    pub accept_queue_size: usize,

    /// Enable TCP_NODELAY on accepted sockets.
    pub nodelay: bool,

    // === Reactor ===
    /// Number of selector sets; connections are sharded across them
    /// round-robin at accept time. Each set runs one loop thread.
    pub selector_sets: usize,

    /// Worker threads shared by all selector sets.
    pub worker_threads: usize,

    /// Capacity of the worker dispatch queue. A full queue rejects the
    /// dispatch and the ready endpoint is re-armed instead of dropped.
    pub dispatch_queue_capacity: usize,

    // === Buffers ===
    /// Size class for application-facing buffers leased from the pool.
    pub buffer_size: usize,

    // === Idle policy ===
    /// How long a connection may sit with no fill/flush/dispatch activity
    /// before it is expired. Zero disables idle expiry.
    pub max_idle_time: Duration,

    /// Connection count above which the connector is considered low on
    /// resources and switches to `low_resources_max_idle_time`.
    /// Zero disables the low-resource policy.
    pub low_resources_connections: usize,

    /// Reduced idle limit applied while low on resources, so idle
    /// connections are reaped quickly under load.
    pub low_resources_max_idle_time: Duration,

    // === TLS ===
    /// Terminate TLS on accepted connections.
    ///
    /// Requires the `tls` feature and a server-mode `tls_config`.
    pub tls_enabled: bool,

    /// TLS configuration (certificates, key, ALPN).
    #[cfg(feature = "tls")]
    pub tls_config: Option<crate::tls::TlsConfig>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            port: 0,
            accept_queue_size: 128,
            nodelay: true,
            selector_sets: (cpus + 3) / 4,
            worker_threads: cpus.max(4),
            dispatch_queue_capacity: 1024,
            buffer_size: 8 * 1024,
            max_idle_time: Duration::from_secs(200),
            low_resources_connections: 0,
            low_resources_max_idle_time: Duration::from_secs(5),
            tls_enabled: false,
            #[cfg(feature = "tls")]
            tls_config: None,
        }
    }
}

impl ConnectorConfig {
    /// Check the configuration for values the connector cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.selector_sets == 0 {
            return Err("selector_sets must be at least 1".into());
        }
        if self.worker_threads == 0 {
            return Err("worker_threads must be at least 1".into());
        }
        if self.dispatch_queue_capacity == 0 {
            return Err("dispatch_queue_capacity must be at least 1".into());
        }
        if self.buffer_size == 0 {
            return Err("buffer_size must be non-zero".into());
        }
        if self.tls_enabled {
            #[cfg(feature = "tls")]
            {
                match &self.tls_config {
                    None => return Err("tls_enabled requires tls_config".into()),
                    Some(c) if !c.is_server() => {
                        return Err("tls_config must be a server configuration".into())
                    }
                    Some(_) => {}
                }
            }
            #[cfg(not(feature = "tls"))]
            return Err("tls_enabled requires the 'tls' feature".into());
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ConnectorConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.selector_sets >= 1);
        assert!(config.worker_threads >= 4);
        assert!(!config.tls_enabled);
    }

    #[test]
    fn test_validate_rejects_zero_sets() {
        let config = ConnectorConfig {
            selector_sets: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tls_without_config() {
        let config = ConnectorConfig {
            tls_enabled: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
