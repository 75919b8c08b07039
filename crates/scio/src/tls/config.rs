// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLS configuration for the termination layer.
//!
//! Server-mode configuration (certificate chain + private key) is what
//! the connector consumes; client-mode configuration exists for outbound
//! use and for driving the server in tests.
//!
//! # Example
//!
//! ```ignore
//! use scio::tls::TlsConfig;
//!
//! let tls = TlsConfig::server()
//!     .with_cert_pem(cert_pem)
//!     .with_key_pem(key_pem)
//!     .build()?;
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ServerConfig};

// ============================================================================
// TlsConfig
// ============================================================================

/// Built TLS configuration, ready to create engines from.
#[derive(Clone)]
pub struct TlsConfig {
    server_config: Option<Arc<ServerConfig>>,
    client_config: Option<Arc<ClientConfig>>,
    is_server: bool,
    alpn_protocols: Vec<Vec<u8>>,
}

impl TlsConfig {
    /// Create a builder for server-side TLS (termination).
    pub fn server() -> TlsConfigBuilder {
        TlsConfigBuilder::server()
    }

    /// Create a builder for client-side TLS.
    pub fn client() -> TlsConfigBuilder {
        TlsConfigBuilder::client()
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn is_client(&self) -> bool {
        !self.is_server
    }

    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn_protocols
    }

    pub(crate) fn server_config(&self) -> Option<Arc<ServerConfig>> {
        self.server_config.clone()
    }

    pub(crate) fn client_config(&self) -> Option<Arc<ClientConfig>> {
        self.client_config.clone()
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("is_server", &self.is_server)
            .field("alpn_protocols", &self.alpn_protocols.len())
            .finish()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`TlsConfig`].
pub struct TlsConfigBuilder {
    is_server: bool,
    cert_chain: Option<Vec<u8>>,
    private_key: Option<Vec<u8>>,
    root_certs: Vec<Vec<u8>>,
    alpn_protocols: Vec<Vec<u8>>,
    verify_peer: bool,
}

impl TlsConfigBuilder {
    fn server() -> Self {
        Self {
            is_server: true,
            cert_chain: None,
            private_key: None,
            root_certs: Vec::new(),
            alpn_protocols: Vec::new(),
            verify_peer: false,
        }
    }

    fn client() -> Self {
        Self {
            is_server: false,
            cert_chain: None,
            private_key: None,
            root_certs: Vec::new(),
            alpn_protocols: Vec::new(),
            verify_peer: true,
        }
    }

    /// Set the certificate chain (PEM).
    pub fn with_cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.cert_chain = Some(pem.into());
        self
    }

    /// Set the private key (PEM).
    pub fn with_key_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.private_key = Some(pem.into());
        self
    }

    /// Add a trusted root certificate (PEM) for peer verification.
    pub fn with_root_cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.root_certs.push(pem.into());
        self
    }

    /// Set ALPN protocols, most preferred first.
    pub fn with_alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    /// Disable server-certificate verification (client mode).
    ///
    /// # Warning
    ///
    /// Only for testing; never in production.
    pub fn dangerous_disable_verification(mut self) -> Self {
        self.verify_peer = false;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> io::Result<TlsConfig> {
        if self.is_server {
            let cert_pem = self.cert_chain.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "server requires a certificate")
            })?;
            let key_pem = self.private_key.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "server requires a private key")
            })?;

            let certs = parse_certs(&cert_pem)?;
            if certs.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no certificates found in PEM data",
                ));
            }
            let key = parse_key(&key_pem)?;

            let mut config = ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            config.alpn_protocols = self.alpn_protocols.clone();

            Ok(TlsConfig {
                server_config: Some(Arc::new(config)),
                client_config: None,
                is_server: true,
                alpn_protocols: self.alpn_protocols,
            })
        } else {
            let config = if self.verify_peer {
                let mut root_store = rustls::RootCertStore::empty();
                for pem in &self.root_certs {
                    for cert in parse_certs(pem)? {
                        root_store
                            .add(cert)
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    }
                }
                ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth()
            } else {
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth()
            };

            let mut config = config;
            config.alpn_protocols = self.alpn_protocols.clone();

            Ok(TlsConfig {
                server_config: None,
                client_config: Some(Arc::new(config)),
                is_server: false,
                alpn_protocols: self.alpn_protocols,
            })
        }
    }
}

fn parse_certs(pem: &[u8]) -> io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn parse_key(pem: &[u8]) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found in PEM"))
}

// ============================================================================
// No-verification certificate verifier (dangerous, for testing only)
// ============================================================================

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_requires_cert_and_key() {
        assert!(TlsConfig::server().build().is_err());
        assert!(TlsConfig::server()
            .with_cert_pem(b"not a cert".to_vec())
            .build()
            .is_err());
    }

    #[test]
    fn test_client_without_verification_builds() {
        let config = TlsConfig::client()
            .dangerous_disable_verification()
            .build()
            .unwrap();
        assert!(config.is_client());
        assert!(config.client_config().is_some());
        assert!(config.server_config().is_none());
    }

    #[test]
    fn test_server_with_generated_cert_builds() {
        let key = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let config = TlsConfig::server()
            .with_cert_pem(key.cert.pem())
            .with_key_pem(key.key_pair.serialize_pem())
            .with_alpn_protocols(vec![b"http/1.1".to_vec()])
            .build()
            .unwrap();
        assert!(config.is_server());
        assert!(config.server_config().is_some());
        assert_eq!(config.alpn_protocols().len(), 1);
    }

    #[test]
    fn test_rejects_garbage_key() {
        let key = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let result = TlsConfig::server()
            .with_cert_pem(key.cert.pem())
            .with_key_pem(b"garbage".to_vec())
            .build();
        assert!(result.is_err());
    }
}
