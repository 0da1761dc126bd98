// SPDX-FileCopyrightText: © 2025 Medbridge Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! TLS (MLLPS) support for the TCP connectors.
//!
//! Operator-supplied PEM files are loaded into rustls configs; the receiver
//! wraps accepted sockets through a [`tokio_rustls::TlsAcceptor`], the
//! dispatcher wraps outbound sockets through a
//! [`tokio_rustls::TlsConnector`].

use medbridge_core::{EngineError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TlsMinVersion {
    #[serde(rename = "1.2")]
    #[default]
    V1_2,
    #[serde(rename = "1.3")]
    V1_3,
}

impl TlsMinVersion {
    fn protocol_versions(self) -> &'static [&'static SupportedProtocolVersion] {
        static V1_2_AND_V1_3: &[&SupportedProtocolVersion] =
            &[&rustls::version::TLS12, &rustls::version::TLS13];
        static V1_3_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
        match self {
            Self::V1_2 => V1_2_AND_V1_3,
            Self::V1_3 => V1_3_ONLY,
        }
    }
}

/// TLS settings shared by the receiver and the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// PEM certificate chain presented by this side.
    pub cert_path: String,
    /// PEM private key for `cert_path`.
    pub key_path: String,
    /// PEM CA bundle used to verify the peer.
    pub ca_path: Option<String>,
    pub min_version: TlsMinVersion,
    /// SNI hostname for outbound connections; defaults to the remote host.
    pub sni_hostname: Option<String>,
    /// Receiver: require and verify a client certificate (mTLS).
    pub verify_peer: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert_path: String::new(),
            key_path: String::new(),
            ca_path: None,
            min_version: TlsMinVersion::default(),
            sni_hostname: None,
            verify_peer: false,
        }
    }
}

impl TlsSettings {
    /// Builds the server-side config for the receiver.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_key(&self.key_path)?;

        let builder = ServerConfig::builder_with_protocol_versions(
            self.min_version.protocol_versions(),
        );
        let config = if self.verify_peer {
            let ca_path = self.ca_path.as_deref().ok_or_else(|| {
                EngineError::Configuration(
                    "TLS peer verification requires a CA bundle".to_string(),
                )
            })?;
            let roots = load_root_store(ca_path)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| EngineError::Configuration(format!("invalid client CA bundle: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
                .map_err(|e| EngineError::Configuration(format!("invalid TLS cert/key: {e}")))?
        } else {
            builder
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|e| EngineError::Configuration(format!("invalid TLS cert/key: {e}")))?
        };
        Ok(Arc::new(config))
    }

    /// Builds the client-side config for the dispatcher (and for receiver
    /// CLIENT mode).
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let roots = match self.ca_path.as_deref() {
            Some(path) => load_root_store(path)?,
            None => RootCertStore::empty(),
        };
        let builder = ClientConfig::builder_with_protocol_versions(
            self.min_version.protocol_versions(),
        )
        .with_root_certificates(roots);

        // Present a client certificate when one is configured (mTLS).
        let config = if self.cert_path.is_empty() {
            builder.with_no_client_auth()
        } else {
            builder
                .with_client_auth_cert(load_certs(&self.cert_path)?, load_key(&self.key_path)?)
                .map_err(|e| EngineError::Configuration(format!("invalid TLS cert/key: {e}")))?
        };
        Ok(Arc::new(config))
    }

    /// The SNI server name used for outbound handshakes.
    pub fn server_name(&self, remote_host: &str) -> Result<ServerName<'static>> {
        let host = self.sni_hostname.as_deref().unwrap_or(remote_host);
        ServerName::try_from(host.to_string())
            .map_err(|_| EngineError::Configuration(format!("invalid TLS server name '{host}'")))
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| EngineError::Configuration(format!("cannot open TLS cert '{path}': {e}")))?;
    let mut reader = BufReader::new(file);
    let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs
        .map_err(|e| EngineError::Configuration(format!("cannot parse TLS cert '{path}': {e}")))?;
    if certs.is_empty() {
        return Err(EngineError::Configuration(format!("no certificates in '{path}'")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| EngineError::Configuration(format!("cannot open TLS key '{path}': {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| EngineError::Configuration(format!("cannot parse TLS key '{path}': {e}")))?
        .ok_or_else(|| EngineError::Configuration(format!("no private key in '{path}'")))
}

fn load_root_store(path: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| EngineError::Configuration(format!("invalid CA cert in '{path}': {e}")))?;
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_prefers_sni_hostname() {
        let settings = TlsSettings {
            sni_hostname: Some("mllp.example.org".to_string()),
            ..TlsSettings::default()
        };
        let name = settings.server_name("10.0.0.5").expect("valid name");
        assert!(matches!(name, ServerName::DnsName(_)));
    }

    #[test]
    fn test_missing_cert_file_is_configuration_error() {
        let settings = TlsSettings {
            cert_path: "/nonexistent/cert.pem".to_string(),
            key_path: "/nonexistent/key.pem".to_string(),
            ..TlsSettings::default()
        };
        match settings.server_config() {
            Err(EngineError::Configuration(msg)) => assert!(msg.contains("cannot open")),
            other => panic!("expected configuration error, got {other:?}"),
        }
    }
}
