//! TLS configuration and certificate loading.
//!
//! Certificates are selected by SNI. Each entry may carry a DER-encoded OCSP
//! response that is stapled to the handshake. Reloading builds a fresh
//! `ServerConfig` and swaps it into the running listener; handshakes already
//! in progress finish with the old one.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;

use crate::config::loader::ConfigError;
use crate::config::{CertificateConfig, TlsConfig};

/// Picks a certificate by the name the client asked for.
#[derive(Debug, Default)]
pub struct SniResolver {
    exact: HashMap<String, Arc<CertifiedKey>>,
    /// Keyed by the parent domain of a `*.` pattern.
    wildcard: HashMap<String, Arc<CertifiedKey>>,
    fallback: Option<Arc<CertifiedKey>>,
}

impl SniResolver {
    pub fn add(&mut self, names: &[String], key: Arc<CertifiedKey>) {
        if self.fallback.is_none() {
            self.fallback = Some(key.clone());
        }
        for name in names {
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            match name.strip_prefix("*.") {
                Some(parent) => self.wildcard.insert(parent.to_string(), key.clone()),
                None => self.exact.insert(name, key.clone()),
            };
        }
    }

    /// Certificate for `server_name`; the first certificate when the client
    /// sent no name or nothing matches.
    pub fn lookup(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = server_name else {
            return self.fallback.clone();
        };
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        if let Some(key) = self.exact.get(&name) {
            return Some(key.clone());
        }
        name.split_once('.')
            .and_then(|(_, parent)| self.wildcard.get(parent))
            .or(self.fallback.as_ref())
            .cloned()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.lookup(client_hello.server_name())
    }
}

fn tls_err(path: &Path, what: impl std::fmt::Display) -> ConfigError {
    ConfigError::Tls(format!("{}: {what}", path.display()))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path).map_err(|e| tls_err(path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err(path, e))?;
    if certs.is_empty() {
        return Err(tls_err(path, "no certificates found"));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path).map_err(|e| tls_err(path, e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| tls_err(path, e))?
        .ok_or_else(|| tls_err(path, "no private key found"))
}

fn load_certified_key(
    provider: &CryptoProvider,
    config: &CertificateConfig,
) -> Result<CertifiedKey, ConfigError> {
    let certs = load_certs(&config.cert_path)?;
    let key = provider
        .key_provider
        .load_private_key(load_key(&config.key_path)?)
        .map_err(|e| tls_err(&config.key_path, e))?;

    let mut certified = CertifiedKey::new(certs, key);
    if let Some(ocsp_path) = &config.ocsp_path {
        match std::fs::read(ocsp_path) {
            Ok(response) if !response.is_empty() => certified.ocsp = Some(response),
            Ok(_) => tracing::warn!(path = ?ocsp_path, "OCSP response file is empty, not stapling"),
            // Stapling is an optimisation; a missing response only costs the
            // client a lookup.
            Err(e) => tracing::warn!(path = ?ocsp_path, error = %e, "Could not read OCSP response"),
        }
    }
    Ok(certified)
}

/// Build a rustls server config for `tls`.
pub fn build_server_config(tls: &TlsConfig) -> Result<Arc<ServerConfig>, ConfigError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let mut resolver = SniResolver::default();
    for cert in &tls.certificates {
        let key = load_certified_key(&provider, cert)?;
        resolver.add(&cert.server_names, Arc::new(key));
    }
    if resolver.fallback.is_none() {
        return Err(ConfigError::Tls("no certificates configured".to_string()));
    }

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    tracing::info!(certificates = tls.certificates.len(), "TLS configuration loaded");
    Ok(Arc::new(config))
}

/// Load TLS configuration for the listener.
pub fn load_tls_config(tls: &TlsConfig) -> Result<RustlsConfig, ConfigError> {
    Ok(RustlsConfig::from_config(build_server_config(tls)?))
}

/// Replace the certificates served by a running listener.
pub fn reload_tls_config(current: &RustlsConfig, tls: &TlsConfig) -> Result<(), ConfigError> {
    current.reload_from_config(build_server_config(tls)?);
    Ok(())
}
