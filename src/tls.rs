//! TLS material for the public listener
//!
//! The reload controller asks a [`CertificateClient`] for a server
//! configuration covering the current domain list on every cycle.

use crate::error::CertificateError;
use async_trait::async_trait;
use rcgen::{generate_simple_self_signed, CertifiedKey as GeneratedCert};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::io::BufReader;
use std::sync::Arc;
use tracing::warn;

/// ALPN protocols offered to regular clients
pub const ALPN_PROTOCOLS: &[&[u8]] = &[b"h2", b"http/1.1"];

/// Source of TLS material for a set of domains
#[async_trait]
pub trait CertificateClient: Send + Sync + 'static {
    /// Server configuration covering `domains`, or `None` to serve plaintext
    async fn server_config(
        &self,
        domains: &[String],
    ) -> Result<Option<Arc<ServerConfig>>, CertificateError>;
}

/// Serves plain HTTP (behind another TLS terminator)
#[derive(Debug, Default, Clone, Copy)]
pub struct Plaintext;

#[async_trait]
impl CertificateClient for Plaintext {
    async fn server_config(
        &self,
        _domains: &[String],
    ) -> Result<Option<Arc<ServerConfig>>, CertificateError> {
        Ok(None)
    }
}

/// Generates one self-signed certificate covering every domain.
/// Development only; browsers will not trust it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfSigned;

#[async_trait]
impl CertificateClient for SelfSigned {
    async fn server_config(
        &self,
        domains: &[String],
    ) -> Result<Option<Arc<ServerConfig>>, CertificateError> {
        let GeneratedCert { cert, key_pair } = generate_simple_self_signed(domains.to_vec())
            .map_err(|e| CertificateError::Generate(e.to_string()))?;

        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| CertificateError::Generate(e.to_string()))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)?;
        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

        warn!(domains = ?domains, "Serving a self-signed certificate (not for production)");
        Ok(Some(Arc::new(config)))
    }
}

/// Parse every certificate in a PEM bundle
pub fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem)).collect::<Result<Vec<_>, _>>()?;

    if certs.is_empty() {
        return Err(CertificateError::Cache("no certificates found in PEM data".to_string()));
    }

    Ok(certs)
}

/// Parse the first private key (PKCS#1, PKCS#8 or SEC1) in PEM data
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, CertificateError> {
    let mut reader = BufReader::new(pem);

    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(CertificateError::Cache("no private key found in PEM data".to_string()))
}

/// Pair a chain with its key into something a resolver can hand out
pub fn certified_key(
    certs: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'static>,
) -> Result<Arc<CertifiedKey>, CertificateError> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key)?;
    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domains() -> Vec<String> {
        vec!["app.example.com".to_string(), "gate.example.com".to_string()]
    }

    #[tokio::test]
    async fn test_plaintext_has_no_config() {
        assert!(Plaintext.server_config(&domains()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_self_signed_config() {
        let config = SelfSigned.server_config(&domains()).await.unwrap().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_parse_pem_round_trip() {
        let GeneratedCert { cert, key_pair } =
            generate_simple_self_signed(vec!["app.example.com".to_string()]).unwrap();

        let certs = parse_certs(cert.pem().as_bytes()).unwrap();
        assert_eq!(certs.len(), 1);

        let key = parse_private_key(key_pair.serialize_pem().as_bytes()).unwrap();
        assert!(certified_key(certs, &key).is_ok());
    }

    #[test]
    fn test_parse_rejects_empty_pem() {
        assert!(matches!(parse_certs(b""), Err(CertificateError::Cache(_))));
        assert!(matches!(parse_private_key(b"garbage"), Err(CertificateError::Cache(_))));
    }
}
