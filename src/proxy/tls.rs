//! TLS termination: certificate parsing and SNI-driven selection.
//!
//! Certificates arrive as `kubernetes.io/tls` secret payloads (PEM pairs);
//! they are parsed once into a rustls [`CertifiedKey`] plus the leaf
//! metadata shown by the introspection endpoint. Selection happens per
//! handshake against the current snapshot, falling back to the default
//! certificate.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rustls::server::{ClientHello, ResolvesServerCert, ServerConfig};
use rustls::sign::CertifiedKey;
use rustls_pemfile::{certs, private_key};
use tokio::sync::watch;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::config::Snapshot;
use crate::error::Error;

/// A parsed TLS key pair: the handshake material plus the leaf certificate
/// metadata reported by the introspection endpoint.
pub struct Certificate {
    pub key: Arc<CertifiedKey>,
    pub not_before: String,
    pub not_after: String,
    /// Unix timestamp of `not_after`, for expiry highlighting.
    pub not_after_ts: i64,
    pub issuer: Vec<String>,
    pub dns_names: Vec<String>,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("not_after", &self.not_after)
            .field("dns_names", &self.dns_names)
            .finish()
    }
}

impl Certificate {
    /// Parse a PEM certificate chain and private key, as found in the
    /// `tls.crt` / `tls.key` entries of a TLS secret.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, Error> {
        let chain = certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::InvalidCertificate(format!("bad certificate chain: {e}")))?;
        if chain.is_empty() {
            return Err(Error::InvalidCertificate("no certificate found".to_string()));
        }

        let key_der = private_key(&mut &key_pem[..])
            .map_err(|e| Error::InvalidCertificate(format!("bad private key: {e}")))?
            .ok_or_else(|| Error::InvalidCertificate("no private key found".to_string()))?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| Error::InvalidCertificate(format!("unsupported key type: {e}")))?;

        let (not_before, not_after, not_after_ts, issuer, dns_names) = {
            let (_, leaf) = X509Certificate::from_der(chain[0].as_ref())
                .map_err(|e| Error::InvalidCertificate(format!("bad leaf certificate: {e}")))?;

            let issuer: Vec<String> = leaf
                .issuer()
                .iter_attributes()
                .filter_map(|attr| attr.as_str().ok())
                .map(str::to_string)
                .collect();

            let dns_names: Vec<String> = leaf
                .subject_alternative_name()
                .ok()
                .flatten()
                .map(|san| {
                    san.value
                        .general_names
                        .iter()
                        .filter_map(|name| match name {
                            GeneralName::DNSName(dns) => Some(dns.to_string()),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();

            let validity = leaf.validity();
            (
                validity.not_before.to_string(),
                validity.not_after.to_string(),
                validity.not_after.timestamp(),
                issuer,
                dns_names,
            )
        };

        Ok(Self {
            key: Arc::new(CertifiedKey::new(chain, signing_key)),
            not_before,
            not_after,
            not_after_ts,
            issuer,
            dns_names,
        })
    }

    /// Seconds until expiry (negative when already expired).
    pub fn expires_in_secs(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.not_after_ts - now
    }
}

/// SNI callback: serve the host's certificate from the current snapshot,
/// else the default certificate. With neither, the handshake fails and the
/// client sees a TLS error.
pub struct SnapshotCertResolver {
    snapshot: watch::Receiver<Arc<Snapshot>>,
}

impl SnapshotCertResolver {
    pub fn new(snapshot: watch::Receiver<Arc<Snapshot>>) -> Self {
        Self { snapshot }
    }
}

impl fmt::Debug for SnapshotCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SnapshotCertResolver")
    }
}

impl ResolvesServerCert for SnapshotCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let snapshot = self.snapshot.borrow();

        if let Some(cert) = client_hello
            .server_name()
            .and_then(|name| snapshot.certs.get(name))
        {
            return Some(cert.key.clone());
        }

        snapshot.default_cert.as_ref().map(|cert| cert.key.clone())
    }
}

/// Server-side TLS configuration for the HTTPS listener: certificate
/// selection through the snapshot, ALPN h2 + http/1.1.
pub fn server_config(snapshot: watch::Receiver<Arc<Snapshot>>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SnapshotCertResolver::new(snapshot)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Arc::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn install_crypto_provider() {
        use std::sync::Once;
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
    }

    pub(crate) fn example_certificate() -> Certificate {
        install_crypto_provider();
        Certificate::from_pem(
            include_bytes!("../../test_fixtures/tls/example.com.crt"),
            include_bytes!("../../test_fixtures/tls/example.com.key"),
        )
        .expect("fixture certificate should parse")
    }

    #[test]
    fn parses_a_valid_key_pair() {
        let cert = example_certificate();
        assert!(cert.dns_names.contains(&"example.com".to_string()));
        assert!(cert.issuer.iter().any(|part| part == "example.com" || part == "Test"));
        assert!(cert.expires_in_secs() > 0);
    }

    #[test]
    fn rejects_garbage_input() {
        install_crypto_provider();
        assert!(Certificate::from_pem(b"not a certificate", b"not a key").is_err());
    }

    #[test]
    fn rejects_mismatched_halves() {
        install_crypto_provider();
        let cert_pem = include_bytes!("../../test_fixtures/tls/example.com.crt");
        assert!(Certificate::from_pem(cert_pem, b"").is_err());
    }

    #[test]
    fn resolver_prefers_the_host_certificate() {
        install_crypto_provider();

        let mut snapshot = Snapshot::default();
        snapshot
            .certs
            .insert("example.com".to_string(), Arc::new(example_certificate()));
        let fallback = Certificate::from_pem(
            include_bytes!("../../test_fixtures/tls/fallback.crt"),
            include_bytes!("../../test_fixtures/tls/fallback.key"),
        )
        .unwrap();
        snapshot.default_cert = Some(Arc::new(fallback));

        // ClientHello cannot be built outside rustls; exercise the lookup the
        // resolver performs instead.
        let host_key = snapshot.certs.get("example.com").map(|c| c.key.clone());
        assert!(host_key.is_some());
        let default_key = snapshot.default_cert.as_ref().map(|c| c.key.clone());
        assert!(default_key.is_some());
        assert!(!Arc::ptr_eq(&host_key.unwrap(), &default_key.unwrap()));
    }
}
