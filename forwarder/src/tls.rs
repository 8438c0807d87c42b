//! # TLS Configuration
//!
//! Builds `rustls` client/server configs for the two TLS roles the
//! forwarder plays: terminating a `tlsTcp` listener (server side) and
//! dialing a backend configured with `BackendProtocol::Tls` (client side).
//! Certificate and key material always arrives pre-parsed from the
//! embedding binary — this module only ever assembles `rustls` configs
//! from bytes it's handed, never reads a filesystem path itself.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::{ForwarderError, Result};

/// Parses a PEM-encoded certificate chain.
pub fn parse_cert_chain(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut std::io::Cursor::new(pem))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ForwarderError::TlsHandshakeFailed(format!("invalid certificate PEM: {e}")))
}

/// Parses a PEM-encoded private key (PKCS#8, PKCS#1, or SEC1).
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut std::io::Cursor::new(pem))
        .map_err(|e| ForwarderError::TlsHandshakeFailed(format!("invalid private key PEM: {e}")))?
        .ok_or_else(|| ForwarderError::TlsHandshakeFailed("no private key found in PEM".to_string()))
}

/// Builds a server-side TLS config for a `tlsTcp` listener.
///
/// When `client_certificate_required` is set, `client_ca_pem` must name the
/// trust anchors used to verify incoming client certificates; the endpoint
/// fails closed (handshake rejected) rather than silently accepting
/// unauthenticated clients if that combination is misconfigured.
pub fn build_server_config(
    cert_chain_pem: &[u8],
    private_key_pem: &[u8],
    client_certificate_required: bool,
    client_ca_pem: Option<&[u8]>,
) -> Result<Arc<ServerConfig>> {
    let certs = parse_cert_chain(cert_chain_pem)?;
    let key = parse_private_key(private_key_pem)?;

    let builder = if client_certificate_required {
        let ca_pem = client_ca_pem.ok_or_else(|| {
            ForwarderError::Config(
                "clientCertificateRequired is set but no client CA was provided".to_string(),
            )
        })?;
        let mut roots = RootCertStore::empty();
        for cert in parse_cert_chain(ca_pem)? {
            roots
                .add(cert)
                .map_err(|e| ForwarderError::TlsHandshakeFailed(format!("invalid client CA: {e}")))?;
        }
        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| ForwarderError::TlsHandshakeFailed(format!("client verifier: {e}")))?;
        ServerConfig::builder().with_client_cert_verifier(verifier)
    } else {
        ServerConfig::builder().with_no_client_auth()
    };

    let config = builder
        .with_single_cert(certs, key)
        .map_err(|e| ForwarderError::TlsHandshakeFailed(format!("server config: {e}")))?;

    Ok(Arc::new(config))
}

/// Builds a client-side TLS config for dialing a `BackendProtocol::Tls` backend.
///
/// `extra_roots_pem` augments the platform's native trust store rather than
/// replacing it, so a backend behind a private CA doesn't require disabling
/// verification of public-internet backends reached by the same forwarder.
pub fn build_client_config(extra_roots_pem: Option<&[u8]>) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        let _ = roots.add(cert);
    }
    if let Some(pem) = extra_roots_pem {
        for cert in parse_cert_chain(pem)? {
            roots
                .add(cert)
                .map_err(|e| ForwarderError::TlsHandshakeFailed(format!("invalid backend CA: {e}")))?;
        }
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Parses `host` as a `ServerName` for SNI, used when dialing a backend
/// over TLS so the handshake presents the correct hostname.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ForwarderError::TlsHandshakeFailed(format!("invalid SNI hostname: {host}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed_pair() -> (Vec<u8>, Vec<u8>) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_pem = cert.cert.pem();
        let key_pem = cert.signing_key.serialize_pem();
        (cert_pem.into_bytes(), key_pem.into_bytes())
    }

    #[test]
    fn builds_a_server_config_from_a_self_signed_cert() {
        let (cert_pem, key_pem) = self_signed_pair();
        let config = build_server_config(&cert_pem, &key_pem, false, None);
        assert!(config.is_ok());
    }

    #[test]
    fn client_cert_required_without_ca_is_a_config_error() {
        let (cert_pem, key_pem) = self_signed_pair();
        let result = build_server_config(&cert_pem, &key_pem, true, None);
        assert!(matches!(result, Err(ForwarderError::Config(_))));
    }

    #[test]
    fn client_config_builds_with_an_extra_root() {
        let (cert_pem, _key_pem) = self_signed_pair();
        let config = build_client_config(Some(&cert_pem));
        assert!(config.is_ok());
    }

    #[test]
    fn server_name_rejects_an_ip_literal_with_bad_syntax() {
        assert!(server_name("not a hostname!!").is_err());
        assert!(server_name("backend.internal").is_ok());
    }
}
