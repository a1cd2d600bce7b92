use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, SupportedCipherSuite};
use tracing::warn;

use crate::errors::ProxyError;

/// Forward-secret cipher policy for the TLS 1.2 floor: ECDHE key exchange
/// with AES-GCM or ChaCha20-Poly1305, RSA and ECDSA flavors, plus the
/// TLS 1.3 AEAD suites.
fn pinned_cipher_suites() -> Vec<SupportedCipherSuite> {
    use rustls::crypto::ring::cipher_suite::*;
    vec![
        TLS13_AES_128_GCM_SHA256,
        TLS13_AES_256_GCM_SHA384,
        TLS13_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

/// Build the listener's rustls configuration: TLS 1.2 minimum with the
/// pinned cipher policy.
///
/// When `cert_dir` is set, `tls.crt` / `tls.key` are loaded from it.
/// Otherwise a self-signed certificate is generated once for the life of the
/// process; that mode is for development and is logged loudly.
pub fn server_config(cert_dir: Option<&Path>) -> Result<ServerConfig, ProxyError> {
    let (certs, key) = match cert_dir {
        Some(dir) => load_key_pair(dir)?,
        None => {
            warn!("no --cert-path configured, serving with a SELF-SIGNED certificate (development only)");
            self_signed_key_pair()?
        }
    };

    let provider = CryptoProvider {
        cipher_suites: pinned_cipher_suites(),
        ..ring::default_provider()
    };

    ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|err| ProxyError::Tls(err.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| ProxyError::Tls(err.to_string()))
}

fn load_key_pair(
    dir: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ProxyError> {
    let cert_path = dir.join("tls.crt");
    let key_path = dir.join("tls.key");

    let mut reader = BufReader::new(
        File::open(&cert_path)
            .map_err(|err| ProxyError::Tls(format!("open {}: {err}", cert_path.display())))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| ProxyError::Tls(format!("parse {}: {err}", cert_path.display())))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let mut reader = BufReader::new(
        File::open(&key_path)
            .map_err(|err| ProxyError::Tls(format!("open {}: {err}", key_path.display())))?,
    );
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|err| ProxyError::Tls(format!("parse {}: {err}", key_path.display())))?
        .ok_or_else(|| {
            ProxyError::Tls(format!("no private key found in {}", key_path.display()))
        })?;

    Ok((certs, key))
}

fn self_signed_key_pair(
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ProxyError> {
    let names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names)
        .map_err(|err| ProxyError::Tls(format!("self-signed certificate: {err}")))?;

    let certs = vec![cert.der().clone()];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((certs, key))
}
