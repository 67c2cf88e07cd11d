//! TLS boundary: certificate loading for the listener and an
//! encryption-only connector for the client.
//!
//! The protocol treats TLS purely as opaque transport-level encryption
//! (authentication is out of scope), so the client accepts any server
//! certificate rather than verifying it against a root store.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::client;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::CryptoProvider;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsSettings;
use crate::{AppError, Result};

/// Build a [`TlsAcceptor`] from the configured certificate/key pair.
///
/// # Errors
///
/// Returns [`AppError::Config`] when either file cannot be read, contains
/// no usable PEM sections, or the pair is rejected by rustls.
pub fn acceptor(settings: &TlsSettings) -> Result<TlsAcceptor> {
    let certs = load_certs(&settings.cert_path)?;
    let key = load_key(&settings.key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| AppError::Config(format!("tls protocol setup failed: {err}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| AppError::Config(format!("invalid certificate/key pair: {err}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Wrap an established TCP connection in a client-side TLS session.
///
/// `host` is sent as the SNI server name but the presented certificate is
/// not verified.
///
/// # Errors
///
/// Returns [`AppError::Config`] for an unusable server name and
/// [`AppError::Connection`] when the handshake fails.
pub async fn connect(socket: TcpStream, host: &str) -> Result<client::TlsStream<TcpStream>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|err| AppError::Config(format!("tls protocol setup failed: {err}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
        .with_no_client_auth();

    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|err| AppError::Config(format!("invalid tls server name '{host}': {err}")))?;

    let connector = TlsConnector::from(Arc::new(config));
    connector
        .connect(server_name, socket)
        .await
        .map_err(|err| AppError::Connection(format!("tls handshake failed: {err}")))
}

// ── PEM loading ──────────────────────────────────────────────────────────────

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|err| {
        AppError::Config(format!("cannot read certificate {}: {err}", path.display()))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|err| {
            AppError::Config(format!("invalid certificate {}: {err}", path.display()))
        })?;
    if certs.is_empty() {
        return Err(AppError::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|err| {
        AppError::Config(format!("cannot read private key {}: {err}", path.display()))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|err| AppError::Config(format!("invalid private key {}: {err}", path.display())))?
        .ok_or_else(|| AppError::Config(format!("no private key found in {}", path.display())))
}

// ── Verifier ─────────────────────────────────────────────────────────────────

/// Certificate verifier that accepts whatever the server presents.
///
/// Signature checks still run so the handshake itself is well-formed; only
/// chain and hostname validation are skipped.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
