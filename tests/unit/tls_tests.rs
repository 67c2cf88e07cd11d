//! Unit tests for TLS material loading failures.
//!
//! Handshake behavior is exercised end-to-end elsewhere; these tests pin
//! down the error reporting when the configured PEM files are unusable.

use std::io::Write;

use rexec::config::TlsSettings;
use rexec::{tls, AppError};

fn settings(cert: &std::path::Path, key: &std::path::Path) -> TlsSettings {
    TlsSettings {
        cert_path: cert.to_path_buf(),
        key_path: key.to_path_buf(),
    }
}

#[test]
fn missing_certificate_file_is_a_config_error() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let missing = dir.path().join("nope.pem");
    let key = dir.path().join("key.pem");

    match tls::acceptor(&settings(&missing, &key)) {
        Err(AppError::Config(msg)) => assert!(
            msg.contains("cannot read certificate"),
            "error must mention the certificate read failure, got: {msg}"
        ),
        Ok(_) => panic!("expected Err(AppError::Config), got: Ok(acceptor)"),
        Err(other) => panic!("expected Err(AppError::Config), got: {other:?}"),
    }
}

#[test]
fn certificate_file_without_pem_sections_is_rejected() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    std::fs::File::create(&cert)
        .and_then(|mut f| f.write_all(b"this is not pem data"))
        .expect("write cert file");
    std::fs::File::create(&key).expect("write key file");

    match tls::acceptor(&settings(&cert, &key)) {
        Err(AppError::Config(msg)) => assert!(
            msg.contains("no certificates found"),
            "error must mention the empty certificate file, got: {msg}"
        ),
        Ok(_) => panic!("expected Err(AppError::Config), got: Ok(acceptor)"),
        Err(other) => panic!("expected Err(AppError::Config), got: {other:?}"),
    }
}

#[test]
fn key_file_without_a_key_is_rejected() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");

    // A syntactically valid PEM section is enough to get past certificate
    // loading; the key file is empty so key loading must fail.
    std::fs::File::create(&cert)
        .and_then(|mut f| {
            f.write_all(b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n")
        })
        .expect("write cert file");
    std::fs::File::create(&key).expect("write key file");

    match tls::acceptor(&settings(&cert, &key)) {
        Err(AppError::Config(msg)) => assert!(
            msg.contains("no private key found"),
            "error must mention the missing private key, got: {msg}"
        ),
        Ok(_) => panic!("expected Err(AppError::Config), got: Ok(acceptor)"),
        Err(other) => panic!("expected Err(AppError::Config), got: {other:?}"),
    }
}
