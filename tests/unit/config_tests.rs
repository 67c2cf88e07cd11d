//! Unit tests for configuration and environment resolution.
//!
//! Tests that touch process environment variables are serialized with
//! `serial_test` so they cannot observe each other's mutations.

use serial_test::serial;

use rexec::config::{split_address, ClientConfig, ServerConfig, DEFAULT_ADDRESS, DEFAULT_PORT};
use rexec::AppError;

// ── Address parsing ──────────────────────────────────────────────────────────

#[test]
fn default_address_parses() {
    let (host, port) = split_address(DEFAULT_ADDRESS).expect("default address must parse");
    assert_eq!(host, "127.0.0.1");
    assert_eq!(port, DEFAULT_PORT);
}

#[test]
fn hostname_addresses_parse() {
    let (host, port) = split_address("build-host:2200").expect("hostname address must parse");
    assert_eq!(host, "build-host");
    assert_eq!(port, 2200);
}

#[test]
fn address_without_port_is_rejected() {
    match split_address("localhost") {
        Err(AppError::Config(msg)) => assert!(
            msg.contains("expected <host>:<port>"),
            "error must explain the expected form, got: {msg}"
        ),
        other => panic!("expected Err(AppError::Config), got: {other:?}"),
    }
}

#[test]
fn empty_host_is_rejected() {
    assert!(matches!(split_address(":9323"), Err(AppError::Config(_))));
}

#[test]
fn non_numeric_port_is_rejected() {
    assert!(matches!(
        split_address("localhost:http"),
        Err(AppError::Config(_))
    ));
}

// ── Client environment ───────────────────────────────────────────────────────

#[test]
#[serial]
fn client_defaults_to_plain_transport() {
    std::env::remove_var("USE_TLS");
    let config = ClientConfig::from_env(DEFAULT_ADDRESS);
    assert!(!config.use_tls);
    assert_eq!(config.address, DEFAULT_ADDRESS);
}

#[test]
#[serial]
fn client_selects_tls_when_use_tls_is_set() {
    std::env::set_var("USE_TLS", "1");
    let config = ClientConfig::from_env("remote:9000");
    std::env::remove_var("USE_TLS");
    assert!(config.use_tls);
}

#[test]
#[serial]
fn empty_use_tls_means_plain_transport() {
    std::env::set_var("USE_TLS", "");
    let config = ClientConfig::from_env(DEFAULT_ADDRESS);
    std::env::remove_var("USE_TLS");
    assert!(!config.use_tls);
}

#[test]
fn client_host_extracts_the_host_part() {
    let config = ClientConfig {
        address: "remote:9000".to_owned(),
        use_tls: true,
    };
    assert_eq!(config.host().expect("host must parse"), "remote");
}

// ── Server environment ───────────────────────────────────────────────────────

#[test]
#[serial]
fn server_defaults_to_plain_listening() {
    std::env::remove_var("TLS_CERT");
    std::env::remove_var("TLS_KEY");
    let config = ServerConfig::from_env(DEFAULT_PORT);
    assert_eq!(config.port, DEFAULT_PORT);
    assert!(config.tls.is_none());
}

#[test]
#[serial]
fn server_requires_both_cert_and_key() {
    std::env::set_var("TLS_CERT", "/tmp/cert.pem");
    std::env::remove_var("TLS_KEY");
    let config = ServerConfig::from_env(DEFAULT_PORT);
    std::env::remove_var("TLS_CERT");
    assert!(
        config.tls.is_none(),
        "a certificate without a key must not enable TLS"
    );
}

#[test]
#[serial]
fn server_enables_tls_when_both_are_set() {
    std::env::set_var("TLS_CERT", "/tmp/cert.pem");
    std::env::set_var("TLS_KEY", "/tmp/key.pem");
    let config = ServerConfig::from_env(DEFAULT_PORT);
    std::env::remove_var("TLS_CERT");
    std::env::remove_var("TLS_KEY");

    let tls = config.tls.expect("both variables must enable TLS");
    assert_eq!(tls.cert_path, std::path::PathBuf::from("/tmp/cert.pem"));
    assert_eq!(tls.key_path, std::path::PathBuf::from("/tmp/key.pem"));
}
