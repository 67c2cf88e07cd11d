//! Client and server configuration resolved from CLI arguments and
//! environment variables.
//!
//! The transport mode is selected the same way on both sides:
//! - Client: `USE_TLS` (any non-empty value) switches the dial to TLS.
//! - Server: `TLS_CERT` and `TLS_KEY` (paths to PEM files, both set)
//!   switch the listener to TLS.

use std::env;
use std::path::PathBuf;

use crate::{AppError, Result};

/// Default port the server listens on and the client dials.
pub const DEFAULT_PORT: u16 = 9323;

/// Default server address used by the client when `-a` is not given.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:9323";

/// Environment variable selecting encrypted transport on the client.
const USE_TLS_VAR: &str = "USE_TLS";

/// Environment variable holding the server certificate path (PEM).
const TLS_CERT_VAR: &str = "TLS_CERT";

/// Environment variable holding the server private key path (PEM).
const TLS_KEY_VAR: &str = "TLS_KEY";

/// Resolved client invocation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server address as `<host>:<port>`.
    pub address: String,
    /// Whether to wrap the connection in TLS.
    pub use_tls: bool,
}

impl ClientConfig {
    /// Build a client configuration from the target address and the
    /// `USE_TLS` environment variable.
    #[must_use]
    pub fn from_env(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            use_tls: env::var(USE_TLS_VAR).is_ok_and(|value| !value.is_empty()),
        }
    }

    /// The host portion of the address, used as the TLS server name.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when the address is not of the form
    /// `<host>:<port>`.
    pub fn host(&self) -> Result<String> {
        let (host, _) = split_address(&self.address)?;
        Ok(host)
    }
}

/// TLS material locations for the server listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    /// Path to the PEM certificate chain.
    pub cert_path: PathBuf,
    /// Path to the PEM private key.
    pub key_path: PathBuf,
}

/// Resolved server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Port to listen on; the bind address is always loopback.
    pub port: u16,
    /// TLS material; `None` means plain TCP.
    pub tls: Option<TlsSettings>,
}

impl ServerConfig {
    /// Build a server configuration from the listen port and the
    /// `TLS_CERT`/`TLS_KEY` environment variables.
    #[must_use]
    pub fn from_env(port: u16) -> Self {
        Self {
            port,
            tls: tls_settings_from_env(),
        }
    }
}

/// Split a `<host>:<port>` address into its parts.
///
/// # Errors
///
/// Returns [`AppError::Config`] when the separator is missing, the host is
/// empty, or the port does not parse.
pub fn split_address(address: &str) -> Result<(String, u16)> {
    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(AppError::Config(format!(
            "invalid address '{address}': expected <host>:<port>"
        )));
    };
    if host.is_empty() {
        return Err(AppError::Config(format!(
            "invalid address '{address}': empty host"
        )));
    }
    let port = port
        .parse::<u16>()
        .map_err(|err| AppError::Config(format!("invalid port in '{address}': {err}")))?;
    Ok((host.to_owned(), port))
}

/// Read `TLS_CERT`/`TLS_KEY`; TLS is enabled only when both are non-empty.
fn tls_settings_from_env() -> Option<TlsSettings> {
    let cert = env::var(TLS_CERT_VAR).ok().filter(|value| !value.is_empty())?;
    let key = env::var(TLS_KEY_VAR).ok().filter(|value| !value.is_empty())?;
    Some(TlsSettings {
        cert_path: cert.into(),
        key_path: key.into(),
    })
}
