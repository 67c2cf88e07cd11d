//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration or environment failure (bad address, unreadable
    /// certificate, invalid CLI input).
    Config(String),
    /// Dial, listen, accept, TLS, or multiplexer-transport failure.
    /// Fatal to the affected connection only.
    Connection(String),
    /// Malformed or mistimed protocol message, including channel preamble
    /// violations and unresolvable channel references. Terminates the
    /// affected command or connection.
    Protocol(String),
    /// The requested executable is missing or unrunnable. Becomes a
    /// degenerate `CommandResponse`; never crashes the server.
    Spawn(String),
    /// Abnormal process wait result other than a normal or signal exit.
    Process(String),
    /// Byte-level I/O failure on a stream or pipe.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Connection(msg) => write!(f, "connection: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
