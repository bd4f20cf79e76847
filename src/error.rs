use thiserror::Error;

/// The error type for rustloop operations.
///
/// This covers the failures that can occur while setting up a reactor or a
/// server: socket creation, readiness-backend creation, and configuration
/// loading. Per-connection I/O errors are not surfaced through this type;
/// they are handled asynchronously through connection state transitions and
/// the connection callback.
#[derive(Error, Debug)]
pub enum Error {
    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address")]
    InvalidAddress,

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
