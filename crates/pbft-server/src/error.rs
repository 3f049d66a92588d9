//! Server error types.

use std::net::SocketAddr;

use pbft_config::ConfigError;
use pbft_core::RuntimeError;
use pbft_types::PrincipalId;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur during server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// The replica runtime stopped.
    #[error("replica runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Configuration or key material error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// This node's identity is not in the principal table.
    #[error("unknown principal {0}")]
    UnknownPrincipal(PrincipalId),
}
