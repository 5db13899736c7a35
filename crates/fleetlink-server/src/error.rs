//! Server error types.

use std::fmt;

/// Errors that can occur in the server runtime.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, nonsensical limits).
    ///
    /// Fatal: the server refuses to start. Fix configuration and restart.
    Config(String),

    /// Transport/network error (bind failure, accept failure).
    ///
    /// Fatal at startup (address in use); per-connection transport faults
    /// never surface here, they close only the affected session.
    Transport(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
