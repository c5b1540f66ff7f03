//! Error types for the data-access layer.
//!
//! The taxonomy mirrors how failures surface to callers:
//! - `Connectivity`: a handle could not be opened, borrowed, or kept alive.
//! - `Remote`: the server evaluated the query and reported a structured error.
//! - `Protocol`: a reply did not match the expected envelope shape.
//! - `Capacity`: a persistence payload exceeded what the settings store can hold.
//! - `AlreadyQuerying`: a second query was started while one was in flight.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum QdeskError {
    /// A connection could not be opened, borrowed, or used.
    #[error("connection error: {0}")]
    Connectivity(String),

    /// The remote server evaluated the query and returned an error,
    /// optionally carrying the remote call stack.
    #[error("remote error: {message}")]
    Remote {
        message: String,
        trace: Option<String>,
    },

    /// A wrapped-query reply did not have the expected shape.
    /// Fatal for that call; never retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A persistence payload exceeded the settings store's capacity.
    #[error("{0}")]
    Capacity(String),

    /// A second query was started while one was already in flight.
    #[error("a query is already running")]
    AlreadyQuerying,

    /// A server with the same name but a different configuration exists.
    #[error("a server named '{0}' already exists")]
    DuplicateName(String),

    /// No server with the given name is registered.
    #[error("server '{0}' not found")]
    NotFound(String),

    /// A server configuration violated an invariant.
    #[error("invalid server config: {0}")]
    InvalidConfig(String),

    /// The settings store rejected an operation or held corrupt data.
    #[error("settings store error: {0}")]
    Store(String),

    /// File system errors from the settings store backing file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for results across the crate.
pub type Result<T> = std::result::Result<T, QdeskError>;

impl QdeskError {
    /// Build a `Remote` error with no stack trace.
    pub fn remote(message: impl Into<String>) -> Self {
        QdeskError::Remote {
            message: message.into(),
            trace: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = QdeskError::Connectivity("refused".into());
        assert_eq!(err.to_string(), "connection error: refused");

        let err = QdeskError::remote("type");
        assert_eq!(err.to_string(), "remote error: type");

        let err = QdeskError::DuplicateName("prod".into());
        assert_eq!(err.to_string(), "a server named 'prod' already exists");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: QdeskError = io.into();
        assert!(matches!(err, QdeskError::Io(_)));
    }
}
