//! Server error types.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors returned by [`Server::start_and_wait`](crate::Server::start_and_wait).
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listener could not be bound.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        /// Address the server tried to bind.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The accept loop failed before shutdown was requested.
    #[error("failed to start server: {0}")]
    Serve(#[source] io::Error),

    /// The accept loop task panicked or was cancelled.
    #[error("accept loop task failed: {0}")]
    ServeTask(String),
}

/// Errors surfaced by the response [`CompressionWriter`](crate::CompressionWriter).
#[derive(Debug, Error)]
pub enum CompressionError {
    /// The writer was written to after [`close`](crate::CompressionWriter::close).
    #[error("write on closed compression writer")]
    Closed,

    /// The compressor or the underlying sink failed.
    #[error("compression I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display() {
        let err = ServerError::Bind {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            source: io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        };
        assert_eq!(
            err.to_string(),
            "failed to listen on 0.0.0.0:8080: address in use"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_serve_error_display() {
        let err = ServerError::Serve(io::Error::other("listener closed"));
        assert!(err.to_string().starts_with("failed to start server"));
    }

    #[test]
    fn test_compression_error_from_io() {
        let err: CompressionError = io::Error::other("sink gone").into();
        assert!(matches!(err, CompressionError::Io(_)));
        assert_eq!(
            CompressionError::Closed.to_string(),
            "write on closed compression writer"
        );
    }
}
