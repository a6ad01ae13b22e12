use std::{io, sync::Arc};

use thiserror::Error;

/// Errors that could occur while forwarding metrics to the remote server.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to connect, or reconnect, to the remote server.
    #[error("failed to connect to {addr}: {source}")]
    Dial {
        /// Remote address that was dialed.
        addr: String,

        /// Underlying I/O error.
        source: io::Error,
    },

    /// The connection rejected or aborted a write.
    #[error("failed to write payload: {source}")]
    Write {
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Failed to cleanly shut the connection down.
    #[error("failed to close connection: {source}")]
    Close {
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// Callback receiving errors from flushes that happen in the background.
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

pub(crate) fn default_error_handler() -> ErrorHandler {
    Arc::new(|e| tracing::error!(error = %e, "Failed to forward metrics."))
}
