//! Transaction error types.

use thiserror::Error;

use crate::connection::ConnectionError;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors raised by the coordinator itself.
///
/// A transaction body may fail with any error type that converts from this
/// one; the coordinator hands the body's own error back unchanged.
#[derive(Debug, Clone, Error)]
pub enum TransactionError {
    /// The frame's cancellation signal fired before the frame could finish.
    #[error("Transaction has been aborted by the user.")]
    Aborted,

    /// The backend cannot open a frame at this depth.
    #[error("nested transactions are not supported by {backend} (depth {depth})")]
    NestingUnsupported { backend: String, depth: usize },

    /// Connection layer error, including failed commit/rollback statements.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// A root transaction is already open on this connection.
    #[error("connection is busy with transaction {root_id}")]
    ConnectionBusy { root_id: String },

    /// The context used belongs to a frame that is closed or not innermost.
    #[error("transaction frame {frame} is no longer active")]
    FrameClosed { frame: u64 },

    /// A nested frame could not be closed, so the root was rolled back
    /// instead of committed.
    #[error("transaction rolled back: frame {frame} could not be closed")]
    Poisoned { frame: u64 },
}

impl TransactionError {
    /// Whether this error reports a cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, TransactionError::Aborted)
    }

    /// Whether the connection layer produced this error.
    pub fn is_connection(&self) -> bool {
        matches!(self, TransactionError::Connection(_))
    }
}
