//! Connection error types.

use thiserror::Error;

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Errors reported by a connection handle.
///
/// The coordinator never inspects these; they are propagated opaquely.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// The backend rejected or failed a statement.
    #[error("statement failed: {sql}: {message}")]
    Statement { sql: String, message: String },

    /// The statement could not be parsed by the backend.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// The backend does not understand this kind of statement.
    #[error("unsupported statement: {0}")]
    Unsupported(String),

    /// Transport or driver failure.
    #[error("driver error: {0}")]
    Driver(String),

    /// The connection was closed.
    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    /// Create a statement failure.
    pub fn statement(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Statement {
            sql: sql.into(),
            message: message.into(),
        }
    }
}

impl From<sqlparser::parser::ParserError> for ConnectionError {
    fn from(e: sqlparser::parser::ParserError) -> Self {
        ConnectionError::Syntax(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_error_display() {
        let err = ConnectionError::statement("COMMIT", "no transaction is active");
        assert_eq!(err.to_string(), "statement failed: COMMIT: no transaction is active");
    }
}
