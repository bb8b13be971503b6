//! Per-call transaction options.

use crate::backend::IsolationLevel;

use super::cancel::AbortSignal;

/// Options for one `transaction()` call.
///
/// Both fields apply to the frame opened by that call only. A nested frame
/// does not inherit its parent's signal.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Passed to the root `BEGIN`; ignored on nested frames.
    pub isolation_level: Option<IsolationLevel>,
    /// Cancels this frame when fired.
    pub cancellation: Option<AbortSignal>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the isolation level.
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    /// Attach a cancellation signal.
    pub fn cancellation(mut self, signal: AbortSignal) -> Self {
        self.cancellation = Some(signal);
        self
    }
}

impl From<IsolationLevel> for TransactionOptions {
    fn from(level: IsolationLevel) -> Self {
        Self::new().isolation_level(level)
    }
}

impl From<AbortSignal> for TransactionOptions {
    fn from(signal: AbortSignal) -> Self {
        Self::new().cancellation(signal)
    }
}
