//! Scoped contexts handed to transaction bodies.

use std::future::Future;

use crate::connection::Connection;

use super::coordinator::TransactionCoordinator;
use super::error::{TransactionError, TransactionResult};
use super::frame::FrameId;
use super::options::TransactionOptions;

/// Builds the handle a transaction body receives.
///
/// Repository or entity-manager layers implement this to wrap the raw
/// [`ScopedContext`] in their own data-access type. The wrapper is expected
/// to route nested transactions back through the scope it was built from.
pub trait ContextFactory<C: Connection>: Send + Sync + Sized + 'static {
    type Context: Send + 'static;

    fn create(&self, scope: ScopedContext<C, Self>) -> Self::Context;
}

/// Factory that hands the [`ScopedContext`] itself to the body.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectContext;

impl<C: Connection> ContextFactory<C> for DirectContext {
    type Context = ScopedContext<C, DirectContext>;

    fn create(&self, scope: ScopedContext<C, Self>) -> Self::Context {
        scope
    }
}

/// A handle bound to one frame of a coordinator.
///
/// Statements and nested transactions go through the frame the context was
/// built for. Once that frame is closed, or while one of its children is
/// open, the context refuses work with [`TransactionError::FrameClosed`].
pub struct ScopedContext<C, F = DirectContext> {
    coordinator: TransactionCoordinator<C, F>,
    frame: FrameId,
    depth: usize,
}

impl<C, F> Clone for ScopedContext<C, F> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            frame: self.frame,
            depth: self.depth,
        }
    }
}

impl<C: Connection, F: ContextFactory<C>> ScopedContext<C, F> {
    pub(crate) fn new(coordinator: TransactionCoordinator<C, F>, frame: FrameId, depth: usize) -> Self {
        Self {
            coordinator,
            frame,
            depth,
        }
    }

    /// Frame this context is bound to.
    pub fn frame_id(&self) -> FrameId {
        self.frame
    }

    /// Depth of the bound frame; 0 inside the root transaction.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether statements may currently go through this context.
    pub fn is_active(&self) -> bool {
        self.coordinator.is_current(self.frame)
    }

    pub fn coordinator(&self) -> &TransactionCoordinator<C, F> {
        &self.coordinator
    }

    /// Execute a statement inside the bound frame.
    pub async fn execute(&self, sql: &str) -> TransactionResult<u64> {
        self.coordinator.execute_in(self.frame, sql).await
    }

    /// Run `body` in a nested frame.
    pub async fn transaction<B, Fut, T, E>(&self, body: B) -> Result<T, E>
    where
        B: FnOnce(F::Context) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<TransactionError> + Send + 'static,
    {
        self.transaction_with(TransactionOptions::default(), body).await
    }

    /// Run `body` in a nested frame with options.
    pub async fn transaction_with<B, Fut, T, E>(
        &self,
        options: impl Into<TransactionOptions>,
        body: B,
    ) -> Result<T, E>
    where
        B: FnOnce(F::Context) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<TransactionError> + Send + 'static,
    {
        self.coordinator
            .run_scoped(Some(self.frame), options.into(), body)
            .await
    }
}

impl<C, F> std::fmt::Debug for ScopedContext<C, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedContext")
            .field("frame", &self.frame)
            .field("depth", &self.depth)
            .finish()
    }
}
