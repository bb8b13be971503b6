//! Transaction coordinator - owns the nesting stack of one connection.
//!
//! The coordinator handles:
//! - Mapping nested `transaction()` calls onto `BEGIN` or savepoints
//! - Racing each frame's body against its cancellation signal
//! - Closing frames in LIFO order with commit/release or rollback
//! - Rolling back frames whose `transaction()` future was dropped
//! - Refusing concurrent use of the connection

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::{Capabilities, IsolationLevel, NestingPolicy};
use crate::config::CoordinatorConfig;
use crate::connection::{Connection, ConnectionResult};
use crate::transaction::cancel::CancellationBridge;
use crate::transaction::context::{ContextFactory, DirectContext, ScopedContext};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::frame::{FrameId, FrameState, TransactionFrame, TransactionStack};
use crate::transaction::options::TransactionOptions;
use crate::transaction::savepoint::SavepointNamer;

/// Coordinates nested transactions over one logical connection.
///
/// Cloning is cheap and yields a handle to the same connection and stack.
pub struct TransactionCoordinator<C, F = DirectContext> {
    inner: Arc<CoordinatorInner<C, F>>,
}

struct CoordinatorInner<C, F> {
    conn: C,
    factory: F,
    config: CoordinatorConfig,
    namer: SavepointNamer,
    stack: Mutex<TransactionStack>,
    /// Rollbacks owed by frames whose future was dropped.
    pending: Mutex<Vec<PendingRollback>>,
    /// Held while a statement is on the wire, so pending rollbacks always
    /// go out ahead of the next statement.
    wire: tokio::sync::Mutex<()>,
}

#[derive(Debug)]
struct PendingRollback {
    frame: FrameId,
    sql: String,
    nested: bool,
}

/// Where a body runs.
#[derive(Debug, Clone, Copy)]
struct Scope {
    frame: FrameId,
    depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closing {
    Commit,
    Rollback,
    Abort,
}

impl Closing {
    fn target(self) -> FrameState {
        match self {
            Closing::Commit => FrameState::Committed,
            Closing::Rollback => FrameState::RolledBack,
            Closing::Abort => FrameState::Aborted,
        }
    }
}

enum Outcome<T, E> {
    Settled(Result<T, E>),
    Cancelled,
}

/// Rolls back a frame whose `transaction()` future is dropped before the
/// frame was closed.
struct FrameGuard<C: Connection, F: ContextFactory<C>> {
    coordinator: TransactionCoordinator<C, F>,
    frame: Option<FrameId>,
}

impl<C: Connection, F: ContextFactory<C>> FrameGuard<C, F> {
    fn disarm(mut self) {
        self.frame = None;
    }
}

impl<C: Connection, F: ContextFactory<C>> Drop for FrameGuard<C, F> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.coordinator.abandon(frame);
        }
    }
}

impl<C, F> Clone for TransactionCoordinator<C, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connection> TransactionCoordinator<C, DirectContext> {
    /// Create a coordinator with the default configuration.
    pub fn new(conn: C) -> Self {
        Self::with_config(conn, CoordinatorConfig::default())
    }

    pub fn with_config(conn: C, config: CoordinatorConfig) -> Self {
        Self::with_factory(conn, DirectContext, config)
    }
}

impl<C: Connection, F: ContextFactory<C>> TransactionCoordinator<C, F> {
    /// Create a coordinator whose bodies receive contexts built by `factory`.
    pub fn with_factory(conn: C, factory: F, config: CoordinatorConfig) -> Self {
        let namer = SavepointNamer::new(config.savepoint_prefix.clone());
        Self {
            inner: Arc::new(CoordinatorInner {
                conn,
                factory,
                config,
                namer,
                stack: Mutex::new(TransactionStack::new()),
                pending: Mutex::new(Vec::new()),
                wire: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn connection(&self) -> &C {
        &self.inner.conn
    }

    pub fn capabilities(&self) -> &Capabilities {
        self.inner.conn.capabilities()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Whether a root transaction is open.
    pub fn is_transaction_active(&self) -> bool {
        !self.inner.stack.lock().is_empty()
    }

    /// Number of open frames.
    pub fn depth(&self) -> usize {
        self.inner.stack.lock().len()
    }

    /// Id of the open root transaction.
    pub fn root_id(&self) -> Option<String> {
        self.inner.stack.lock().root_id().map(String::from)
    }

    /// Snapshot of the open frames, root first.
    pub fn frames(&self) -> Vec<TransactionFrame> {
        self.inner.stack.lock().frames().to_vec()
    }

    pub(crate) fn is_current(&self, frame: FrameId) -> bool {
        self.inner.stack.lock().is_current(frame)
    }

    /// Execute a statement outside any transaction (autocommit).
    pub async fn execute(&self, sql: &str) -> TransactionResult<u64> {
        let root = self.root_id();
        if let Some(root_id) = root {
            return Err(TransactionError::ConnectionBusy { root_id });
        }
        Ok(self.issue(sql).await?)
    }

    /// Run `body` in a root transaction.
    pub async fn transaction<B, Fut, T, E>(&self, body: B) -> Result<T, E>
    where
        B: FnOnce(F::Context) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<TransactionError> + Send + 'static,
    {
        self.run_scoped(None, TransactionOptions::default(), body).await
    }

    /// Run `body` in a root transaction with options.
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
        self.run_scoped(None, options.into(), body).await
    }

    pub(crate) async fn execute_in(&self, frame: FrameId, sql: &str) -> TransactionResult<u64> {
        if !self.is_current(frame) {
            return Err(TransactionError::FrameClosed { frame });
        }
        Ok(self.issue(sql).await?)
    }

    /// Open a frame under `parent` (or a root), run `body` in it and close it.
    pub(crate) async fn run_scoped<B, Fut, T, E>(
        &self,
        parent: Option<FrameId>,
        options: TransactionOptions,
        body: B,
    ) -> Result<T, E>
    where
        B: FnOnce(F::Context) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<TransactionError> + Send + 'static,
    {
        let bridge = options.cancellation.map(CancellationBridge::new);
        if bridge.as_ref().is_some_and(CancellationBridge::aborted_at_creation) {
            debug!(parent = ?parent, "cancellation signal already fired, no frame opened");
            return Err(TransactionError::Aborted.into());
        }

        let (scope, guard) = self
            .open_frame(parent, options.isolation_level, bridge.clone())
            .await?;
        let context = self.inner.factory.create(ScopedContext::new(
            self.clone(),
            scope.frame,
            scope.depth,
        ));
        let outcome = race(body(context), bridge.as_ref()).await;

        let Some(guard) = guard else {
            return match outcome {
                Outcome::Settled(result) => result,
                Outcome::Cancelled => {
                    warn!(
                        frame = scope.frame,
                        "cancelled pass-through body keeps running against the enclosing frame"
                    );
                    Err(TransactionError::Aborted.into())
                }
            };
        };

        let (closing, result) = match outcome {
            Outcome::Settled(Ok(value)) => (Closing::Commit, Ok(value)),
            Outcome::Settled(Err(err)) => (Closing::Rollback, Err(err)),
            Outcome::Cancelled => {
                debug!(frame = scope.frame, depth = scope.depth, "cancellation won the race");
                (Closing::Abort, Err(TransactionError::Aborted.into()))
            }
        };
        let closed = self.close_frame(scope.frame, closing).await;
        guard.disarm();
        closed?;
        result
    }

    /// Push a frame and issue its opening statements.
    ///
    /// The returned guard is `None` when the call was passed through to the
    /// enclosing frame.
    async fn open_frame(
        &self,
        parent: Option<FrameId>,
        isolation: Option<IsolationLevel>,
        bridge: Option<CancellationBridge>,
    ) -> TransactionResult<(Scope, Option<FrameGuard<C, F>>)> {
        let caps = self.capabilities();

        let (scope, statements) = {
            let mut stack = self.inner.stack.lock();
            match parent {
                None => {
                    if let Some(root_id) = stack.root_id() {
                        return Err(TransactionError::ConnectionBusy {
                            root_id: root_id.to_string(),
                        });
                    }
                    let requested = isolation.or(self.inner.config.default_isolation);
                    if let Some(level) = requested.filter(|l| !caps.supports_isolation(*l)) {
                        warn!(backend = %caps.name, %level, "isolation level not supported by backend, ignoring");
                    }
                    let isolation = requested.filter(|l| caps.supports_isolation(*l));
                    let frame = stack.push_root(SavepointNamer::root_id(), isolation, bridge);
                    (Scope { frame, depth: 0 }, caps.begin_statements(isolation))
                }
                Some(parent) => {
                    if !stack.is_current(parent) {
                        return Err(TransactionError::FrameClosed { frame: parent });
                    }
                    if let Some(level) = isolation {
                        warn!(%level, "isolation level only applies to the root transaction, ignoring");
                    }
                    let depth = stack.len();
                    match caps.nesting_policy() {
                        NestingPolicy::Savepoint => {
                            let root_id = stack.root_id().unwrap_or_default();
                            let name = self.inner.namer.name_for(root_id, depth);
                            let Some(syntax) = caps.savepoint_syntax(&name) else {
                                return Err(TransactionError::NestingUnsupported {
                                    backend: caps.name.clone(),
                                    depth,
                                });
                            };
                            let frame = stack.push_nested(Some(name), bridge);
                            (Scope { frame, depth }, vec![syntax.begin])
                        }
                        NestingPolicy::Passthrough => {
                            debug!(backend = %caps.name, depth, "nested transaction passed through to enclosing frame");
                            let scope = Scope {
                                frame: parent,
                                depth: depth - 1,
                            };
                            return Ok((scope, None));
                        }
                        NestingPolicy::Reject => {
                            return Err(TransactionError::NestingUnsupported {
                                backend: caps.name.clone(),
                                depth,
                            });
                        }
                    }
                }
            }
        };
        let guard = FrameGuard {
            coordinator: self.clone(),
            frame: Some(scope.frame),
        };

        for (i, sql) in statements.iter().enumerate() {
            if let Err(err) = self.issue(sql).await {
                // The isolation statement may follow a begin that already went through.
                if statements[..i].iter().any(|s| s == &caps.begin) {
                    self.rollback_quietly().await;
                }
                {
                    let mut stack = self.inner.stack.lock();
                    stack.set_state(scope.frame, FrameState::Aborted);
                    stack.pop(scope.frame);
                }
                guard.disarm();
                warn!(frame = scope.frame, depth = scope.depth, error = %err, "failed to open transaction frame");
                return Err(err.into());
            }
        }

        debug!(frame = scope.frame, depth = scope.depth, "opened transaction frame");
        Ok((scope, Some(guard)))
    }

    async fn close_frame(&self, id: FrameId, closing: Closing) -> TransactionResult<()> {
        let target = closing.target();
        let settled = self.inner.stack.lock().settle(id, target);
        let Some((frame, orphans)) = settled else {
            debug!(frame = id, "frame was already unwound by an enclosing frame");
            return Err(TransactionError::FrameClosed { frame: id });
        };

        let caps = self.capabilities();
        let mut result = Ok(());
        if !orphans.is_empty() {
            warn!(frame = id, orphans = orphans.len(), "unwinding frames that were never closed");
            // Work of frames that never closed must not reach the commit.
            let undo = orphans
                .first()
                .and_then(TransactionFrame::savepoint)
                .and_then(|name| caps.savepoint_syntax(name));
            if let (Closing::Commit, Some(undo)) = (closing, undo) {
                result = self.issue(&undo.rollback_to).await.map(drop);
                if result.is_err() && frame.is_root() {
                    self.rollback_quietly().await;
                }
            }
        }

        let result: TransactionResult<()> = match result {
            Err(err) => Err(err.into()),
            Ok(()) => match (frame.savepoint(), closing) {
                (None, Closing::Commit) => self.commit_root().await,
                (None, _) => Ok(self.issue(&caps.rollback).await.map(drop)?),
                (Some(name), Closing::Commit) => {
                    match caps.savepoint_syntax(name).and_then(|s| s.release) {
                        Some(sql) => Ok(self.issue(&sql).await.map(drop)?),
                        None => Ok(()),
                    }
                }
                (Some(name), _) => match caps.savepoint_syntax(name) {
                    Some(syntax) => Ok(self.issue(&syntax.rollback_to).await.map(drop)?),
                    None => Ok(()),
                },
            },
        };

        {
            let mut stack = self.inner.stack.lock();
            if result.is_err() {
                stack.set_state(id, FrameState::Aborted);
                if !frame.is_root() {
                    stack.poison(id);
                }
            }
            stack.pop(id);
        }

        match &result {
            Ok(()) => debug!(frame = id, depth = frame.depth(), state = %target, "closed transaction frame"),
            Err(err) => warn!(frame = id, depth = frame.depth(), error = %err, "closing statement failed, frame aborted"),
        }
        result
    }

    /// `COMMIT` the root, unless a nested frame failed to close under it.
    async fn commit_root(&self) -> TransactionResult<()> {
        self.flush_pending().await;
        let poisoned = self.inner.stack.lock().poisoned_by();
        if let Some(frame) = poisoned {
            warn!(frame, "rolling back instead of committing, a nested frame could not be closed");
            self.rollback_quietly().await;
            return Err(TransactionError::Poisoned { frame });
        }
        if let Err(err) = self.issue(&self.capabilities().commit).await {
            self.rollback_quietly().await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Best-effort `ROLLBACK` after a failed begin or commit.
    async fn rollback_quietly(&self) {
        if let Err(err) = self.issue(&self.capabilities().rollback).await {
            warn!(error = %err, "rollback after failure also failed");
        }
    }

    /// Unwind frame `id` after its `transaction()` future was dropped.
    ///
    /// The frame leaves the stack at once; its rollback is queued and goes
    /// out before the next statement, or sooner from a background task when
    /// a runtime is available.
    fn abandon(&self, id: FrameId) {
        let caps = self.capabilities();
        {
            let mut stack = self.inner.stack.lock();
            let Some((frame, orphans)) = stack.settle(id, FrameState::Aborted) else {
                return;
            };
            stack.pop(id);

            let mut pending = self.inner.pending.lock();
            match frame.savepoint() {
                None => {
                    // A root rollback discards everything queued for its savepoints.
                    pending.clear();
                    pending.push(PendingRollback {
                        frame: id,
                        sql: caps.rollback.clone(),
                        nested: false,
                    });
                }
                Some(name) => {
                    if let Some(syntax) = caps.savepoint_syntax(name) {
                        pending.push(PendingRollback {
                            frame: id,
                            sql: syntax.rollback_to,
                            nested: true,
                        });
                    }
                }
            }
            warn!(
                frame = id,
                depth = frame.depth(),
                orphans = orphans.len(),
                "transaction dropped before it settled, rolling back"
            );
        }

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let coordinator = self.clone();
            handle.spawn(async move { coordinator.flush_pending().await });
        }
    }

    async fn flush_pending(&self) {
        let _wire = self.inner.wire.lock().await;
        self.flush_locked().await;
    }

    /// Send queued rollbacks. The caller holds the wire.
    async fn flush_locked(&self) {
        let pending = std::mem::take(&mut *self.inner.pending.lock());
        for rollback in pending {
            if let Err(err) = self.send(&rollback.sql).await {
                warn!(frame = rollback.frame, error = %err, "rollback of dropped frame failed");
                if rollback.nested {
                    self.inner.stack.lock().poison(rollback.frame);
                }
            }
        }
    }

    async fn issue(&self, sql: &str) -> ConnectionResult<u64> {
        let _wire = self.inner.wire.lock().await;
        self.flush_locked().await;
        self.send(sql).await
    }

    async fn send(&self, sql: &str) -> ConnectionResult<u64> {
        if self.inner.config.log_statements {
            debug!(target: "txnest::sql", %sql, "executing statement");
        }
        self.inner.conn.execute(sql).await
    }
}

/// Race a body against its frame's cancellation.
///
/// Cancellation does not preempt the body: when the signal wins, the body is
/// moved to a background task and left to finish on its own. A body that
/// succeeds while the signal has already fired is reported as cancelled.
async fn race<Fut, T, E>(body: Fut, bridge: Option<&CancellationBridge>) -> Outcome<T, E>
where
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let Some(bridge) = bridge else {
        return Outcome::Settled(body.await);
    };

    let mut body = Box::pin(body);
    let settled = tokio::select! {
        biased;
        _ = bridge.aborted() => None,
        result = &mut body => Some(result),
    };

    match settled {
        Some(Ok(_)) if bridge.is_aborted() => Outcome::Cancelled,
        Some(result) => Outcome::Settled(result),
        None => {
            tokio::spawn(async move {
                if body.await.is_err() {
                    debug!("detached transaction body finished with an error");
                }
            });
            Outcome::Cancelled
        }
    }
}

impl<C: Connection, F: ContextFactory<C>> std::fmt::Debug for TransactionCoordinator<C, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("backend", &self.capabilities().name)
            .field("depth", &self.depth())
            .finish()
    }
}
