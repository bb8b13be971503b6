//! In-memory reference backend.
//!
//! [`MemoryConnection`] is a complete [`Connection`] that keeps tables of JSON
//! rows in memory and honours the transaction statements of whatever
//! [`Capabilities`] it is created with. It is what the crate's own tests run
//! against, and it is small enough to embed in downstream test suites.
//!
//! # Usage
//!
//! ```ignore
//! use txnest::backend::Capabilities;
//! use txnest::memory::MemoryConnection;
//!
//! let conn = MemoryConnection::new(Capabilities::postgres());
//! conn.execute("CREATE TABLE post (id INTEGER, title TEXT)").await?;
//! conn.execute("INSERT INTO post (id, title) VALUES (1, 'Post #1')").await?;
//! assert_eq!(conn.rows("post").len(), 1);
//! ```

mod parser;
mod store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{Capabilities, IsolationPlacement};
use crate::connection::{Connection, ConnectionError, ConnectionResult};

use self::parser::MemoryStatement;
use self::store::MemoryStore;

pub use self::store::Row;

/// In-memory database session.
///
/// Clones share the same session, so a test can keep one handle for
/// inspection while the coordinator owns another.
#[derive(Clone)]
pub struct MemoryConnection {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    capabilities: Capabilities,
    state: Mutex<MemoryState>,
    /// Statements run one at a time, in arrival order, like on a real wire.
    turn: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct MemoryState {
    store: MemoryStore,
    /// Every statement received, in order, including failed ones.
    log: Vec<String>,
    /// Statement prefixes that fail on purpose.
    failures: Vec<String>,
    latency: Option<Duration>,
}

impl MemoryConnection {
    /// Create an empty session for a backend.
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                capabilities,
                state: Mutex::new(MemoryState::default()),
                turn: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Delay every statement by `latency` before it is applied.
    ///
    /// A statement still in flight holds up the ones issued after it.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.state.lock().latency = latency;
    }

    /// Make every statement starting with `prefix` (case-insensitive) fail.
    pub fn fail_statements_starting_with(&self, prefix: impl Into<String>) {
        self.inner.state.lock().failures.push(prefix.into().to_uppercase());
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.inner.state.lock().failures.clear();
    }

    /// Statements executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.inner.state.lock().log.clone()
    }

    /// Forget the statement log.
    pub fn clear_log(&self) {
        self.inner.state.lock().log.clear();
    }

    /// Committed rows of `table`; empty if the table does not exist.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.inner.state.lock().store.committed_rows(table)
    }

    /// Whether the session has an open transaction.
    pub fn in_transaction(&self) -> bool {
        self.inner.state.lock().store.in_transaction()
    }

    /// Names of the savepoints currently held by the open transaction.
    pub fn savepoints(&self) -> Vec<String> {
        self.inner.state.lock().store.savepoint_names()
    }

    /// Whether `sql` opens a transaction according to this backend's table.
    ///
    /// Needed for backends where the begin statement is not a `BEGIN`
    /// keyword, such as Oracle's `SET TRANSACTION`.
    fn opens_transaction(&self, sql: &str) -> bool {
        let caps = &self.inner.capabilities;
        let sql = sql.trim();
        sql.eq_ignore_ascii_case(&caps.begin)
            || (caps.isolation.placement == IsolationPlacement::ReplacesBegin
                && caps
                    .isolation
                    .statements
                    .values()
                    .any(|s| sql.eq_ignore_ascii_case(s)))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&self, sql: &str) -> ConnectionResult<u64> {
        let _turn = self.inner.turn.lock().await;
        let latency = self.inner.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.inner.state.lock();
        state.log.push(sql.to_string());

        let upper = sql.trim_start().to_uppercase();
        if state.failures.iter().any(|prefix| upper.starts_with(prefix.as_str())) {
            return Err(ConnectionError::statement(sql, "injected failure"));
        }

        let statement = if self.opens_transaction(sql) {
            MemoryStatement::Begin
        } else {
            parser::parse(sql)?
        };
        state.store.apply(sql, statement)
    }

    fn capabilities(&self) -> &Capabilities {
        &self.inner.capabilities
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("backend", &self.inner.capabilities.name)
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}
