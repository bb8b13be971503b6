//! txnest - Nested transactions over a single database connection
//!
//! This crate maps a call-tree of nested `transaction()` calls onto one real
//! transaction and a stack of savepoints. A failure at any depth rolls back
//! exactly that depth's work, and every level can carry its own abort signal.
//!
//! # Example
//!
//! ```no_run
//! use txnest::backend::Capabilities;
//! use txnest::memory::MemoryConnection;
//! use txnest::transaction::{TransactionCoordinator, TransactionError};
//!
//! # async fn run() -> Result<(), TransactionError> {
//! let coordinator = TransactionCoordinator::new(MemoryConnection::new(Capabilities::postgres()));
//! coordinator.execute("CREATE TABLE users (id TEXT, name TEXT)").await?;
//!
//! coordinator
//!     .transaction(|tx| async move {
//!         tx.execute("INSERT INTO users (id, name) VALUES ('1', 'Alice')").await?;
//!         tx.transaction(|tx| async move {
//!             tx.execute("INSERT INTO users (id, name) VALUES ('2', 'Bob')").await
//!         })
//!         .await?;
//!         Ok::<_, TransactionError>(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod connection;
pub mod memory;
pub mod transaction;
