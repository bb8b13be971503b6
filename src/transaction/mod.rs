//! Nested transaction coordination.
//!
//! A [`TransactionCoordinator`] owns one connection and the stack of frames
//! opened on it. The outermost `transaction()` call issues a real `BEGIN`;
//! calls nested inside its body open savepoints, pass through, or are
//! refused, depending on the backend's capabilities.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  TransactionCoordinator                     │
//! │   (opens/closes frames, races bodies against cancellation)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ Transaction │       │ Cancellation│       │  Savepoint  │
//!  │    Stack    │       │   Bridge    │       │    Namer    │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use txnest::backend::Capabilities;
//! use txnest::memory::MemoryConnection;
//! use txnest::transaction::{TransactionCoordinator, TransactionError};
//!
//! let coordinator = TransactionCoordinator::new(MemoryConnection::new(Capabilities::postgres()));
//!
//! coordinator
//!     .transaction(|tx| async move {
//!         tx.execute("INSERT INTO post (title) VALUES ('kept')").await?;
//!
//!         // Rolled back to its savepoint; the outer insert survives.
//!         let _ = tx
//!             .transaction(|tx| async move {
//!                 tx.execute("INSERT INTO post (title) VALUES ('dropped')").await?;
//!                 Err::<(), _>(TransactionError::Aborted)
//!             })
//!             .await;
//!
//!         Ok::<_, TransactionError>(())
//!     })
//!     .await?;
//! ```

mod cancel;
mod context;
mod coordinator;
mod error;
mod frame;
mod options;
mod savepoint;

pub use cancel::{AbortController, AbortSignal, CancellationBridge};
pub use context::{ContextFactory, DirectContext, ScopedContext};
pub use coordinator::TransactionCoordinator;
pub use error::{TransactionError, TransactionResult};
pub use frame::{FrameId, FrameState, TransactionFrame, TransactionStack};
pub use options::TransactionOptions;
pub use savepoint::{SavepointNamer, DEFAULT_SAVEPOINT_PREFIX};

pub(crate) use savepoint::is_identifier;
