//! The connection handle consumed by the coordinator.
//!
//! A [`Connection`] is one physical database session. The coordinator only
//! needs two things from it: run a statement, and describe what the backend
//! can do. Pool acquisition, query building and result decoding all live
//! outside this crate.

mod error;

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::Capabilities;

pub use error::{ConnectionError, ConnectionResult};

/// A single database session.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Execute one statement, returning the number of rows affected.
    async fn execute(&self, sql: &str) -> ConnectionResult<u64>;

    /// Transaction capabilities of the backend behind this session.
    fn capabilities(&self) -> &Capabilities;
}

#[async_trait]
impl<C: Connection + ?Sized> Connection for Arc<C> {
    async fn execute(&self, sql: &str) -> ConnectionResult<u64> {
        (**self).execute(sql).await
    }

    fn capabilities(&self) -> &Capabilities {
        (**self).capabilities()
    }
}
