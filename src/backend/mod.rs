//! Backend capability descriptors.
//!
//! Backends differ in what they can do inside a transaction: PostgreSQL and
//! MySQL nest through savepoints, SQL Server and Oracle have savepoints but no
//! release statement, Spanner cannot nest at all. The coordinator consumes
//! these differences through [`Capabilities`] alone.

mod capabilities;
mod isolation;

pub use capabilities::{
    Capabilities, IsolationPlacement, IsolationSyntax, NestedFallback, NestingPolicy,
    SavepointStatements, SavepointTemplates,
};
pub use isolation::IsolationLevel;
