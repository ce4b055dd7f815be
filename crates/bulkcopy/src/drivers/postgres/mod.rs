//! PostgreSQL driver.
//!
//! - [`PgRepository`] / [`PgConnection`]: pooled connections and the bulk worker
//! - [`PostgresDialect`]: statement builders
//! - `encode`: binary COPY encoding of [`SqlValue`](crate::core::value::SqlValue)
//! - `schema`: catalog lookups

mod connection;
mod dialect;
mod encode;
mod schema;

pub use connection::{PgConnection, PgRepository};
pub use dialect::PostgresDialect;
