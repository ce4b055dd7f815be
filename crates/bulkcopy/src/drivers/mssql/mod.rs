//! Microsoft SQL Server driver.
//!
//! - [`MssqlRepository`] / [`MssqlConnection`]: bb8-pooled tiberius connections and the bulk worker
//! - [`MssqlDialect`]: statement builders
//! - `encode`: TDS bulk-load encoding of [`SqlValue`](crate::core::value::SqlValue)
//! - `schema`: catalog lookups and pseudo-table column types

mod connection;
mod dialect;
mod encode;
mod schema;

pub use connection::{
    MssqlClient, MssqlConnection, MssqlRepository, MssqlSession, TiberiusConnectionManager,
};
pub use dialect::MssqlDialect;
