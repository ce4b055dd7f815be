//! # bulkcopy
//!
//! Connection-scoped bulk insert, update, delete, merge and delete-by-key
//! for PostgreSQL (binary COPY) and SQL Server (TDS bulk insert).
//!
//! Every call goes through one dispatcher that:
//!
//! - **Uses the caller's transaction connection** when one is given, or
//!   creates a connection from the repository
//! - **Resolves the target table**: explicit option, then the `DataTable`
//!   name, then the entity type registry
//! - **Disposes connections it created** when the repository is per-call,
//!   whether the operation succeeded or failed
//! - **Passes cancellation through** to the vendor worker and returns its
//!   row count or error unchanged
//!
//! ## Example
//!
//! ```rust,no_run
//! use bulkcopy::{BulkOptions, BulkRepositoryExt, Config, RepositoryImpl};
//! # use bulkcopy::{BulkEntity, SqlValue};
//! # struct Order { id: i64 }
//! # impl BulkEntity for Order {
//! #     fn columns() -> &'static [&'static str] { &["id"] }
//! #     fn to_row(&self) -> Vec<SqlValue> { vec![self.id.into()] }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> bulkcopy::Result<()> {
//!     let config = Config::load("bulkcopy.yaml")?;
//!     let repo = RepositoryImpl::connect(&config).await?;
//!     repo.mappings_handle().register::<Order>("orders");
//!
//!     let orders = vec![Order { id: 1 }, Order { id: 2 }];
//!     let inserted = repo.bulk_insert(&orders, BulkOptions::new()).await?;
//!     println!("Inserted {} rows", inserted);
//!     Ok(())
//! }
//! ```

pub mod blocking;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod drivers;
pub mod error;
pub mod ops;
pub mod transaction;

// Re-exports for convenient access
pub use crate::blocking::BlockingRepository;
pub use crate::config::{BulkConfig, Config, DatabaseConfig, DatabaseType};
pub use crate::core::{
    BulkConnection, BulkEntity, BulkOperation, BulkOptions, BulkRequest, ColumnMapping,
    ConnectionPersistency, DataTable, EntityType, IdentityBehavior, MergeCommandType,
    PseudoTableType, Repository, RowReader, RowSource, SqlNullType, SqlValue, TableMappings,
};
pub use crate::dispatch::{dispatch, dispatch_on};
pub use crate::drivers::{
    ConnectionImpl, HealthReport, MssqlRepository, PgRepository, RepositoryImpl,
};
pub use crate::error::{BulkError, Result};
pub use crate::ops::BulkRepositoryExt;
pub use crate::transaction::Transaction;
