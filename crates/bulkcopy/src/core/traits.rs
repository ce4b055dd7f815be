//! Core traits for connection-scoped bulk operations.
//!
//! - [`BulkConnection`]: a vendor connection that runs bulk workers and
//!   transaction statements
//! - [`Repository`]: manufactures connections and carries the persistency
//!   policy, command timeout and table mapping registry
//!
//! The dispatcher in [`crate::dispatch`] only talks to these two traits, so
//! vendors and test doubles plug in the same way.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::mapping::TableMappings;
use crate::core::request::BulkCommand;
use crate::error::Result;

/// Whether a repository hands out a fresh connection per call or keeps one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPersistency {
    /// Connections created for a call are disposed when the call ends.
    #[default]
    PerCall,
    /// One connection is reused across calls and stays open.
    Instance,
}

/// A database connection able to run bulk workers.
#[async_trait]
pub trait BulkConnection: Send {
    /// Short vendor name ("postgres", "mssql").
    fn dialect(&self) -> &'static str;

    /// Run one bulk operation and return the affected row count.
    ///
    /// Implementations report a missing table name as
    /// [`BulkError::MissingTableName`](crate::error::BulkError::MissingTableName)
    /// and stop with [`BulkError::Cancelled`](crate::error::BulkError::Cancelled)
    /// once `cancel` fires.
    async fn execute_bulk(
        &mut self,
        command: BulkCommand<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64>;

    /// Start a transaction on this connection.
    async fn begin(&mut self) -> Result<()>;

    /// Commit the current transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the current transaction.
    async fn rollback(&mut self) -> Result<()>;

    /// Dispose the connection.
    async fn close(self) -> Result<()>
    where
        Self: Sized;
}

/// Source of connections for bulk operations.
#[async_trait]
pub trait Repository: Send + Sync {
    type Connection: BulkConnection;

    /// Open (or, under [`ConnectionPersistency::Instance`], hand out) a connection.
    ///
    /// Under the instance policy the returned connection holds the repository's
    /// single slot until it is dropped or closed. A task that keeps it (for a
    /// [`Transaction`](crate::Transaction), say) must pass that transaction to
    /// every further call on the same repository; a call without one waits
    /// for the slot and never returns.
    async fn create_connection(&self) -> Result<Self::Connection>;

    /// Disposal policy for connections created by the dispatcher.
    fn persistency(&self) -> ConnectionPersistency;

    /// Default timeout for calls that do not set one.
    fn command_timeout(&self) -> Option<Duration> {
        None
    }

    /// Entity type to table name registry.
    fn mappings(&self) -> &TableMappings;
}
