//! Per-call bulk operation options.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Rows per COPY / bulk-load round when nothing else is configured.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Source column to destination column mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub source: String,
    pub destination: String,
}

impl ColumnMapping {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

/// How identity (serial / IDENTITY) columns are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityBehavior {
    /// Identity columns are generated by the server; supplied values are ignored.
    #[default]
    Unspecified,
    /// Supplied identity values are written as-is.
    KeepIdentity,
}

/// Statement shape used by merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeCommandType {
    /// Vendor default: ON CONFLICT on PostgreSQL, MERGE on SQL Server.
    #[default]
    Default,
    /// UPDATE matched rows, then INSERT the rest.
    InsertAndUpdate,
    /// Single upsert statement (MERGE on SQL Server).
    OnConflictDoUpdate,
}

/// Kind of staging table used by update, delete and merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PseudoTableType {
    /// Session-scoped temporary table.
    #[default]
    Temporary,
    /// Regular (PostgreSQL: unlogged) table, dropped after the operation.
    Physical,
}

/// Options for one bulk call.
///
/// Everything is optional; unset values fall back to repository defaults.
#[derive(Debug, Clone, Default)]
pub struct BulkOptions {
    /// Explicit target table, `table` or `schema.table`.
    pub table_name: Option<String>,
    /// Source to destination column mappings.
    pub mappings: Option<Vec<ColumnMapping>>,
    /// Rows per round.
    pub batch_size: Option<usize>,
    /// Command timeout.
    pub timeout: Option<Duration>,
    pub identity: IdentityBehavior,
    pub merge_command: MergeCommandType,
    /// Staging table kind; `None` uses the repository default.
    pub pseudo_table: Option<PseudoTableType>,
    /// Match columns for update, delete and merge; defaults to the primary key.
    pub qualifiers: Option<Vec<String>>,
    /// Cancellation signal forwarded to the worker.
    pub cancel: CancellationToken,
}

impl BulkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, name: impl Into<String>) -> Self {
        self.table_name = Some(name.into());
        self
    }

    pub fn mapping(mut self, source: impl Into<String>, destination: impl Into<String>) -> Self {
        self.mappings
            .get_or_insert_with(Vec::new)
            .push(ColumnMapping::new(source, destination));
        self
    }

    pub fn batch_size(mut self, rows: usize) -> Self {
        self.batch_size = Some(rows);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn identity(mut self, identity: IdentityBehavior) -> Self {
        self.identity = identity;
        self
    }

    pub fn merge_command(mut self, command: MergeCommandType) -> Self {
        self.merge_command = command;
        self
    }

    pub fn pseudo_table(mut self, kind: PseudoTableType) -> Self {
        self.pseudo_table = Some(kind);
        self
    }

    pub fn qualifier(mut self, column: impl Into<String>) -> Self {
        self.qualifiers
            .get_or_insert_with(Vec::new)
            .push(column.into());
        self
    }

    pub fn cancel_with(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_accumulates() {
        let opts = BulkOptions::new()
            .table("sales.orders")
            .mapping("OrderId", "id")
            .mapping("Total", "amount")
            .qualifier("id")
            .identity(IdentityBehavior::KeepIdentity);

        assert_eq!(opts.table_name.as_deref(), Some("sales.orders"));
        assert_eq!(opts.mappings.as_ref().map(Vec::len), Some(2));
        assert_eq!(opts.qualifiers, Some(vec!["id".to_string()]));
        assert_eq!(opts.identity, IdentityBehavior::KeepIdentity);
        assert_eq!(opts.merge_command, MergeCommandType::Default);
        assert_eq!(opts.pseudo_table, None);
    }
}
