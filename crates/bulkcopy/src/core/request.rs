//! Operation requests and the commands handed to vendor workers.

use std::fmt;
use std::time::Duration;

use crate::core::mapping::EntityType;
use crate::core::options::BulkOptions;
use crate::core::rows::{BulkEntity, DataTable, RowReader};
use crate::core::value::SqlValue;

/// Kind of bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOperation {
    Insert,
    Update,
    Delete,
    Merge,
    DeleteByKey,
}

impl BulkOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkOperation::Insert => "insert",
            BulkOperation::Update => "update",
            BulkOperation::Delete => "delete",
            BulkOperation::Merge => "merge",
            BulkOperation::DeleteByKey => "delete-by-key",
        }
    }
}

impl fmt::Display for BulkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the rows of a request come from.
pub enum RowSource<'a> {
    /// Streaming cursor (entity lists arrive here too).
    Reader(RowReader<'a>),
    /// In-memory table; its name takes part in table resolution.
    Table(&'a DataTable),
    /// Primary key values for delete-by-key.
    PrimaryKeys(Vec<SqlValue>),
}

impl RowSource<'_> {
    /// Intrinsic table name of a `DataTable` source.
    pub fn table_name(&self) -> Option<&str> {
        match self {
            RowSource::Table(table) => table.name.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Debug for RowSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowSource::Reader(reader) => f.debug_tuple("Reader").field(reader).finish(),
            RowSource::Table(table) => f
                .debug_struct("Table")
                .field("name", &table.name)
                .field("rows", &table.len())
                .finish(),
            RowSource::PrimaryKeys(keys) => f.debug_tuple("PrimaryKeys").field(&keys.len()).finish(),
        }
    }
}

/// A logical bulk operation as requested by the caller.
#[derive(Debug)]
pub struct BulkRequest<'a> {
    pub operation: BulkOperation,
    pub source: RowSource<'a>,
    /// Entity type of list sources, used for registry lookups.
    pub entity: Option<EntityType>,
    pub options: BulkOptions,
}

impl<'a> BulkRequest<'a> {
    pub fn new(operation: BulkOperation, source: RowSource<'a>, options: BulkOptions) -> Self {
        Self {
            operation,
            source,
            entity: None,
            options,
        }
    }

    /// Request over an entity list; the entity type is kept for table resolution.
    pub fn entities<T: BulkEntity>(
        operation: BulkOperation,
        entities: &'a [T],
        options: BulkOptions,
    ) -> Self {
        Self {
            operation,
            source: RowSource::Reader(RowReader::from_entities(entities)),
            entity: Some(EntityType::of::<T>()),
            options,
        }
    }

    /// Request over a `DataTable`.
    pub fn table(operation: BulkOperation, table: &'a DataTable, options: BulkOptions) -> Self {
        Self::new(operation, RowSource::Table(table), options)
    }

    /// Request over a reader.
    pub fn reader(operation: BulkOperation, reader: RowReader<'a>, options: BulkOptions) -> Self {
        Self::new(operation, RowSource::Reader(reader), options)
    }

    /// Delete-by-key request.
    pub fn delete_by_keys(keys: Vec<SqlValue>, options: BulkOptions) -> Self {
        Self::new(BulkOperation::DeleteByKey, RowSource::PrimaryKeys(keys), options)
    }

    /// Attach an entity type for registry lookups.
    pub fn with_entity<T: BulkEntity>(mut self) -> Self {
        self.entity = Some(EntityType::of::<T>());
        self
    }

    /// Turn the request into the worker command, with the table name resolved.
    pub fn into_command(self, table: Option<String>, default_timeout: Option<Duration>) -> BulkCommand<'a> {
        let timeout = self.options.timeout.or(default_timeout);
        let source = match self.source {
            RowSource::Table(table) => BulkSource::Rows(table.reader()),
            RowSource::Reader(reader) => BulkSource::Rows(reader),
            RowSource::PrimaryKeys(keys) => BulkSource::Keys(keys),
        };
        BulkCommand {
            operation: self.operation,
            table,
            source,
            timeout,
            options: self.options,
        }
    }
}

/// Rows as the worker consumes them.
#[derive(Debug)]
pub enum BulkSource<'a> {
    Rows(RowReader<'a>),
    Keys(Vec<SqlValue>),
}

/// Fully resolved work item for a vendor worker.
#[derive(Debug)]
pub struct BulkCommand<'a> {
    pub operation: BulkOperation,
    /// Resolved table name; `None` when nothing could be resolved.
    pub table: Option<String>,
    pub source: BulkSource<'a>,
    /// Effective timeout (call option, else repository command timeout).
    pub timeout: Option<Duration>,
    pub options: BulkOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_table_source_exposes_name() {
        let table = DataTable::named("Orders", vec!["id".into()]);
        let request = BulkRequest::table(BulkOperation::Insert, &table, BulkOptions::new());
        assert_eq!(request.source.table_name(), Some("Orders"));
        assert!(request.entity.is_none());
    }

    #[test]
    fn test_into_command_prefers_call_timeout() {
        let request = BulkRequest::delete_by_keys(
            vec![SqlValue::I32(1)],
            BulkOptions::new().timeout(Duration::from_secs(5)),
        );
        let command = request.into_command(Some("t".into()), Some(Duration::from_secs(300)));
        assert_eq!(command.timeout, Some(Duration::from_secs(5)));
        assert!(matches!(command.source, BulkSource::Keys(ref keys) if keys.len() == 1));

        let request = BulkRequest::delete_by_keys(vec![], BulkOptions::new());
        let command = request.into_command(None, Some(Duration::from_secs(300)));
        assert_eq!(command.timeout, Some(Duration::from_secs(300)));
        assert_eq!(command.operation, BulkOperation::DeleteByKey);
    }
}
