//! Row sources consumed by bulk operations.
//!
//! Every source is normalised into a [`RowReader`] before it reaches a vendor
//! worker. Rows are pulled lazily from the reader's stream.

use futures::stream::{self, BoxStream, StreamExt};

use crate::core::value::SqlValue;
use crate::error::Result;

/// A user row type that can be bulk-loaded.
///
/// ```
/// use bulkcopy::{BulkEntity, SqlValue};
///
/// struct Order {
///     id: i64,
///     customer: String,
/// }
///
/// impl BulkEntity for Order {
///     fn columns() -> &'static [&'static str] {
///         &["id", "customer"]
///     }
///
///     fn to_row(&self) -> Vec<SqlValue> {
///         vec![self.id.into(), self.customer.as_str().into()]
///     }
///
///     fn table_name() -> Option<&'static str> {
///         Some("orders")
///     }
/// }
/// ```
pub trait BulkEntity: Send + Sync + 'static {
    /// Column names in the order `to_row` produces values.
    fn columns() -> &'static [&'static str];

    /// Values of this entity, one per column.
    fn to_row(&self) -> Vec<SqlValue>;

    /// Table this type maps to when no registry entry or explicit name exists.
    fn table_name() -> Option<&'static str> {
        None
    }
}

/// Vendor-neutral forward-only cursor over rows.
pub struct RowReader<'a> {
    columns: Vec<String>,
    rows: BoxStream<'a, Result<Vec<SqlValue>>>,
}

impl<'a> RowReader<'a> {
    /// Wrap an arbitrary row stream.
    pub fn new(columns: Vec<String>, rows: BoxStream<'a, Result<Vec<SqlValue>>>) -> Self {
        Self { columns, rows }
    }

    /// Reader over rows that are already in memory.
    pub fn from_rows<I>(columns: Vec<String>, rows: I) -> Self
    where
        I: IntoIterator<Item = Vec<SqlValue>>,
        I::IntoIter: Send + 'a,
    {
        Self::new(columns, stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    /// Reader that converts entities one at a time as rows are pulled.
    pub fn from_entities<T: BulkEntity>(entities: &'a [T]) -> Self {
        let columns = T::columns().iter().map(|c| c.to_string()).collect();
        Self::new(
            columns,
            stream::iter(entities.iter().map(|e| Ok(e.to_row()))).boxed(),
        )
    }

    /// Reader with no rows.
    pub fn empty(columns: Vec<String>) -> Self {
        Self::new(columns, stream::empty().boxed())
    }

    /// Column names, in row order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Pull up to `max` rows. An empty vector means the reader is exhausted.
    pub async fn next_batch(&mut self, max: usize) -> Result<Vec<Vec<SqlValue>>> {
        let mut batch = Vec::with_capacity(max.min(1024));
        while batch.len() < max {
            match self.rows.next().await {
                Some(row) => batch.push(row?),
                None => break,
            }
        }
        Ok(batch)
    }
}

impl std::fmt::Debug for RowReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowReader")
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

/// In-memory tabular data with an optional intrinsic table name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    /// Table name used when the caller gives no explicit one.
    pub name: Option<String>,
    /// Column names.
    pub columns: Vec<String>,
    /// Row values, one vector per row.
    pub rows: Vec<Vec<SqlValue>>,
}

impl DataTable {
    /// Create an unnamed table.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            name: None,
            columns,
            rows: Vec::new(),
        }
    }

    /// Create a table that carries its own name.
    pub fn named(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: Some(name.into()),
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row.
    pub fn push_row(&mut self, row: Vec<SqlValue>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cursor over this table's rows (rows are cloned as they are pulled).
    pub fn reader(&self) -> RowReader<'_> {
        RowReader::new(
            self.columns.clone(),
            stream::iter(self.rows.iter().cloned().map(Ok)).boxed(),
        )
    }
}
