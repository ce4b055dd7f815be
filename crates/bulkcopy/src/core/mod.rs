//! Database-agnostic building blocks for bulk operations.
//!
//! - [`value`]: [`SqlValue`] cells and coercions
//! - [`rows`]: entities, [`DataTable`] and the batching [`RowReader`]
//! - [`options`]: per-call [`BulkOptions`]
//! - [`request`]: the [`BulkRequest`] a caller builds and the command a connection runs
//! - [`mapping`]: entity type to table name registry
//! - [`columns`]: target table metadata and the source-to-target column plan
//! - [`identifier`]: identifier validation and quoting
//! - [`traits`]: [`BulkConnection`] and [`Repository`]

pub mod columns;
pub mod identifier;
pub mod mapping;
pub mod options;
pub mod request;
pub mod rows;
pub mod traits;
pub mod value;

pub use mapping::{EntityType, TableMappings};
pub use options::{BulkOptions, ColumnMapping, IdentityBehavior, MergeCommandType, PseudoTableType};
pub use request::{BulkOperation, BulkRequest, RowSource};
pub use rows::{BulkEntity, DataTable, RowReader};
pub use traits::{BulkConnection, ConnectionPersistency, Repository};
pub use value::{SqlNullType, SqlValue};
