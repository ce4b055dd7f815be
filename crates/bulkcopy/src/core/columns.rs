//! Destination table metadata and the source-to-destination column plan.

use tracing::debug;

use crate::core::options::{ColumnMapping, IdentityBehavior};
use crate::core::value::{SqlNullType, SqlValue};
use crate::error::{BulkError, Result};

/// Column metadata read from the destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumn {
    /// Column name as stored in the catalog.
    pub name: String,
    /// Vendor type name (`int4`, `numeric`, `nvarchar`, ...).
    pub data_type: String,
    /// Decimal scale, when the type has one.
    pub scale: Option<u8>,
    /// Identity / serial column.
    pub is_identity: bool,
    /// Part of the primary key.
    pub is_primary_key: bool,
    /// Generated or computed column that cannot be written.
    pub is_computed: bool,
}

impl TableColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            scale: None,
            is_identity: false,
            is_primary_key: false,
            is_computed: false,
        }
    }

    pub fn identity(mut self) -> Self {
        self.is_identity = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    pub fn computed(mut self) -> Self {
        self.is_computed = true;
        self
    }
}

/// Columns of a destination table in ordinal order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<TableColumn>,
}

impl TableSchema {
    pub fn new(columns: Vec<TableColumn>) -> Self {
        Self { columns }
    }

    /// Find a column: exact name first, then case-insensitive.
    pub fn find(&self, name: &str) -> Option<&TableColumn> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name)))
    }

    /// Primary key column names.
    pub fn primary_key(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Columns a bulk load writes when identities are server-generated.
    pub fn writable_columns(&self) -> impl Iterator<Item = &TableColumn> {
        self.columns.iter().filter(|c| !c.is_computed && !c.is_identity)
    }
}

/// One destination column fed from one source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedColumn {
    pub source_index: usize,
    pub column: TableColumn,
}

/// Mapping of source row positions to destination columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPlan {
    source_width: usize,
    columns: Vec<PlannedColumn>,
}

impl ColumnPlan {
    /// Build the plan for `source_columns` against `schema`.
    ///
    /// With explicit mappings only mapped columns are used and every mapping
    /// must name a known source and destination. Without mappings, source
    /// columns are matched by name and columns the table lacks are skipped.
    pub fn build(
        table: &str,
        source_columns: &[String],
        schema: &TableSchema,
        mappings: Option<&[ColumnMapping]>,
    ) -> Result<Self> {
        let mut columns: Vec<PlannedColumn> = Vec::new();

        match mappings {
            Some(mappings) => {
                for mapping in mappings {
                    let source_index = find_source(source_columns, &mapping.source).ok_or_else(|| {
                        BulkError::Config(format!(
                            "Column mapping source '{}' is not a column of the input (columns: {})",
                            mapping.source,
                            source_columns.join(", ")
                        ))
                    })?;
                    let column = schema.find(&mapping.destination).ok_or_else(|| {
                        BulkError::Config(format!(
                            "Column mapping destination '{}' does not exist in table {}",
                            mapping.destination, table
                        ))
                    })?;
                    if column.is_computed {
                        return Err(BulkError::Config(format!(
                            "Column {}.{} is computed and cannot be written",
                            table, column.name
                        )));
                    }
                    push_unique(table, &mut columns, source_index, column)?;
                }
            }
            None => {
                for (source_index, name) in source_columns.iter().enumerate() {
                    match schema.find(name) {
                        Some(column) if column.is_computed => {
                            debug!("{}: skipping computed column {}", table, column.name);
                        }
                        Some(column) => push_unique(table, &mut columns, source_index, column)?,
                        None => debug!("{}: input column {} has no destination", table, name),
                    }
                }
            }
        }

        if columns.is_empty() {
            return Err(BulkError::Config(format!(
                "No input column matches a column of table {}",
                table
            )));
        }

        Ok(Self {
            source_width: source_columns.len(),
            columns,
        })
    }

    /// Planned columns in staging order.
    pub fn columns(&self) -> &[PlannedColumn] {
        &self.columns
    }

    /// Destination column names in staging order.
    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.column.name.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.column.name == name)
    }

    /// Columns written by an INSERT under the given identity behavior.
    pub fn insert_columns(&self, identity: IdentityBehavior) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| identity == IdentityBehavior::KeepIdentity || !c.column.is_identity)
            .map(|c| c.column.name.clone())
            .collect()
    }

    /// Columns an UPDATE may assign: everything except qualifiers and identities.
    pub fn update_columns(&self, qualifiers: &[String]) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| !c.column.is_identity && !qualifiers.contains(&c.column.name))
            .map(|c| c.column.name.clone())
            .collect()
    }

    /// Same plan without identity columns, for loads that let the database
    /// generate them.
    pub fn without_identity(&self, table: &str) -> Result<ColumnPlan> {
        let columns: Vec<PlannedColumn> = self
            .columns
            .iter()
            .filter(|c| !c.column.is_identity)
            .cloned()
            .collect();
        if columns.is_empty() {
            return Err(BulkError::Config(format!(
                "Only identity columns of {} are mapped; use KeepIdentity to write them",
                table
            )));
        }
        Ok(Self {
            source_width: self.source_width,
            columns,
        })
    }

    /// Whether any planned column is an identity column.
    pub fn has_identity(&self) -> bool {
        self.columns.iter().any(|c| c.column.is_identity)
    }

    /// Pick the planned values out of a source row.
    pub fn project(&self, table: &str, row: Vec<SqlValue>) -> Result<Vec<SqlValue>> {
        if row.len() != self.source_width {
            return Err(BulkError::operation(
                table,
                format!(
                    "row has {} values but the input declares {} columns",
                    row.len(),
                    self.source_width
                ),
            ));
        }
        let mut row: Vec<Option<SqlValue>> = row.into_iter().map(Some).collect();
        let mut projected = Vec::with_capacity(self.columns.len());
        for (i, c) in self.columns.iter().enumerate() {
            let reused_later = self.columns[i + 1..]
                .iter()
                .any(|later| later.source_index == c.source_index);
            let value = if reused_later {
                row[c.source_index].clone()
            } else {
                row[c.source_index].take()
            };
            projected.push(value.unwrap_or(SqlValue::Null(SqlNullType::String)));
        }
        Ok(projected)
    }
}

fn find_source(source_columns: &[String], name: &str) -> Option<usize> {
    source_columns
        .iter()
        .position(|c| c == name)
        .or_else(|| source_columns.iter().position(|c| c.eq_ignore_ascii_case(name)))
}

fn push_unique(
    table: &str,
    columns: &mut Vec<PlannedColumn>,
    source_index: usize,
    column: &TableColumn,
) -> Result<()> {
    if columns.iter().any(|c| c.column.name == column.name) {
        return Err(BulkError::Config(format!(
            "Column {}.{} is targeted more than once",
            table, column.name
        )));
    }
    columns.push(PlannedColumn {
        source_index,
        column: column.clone(),
    });
    Ok(())
}

/// Resolve the columns used to match rows: explicit qualifiers, else the primary key.
///
/// Every qualifier must be part of the plan.
pub fn resolve_qualifiers(
    table: &str,
    schema: &TableSchema,
    plan: &ColumnPlan,
    qualifiers: Option<&[String]>,
) -> Result<Vec<String>> {
    let names = match qualifiers {
        Some(given) if !given.is_empty() => given
            .iter()
            .map(|q| {
                schema.find(q).map(|c| c.name.clone()).ok_or_else(|| {
                    BulkError::Config(format!(
                        "Qualifier field '{}' does not exist in table {}",
                        q, table
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?,
        _ => schema.primary_key(),
    };

    if names.is_empty() {
        return Err(BulkError::NoQualifiers(table.to_string()));
    }

    for name in &names {
        if !plan.contains(name) {
            return Err(BulkError::Config(format!(
                "Qualifier field '{}' of table {} is not among the input columns",
                name, table
            )));
        }
    }

    Ok(names)
}

/// Single key column for delete-by-key.
pub fn key_column(
    table: &str,
    schema: &TableSchema,
    qualifiers: Option<&[String]>,
) -> Result<TableColumn> {
    let names = match qualifiers {
        Some(given) if !given.is_empty() => given.to_vec(),
        _ => schema.primary_key(),
    };

    match names.as_slice() {
        [] => Err(BulkError::NoQualifiers(table.to_string())),
        [name] => schema.find(name).cloned().ok_or_else(|| {
            BulkError::Config(format!(
                "Key column '{}' does not exist in table {}",
                name, table
            ))
        }),
        _ => Err(BulkError::Config(format!(
            "Delete by key needs a single key column, table {} has {} ({})",
            table,
            names.len(),
            names.join(", ")
        ))),
    }
}
