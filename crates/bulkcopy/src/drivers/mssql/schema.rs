//! SQL Server catalog lookups and pseudo-table column types.
//!
//! Pseudo-table columns use a bulk-load friendly type where tiberius cannot
//! send the original one (`tinyint`, `datetime`, `money`, the legacy LOB
//! types). SQL Server converts them back implicitly when the set-based
//! statement copies rows into the target.

use std::collections::HashMap;

use futures::{AsyncRead, AsyncWrite};
use tiberius::Client;
use tracing::debug;

use crate::core::columns::{TableColumn, TableSchema};
use crate::error::{BulkError, Result};

const TABLE_COLUMNS_QUERY: &str = r#"
    SELECT c.name,
           TYPE_NAME(c.system_type_id),
           CAST(c.max_length AS int),
           CAST(c.precision AS int),
           CAST(c.scale AS int),
           c.is_identity,
           CAST(CASE WHEN EXISTS (
                    SELECT 1 FROM sys.index_columns ic
                    JOIN sys.indexes i ON i.object_id = ic.object_id AND i.index_id = ic.index_id
                    WHERE i.is_primary_key = 1 AND ic.object_id = c.object_id AND ic.column_id = c.column_id)
                THEN 1 ELSE 0 END AS bit),
           CAST(CASE WHEN c.is_computed = 1 OR TYPE_NAME(c.system_type_id) = 'timestamp'
                THEN 1 ELSE 0 END AS bit),
           c.collation_name
    FROM sys.columns c
    WHERE c.object_id = OBJECT_ID(@P1)
    ORDER BY c.column_id"#;

/// Columns of a target table plus the pseudo-table definition of each.
#[derive(Debug, Clone)]
pub struct TableShape {
    pub schema: TableSchema,
    definitions: HashMap<String, String>,
}

impl TableShape {
    /// `(column, definition)` pairs for `columns`, in order.
    pub fn definitions(&self, columns: &[String]) -> Result<Vec<(String, String)>> {
        columns
            .iter()
            .map(|name| {
                self.definitions
                    .get(name)
                    .map(|definition| (name.clone(), definition.clone()))
                    .ok_or_else(|| BulkError::Config(format!("Unknown column {}", name)))
            })
            .collect()
    }
}

/// Read column metadata of `qualified_table` (bracket-quoted).
pub async fn read_table_shape<S>(client: &mut Client<S>, qualified_table: &str) -> Result<TableShape>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let rows = client
        .query(TABLE_COLUMNS_QUERY, &[&qualified_table])
        .await?
        .into_first_result()
        .await?;

    let mut columns = Vec::with_capacity(rows.len());
    let mut definitions = HashMap::with_capacity(rows.len());

    for row in &rows {
        let name: &str = row.get(0).unwrap_or_default();
        let data_type: &str = row.get(1).unwrap_or_default();
        let max_length: i32 = row.get(2).unwrap_or(0);
        let precision: i32 = row.get(3).unwrap_or(0);
        let scale: i32 = row.get(4).unwrap_or(0);
        let collation: Option<&str> = row.get(8);

        definitions.insert(
            name.to_string(),
            staging_definition(data_type, max_length, precision, scale, collation),
        );
        columns.push(TableColumn {
            name: name.to_string(),
            data_type: data_type.to_string(),
            scale: u8::try_from(scale).ok(),
            is_identity: row.get(5).unwrap_or(false),
            is_primary_key: row.get(6).unwrap_or(false),
            is_computed: row.get(7).unwrap_or(false),
        });
    }

    if columns.is_empty() {
        return Err(BulkError::operation(
            qualified_table,
            "table does not exist or has no columns",
        ));
    }

    debug!("{}: {} columns", qualified_table, columns.len());
    Ok(TableShape {
        schema: TableSchema::new(columns),
        definitions,
    })
}

/// Type a column is staged and bulk-loaded as.
pub fn staging_base(data_type: &str) -> &str {
    match data_type {
        "tinyint" => "smallint",
        "datetime" | "smalldatetime" => "datetime2",
        "money" | "smallmoney" => "decimal",
        "text" => "varchar",
        "ntext" | "xml" => "nvarchar",
        "image" => "varbinary",
        other => other,
    }
}

/// Scale the staged value is encoded with.
pub fn staging_scale(column: &TableColumn) -> u8 {
    match column.data_type.as_str() {
        "datetime" | "smalldatetime" => 7,
        "money" | "smallmoney" => 4,
        _ => column.scale.unwrap_or(0),
    }
}

/// Whether tiberius can bulk load the column without a type change.
pub fn bulk_loadable(column: &TableColumn) -> bool {
    staging_base(&column.data_type) == column.data_type
}

fn staging_definition(
    data_type: &str,
    max_length: i32,
    precision: i32,
    scale: i32,
    collation: Option<&str>,
) -> String {
    let definition = match data_type {
        "tinyint" => "smallint".to_string(),
        "datetime" | "smalldatetime" => "datetime2(7)".to_string(),
        "money" => "decimal(19, 4)".to_string(),
        "smallmoney" => "decimal(10, 4)".to_string(),
        "text" => "varchar(max)".to_string(),
        "ntext" | "xml" => "nvarchar(max)".to_string(),
        "image" => "varbinary(max)".to_string(),
        "nvarchar" | "nchar" if max_length == -1 => format!("{}(max)", data_type),
        // sys.columns reports bytes; two per character
        "nvarchar" | "nchar" => format!("{}({})", data_type, max_length / 2),
        "varchar" | "char" | "varbinary" | "binary" if max_length == -1 => format!("{}(max)", data_type),
        "varchar" | "char" | "varbinary" | "binary" => format!("{}({})", data_type, max_length),
        "decimal" | "numeric" => format!("{}({}, {})", data_type, precision, scale),
        "datetime2" | "time" | "datetimeoffset" => format!("{}({})", data_type, scale),
        other => other.to_string(),
    };

    match collation {
        Some(collation) => format!("{} COLLATE {}", definition, collation),
        None => definition,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_definition() {
        assert_eq!(staging_definition("int", 4, 10, 0, None), "int");
        assert_eq!(staging_definition("nvarchar", 100, 0, 0, None), "nvarchar(50)");
        assert_eq!(staging_definition("nvarchar", -1, 0, 0, None), "nvarchar(max)");
        assert_eq!(staging_definition("varbinary", 16, 0, 0, None), "varbinary(16)");
        assert_eq!(staging_definition("decimal", 9, 18, 2, None), "decimal(18, 2)");
        assert_eq!(staging_definition("datetime2", 8, 27, 3, None), "datetime2(3)");
        assert_eq!(staging_definition("tinyint", 1, 3, 0, None), "smallint");
        assert_eq!(staging_definition("datetime", 8, 23, 3, None), "datetime2(7)");
        assert_eq!(
            staging_definition("varchar", 20, 0, 0, Some("Latin1_General_CI_AS")),
            "varchar(20) COLLATE Latin1_General_CI_AS"
        );
    }

    #[test]
    fn test_staging_scale_and_loadability() {
        let legacy = TableColumn::new("created", "datetime");
        assert_eq!(staging_base(&legacy.data_type), "datetime2");
        assert_eq!(staging_scale(&legacy), 7);
        assert!(!bulk_loadable(&legacy));

        let mut amount = TableColumn::new("amount", "decimal");
        amount.scale = Some(2);
        assert_eq!(staging_scale(&amount), 2);
        assert!(bulk_loadable(&amount));

        assert_eq!(staging_scale(&TableColumn::new("price", "money")), 4);
    }

    #[test]
    fn test_shape_definitions_in_requested_order() {
        let shape = TableShape {
            schema: TableSchema::new(vec![TableColumn::new("a", "int"), TableColumn::new("b", "bit")]),
            definitions: HashMap::from([
                ("a".to_string(), "int".to_string()),
                ("b".to_string(), "bit".to_string()),
            ]),
        };
        let defs = shape.definitions(&["b".to_string(), "a".to_string()]).unwrap();
        assert_eq!(defs[0], ("b".to_string(), "bit".to_string()));
        assert!(shape.definitions(&["zz".to_string()]).is_err());
    }
}
