//! PostgreSQL catalog queries used by the bulk worker.

use tokio_postgres::types::Type;
use tokio_postgres::GenericClient;
use tracing::debug;

use crate::core::columns::{TableColumn, TableSchema};
use crate::core::identifier::quote_pg;
use crate::drivers::postgres::dialect::PostgresDialect;
use crate::error::{BulkError, Result};

const TABLE_COLUMNS_QUERY: &str = r#"
    SELECT a.attname::text,
           t.typname::text,
           CASE WHEN t.typname = 'numeric' AND a.atttypmod > 4
                THEN ((a.atttypmod - 4) & 65535)::int4 END,
           (a.attidentity <> '' OR COALESCE(pg_get_expr(d.adbin, d.adrelid), '') LIKE 'nextval(%'),
           EXISTS (SELECT 1 FROM pg_index i
                   WHERE i.indrelid = a.attrelid AND i.indisprimary AND a.attnum = ANY(i.indkey)),
           (a.attgenerated <> '')
    FROM pg_attribute a
    JOIN pg_type t ON t.oid = a.atttypid
    LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
    WHERE a.attrelid = $1::text::regclass
      AND a.attnum > 0
      AND NOT a.attisdropped
    ORDER BY a.attnum"#;

/// Read column metadata of `qualified_table` (already quoted).
pub async fn read_table_schema<C: GenericClient>(client: &C, qualified_table: &str) -> Result<TableSchema> {
    let rows = client.query(TABLE_COLUMNS_QUERY, &[&qualified_table]).await?;

    let columns: Vec<TableColumn> = rows
        .iter()
        .map(|row| {
            let scale: Option<i32> = row.get(2);
            TableColumn {
                name: row.get(0),
                data_type: row.get(1),
                scale: scale.and_then(|s| u8::try_from(s).ok()),
                is_identity: row.get(3),
                is_primary_key: row.get(4),
                is_computed: row.get(5),
            }
        })
        .collect();

    if columns.is_empty() {
        return Err(BulkError::operation(qualified_table, "table has no columns"));
    }

    debug!("{}: {} columns", qualified_table, columns.len());
    Ok(TableSchema::new(columns))
}

/// Column types of `columns` in `table`, in the given order, for binary COPY.
pub async fn column_types<C: GenericClient>(
    client: &C,
    dialect: &PostgresDialect,
    table: &str,
    columns: &[String],
) -> Result<Vec<Type>> {
    let statement = client.prepare(&dialect.probe_columns(table, columns)?).await?;
    Ok(statement
        .columns()
        .iter()
        .map(|c| c.type_().clone())
        .collect())
}

/// Move identity/serial sequences past the highest value written.
pub async fn reset_sequences<C: GenericClient>(
    client: &C,
    qualified_table: &str,
    identity_columns: &[String],
) -> Result<()> {
    for column in identity_columns {
        let row = client
            .query_one(
                "SELECT pg_get_serial_sequence($1, $2)",
                &[&qualified_table, &column.as_str()],
            )
            .await?;
        let sequence: Option<String> = row.get(0);

        if let Some(sequence) = sequence {
            let sql = format!(
                "SELECT setval($1::regclass, COALESCE((SELECT MAX({}) FROM {}), 1), (SELECT MAX({}) FROM {}) IS NOT NULL)",
                quote_pg(column)?,
                qualified_table,
                quote_pg(column)?,
                qualified_table
            );
            client.query_one(sql.as_str(), &[&sequence]).await?;
            debug!("Reset sequence {} for {}.{}", sequence, qualified_table, column);
        }
    }
    Ok(())
}
