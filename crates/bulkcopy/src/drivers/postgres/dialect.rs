//! PostgreSQL statement builders for bulk operations.
//!
//! All table arguments are already quoted/qualified; column arguments are raw
//! catalog names and are quoted here.

use crate::core::identifier::quote_pg;
use crate::core::options::PseudoTableType;
use crate::error::Result;

/// PostgreSQL SQL builders.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    pub fn new() -> Self {
        Self
    }

    /// Empty copy of `columns` of `target`.
    pub fn create_pseudo_table(
        &self,
        pseudo: &str,
        target: &str,
        columns: &[String],
        kind: PseudoTableType,
    ) -> Result<String> {
        let kind = match kind {
            PseudoTableType::Temporary => "TEMP ",
            PseudoTableType::Physical => "UNLOGGED ",
        };
        Ok(format!(
            "CREATE {}TABLE {} AS SELECT {} FROM {} WITH NO DATA",
            kind,
            pseudo,
            column_list(columns)?,
            target
        ))
    }

    pub fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", table)
    }

    /// Zero-row query used to learn the column types for binary COPY.
    pub fn probe_columns(&self, table: &str, columns: &[String]) -> Result<String> {
        Ok(format!("SELECT {} FROM {} LIMIT 0", column_list(columns)?, table))
    }

    pub fn copy_in(&self, table: &str, columns: &[String]) -> Result<String> {
        Ok(format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT BINARY)",
            table,
            column_list(columns)?
        ))
    }

    /// Update matched rows from the pseudo-table.
    pub fn update_from(
        &self,
        target: &str,
        pseudo: &str,
        set_columns: &[String],
        qualifiers: &[String],
    ) -> Result<String> {
        let assignments = set_columns
            .iter()
            .map(|c| {
                let q = quote_pg(c)?;
                Ok(format!("{} = s.{}", q, q))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(format!(
            "UPDATE {} AS t SET {} FROM {} AS s WHERE {}",
            target,
            assignments.join(", "),
            pseudo,
            join_condition(qualifiers)?
        ))
    }

    /// Delete rows matched by the pseudo-table.
    pub fn delete_using(&self, target: &str, pseudo: &str, qualifiers: &[String]) -> Result<String> {
        Ok(format!(
            "DELETE FROM {} AS t USING {} AS s WHERE {}",
            target,
            pseudo,
            join_condition(qualifiers)?
        ))
    }

    /// Single-statement upsert.
    pub fn upsert(
        &self,
        target: &str,
        pseudo: &str,
        insert_columns: &[String],
        qualifiers: &[String],
        update_columns: &[String],
        overriding: bool,
    ) -> Result<String> {
        let cols = column_list(insert_columns)?;
        let action = if update_columns.is_empty() {
            "DO NOTHING".to_string()
        } else {
            let assignments = update_columns
                .iter()
                .map(|c| {
                    let q = quote_pg(c)?;
                    Ok(format!("{} = EXCLUDED.{}", q, q))
                })
                .collect::<Result<Vec<_>>>()?;
            format!("DO UPDATE SET {}", assignments.join(", "))
        };
        Ok(format!(
            "INSERT INTO {} ({}){} SELECT {} FROM {} ON CONFLICT ({}) {}",
            target,
            cols,
            overriding_clause(overriding),
            cols,
            pseudo,
            column_list(qualifiers)?,
            action
        ))
    }

    /// Insert pseudo-table rows that have no match in the target.
    pub fn insert_missing(
        &self,
        target: &str,
        pseudo: &str,
        insert_columns: &[String],
        qualifiers: &[String],
        overriding: bool,
    ) -> Result<String> {
        let source_cols = insert_columns
            .iter()
            .map(|c| Ok(format!("s.{}", quote_pg(c)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!(
            "INSERT INTO {} ({}){} SELECT {} FROM {} AS s WHERE NOT EXISTS (SELECT 1 FROM {} AS t WHERE {})",
            target,
            column_list(insert_columns)?,
            overriding_clause(overriding),
            source_cols.join(", "),
            pseudo,
            target,
            join_condition(qualifiers)?
        ))
    }
}

fn column_list(columns: &[String]) -> Result<String> {
    Ok(columns
        .iter()
        .map(|c| quote_pg(c))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

fn join_condition(qualifiers: &[String]) -> Result<String> {
    Ok(qualifiers
        .iter()
        .map(|c| {
            let q = quote_pg(c)?;
            Ok(format!("t.{} = s.{}", q, q))
        })
        .collect::<Result<Vec<_>>>()?
        .join(" AND "))
}

fn overriding_clause(overriding: bool) -> &'static str {
    if overriding {
        " OVERRIDING SYSTEM VALUE"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_create_pseudo_table() {
        let d = PostgresDialect::new();
        let sql = d
            .create_pseudo_table("\"_bulk_t_1\"", "\"public\".\"t\"", &cols(&["id", "v"]), PseudoTableType::Temporary)
            .unwrap();
        assert_eq!(
            sql,
            "CREATE TEMP TABLE \"_bulk_t_1\" AS SELECT \"id\", \"v\" FROM \"public\".\"t\" WITH NO DATA"
        );

        let sql = d
            .create_pseudo_table("\"public\".\"_bulk_t_1\"", "\"public\".\"t\"", &cols(&["id"]), PseudoTableType::Physical)
            .unwrap();
        assert!(sql.starts_with("CREATE UNLOGGED TABLE \"public\".\"_bulk_t_1\""));
    }

    #[test]
    fn test_copy_in() {
        let sql = PostgresDialect::new()
            .copy_in("\"public\".\"t\"", &cols(&["id", "name"]))
            .unwrap();
        assert_eq!(
            sql,
            "COPY \"public\".\"t\" (\"id\", \"name\") FROM STDIN WITH (FORMAT BINARY)"
        );
    }

    #[test]
    fn test_update_from() {
        let sql = PostgresDialect::new()
            .update_from("\"public\".\"t\"", "\"s\"", &cols(&["name", "qty"]), &cols(&["id"]))
            .unwrap();
        assert_eq!(
            sql,
            "UPDATE \"public\".\"t\" AS t SET \"name\" = s.\"name\", \"qty\" = s.\"qty\" FROM \"s\" AS s WHERE t.\"id\" = s.\"id\""
        );
    }

    #[test]
    fn test_delete_using_composite_key() {
        let sql = PostgresDialect::new()
            .delete_using("\"public\".\"t\"", "\"s\"", &cols(&["a", "b"]))
            .unwrap();
        assert_eq!(
            sql,
            "DELETE FROM \"public\".\"t\" AS t USING \"s\" AS s WHERE t.\"a\" = s.\"a\" AND t.\"b\" = s.\"b\""
        );
    }

    #[test]
    fn test_upsert() {
        let d = PostgresDialect::new();
        let sql = d
            .upsert("\"public\".\"t\"", "\"s\"", &cols(&["id", "name"]), &cols(&["id"]), &cols(&["name"]), true)
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"t\" (\"id\", \"name\") OVERRIDING SYSTEM VALUE SELECT \"id\", \"name\" FROM \"s\" ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\""
        );

        let sql = d
            .upsert("\"public\".\"t\"", "\"s\"", &cols(&["id"]), &cols(&["id"]), &[], false)
            .unwrap();
        assert!(sql.ends_with("ON CONFLICT (\"id\") DO NOTHING"));
    }

    #[test]
    fn test_insert_missing() {
        let sql = PostgresDialect::new()
            .insert_missing("\"public\".\"t\"", "\"s\"", &cols(&["code", "name"]), &cols(&["code"]), false)
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"t\" (\"code\", \"name\") SELECT s.\"code\", s.\"name\" FROM \"s\" AS s WHERE NOT EXISTS (SELECT 1 FROM \"public\".\"t\" AS t WHERE t.\"code\" = s.\"code\")"
        );
    }
}
