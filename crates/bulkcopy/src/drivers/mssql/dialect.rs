//! SQL Server statement builders for bulk operations.
//!
//! Table arguments are already bracket-quoted; column arguments are raw
//! catalog names.

use crate::core::identifier::quote_mssql;
use crate::error::Result;

/// Microsoft SQL Server SQL builders.
#[derive(Debug, Clone, Copy, Default)]
pub struct MssqlDialect;

impl MssqlDialect {
    pub fn new() -> Self {
        Self
    }

    /// `definitions` are `(column, type definition)` pairs.
    pub fn create_pseudo_table(&self, pseudo: &str, definitions: &[(String, String)]) -> Result<String> {
        let cols = definitions
            .iter()
            .map(|(name, definition)| Ok(format!("{} {} NULL", quote_mssql(name)?, definition)))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("CREATE TABLE {} ({})", pseudo, cols.join(", ")))
    }

    pub fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", table)
    }

    pub fn insert_select(&self, target: &str, pseudo: &str, columns: &[String]) -> Result<String> {
        let cols = column_list(columns)?;
        Ok(format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            target, cols, cols, pseudo
        ))
    }

    pub fn update_join(
        &self,
        target: &str,
        pseudo: &str,
        set_columns: &[String],
        qualifiers: &[String],
    ) -> Result<String> {
        let assignments = set_columns
            .iter()
            .map(|c| {
                let q = quote_mssql(c)?;
                Ok(format!("t.{} = s.{}", q, q))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(format!(
            "UPDATE t SET {} FROM {} AS t INNER JOIN {} AS s ON {}",
            assignments.join(", "),
            target,
            pseudo,
            join_condition(qualifiers)?
        ))
    }

    pub fn delete_join(&self, target: &str, pseudo: &str, qualifiers: &[String]) -> Result<String> {
        Ok(format!(
            "DELETE t FROM {} AS t INNER JOIN {} AS s ON {}",
            target,
            pseudo,
            join_condition(qualifiers)?
        ))
    }

    /// Single MERGE statement: update matched rows, insert the rest.
    pub fn merge(
        &self,
        target: &str,
        pseudo: &str,
        insert_columns: &[String],
        qualifiers: &[String],
        update_columns: &[String],
    ) -> Result<String> {
        let source_cols = insert_columns
            .iter()
            .map(|c| Ok(format!("s.{}", quote_mssql(c)?)))
            .collect::<Result<Vec<_>>>()?;

        let matched = if update_columns.is_empty() {
            String::new()
        } else {
            let assignments = update_columns
                .iter()
                .map(|c| {
                    let q = quote_mssql(c)?;
                    Ok(format!("t.{} = s.{}", q, q))
                })
                .collect::<Result<Vec<_>>>()?;
            format!(" WHEN MATCHED THEN UPDATE SET {}", assignments.join(", "))
        };

        Ok(format!(
            "MERGE INTO {} WITH (TABLOCK) AS t USING {} AS s ON {}{} WHEN NOT MATCHED THEN INSERT ({}) VALUES ({});",
            target,
            pseudo,
            join_condition(qualifiers)?,
            matched,
            column_list(insert_columns)?,
            source_cols.join(", ")
        ))
    }

    /// Insert pseudo-table rows with no match in the target.
    pub fn insert_missing(
        &self,
        target: &str,
        pseudo: &str,
        insert_columns: &[String],
        qualifiers: &[String],
    ) -> Result<String> {
        let source_cols = insert_columns
            .iter()
            .map(|c| Ok(format!("s.{}", quote_mssql(c)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!(
            "INSERT INTO {} ({}) SELECT {} FROM {} AS s WHERE NOT EXISTS (SELECT 1 FROM {} AS t WHERE {})",
            target,
            column_list(insert_columns)?,
            source_cols.join(", "),
            pseudo,
            target,
            join_condition(qualifiers)?
        ))
    }

    /// Allow explicit identity values for the duration of `sql`.
    ///
    /// IDENTITY_INSERT is session state, so it is switched off again before
    /// an error from `sql` is rethrown.
    pub fn with_identity_insert(&self, target: &str, sql: &str) -> String {
        format!(
            "SET IDENTITY_INSERT {t} ON; \
             BEGIN TRY {sql} END TRY \
             BEGIN CATCH SET IDENTITY_INSERT {t} OFF; THROW; END CATCH; \
             SET IDENTITY_INSERT {t} OFF;",
            t = target,
            sql = terminated(sql),
        )
    }
}

fn terminated(sql: &str) -> String {
    if sql.trim_end().ends_with(';') {
        sql.to_string()
    } else {
        format!("{};", sql)
    }
}

fn column_list(columns: &[String]) -> Result<String> {
    Ok(columns
        .iter()
        .map(|c| quote_mssql(c))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

fn join_condition(qualifiers: &[String]) -> Result<String> {
    Ok(qualifiers
        .iter()
        .map(|c| {
            let q = quote_mssql(c)?;
            Ok(format!("t.{} = s.{}", q, q))
        })
        .collect::<Result<Vec<_>>>()?
        .join(" AND "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_create_pseudo_table() {
        let defs = vec![
            ("id".to_string(), "int".to_string()),
            ("name".to_string(), "nvarchar(50) COLLATE Latin1_General_CI_AS".to_string()),
        ];
        let sql = MssqlDialect::new().create_pseudo_table("[#_bulk_t_1]", &defs).unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE [#_bulk_t_1] ([id] int NULL, [name] nvarchar(50) COLLATE Latin1_General_CI_AS NULL)"
        );
    }

    #[test]
    fn test_update_join() {
        let sql = MssqlDialect::new()
            .update_join("[dbo].[t]", "[#s]", &cols(&["name"]), &cols(&["id"]))
            .unwrap();
        assert_eq!(
            sql,
            "UPDATE t SET t.[name] = s.[name] FROM [dbo].[t] AS t INNER JOIN [#s] AS s ON t.[id] = s.[id]"
        );
    }

    #[test]
    fn test_delete_join() {
        let sql = MssqlDialect::new()
            .delete_join("[dbo].[t]", "[#s]", &cols(&["a", "b"]))
            .unwrap();
        assert_eq!(
            sql,
            "DELETE t FROM [dbo].[t] AS t INNER JOIN [#s] AS s ON t.[a] = s.[a] AND t.[b] = s.[b]"
        );
    }

    #[test]
    fn test_merge() {
        let d = MssqlDialect::new();
        let sql = d
            .merge("[dbo].[t]", "[#s]", &cols(&["id", "name"]), &cols(&["id"]), &cols(&["name"]))
            .unwrap();
        assert_eq!(
            sql,
            "MERGE INTO [dbo].[t] WITH (TABLOCK) AS t USING [#s] AS s ON t.[id] = s.[id] \
             WHEN MATCHED THEN UPDATE SET t.[name] = s.[name] \
             WHEN NOT MATCHED THEN INSERT ([id], [name]) VALUES (s.[id], s.[name]);"
        );

        let sql = d
            .merge("[dbo].[t]", "[#s]", &cols(&["id"]), &cols(&["id"]), &[])
            .unwrap();
        assert!(!sql.contains("WHEN MATCHED"));
    }

    #[test]
    fn test_insert_missing() {
        let sql = MssqlDialect::new()
            .insert_missing("[dbo].[t]", "[#s]", &cols(&["code"]), &cols(&["code"]))
            .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO [dbo].[t] ([code]) SELECT s.[code] FROM [#s] AS s WHERE NOT EXISTS (SELECT 1 FROM [dbo].[t] AS t WHERE t.[code] = s.[code])"
        );
    }

    #[test]
    fn test_identity_insert_wrapping() {
        let d = MssqlDialect::new();
        let insert = d.insert_select("[dbo].[t]", "[#s]", &cols(&["id"])).unwrap();
        assert_eq!(
            d.with_identity_insert("[dbo].[t]", &insert),
            "SET IDENTITY_INSERT [dbo].[t] ON; \
             BEGIN TRY INSERT INTO [dbo].[t] ([id]) SELECT [id] FROM [#s]; END TRY \
             BEGIN CATCH SET IDENTITY_INSERT [dbo].[t] OFF; THROW; END CATCH; \
             SET IDENTITY_INSERT [dbo].[t] OFF;"
        );
    }

    #[test]
    fn test_identity_insert_is_reset_when_statement_fails() {
        let d = MssqlDialect::new();
        let sql = d.with_identity_insert("[dbo].[t]", "MERGE INTO [dbo].[t] AS t USING [#s] AS s ON 1 = 0");

        let catch_start = sql.find("BEGIN CATCH").unwrap();
        let catch_end = sql.find("END CATCH").unwrap();
        let catch = &sql[catch_start..catch_end];
        let off = catch.find("SET IDENTITY_INSERT [dbo].[t] OFF;").unwrap();
        let rethrow = catch.find("THROW;").unwrap();
        assert!(off < rethrow);

        let try_block = &sql[sql.find("BEGIN TRY").unwrap()..sql.find("END TRY").unwrap()];
        assert!(try_block.contains("ON 1 = 0;"));
        assert!(sql.ends_with("END CATCH; SET IDENTITY_INSERT [dbo].[t] OFF;"));
    }
}
