//! Identifier validation, quoting and table-name parsing.
//!
//! Table and column names cannot be bound as statement parameters, so every
//! identifier that ends up in generated SQL goes through [`validate_identifier`]
//! and a dialect-specific quote function.

use crate::error::{BulkError, Result};

/// Maximum identifier length accepted by either backend.
/// - PostgreSQL: 63 bytes
/// - SQL Server: 128 characters
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// PostgreSQL truncates identifiers longer than this (NAMEDATALEN - 1).
const PG_MAX_IDENTIFIER_BYTES: usize = 63;

/// Prefix of generated pseudo-table names.
const PSEUDO_TABLE_PREFIX: &str = "_bulk_";

/// Validate an identifier for security issues.
///
/// Rejects empty identifiers, identifiers containing null bytes and
/// identifiers exceeding the maximum length.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BulkError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(BulkError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(BulkError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
///
/// Escapes double quotes by doubling them and wraps in double quotes.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a SQL Server identifier using brackets.
///
/// Escapes closing brackets by doubling them and wraps in brackets.
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// A possibly schema-qualified table name as given by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    /// Schema, when the caller wrote `schema.table`.
    pub schema: Option<String>,
    /// Bare table name.
    pub name: String,
}

impl TableName {
    /// Parse `table`, `schema.table`, `"schema"."table"` or `[schema].[table]`.
    ///
    /// Dots inside quotes or brackets belong to the name.
    pub fn parse(raw: &str) -> Result<Self> {
        let parts = split_qualified(raw.trim());
        let (schema, name) = match parts.as_slice() {
            [name] => (None, name.clone()),
            [schema, name] => (Some(schema.clone()), name.clone()),
            _ => {
                return Err(BulkError::Config(format!(
                    "Invalid table name {:?}: expected 'table' or 'schema.table'",
                    raw
                )))
            }
        };

        validate_identifier(&name)?;
        if let Some(schema) = &schema {
            validate_identifier(schema)?;
        }

        Ok(Self { schema, name })
    }

    /// Schema to use, falling back to the connection default.
    pub fn schema_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.schema.as_deref().unwrap_or(default)
    }

    /// `"schema"."table"` for PostgreSQL.
    pub fn qualify_pg(&self, default_schema: &str) -> Result<String> {
        Ok(format!(
            "{}.{}",
            quote_pg(self.schema_or(default_schema))?,
            quote_pg(&self.name)?
        ))
    }

    /// `[schema].[table]` for SQL Server.
    pub fn qualify_mssql(&self, default_schema: &str) -> Result<String> {
        Ok(format!(
            "{}.{}",
            quote_mssql(self.schema_or(default_schema))?,
            quote_mssql(&self.name)?
        ))
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

fn split_qualified(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut closing: Option<char> = None;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        match closing {
            Some(end) if c == end => {
                // A doubled closing character is an escaped literal.
                if chars.peek() == Some(&end) {
                    current.push(end);
                    chars.next();
                } else {
                    closing = None;
                }
            }
            Some(_) => current.push(c),
            None => match c {
                '"' => closing = Some('"'),
                '[' => closing = Some(']'),
                '.' => parts.push(std::mem::take(&mut current)),
                _ => current.push(c),
            },
        }
    }
    parts.push(current);
    parts
}

/// Build a pseudo-table name for staging rows of `table`.
///
/// The result fits PostgreSQL's 63-byte identifier limit.
pub fn pseudo_table_name(table: &str, suffix: &str) -> String {
    let budget = PG_MAX_IDENTIFIER_BYTES - PSEUDO_TABLE_PREFIX.len() - suffix.len() - 1;
    let mut base = String::with_capacity(budget);
    for c in table.chars() {
        if base.len() + c.len_utf8() > budget {
            break;
        }
        base.push(if c.is_alphanumeric() || c == '_' { c } else { '_' });
    }
    format!("{}{}_{}", PSEUDO_TABLE_PREFIX, base, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_normal() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("column with spaces").is_ok());
        assert!(validate_identifier("日本語").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_empty() {
        let result = validate_identifier("");
        assert!(result.unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn test_validate_identifier_rejects_null_byte() {
        let result = validate_identifier("table\0name");
        assert!(result.unwrap_err().to_string().contains("null byte"));
    }

    #[test]
    fn test_validate_identifier_rejects_too_long() {
        let long_name = "a".repeat(MAX_IDENTIFIER_LENGTH + 1);
        let result = validate_identifier(&long_name);
        assert!(result.unwrap_err().to_string().contains("maximum length"));
    }

    #[test]
    fn test_quote_pg_escapes_double_quote() {
        assert_eq!(quote_pg("users").unwrap(), "\"users\"");
        assert_eq!(quote_pg("table\"name").unwrap(), "\"table\"\"name\"");
    }

    #[test]
    fn test_quote_mssql_escapes_bracket() {
        assert_eq!(quote_mssql("users").unwrap(), "[users]");
        assert_eq!(quote_mssql("table]name").unwrap(), "[table]]name]");
    }

    #[test]
    fn test_quote_sql_injection_safely_quoted() {
        assert_eq!(
            quote_mssql("Robert]; DROP TABLE Students;--").unwrap(),
            "[Robert]]; DROP TABLE Students;--]"
        );
        assert_eq!(
            quote_pg("Robert'); DROP TABLE Students;--").unwrap(),
            "\"Robert'); DROP TABLE Students;--\""
        );
    }

    #[test]
    fn test_table_name_parse_plain_and_qualified() {
        let plain = TableName::parse("orders").unwrap();
        assert_eq!(plain.schema, None);
        assert_eq!(plain.name, "orders");
        assert_eq!(plain.qualify_pg("public").unwrap(), "\"public\".\"orders\"");

        let qualified = TableName::parse("sales.orders").unwrap();
        assert_eq!(qualified.schema.as_deref(), Some("sales"));
        assert_eq!(qualified.qualify_mssql("dbo").unwrap(), "[sales].[orders]");
        assert_eq!(qualified.to_string(), "sales.orders");
    }

    #[test]
    fn test_table_name_parse_quoted_parts() {
        let pg = TableName::parse("\"my.schema\".\"Order\"\"s\"").unwrap();
        assert_eq!(pg.schema.as_deref(), Some("my.schema"));
        assert_eq!(pg.name, "Order\"s");

        let ms = TableName::parse("[dbo].[Order]]Lines]").unwrap();
        assert_eq!(ms.schema.as_deref(), Some("dbo"));
        assert_eq!(ms.name, "Order]Lines");
    }

    #[test]
    fn test_table_name_parse_rejects_three_parts() {
        assert!(TableName::parse("db.dbo.orders").is_err());
        assert!(TableName::parse("").is_err());
    }

    #[test]
    fn test_pseudo_table_name_fits_limit() {
        let name = pseudo_table_name(&"x".repeat(200), "deadbeef");
        assert!(name.len() <= PG_MAX_IDENTIFIER_BYTES);
        assert!(name.starts_with("_bulk_x"));
        assert!(name.ends_with("_deadbeef"));

        assert_eq!(pseudo_table_name("order lines", "0a1b2c3d"), "_bulk_order_lines_0a1b2c3d");
    }
}
