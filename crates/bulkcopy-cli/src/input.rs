//! Input files for the `load` and `delete-keys` commands.
//!
//! Rows are JSON objects, either one per line or as a single JSON array.
//! Columns come from the first row; later rows may omit a column (NULL) but
//! may not introduce one. An empty file is an empty table, which loads zero
//! rows.

use std::path::Path;

use bulkcopy::{BulkError, DataTable, Result, SqlNullType, SqlValue};
use serde_json::{Map, Value};

/// Read `path` into a table named after the file stem.
pub fn read_table(path: &Path) -> Result<DataTable> {
    let content = std::fs::read_to_string(path)?;
    let objects = parse_objects(path, &content)?;

    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let columns: Vec<String> = objects
        .first()
        .map(|first| first.keys().cloned().collect())
        .unwrap_or_default();

    let mut table = DataTable::new(columns.clone());
    table.name = name;

    for (index, object) in objects.iter().enumerate() {
        if let Some(extra) = object.keys().find(|k| !columns.contains(k)) {
            return Err(input_error(
                path,
                format!("row {} has column {} not present in the first row", index + 1, extra),
            ));
        }
        let row = columns
            .iter()
            .map(|c| match object.get(c) {
                Some(value) => SqlValue::from_json(value),
                None => SqlValue::Null(SqlNullType::String),
            })
            .collect();
        table.push_row(row);
    }

    Ok(table)
}

/// Read a JSON array of scalar primary key values.
pub fn read_keys(path: &Path) -> Result<Vec<SqlValue>> {
    let content = std::fs::read_to_string(path)?;
    let values: Vec<Value> = serde_json::from_str(&content)
        .map_err(|e| input_error(path, format!("expected a JSON array of keys: {}", e)))?;

    values
        .iter()
        .enumerate()
        .map(|(index, value)| match value {
            Value::Array(_) | Value::Object(_) | Value::Null => Err(input_error(
                path,
                format!("key {} must be a string or number", index + 1),
            )),
            scalar => Ok(SqlValue::from_json(scalar)),
        })
        .collect()
}

fn parse_objects(path: &Path, content: &str) -> Result<Vec<Map<String, Value>>> {
    let values: Vec<Value> = if content.trim_start().starts_with('[') {
        serde_json::from_str(content).map_err(|e| input_error(path, e.to_string()))?
    } else {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line)
                    .map_err(|e| input_error(path, format!("line {}: {}", n + 1, e)))
            })
            .collect::<Result<_>>()?
    };

    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| match value {
            Value::Object(object) => Ok(object),
            _ => Err(input_error(path, format!("row {} is not a JSON object", index + 1))),
        })
        .collect()
}

fn input_error(path: &Path, message: impl std::fmt::Display) -> BulkError {
    BulkError::Config(format!("Input file {}: {}", path.display(), message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(suffix: &str, content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_json_lines_become_named_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("customers.jsonl");
        std::fs::write(
            &path,
            "{\"id\": 1, \"name\": \"Ada\"}\n\n{\"id\": 2, \"name\": null}\n{\"id\": 3}\n",
        )
        .unwrap();

        let table = read_table(&path).unwrap();
        assert_eq!(table.name.as_deref(), Some("customers"));
        assert_eq!(table.columns, vec!["id".to_string(), "name".to_string()]);
        assert_eq!(table.len(), 3);
        assert_eq!(table.rows[0], vec![SqlValue::I64(1), SqlValue::Text("Ada".into())]);
        assert!(table.rows[1][1].is_null());
        assert!(table.rows[2][1].is_null());
    }

    #[test]
    fn test_json_array_input() {
        let file = file_with(".json", r#"[{"price": 9.5, "active": true}]"#);
        let table = read_table(file.path()).unwrap();
        assert_eq!(table.rows[0], vec![SqlValue::Bool(true), SqlValue::F64(9.5)]);
    }

    #[test]
    fn test_unexpected_column_is_rejected() {
        let file = file_with(".jsonl", "{\"id\": 1}\n{\"id\": 2, \"extra\": 0}\n");
        let err = read_table(file.path()).unwrap_err();
        assert!(err.to_string().contains("extra"));
        assert_eq!(err.exit_code(), bulkcopy::error::EXIT_CONFIG_ERROR);
    }

    #[test]
    fn test_empty_and_malformed_input() {
        for (suffix, content) in [(".jsonl", "\n"), (".json", "[]"), (".jsonl", "")] {
            let file = file_with(suffix, content);
            let table = read_table(file.path()).unwrap();
            assert!(table.is_empty());
            assert!(table.columns.is_empty());
            assert!(table.name.is_some());
        }

        let file = file_with(".jsonl", "{\"id\": 1}\nnot json\n");
        assert!(read_table(file.path()).unwrap_err().to_string().contains("line 2"));
    }

    #[test]
    fn test_read_keys() {
        let file = file_with(".json", r#"[4, "b7", 15]"#);
        let keys = read_keys(file.path()).unwrap();
        assert_eq!(keys, vec![SqlValue::I64(4), SqlValue::Text("b7".into()), SqlValue::I64(15)]);

        let file = file_with(".json", r#"[1, null]"#);
        assert!(read_keys(file.path()).is_err());
    }
}
