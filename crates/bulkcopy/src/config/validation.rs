//! Configuration validation.

use super::Config;
use crate::drivers::common::SslMode;
use crate::error::{BulkError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    let db = &config.database;

    if db.host.is_empty() {
        return Err(BulkError::Config("database.host is required".into()));
    }
    if db.database.is_empty() {
        return Err(BulkError::Config("database.database is required".into()));
    }
    if db.user.is_empty() {
        return Err(BulkError::Config("database.user is required".into()));
    }
    if let Some(schema) = &db.schema {
        if schema.is_empty() {
            return Err(BulkError::Config("database.schema cannot be empty".into()));
        }
    }
    SslMode::parse(&db.ssl_mode)?;

    if let Some(0) = config.bulk.batch_size {
        return Err(BulkError::Config("bulk.batch_size must be at least 1".into()));
    }
    if config.bulk.pool_size == 0 {
        return Err(BulkError::Config("bulk.pool_size must be at least 1".into()));
    }
    if config.bulk.command_timeout_secs == 0 {
        return Err(BulkError::Config(
            "bulk.command_timeout_secs must be at least 1".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BulkConfig, DatabaseConfig, DatabaseType};

    fn valid_config() -> Config {
        Config {
            database: DatabaseConfig {
                r#type: DatabaseType::Postgres,
                host: "localhost".to_string(),
                port: Some(5432),
                database: "app".to_string(),
                user: "postgres".to_string(),
                password: "password".to_string(),
                schema: None,
                ssl_mode: "disable".to_string(),
            },
            bulk: BulkConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_host() {
        let mut config = valid_config();
        config.database.host = "".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_ssl_mode() {
        let mut config = valid_config();
        config.database.ssl_mode = "sometimes".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("ssl_mode"));
    }

    #[test]
    fn test_zero_batch_size() {
        let mut config = valid_config();
        config.bulk.batch_size = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_pool_size() {
        let mut config = valid_config();
        config.bulk.pool_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_database_config_debug_redacts_password() {
        let mut config = valid_config();
        config.database.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.database);
        assert!(
            debug_output.contains("[REDACTED]"),
            "Debug output should contain [REDACTED]"
        );
        assert!(
            !debug_output.contains("super_secret_password_123"),
            "Debug output should not contain actual password value"
        );
    }
}
