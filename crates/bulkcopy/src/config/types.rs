//! Configuration type definitions.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::options::PseudoTableType;
use crate::core::traits::ConnectionPersistency;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database connection settings.
    pub database: DatabaseConfig,

    /// Bulk operation defaults.
    #[serde(default)]
    pub bulk: BulkConfig,
}

/// Supported database vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// PostgreSQL, loaded through binary COPY.
    #[serde(alias = "postgresql", alias = "pg")]
    Postgres,
    /// SQL Server, loaded through TDS bulk insert.
    #[serde(alias = "sqlserver")]
    Mssql,
}

impl DatabaseType {
    /// Default TCP port for the vendor.
    pub fn default_port(self) -> u16 {
        match self {
            DatabaseType::Postgres => 5432,
            DatabaseType::Mssql => 1433,
        }
    }

    /// Default schema for unqualified table names.
    pub fn default_schema(self) -> &'static str {
        match self {
            DatabaseType::Postgres => "public",
            DatabaseType::Mssql => "dbo",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseType::Postgres => f.write_str("postgres"),
            DatabaseType::Mssql => f.write_str("mssql"),
        }
    }
}

/// Database connection configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database vendor.
    pub r#type: DatabaseType,

    /// Database host.
    pub host: String,

    /// Database port (default: 5432 for PostgreSQL, 1433 for SQL Server).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Schema for unqualified table names (default: "public" / "dbo").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,
}

impl DatabaseConfig {
    /// Effective port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.r#type.default_port())
    }

    /// Effective default schema.
    pub fn schema(&self) -> &str {
        self.schema
            .as_deref()
            .unwrap_or_else(|| self.r#type.default_schema())
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("type", &self.r#type)
            .field("host", &self.host)
            .field("port", &self.port())
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema())
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Bulk operation defaults applied by repositories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkConfig {
    /// Connection persistency policy (default: per_call).
    #[serde(default)]
    pub persistency: ConnectionPersistency,

    /// Rows per COPY / bulk-load round when a call does not set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Command timeout in seconds (default: 300).
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Maximum pooled connections (default: 8).
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Pseudo-table kind when a call does not set one.
    #[serde(default)]
    pub pseudo_table: PseudoTableType,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            persistency: ConnectionPersistency::default(),
            batch_size: None,
            command_timeout_secs: default_command_timeout_secs(),
            pool_size: default_pool_size(),
            pseudo_table: PseudoTableType::default(),
        }
    }
}

impl BulkConfig {
    /// Command timeout as a duration.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn default_require() -> String {
    "require".to_string()
}

fn default_command_timeout_secs() -> u64 {
    300
}

fn default_pool_size() -> usize {
    8
}
