//! Database driver implementations.
//!
//! - [`postgres`]: binary COPY through tokio-postgres and deadpool
//! - [`mssql`]: TDS bulk insert through tiberius and bb8
//! - [`common`]: TLS, worker defaults and the cancel/timeout guard
//!
//! [`RepositoryImpl`] and [`ConnectionImpl`] pick the vendor from
//! configuration and dispatch statically with a `match` per method.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DatabaseType};
use crate::core::mapping::TableMappings;
use crate::core::request::BulkCommand;
use crate::core::traits::{BulkConnection, ConnectionPersistency, Repository};
use crate::error::Result;

pub mod common;
pub mod mssql;
pub mod postgres;

pub use common::SslMode;
pub use mssql::{MssqlConnection, MssqlDialect, MssqlRepository};
pub use postgres::{PgConnection, PgRepository, PostgresDialect};

/// Result of a connectivity probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub dialect: String,
    pub target: String,
    pub connected: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub(crate) fn new(dialect: &str, target: &str, started: Instant, outcome: Result<String>) -> Self {
        let latency_ms = started.elapsed().as_millis() as u64;
        let (connected, version, error) = match outcome {
            Ok(version) => (true, Some(version), None),
            Err(e) => (false, None, Some(e.to_string())),
        };
        Self {
            dialect: dialect.to_string(),
            target: target.to_string(),
            connected,
            latency_ms,
            version,
            error,
        }
    }
}

/// Repository for whichever vendor the configuration names.
pub enum RepositoryImpl {
    Postgres(PgRepository),
    Mssql(MssqlRepository),
}

impl RepositoryImpl {
    /// Connect with an empty table mapping registry.
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::with_mappings(config, Arc::new(TableMappings::new())).await
    }

    /// Connect and share `mappings` with other repositories.
    pub async fn with_mappings(config: &Config, mappings: Arc<TableMappings>) -> Result<Self> {
        Ok(match config.database.r#type {
            DatabaseType::Postgres => {
                RepositoryImpl::Postgres(PgRepository::with_mappings(config, mappings).await?)
            }
            DatabaseType::Mssql => {
                RepositoryImpl::Mssql(MssqlRepository::with_mappings(config, mappings).await?)
            }
        })
    }

    /// Shared handle to the mapping registry.
    pub fn mappings_handle(&self) -> Arc<TableMappings> {
        match self {
            RepositoryImpl::Postgres(r) => r.mappings_handle(),
            RepositoryImpl::Mssql(r) => r.mappings_handle(),
        }
    }

    pub async fn health_check(&self) -> HealthReport {
        match self {
            RepositoryImpl::Postgres(r) => r.health_check().await,
            RepositoryImpl::Mssql(r) => r.health_check().await,
        }
    }
}

#[async_trait]
impl Repository for RepositoryImpl {
    type Connection = ConnectionImpl;

    async fn create_connection(&self) -> Result<ConnectionImpl> {
        Ok(match self {
            RepositoryImpl::Postgres(r) => ConnectionImpl::Postgres(r.create_connection().await?),
            RepositoryImpl::Mssql(r) => ConnectionImpl::Mssql(r.create_connection().await?),
        })
    }

    fn persistency(&self) -> ConnectionPersistency {
        match self {
            RepositoryImpl::Postgres(r) => r.persistency(),
            RepositoryImpl::Mssql(r) => r.persistency(),
        }
    }

    fn command_timeout(&self) -> Option<Duration> {
        match self {
            RepositoryImpl::Postgres(r) => r.command_timeout(),
            RepositoryImpl::Mssql(r) => r.command_timeout(),
        }
    }

    fn mappings(&self) -> &TableMappings {
        match self {
            RepositoryImpl::Postgres(r) => r.mappings(),
            RepositoryImpl::Mssql(r) => r.mappings(),
        }
    }
}

/// Connection handed out by [`RepositoryImpl`].
pub enum ConnectionImpl {
    Postgres(PgConnection),
    Mssql(MssqlConnection),
}

#[async_trait]
impl BulkConnection for ConnectionImpl {
    fn dialect(&self) -> &'static str {
        match self {
            ConnectionImpl::Postgres(c) => c.dialect(),
            ConnectionImpl::Mssql(c) => c.dialect(),
        }
    }

    async fn execute_bulk(
        &mut self,
        command: BulkCommand<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        match self {
            ConnectionImpl::Postgres(c) => c.execute_bulk(command, cancel).await,
            ConnectionImpl::Mssql(c) => c.execute_bulk(command, cancel).await,
        }
    }

    async fn begin(&mut self) -> Result<()> {
        match self {
            ConnectionImpl::Postgres(c) => c.begin().await,
            ConnectionImpl::Mssql(c) => c.begin().await,
        }
    }

    async fn commit(&mut self) -> Result<()> {
        match self {
            ConnectionImpl::Postgres(c) => c.commit().await,
            ConnectionImpl::Mssql(c) => c.commit().await,
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        match self {
            ConnectionImpl::Postgres(c) => c.rollback().await,
            ConnectionImpl::Mssql(c) => c.rollback().await,
        }
    }

    async fn close(self) -> Result<()> {
        match self {
            ConnectionImpl::Postgres(c) => c.close().await,
            ConnectionImpl::Mssql(c) => c.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BulkError;

    #[test]
    fn test_health_report_success() {
        let report = HealthReport::new("postgres", "db:5432/app", Instant::now(), Ok("PostgreSQL 16.2".into()));
        assert!(report.connected);
        assert_eq!(report.version.as_deref(), Some("PostgreSQL 16.2"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["dialect"], "postgres");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_health_report_failure() {
        let report = HealthReport::new(
            "mssql",
            "db:1433/app",
            Instant::now(),
            Err(BulkError::pool("connection refused", "db:1433/app")),
        );
        assert!(!report.connected);
        assert!(report.version.is_none());
        assert!(report.error.unwrap().contains("connection refused"));
    }
}
