//! PostgreSQL repository and bulk worker.
//!
//! Inserts stream rows straight into the target with binary COPY. Update,
//! delete, merge and delete-by-key COPY the rows into a pseudo-table first
//! and then run one set-based statement against the target.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::pin_mut;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::core::columns::{key_column, resolve_qualifiers, ColumnPlan};
use crate::core::identifier::{pseudo_table_name, quote_pg, TableName};
use crate::core::mapping::TableMappings;
use crate::core::options::{BulkOptions, IdentityBehavior, MergeCommandType, PseudoTableType};
use crate::core::request::{BulkCommand, BulkOperation, BulkSource};
use crate::core::rows::RowReader;
use crate::core::traits::{BulkConnection, ConnectionPersistency, Repository};
use crate::core::value::SqlValue;
use crate::drivers::common::{run_guarded, tls, SslMode, WorkerDefaults};
use crate::drivers::postgres::dialect::PostgresDialect;
use crate::drivers::postgres::schema::{column_types, read_table_schema, reset_sequences};
use crate::drivers::HealthReport;
use crate::error::{BulkError, Result};

const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

type SharedSlot = Arc<Mutex<Option<Object>>>;

/// PostgreSQL connection source backed by a deadpool pool.
pub struct PgRepository {
    pool: Pool,
    defaults: Arc<WorkerDefaults>,
    persistency: ConnectionPersistency,
    command_timeout: Duration,
    mappings: Arc<TableMappings>,
    /// The kept connection under [`ConnectionPersistency::Instance`].
    instance: SharedSlot,
    /// Connector for out-of-band cancel requests, `None` without TLS.
    tls: Option<MakeRustlsConnect>,
    target: String,
}

impl PgRepository {
    /// Connect with an empty table mapping registry.
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::with_mappings(config, Arc::new(TableMappings::new())).await
    }

    /// Connect and share `mappings` with other repositories.
    pub async fn with_mappings(config: &Config, mappings: Arc<TableMappings>) -> Result<Self> {
        let db = &config.database;

        let mut pg_config = PgConfig::new();
        pg_config.host(&db.host);
        pg_config.port(db.port());
        pg_config.dbname(&db.database);
        pg_config.user(&db.user);
        pg_config.password(&db.password);
        pg_config.application_name("bulkcopy");

        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let tls = tls::pg_connector(SslMode::parse(&db.ssl_mode)?)?;
        let manager = match tls.clone() {
            Some(connector) => Manager::from_config(pg_config, connector, mgr_config),
            None => Manager::from_config(pg_config, NoTls, mgr_config),
        };

        let pool = Pool::builder(manager)
            .max_size(config.bulk.pool_size)
            .build()
            .map_err(|e| BulkError::pool(e, "creating PostgreSQL pool"))?;

        let client = pool
            .get()
            .await
            .map_err(|e| BulkError::pool(e, "testing PostgreSQL connection"))?;
        client.simple_query("SELECT 1").await?;
        drop(client);

        let target = db.display_target();
        info!(
            "Connected to PostgreSQL: {} (persistency={:?}, pool_size={})",
            target, config.bulk.persistency, config.bulk.pool_size
        );

        Ok(Self {
            pool,
            defaults: Arc::new(WorkerDefaults::from_config(config)),
            persistency: config.bulk.persistency,
            command_timeout: config.bulk.command_timeout(),
            mappings,
            instance: Arc::new(Mutex::new(None)),
            tls,
            target,
        })
    }

    /// Shared handle to the table mapping registry.
    pub fn mappings_handle(&self) -> Arc<TableMappings> {
        Arc::clone(&self.mappings)
    }

    /// Round-trip the server and report its version.
    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let outcome = async {
            let client = self
                .pool
                .get()
                .await
                .map_err(|e| BulkError::pool(e, "health check"))?;
            let row = client.query_one("SELECT version()", &[]).await?;
            Ok::<String, BulkError>(row.get(0))
        }
        .await;
        HealthReport::new("postgres", &self.target, started, outcome)
    }

    async fn pooled(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| BulkError::pool(e, "acquiring PostgreSQL connection"))
    }
}

#[async_trait]
impl Repository for PgRepository {
    type Connection = PgConnection;

    /// Under the instance policy, concurrent calls wait for the kept connection,
    /// so a task holding it must not start another call without a transaction.
    async fn create_connection(&self) -> Result<PgConnection> {
        let handle = match self.persistency {
            ConnectionPersistency::PerCall => PgHandle::Pooled(self.pooled().await?),
            ConnectionPersistency::Instance => {
                let mut slot = Arc::clone(&self.instance).lock_owned().await;
                if slot.as_ref().map_or(true, |client| client.is_closed()) {
                    if slot.is_some() {
                        warn!("Instance PostgreSQL connection was closed, reconnecting");
                    }
                    *slot = Some(self.pooled().await?);
                }
                let guard = OwnedMutexGuard::try_map(slot, |slot| slot.as_mut()).map_err(|_| {
                    BulkError::pool("instance slot is empty", "acquiring PostgreSQL connection")
                })?;
                PgHandle::Instance(guard)
            }
        };

        Ok(PgConnection {
            handle,
            defaults: Arc::clone(&self.defaults),
            tls: self.tls.clone(),
            in_transaction: false,
        })
    }

    fn persistency(&self) -> ConnectionPersistency {
        self.persistency
    }

    fn command_timeout(&self) -> Option<Duration> {
        Some(self.command_timeout)
    }

    fn mappings(&self) -> &TableMappings {
        &self.mappings
    }
}

enum PgHandle {
    Pooled(Object),
    Instance(OwnedMappedMutexGuard<Option<Object>, Object>),
}

impl PgHandle {
    fn client(&self) -> &Client {
        match self {
            PgHandle::Pooled(object) => object,
            PgHandle::Instance(guard) => guard,
        }
    }
}

/// A pooled PostgreSQL connection.
pub struct PgConnection {
    handle: PgHandle,
    defaults: Arc<WorkerDefaults>,
    tls: Option<MakeRustlsConnect>,
    in_transaction: bool,
}

impl PgConnection {
    pub fn client(&self) -> &Client {
        self.handle.client()
    }
}

#[async_trait]
impl BulkConnection for PgConnection {
    fn dialect(&self) -> &'static str {
        "postgres"
    }

    async fn execute_bulk(
        &mut self,
        command: BulkCommand<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let operation = command.operation;
        let raw = command
            .table
            .clone()
            .ok_or_else(|| BulkError::MissingTableName {
                operation: operation.to_string(),
            })?;
        let table = TableName::parse(&raw)?;
        let target = table.qualify_pg(&self.defaults.schema)?;
        let timeout = command.timeout;
        let started = Instant::now();

        let worker = PgWorker {
            client: self.handle.client(),
            defaults: &self.defaults,
            table: &table,
            target: &target,
            dialect: PostgresDialect::new(),
        };

        let mut staged: Option<String> = None;
        let result = run_guarded(&target, timeout, cancel, worker.run(command, &mut staged)).await;

        // The abandoned statement keeps running server-side and would hold up the cleanup.
        if result.as_ref().is_err_and(BulkError::is_abandoned) {
            cancel_running(worker.client, self.tls.as_ref()).await;
        }

        if let Some(pseudo) = staged {
            worker.drop_pseudo_table(&pseudo).await;
        }

        match &result {
            Ok(rows) => info!(
                "Bulk {} on {}: {} rows in {:.2?}",
                operation,
                target,
                rows,
                started.elapsed()
            ),
            Err(e) => debug!("Bulk {} on {} failed: {}", operation, target, e),
        }
        result
    }

    async fn begin(&mut self) -> Result<()> {
        self.client().batch_execute("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.client().batch_execute("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.client().batch_execute("ROLLBACK").await?;
        self.in_transaction = false;
        Ok(())
    }

    /// Return the connection to the pool.
    async fn close(mut self) -> Result<()> {
        if self.in_transaction {
            warn!("Closing PostgreSQL connection with an open transaction, rolling back");
            self.rollback().await?;
        }
        drop(self.handle);
        Ok(())
    }
}

/// Ask the server to stop whatever `client` is running.
async fn cancel_running(client: &Client, tls: Option<&MakeRustlsConnect>) {
    let token = client.cancel_token();
    let sent = match tls {
        Some(connector) => token.cancel_query(connector.clone()).await,
        None => token.cancel_query(NoTls).await,
    };
    match sent {
        Ok(()) => debug!("Cancel request sent for abandoned statement"),
        Err(e) => warn!("Failed to cancel abandoned statement: {}", e),
    }
}

/// One command against one target table.
struct PgWorker<'c> {
    client: &'c Client,
    defaults: &'c WorkerDefaults,
    table: &'c TableName,
    target: &'c str,
    dialect: PostgresDialect,
}

impl PgWorker<'_> {
    /// `staged` receives the pseudo-table name before the table is created,
    /// so the caller can drop it however the command ends.
    async fn run(&self, command: BulkCommand<'_>, staged: &mut Option<String>) -> Result<u64> {
        let BulkCommand {
            operation,
            source,
            options,
            ..
        } = command;
        let batch_size = self.defaults.batch_size(&options);

        let mut reader = match source {
            BulkSource::Keys(keys) => {
                return self.delete_by_keys(keys, &options, batch_size, staged).await
            }
            BulkSource::Rows(reader) => reader,
        };

        let first = reader.next_batch(batch_size).await?;
        if first.is_empty() {
            debug!("{}: no input rows, nothing to {}", self.target, operation);
            return Ok(0);
        }

        let schema = read_table_schema(self.client, self.target).await?;
        let plan = ColumnPlan::build(
            self.target,
            reader.columns(),
            &schema,
            options.mappings.as_deref(),
        )?;
        let mut input = Input {
            first,
            reader: &mut reader,
            batch_size,
        };

        if operation == BulkOperation::Insert {
            return self.insert(&plan, input, &options).await;
        }
        if operation == BulkOperation::DeleteByKey {
            return Err(BulkError::Config(
                "delete-by-key takes a key list, not rows".to_string(),
            ));
        }

        let qualifiers = resolve_qualifiers(
            self.target,
            &schema,
            &plan,
            options.qualifiers.as_deref(),
        )?;
        let pseudo = self.pseudo_table(&options, &plan.names(), staged).await?;
        let staged_rows = self.copy_all(&pseudo, &plan, &mut input).await?;
        debug!("{}: staged {} rows in {}", self.target, staged_rows, pseudo);

        match operation {
            BulkOperation::Update => {
                let set_columns = plan.update_columns(&qualifiers);
                if set_columns.is_empty() {
                    return Err(BulkError::Config(format!(
                        "Nothing to update in {}: every input column is a qualifier or identity",
                        self.target
                    )));
                }
                let sql = self
                    .dialect
                    .update_from(self.target, &pseudo, &set_columns, &qualifiers)?;
                self.execute(&sql).await
            }
            BulkOperation::Delete => {
                let sql = self.dialect.delete_using(self.target, &pseudo, &qualifiers)?;
                self.execute(&sql).await
            }
            _ => self.merge(&pseudo, &plan, &qualifiers, &options).await,
        }
    }

    async fn insert(&self, plan: &ColumnPlan, mut input: Input<'_, '_>, options: &BulkOptions) -> Result<u64> {
        let keep_identity = options.identity == IdentityBehavior::KeepIdentity;
        let plan = if keep_identity {
            plan.clone()
        } else {
            plan.without_identity(self.target)?
        };

        let inserted = self.copy_all(self.target, &plan, &mut input).await?;

        if keep_identity && plan.has_identity() {
            let identity: Vec<String> = plan
                .columns()
                .iter()
                .filter(|c| c.column.is_identity)
                .map(|c| c.column.name.clone())
                .collect();
            reset_sequences(self.client, self.target, &identity).await?;
        }
        Ok(inserted)
    }

    async fn merge(
        &self,
        pseudo: &str,
        plan: &ColumnPlan,
        qualifiers: &[String],
        options: &BulkOptions,
    ) -> Result<u64> {
        let insert_columns = plan.insert_columns(options.identity);
        let update_columns = plan.update_columns(qualifiers);
        let overriding = options.identity == IdentityBehavior::KeepIdentity && plan.has_identity();

        // ON CONFLICT needs every qualifier in the inserted row.
        let qualifiers_inserted = qualifiers.iter().all(|q| insert_columns.contains(q));
        let single_statement = match options.merge_command {
            MergeCommandType::Default | MergeCommandType::OnConflictDoUpdate => qualifiers_inserted,
            MergeCommandType::InsertAndUpdate => false,
        };
        if options.merge_command == MergeCommandType::OnConflictDoUpdate && !qualifiers_inserted {
            debug!(
                "{}: qualifiers are generated columns, merging with update then insert",
                self.target
            );
        }

        let affected = if single_statement {
            let sql = self.dialect.upsert(
                self.target,
                pseudo,
                &insert_columns,
                qualifiers,
                &update_columns,
                overriding,
            )?;
            self.execute(&sql).await?
        } else {
            let updated = if update_columns.is_empty() {
                0
            } else {
                let sql = self
                    .dialect
                    .update_from(self.target, pseudo, &update_columns, qualifiers)?;
                self.execute(&sql).await?
            };
            let sql = self.dialect.insert_missing(
                self.target,
                pseudo,
                &insert_columns,
                qualifiers,
                overriding,
            )?;
            updated + self.execute(&sql).await?
        };

        if overriding {
            let identity: Vec<String> = plan
                .columns()
                .iter()
                .filter(|c| c.column.is_identity)
                .map(|c| c.column.name.clone())
                .collect();
            reset_sequences(self.client, self.target, &identity).await?;
        }
        Ok(affected)
    }

    async fn delete_by_keys(
        &self,
        keys: Vec<SqlValue>,
        options: &BulkOptions,
        batch_size: usize,
        staged: &mut Option<String>,
    ) -> Result<u64> {
        if keys.is_empty() {
            debug!("{}: empty key list, nothing to delete", self.target);
            return Ok(0);
        }

        let schema = read_table_schema(self.client, self.target).await?;
        let key = key_column(self.target, &schema, options.qualifiers.as_deref())?;
        let columns = vec![key.name.clone()];

        let pseudo = self.pseudo_table(options, &columns, staged).await?;
        let copy_sql = self.dialect.copy_in(&pseudo, &columns)?;
        let types = column_types(self.client, &self.dialect, &pseudo, &columns).await?;

        let mut keys = keys.into_iter().peekable();
        while keys.peek().is_some() {
            let rows: Vec<Vec<SqlValue>> = keys.by_ref().take(batch_size).map(|k| vec![k]).collect();
            self.copy_batch(&copy_sql, &types, &rows).await?;
        }

        let sql = self.dialect.delete_using(self.target, &pseudo, &columns)?;
        self.execute(&sql).await
    }

    /// Create the pseudo-table for `columns` of the target.
    async fn pseudo_table(
        &self,
        options: &BulkOptions,
        columns: &[String],
        staged: &mut Option<String>,
    ) -> Result<String> {
        let kind = self.defaults.pseudo_table(options);
        let suffix = Uuid::new_v4().simple().to_string();
        let name = pseudo_table_name(&self.table.name, &suffix[..8]);
        let pseudo = match kind {
            PseudoTableType::Temporary => quote_pg(&name)?,
            PseudoTableType::Physical => TableName {
                schema: self.table.schema.clone(),
                name,
            }
            .qualify_pg(&self.defaults.schema)?,
        };

        *staged = Some(pseudo.clone());
        let sql = self
            .dialect
            .create_pseudo_table(&pseudo, self.target, columns, kind)?;
        self.client.batch_execute(&sql).await?;
        debug!("Created {:?} pseudo-table {}", kind, pseudo);
        Ok(pseudo)
    }

    async fn drop_pseudo_table(&self, pseudo: &str) {
        if let Err(e) = self.client.batch_execute(&self.dialect.drop_table(pseudo)).await {
            warn!("Failed to drop pseudo-table {}: {}", pseudo, e);
        }
    }

    /// COPY every remaining input batch into `dest`.
    async fn copy_all(&self, dest: &str, plan: &ColumnPlan, input: &mut Input<'_, '_>) -> Result<u64> {
        let columns = plan.names();
        let copy_sql = self.dialect.copy_in(dest, &columns)?;
        let types = column_types(self.client, &self.dialect, dest, &columns).await?;

        let mut total = 0u64;
        let mut batch = std::mem::take(&mut input.first);
        while !batch.is_empty() {
            let rows = batch
                .into_iter()
                .map(|row| plan.project(self.target, row))
                .collect::<Result<Vec<_>>>()?;
            total += self.copy_batch(&copy_sql, &types, &rows).await?;
            debug!("{}: copied {} rows into {}", self.target, total, dest);
            batch = input.reader.next_batch(input.batch_size).await?;
        }
        Ok(total)
    }

    async fn copy_batch(&self, copy_sql: &str, types: &[Type], rows: &[Vec<SqlValue>]) -> Result<u64> {
        let sink = self.client.copy_in(copy_sql).await?;
        let writer = BinaryCopyInWriter::new(sink, types);
        pin_mut!(writer);

        for row in rows {
            let values: Vec<&(dyn ToSql + Sync)> =
                row.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
            writer.as_mut().write(&values).await?;
        }

        Ok(writer.finish().await?)
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        debug!("{}", sql);
        Ok(self.client.execute(sql, &[]).await?)
    }
}

/// Rows still to be written: the batch read up front, then the reader.
struct Input<'r, 'a> {
    first: Vec<Vec<SqlValue>>,
    reader: &'r mut RowReader<'a>,
    batch_size: usize,
}
