//! SQL Server repository and bulk worker.
//!
//! Inserts go straight into the target through TDS bulk load when the input
//! covers exactly the columns bulk load writes. Everything else is loaded
//! into a pseudo-table and applied with one set-based statement, retried on
//! deadlock outside caller transactions.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use tiberius::{AuthMethod, Client, Config as TiberiusConfig, TokenRow};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, DatabaseConfig};
use crate::core::columns::{key_column, resolve_qualifiers, ColumnPlan};
use crate::core::identifier::{pseudo_table_name, quote_mssql, TableName};
use crate::core::mapping::TableMappings;
use crate::core::options::{BulkOptions, IdentityBehavior, MergeCommandType, PseudoTableType};
use crate::core::request::{BulkCommand, BulkOperation, BulkSource};
use crate::core::rows::RowReader;
use crate::core::traits::{BulkConnection, ConnectionPersistency, Repository};
use crate::core::value::SqlValue;
use crate::drivers::common::{run_guarded, SslMode, WorkerDefaults};
use crate::drivers::mssql::dialect::MssqlDialect;
use crate::drivers::mssql::encode::encode_value;
use crate::drivers::mssql::schema::{bulk_loadable, read_table_shape, TableShape};
use crate::drivers::HealthReport;
use crate::error::{BulkError, Result};

/// Maximum deadlock retries for set-based statements.
const DEADLOCK_MAX_RETRIES: u32 = 5;

/// Base delay between deadlock retries, multiplied by the attempt number.
const DEADLOCK_RETRY_DELAY_MS: u64 = 200;

const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(1800);
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub type MssqlClient = Client<Compat<TcpStream>>;

/// A tiberius client plus whether it may go back to the pool.
pub struct MssqlSession {
    client: MssqlClient,
    broken: bool,
}

impl MssqlSession {
    fn new(client: MssqlClient) -> Self {
        Self {
            client,
            broken: false,
        }
    }

    /// Set once a statement was abandoned mid-stream or the socket failed.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for MssqlSession {
    type Target = MssqlClient;

    fn deref(&self) -> &MssqlClient {
        &self.client
    }
}

impl DerefMut for MssqlSession {
    fn deref_mut(&mut self) -> &mut MssqlClient {
        &mut self.client
    }
}

/// Whether `err` leaves the TDS stream in an unknown state.
///
/// A dropped bulk load or query stops mid-packet, so the session cannot be
/// reused for cleanup or handed back to the pool.
fn leaves_session_unusable(err: &BulkError) -> bool {
    err.is_abandoned() || matches!(err, BulkError::Mssql(tiberius::error::Error::Io { .. }))
}

/// bb8 manager for tiberius connections.
#[derive(Debug, Clone)]
pub struct TiberiusConnectionManager {
    config: DatabaseConfig,
    ssl_mode: SslMode,
}

impl TiberiusConnectionManager {
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        let ssl_mode = SslMode::parse(&config.ssl_mode)?;
        Ok(Self { config, ssl_mode })
    }

    fn build_config(&self) -> TiberiusConfig {
        let mut config = TiberiusConfig::new();
        config.host(&self.config.host);
        config.port(self.config.port());
        config.database(&self.config.database);
        config.application_name("bulkcopy");
        config.authentication(AuthMethod::sql_server(&self.config.user, &self.config.password));

        config.encryption(self.ssl_mode.encryption_level());
        if self.ssl_mode.requires_tls() && !self.ssl_mode.verifies_certificate() {
            config.trust_cert();
        }
        config
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = MssqlSession;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;
        tcp.set_nodelay(true).ok();

        let socket = socket2::SockRef::from(&tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on SQL Server connection: {}", e);
        }

        let client = Client::connect(config, tcp.compat_write()).await?;
        Ok(MssqlSession::new(client))
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.client.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.broken
    }
}

type Pooled = PooledConnection<'static, TiberiusConnectionManager>;

/// SQL Server connection source backed by a bb8 pool.
pub struct MssqlRepository {
    pool: Pool<TiberiusConnectionManager>,
    defaults: Arc<WorkerDefaults>,
    persistency: ConnectionPersistency,
    command_timeout: Duration,
    mappings: Arc<TableMappings>,
    instance: Arc<Mutex<Option<Pooled>>>,
    target: String,
}

impl MssqlRepository {
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::with_mappings(config, Arc::new(TableMappings::new())).await
    }

    pub async fn with_mappings(config: &Config, mappings: Arc<TableMappings>) -> Result<Self> {
        let manager = TiberiusConnectionManager::new(config.database.clone())?;
        let max_size = u32::try_from(config.bulk.pool_size).unwrap_or(u32::MAX);
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(1))
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .max_lifetime(Some(POOL_MAX_LIFETIME))
            .test_on_check_out(true)
            .build(manager)
            .await
            .map_err(|e| BulkError::pool(e, "creating SQL Server pool"))?;

        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| BulkError::pool(e, "testing SQL Server connection"))?;
            conn.simple_query("SELECT 1").await?.into_results().await?;
        }

        let target = config.database.display_target();
        info!(
            "Connected to SQL Server: {} (persistency={:?}, pool_size={})",
            target, config.bulk.persistency, max_size
        );

        Ok(Self {
            pool,
            defaults: Arc::new(WorkerDefaults::from_config(config)),
            persistency: config.bulk.persistency,
            command_timeout: config.bulk.command_timeout(),
            mappings,
            instance: Arc::new(Mutex::new(None)),
            target,
        })
    }

    pub fn mappings_handle(&self) -> Arc<TableMappings> {
        Arc::clone(&self.mappings)
    }

    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let outcome = async {
            let mut conn = self
                .pool
                .get()
                .await
                .map_err(|e| BulkError::pool(e, "health check"))?;
            let row = conn.simple_query("SELECT @@VERSION").await?.into_row().await?;
            let version = row
                .as_ref()
                .and_then(|r| r.get::<&str, _>(0))
                .unwrap_or_default()
                .lines()
                .next()
                .unwrap_or_default()
                .trim()
                .to_string();
            Ok::<String, BulkError>(version)
        }
        .await;
        HealthReport::new("mssql", &self.target, started, outcome)
    }

    async fn pooled(&self) -> Result<Pooled> {
        self.pool
            .get_owned()
            .await
            .map_err(|e| BulkError::pool(e, "acquiring SQL Server connection"))
    }
}

#[async_trait]
impl Repository for MssqlRepository {
    type Connection = MssqlConnection;

    /// Under the instance policy, concurrent calls wait for the kept connection,
    /// so a task holding it must not start another call without a transaction.
    async fn create_connection(&self) -> Result<MssqlConnection> {
        let handle = match self.persistency {
            ConnectionPersistency::PerCall => MssqlHandle::Pooled(self.pooled().await?),
            ConnectionPersistency::Instance => {
                let mut slot = Arc::clone(&self.instance).lock_owned().await;
                if slot.as_ref().map_or(true, |conn| conn.is_broken()) {
                    if slot.is_some() {
                        warn!("Instance SQL Server connection was discarded, reconnecting");
                    }
                    *slot = Some(self.pooled().await?);
                }
                let guard = OwnedMutexGuard::try_map(slot, |slot| slot.as_mut()).map_err(|_| {
                    BulkError::pool("instance slot is empty", "acquiring SQL Server connection")
                })?;
                MssqlHandle::Instance(guard)
            }
        };

        Ok(MssqlConnection {
            handle,
            defaults: Arc::clone(&self.defaults),
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

enum MssqlHandle {
    Pooled(Pooled),
    Instance(OwnedMappedMutexGuard<Option<Pooled>, Pooled>),
}

impl MssqlHandle {
    fn session(&mut self) -> &mut MssqlSession {
        match self {
            MssqlHandle::Pooled(conn) => conn,
            MssqlHandle::Instance(guard) => guard,
        }
    }
}

/// A pooled SQL Server connection.
pub struct MssqlConnection {
    handle: MssqlHandle,
    defaults: Arc<WorkerDefaults>,
    in_transaction: bool,
}

impl MssqlConnection {
    pub fn client(&mut self) -> &mut MssqlClient {
        &mut self.handle.session().client
    }

    fn ensure_usable(&mut self) -> Result<()> {
        if self.handle.session().is_broken() {
            return Err(BulkError::pool(
                "connection was discarded after an abandoned statement",
                "SQL Server session",
            ));
        }
        Ok(())
    }

    async fn batch(&mut self, sql: &str) -> Result<()> {
        self.ensure_usable()?;
        let result: Result<()> = async {
            self.client().simple_query(sql).await?.into_results().await?;
            Ok(())
        }
        .await;
        if result.as_ref().is_err_and(leaves_session_unusable) {
            self.handle.session().mark_broken();
        }
        result
    }
}

#[async_trait]
impl BulkConnection for MssqlConnection {
    fn dialect(&self) -> &'static str {
        "mssql"
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
        let target = table.qualify_mssql(&self.defaults.schema)?;
        let timeout = command.timeout;
        let started = Instant::now();
        self.ensure_usable()?;

        let mut worker = MssqlWorker {
            client: &mut self.handle.session().client,
            defaults: &self.defaults,
            table: &table,
            target: &target,
            dialect: MssqlDialect::new(),
            retry_deadlocks: !self.in_transaction,
        };

        let mut staged: Option<String> = None;
        let result = run_guarded(&target, timeout, cancel, worker.run(command, &mut staged)).await;

        let unusable = result.as_ref().is_err_and(leaves_session_unusable);
        match staged {
            Some(pseudo) if unusable => {
                warn!("Pseudo-table {} left in place, connection is being discarded", pseudo)
            }
            Some(pseudo) => worker.drop_pseudo_table(&pseudo).await,
            None => {}
        }
        if unusable {
            warn!("Discarding SQL Server connection after bulk {} on {}", operation, target);
            self.handle.session().mark_broken();
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
        self.batch("BEGIN TRANSACTION").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.batch("COMMIT TRANSACTION").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.batch("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await?;
        self.in_transaction = false;
        Ok(())
    }

    /// Return the connection to the pool.
    /// A discarded connection is dropped instead, and the server rolls back
    /// any open transaction when the session ends.
    async fn close(mut self) -> Result<()> {
        if self.in_transaction && !self.handle.session().is_broken() {
            warn!("Closing SQL Server connection with an open transaction, rolling back");
            self.rollback().await?;
        }
        drop(self.handle);
        Ok(())
    }
}

struct MssqlWorker<'c> {
    client: &'c mut MssqlClient,
    defaults: &'c WorkerDefaults,
    table: &'c TableName,
    target: &'c str,
    dialect: MssqlDialect,
    retry_deadlocks: bool,
}

impl MssqlWorker<'_> {
    async fn run(&mut self, command: BulkCommand<'_>, staged: &mut Option<String>) -> Result<u64> {
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

        let shape = read_table_shape(self.client, self.target).await?;
        let plan = ColumnPlan::build(
            self.target,
            reader.columns(),
            &shape.schema,
            options.mappings.as_deref(),
        )?;
        let mut input = Input {
            first,
            reader: &mut reader,
            batch_size,
        };

        if operation == BulkOperation::DeleteByKey {
            return Err(BulkError::Config(
                "delete-by-key takes a key list, not rows".to_string(),
            ));
        }
        if operation == BulkOperation::Insert {
            return self.insert(&shape, &plan, &mut input, &options, staged).await;
        }

        let qualifiers = resolve_qualifiers(
            self.target,
            &shape.schema,
            &plan,
            options.qualifiers.as_deref(),
        )?;
        let pseudo = self
            .pseudo_table(&options, &shape.definitions(&plan.names())?, staged)
            .await?;
        let staged_rows = self.bulk_load(&pseudo, &plan, &mut input).await?;
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
                    .update_join(self.target, &pseudo, &set_columns, &qualifiers)?;
                self.execute(&sql).await
            }
            BulkOperation::Delete => {
                let sql = self.dialect.delete_join(self.target, &pseudo, &qualifiers)?;
                self.execute(&sql).await
            }
            _ => self.merge(&pseudo, &plan, &qualifiers, &options).await,
        }
    }

    async fn insert(
        &mut self,
        shape: &TableShape,
        plan: &ColumnPlan,
        input: &mut Input<'_, '_>,
        options: &BulkOptions,
        staged: &mut Option<String>,
    ) -> Result<u64> {
        let keep_identity = options.identity == IdentityBehavior::KeepIdentity;
        let plan = if keep_identity {
            plan.clone()
        } else {
            plan.without_identity(self.target)?
        };

        // Bulk load writes every updatable column in table order.
        let loadable: Vec<&str> = shape
            .schema
            .writable_columns()
            .filter(|c| !c.is_identity)
            .map(|c| c.name.as_str())
            .collect();
        let direct = !keep_identity
            && plan.columns().len() == loadable.len()
            && plan
                .columns()
                .iter()
                .zip(&loadable)
                .all(|(planned, name)| planned.column.name == *name && bulk_loadable(&planned.column));

        if direct {
            return self.bulk_load(self.target, &plan, input).await;
        }

        debug!("{}: inserting through a pseudo-table", self.target);
        let columns = plan.names();
        let pseudo = self
            .pseudo_table(options, &shape.definitions(&columns)?, staged)
            .await?;
        self.bulk_load(&pseudo, &plan, input).await?;

        let sql = self.dialect.insert_select(self.target, &pseudo, &columns)?;
        if keep_identity && plan.has_identity() {
            let sql = self.dialect.with_identity_insert(self.target, &sql);
            self.execute(&sql).await
        } else {
            self.execute(&sql).await
        }
    }

    async fn merge(
        &mut self,
        pseudo: &str,
        plan: &ColumnPlan,
        qualifiers: &[String],
        options: &BulkOptions,
    ) -> Result<u64> {
        let insert_columns = plan.insert_columns(options.identity);
        let update_columns = plan.update_columns(qualifiers);
        let identity_insert =
            options.identity == IdentityBehavior::KeepIdentity && plan.has_identity();

        let (dialect, target) = (self.dialect, self.target);
        let wrap = move |sql: String| {
            if identity_insert {
                dialect.with_identity_insert(target, &sql)
            } else {
                sql
            }
        };

        match options.merge_command {
            MergeCommandType::Default | MergeCommandType::OnConflictDoUpdate => {
                let sql = self.dialect.merge(
                    self.target,
                    pseudo,
                    &insert_columns,
                    qualifiers,
                    &update_columns,
                )?;
                let sql = wrap(sql);
                self.execute(&sql).await
            }
            MergeCommandType::InsertAndUpdate => {
                let updated = if update_columns.is_empty() {
                    0
                } else {
                    let sql = self
                        .dialect
                        .update_join(self.target, pseudo, &update_columns, qualifiers)?;
                    self.execute(&sql).await?
                };
                let sql = self
                    .dialect
                    .insert_missing(self.target, pseudo, &insert_columns, qualifiers)?;
                let sql = wrap(sql);
                Ok(updated + self.execute(&sql).await?)
            }
        }
    }

    async fn delete_by_keys(
        &mut self,
        keys: Vec<SqlValue>,
        options: &BulkOptions,
        batch_size: usize,
        staged: &mut Option<String>,
    ) -> Result<u64> {
        if keys.is_empty() {
            debug!("{}: empty key list, nothing to delete", self.target);
            return Ok(0);
        }

        let shape = read_table_shape(self.client, self.target).await?;
        let key = key_column(self.target, &shape.schema, options.qualifiers.as_deref())?;
        let columns = vec![key.name.clone()];
        let pseudo = self
            .pseudo_table(options, &shape.definitions(&columns)?, staged)
            .await?;

        let mut keys = keys.into_iter().peekable();
        while keys.peek().is_some() {
            let mut load = self.client.bulk_insert(&pseudo).await?;
            for value in keys.by_ref().take(batch_size) {
                let mut row = TokenRow::new();
                row.push(encode_value(self.target, &key, &value)?);
                load.send(row).await?;
            }
            load.finalize().await?;
        }

        let sql = self.dialect.delete_join(self.target, &pseudo, &columns)?;
        self.execute(&sql).await
    }

    /// Create a pseudo-table with `definitions`.
    ///
    /// DDL runs as a plain batch so a `#temp` table outlives the statement.
    async fn pseudo_table(
        &mut self,
        options: &BulkOptions,
        definitions: &[(String, String)],
        staged: &mut Option<String>,
    ) -> Result<String> {
        let kind = self.defaults.pseudo_table(options);
        let suffix = Uuid::new_v4().simple().to_string();
        let name = pseudo_table_name(&self.table.name, &suffix[..8]);
        let pseudo = match kind {
            PseudoTableType::Temporary => quote_mssql(&format!("#{}", name))?,
            PseudoTableType::Physical => TableName {
                schema: self.table.schema.clone(),
                name,
            }
            .qualify_mssql(&self.defaults.schema)?,
        };

        *staged = Some(pseudo.clone());
        let sql = self.dialect.create_pseudo_table(&pseudo, definitions)?;
        self.client.simple_query(sql).await?.into_results().await?;
        debug!("Created {:?} pseudo-table {}", kind, pseudo);
        Ok(pseudo)
    }

    async fn drop_pseudo_table(&mut self, pseudo: &str) {
        let sql = self.dialect.drop_table(pseudo);
        let dropped = match self.client.simple_query(sql).await {
            Ok(stream) => stream.into_results().await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = dropped {
            warn!("Failed to drop pseudo-table {}: {}", pseudo, e);
        }
    }

    /// Bulk load every remaining input batch into `dest`, one load per batch.
    async fn bulk_load(&mut self, dest: &str, plan: &ColumnPlan, input: &mut Input<'_, '_>) -> Result<u64> {
        let mut total = 0u64;
        let mut batch = std::mem::take(&mut input.first);
        while !batch.is_empty() {
            let mut load = self.client.bulk_insert(dest).await?;
            for row in batch {
                let values = plan.project(self.target, row)?;
                let mut token_row = TokenRow::new();
                for (planned, value) in plan.columns().iter().zip(&values) {
                    token_row.push(encode_value(self.target, &planned.column, value)?);
                }
                load.send(token_row).await?;
            }
            total += load.finalize().await?.total();
            debug!("{}: bulk loaded {} rows into {}", self.target, total, dest);
            batch = input.reader.next_batch(input.batch_size).await?;
        }
        Ok(total)
    }

    /// Run a set-based statement, retrying deadlock victims.
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        debug!("{}", sql);
        let mut retries = 0;
        loop {
            match self.client.execute(sql, &[]).await {
                Ok(result) => return Ok(result.total()),
                Err(e) if e.is_deadlock() && self.retry_deadlocks && retries < DEADLOCK_MAX_RETRIES => {
                    retries += 1;
                    warn!(
                        "Deadlock detected on {}, retry {}/{}",
                        self.target, retries, DEADLOCK_MAX_RETRIES
                    );
                    tokio::time::sleep(Duration::from_millis(
                        DEADLOCK_RETRY_DELAY_MS * u64::from(retries),
                    ))
                    .await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

struct Input<'r, 'a> {
    first: Vec<Vec<SqlValue>>,
    reader: &'r mut RowReader<'a>,
    batch_size: usize,
}
