//! Dispatcher behaviour against an in-memory repository.
//!
//! The mock connection records every command it receives and every close, so
//! the tests can check table resolution, disposal and pass-through without a
//! database.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use bulkcopy::core::request::{BulkCommand, BulkSource};
use bulkcopy::{
    dispatch, dispatch_on, BlockingRepository, BulkConnection, BulkEntity, BulkError,
    BulkOperation, BulkOptions, BulkRepositoryExt, BulkRequest, ConnectionPersistency, DataTable,
    Repository, RowReader, SqlValue, TableMappings, Transaction,
};

#[derive(Debug, Clone)]
struct Call {
    connection: usize,
    operation: BulkOperation,
    table: Option<String>,
    rows: u64,
    timeout: Option<Duration>,
}

#[derive(Debug, Default)]
struct Log {
    created: usize,
    closed: Vec<usize>,
    calls: Vec<Call>,
    statements: Vec<&'static str>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    worker: bool,
    close: bool,
}

struct MockConnection {
    id: usize,
    log: Arc<Mutex<Log>>,
    faults: Faults,
}

#[async_trait]
impl BulkConnection for MockConnection {
    fn dialect(&self) -> &'static str {
        "mock"
    }

    async fn execute_bulk(
        &mut self,
        command: BulkCommand<'_>,
        cancel: &CancellationToken,
    ) -> bulkcopy::Result<u64> {
        if cancel.is_cancelled() {
            return Err(BulkError::Cancelled);
        }
        let table = command.table.clone().ok_or_else(|| BulkError::MissingTableName {
            operation: command.operation.to_string(),
        })?;
        if self.faults.worker {
            return Err(BulkError::operation(table, "duplicate key value"));
        }

        let rows = match command.source {
            BulkSource::Keys(keys) => keys.len() as u64,
            BulkSource::Rows(mut reader) => {
                let mut total = 0u64;
                loop {
                    let batch = reader.next_batch(2).await?;
                    if batch.is_empty() {
                        break;
                    }
                    total += batch.len() as u64;
                }
                total
            }
        };

        self.log.lock().unwrap().calls.push(Call {
            connection: self.id,
            operation: command.operation,
            table: Some(table),
            rows,
            timeout: command.timeout,
        });
        Ok(rows)
    }

    async fn begin(&mut self) -> bulkcopy::Result<()> {
        self.log.lock().unwrap().statements.push("begin");
        Ok(())
    }

    async fn commit(&mut self) -> bulkcopy::Result<()> {
        self.log.lock().unwrap().statements.push("commit");
        Ok(())
    }

    async fn rollback(&mut self) -> bulkcopy::Result<()> {
        self.log.lock().unwrap().statements.push("rollback");
        Ok(())
    }

    async fn close(self) -> bulkcopy::Result<()> {
        self.log.lock().unwrap().closed.push(self.id);
        if self.faults.close {
            return Err(BulkError::pool("socket reset", "closing mock connection"));
        }
        Ok(())
    }
}

struct MockRepository {
    persistency: ConnectionPersistency,
    timeout: Option<Duration>,
    mappings: TableMappings,
    faults: Faults,
    log: Arc<Mutex<Log>>,
}

impl MockRepository {
    fn new(persistency: ConnectionPersistency) -> Self {
        Self {
            persistency,
            timeout: None,
            mappings: TableMappings::new(),
            faults: Faults::default(),
            log: Arc::new(Mutex::new(Log::default())),
        }
    }

    fn failing(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    fn log(&self) -> std::sync::MutexGuard<'_, Log> {
        self.log.lock().unwrap()
    }
}

#[async_trait]
impl Repository for MockRepository {
    type Connection = MockConnection;

    async fn create_connection(&self) -> bulkcopy::Result<MockConnection> {
        let mut log = self.log.lock().unwrap();
        log.created += 1;
        Ok(MockConnection {
            id: log.created,
            log: Arc::clone(&self.log),
            faults: self.faults,
        })
    }

    fn persistency(&self) -> ConnectionPersistency {
        self.persistency
    }

    fn command_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn mappings(&self) -> &TableMappings {
        &self.mappings
    }
}

struct Invoice {
    id: i64,
}

impl BulkEntity for Invoice {
    fn columns() -> &'static [&'static str] {
        &["id"]
    }

    fn to_row(&self) -> Vec<SqlValue> {
        vec![self.id.into()]
    }
}

struct AuditEntry;

impl BulkEntity for AuditEntry {
    fn columns() -> &'static [&'static str] {
        &["id"]
    }

    fn to_row(&self) -> Vec<SqlValue> {
        vec![SqlValue::I32(0)]
    }

    fn table_name() -> Option<&'static str> {
        Some("audit_log")
    }
}

fn invoices(n: i64) -> Vec<Invoice> {
    (1..=n).map(|id| Invoice { id }).collect()
}

fn orders_table() -> DataTable {
    let mut table = DataTable::named("Orders", vec!["id".into(), "total".into()]);
    table.push_row(vec![SqlValue::I32(1), SqlValue::F64(9.5)]);
    table.push_row(vec![SqlValue::I32(2), SqlValue::F64(12.0)]);
    table.push_row(vec![SqlValue::I32(3), SqlValue::F64(3.25)]);
    table
}

#[tokio::test]
async fn test_per_call_connection_is_disposed_after_success() {
    let repo = MockRepository::new(ConnectionPersistency::PerCall);
    repo.mappings().register::<Invoice>("invoices");

    let inserted = repo.bulk_insert(&invoices(5), BulkOptions::new()).await.unwrap();

    assert_eq!(inserted, 5);
    let log = repo.log();
    assert_eq!(log.created, 1);
    assert_eq!(log.closed, vec![1]);
    assert_eq!(log.calls[0].table.as_deref(), Some("invoices"));
}

#[tokio::test]
async fn test_per_call_connection_is_disposed_after_failure() {
    let repo = MockRepository::new(ConnectionPersistency::PerCall).failing(Faults {
        worker: true,
        close: false,
    });

    let err = repo
        .bulk_merge_table(&orders_table(), BulkOptions::new())
        .await
        .unwrap_err();

    match err {
        BulkError::Operation { table, message } => {
            assert_eq!(table, "Orders");
            assert_eq!(message, "duplicate key value");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(repo.log().closed, vec![1]);
}

#[tokio::test]
async fn test_worker_error_wins_over_disposal_error() {
    let repo = MockRepository::new(ConnectionPersistency::PerCall).failing(Faults {
        worker: true,
        close: true,
    });

    let err = repo
        .bulk_update_table(&orders_table(), BulkOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BulkError::Operation { .. }));
}

#[tokio::test]
async fn test_disposal_error_surfaces_after_success() {
    let repo = MockRepository::new(ConnectionPersistency::PerCall).failing(Faults {
        worker: false,
        close: true,
    });

    let err = repo
        .bulk_insert_table(&orders_table(), BulkOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BulkError::Pool { .. }));
    assert_eq!(repo.log().calls.len(), 1);
}

#[tokio::test]
async fn test_instance_connection_is_never_disposed() {
    let repo = MockRepository::new(ConnectionPersistency::Instance);

    repo.bulk_insert_table(&orders_table(), BulkOptions::new()).await.unwrap();
    repo.bulk_delete_table(&orders_table(), BulkOptions::new()).await.unwrap();

    let log = repo.log();
    assert_eq!(log.calls.len(), 2);
    assert!(log.closed.is_empty());
}

#[tokio::test]
async fn test_transaction_connection_is_borrowed() {
    let repo = MockRepository::new(ConnectionPersistency::PerCall);
    let mut conn = repo.create_connection().await.unwrap();

    let mut tx = Transaction::begin(&mut conn).await.unwrap();
    let table = orders_table();
    repo.bulk(
        Some(&mut tx),
        BulkRequest::table(BulkOperation::Insert, &table, BulkOptions::new()),
    )
    .await
    .unwrap();
    repo.bulk(
        Some(&mut tx),
        BulkRequest::table(BulkOperation::Update, &table, BulkOptions::new()),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let log = repo.log();
    assert_eq!(log.created, 1);
    assert!(log.closed.is_empty());
    assert!(log.calls.iter().all(|c| c.connection == 1));
    assert_eq!(log.statements, vec!["begin", "commit"]);
}

#[tokio::test]
async fn test_instance_transaction_connection_is_borrowed() {
    let repo = MockRepository::new(ConnectionPersistency::Instance);
    let mut conn = repo.create_connection().await.unwrap();

    let mut tx = Transaction::begin(&mut conn).await.unwrap();
    let table = orders_table();
    let affected = repo
        .bulk(
            Some(&mut tx),
            BulkRequest::table(BulkOperation::Merge, &table, BulkOptions::new()),
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(affected, 3);
    let log = repo.log();
    assert_eq!(log.created, 1);
    assert!(log.closed.is_empty());
    assert_eq!(log.statements, vec!["begin", "commit"]);
}

#[tokio::test]
async fn test_failed_worker_leaves_transaction_connection_open() {
    for persistency in [ConnectionPersistency::PerCall, ConnectionPersistency::Instance] {
        let repo = MockRepository::new(persistency).failing(Faults {
            worker: true,
            close: true,
        });
        let mut conn = repo.create_connection().await.unwrap();

        let mut tx = Transaction::begin(&mut conn).await.unwrap();
        let table = orders_table();
        let err = repo
            .bulk(
                Some(&mut tx),
                BulkRequest::table(BulkOperation::Insert, &table, BulkOptions::new()),
            )
            .await
            .unwrap_err();
        tx.rollback().await.unwrap();

        match err {
            BulkError::Operation { table, message } => {
                assert_eq!(table, "Orders");
                assert_eq!(message, "duplicate key value");
            }
            other => panic!("unexpected error under {:?}: {:?}", persistency, other),
        }
        let log = repo.log();
        assert_eq!(log.created, 1, "{:?}", persistency);
        assert!(log.closed.is_empty(), "{:?}", persistency);
        assert_eq!(log.statements, vec!["begin", "rollback"]);
    }
}

#[tokio::test]
async fn test_explicit_table_name_wins() {
    let repo = MockRepository::new(ConnectionPersistency::PerCall);
    repo.mappings().register::<Invoice>("invoices");

    repo.bulk_update(&invoices(2), BulkOptions::new().table("invoices_archive"))
        .await
        .unwrap();
    repo.bulk_update_table(&orders_table(), BulkOptions::new().table("orders_2024"))
        .await
        .unwrap();

    let log = repo.log();
    assert_eq!(log.calls[0].table.as_deref(), Some("invoices_archive"));
    assert_eq!(log.calls[1].table.as_deref(), Some("orders_2024"));
}

#[tokio::test]
async fn test_data_table_name_is_used_without_explicit_name() {
    let repo = MockRepository::new(ConnectionPersistency::PerCall);

    let affected = repo
        .bulk_delete_table(&orders_table(), BulkOptions::new())
        .await
        .unwrap();

    assert_eq!(affected, 3);
    let log = repo.log();
    assert_eq!(log.calls[0].operation, BulkOperation::Delete);
    assert_eq!(log.calls[0].table.as_deref(), Some("Orders"));
}

#[tokio::test]
async fn test_declared_entity_table_is_registered_on_first_use() {
    let repo = MockRepository::new(ConnectionPersistency::PerCall);

    repo.bulk_insert(&[AuditEntry, AuditEntry], BulkOptions::new())
        .await
        .unwrap();

    assert_eq!(repo.log().calls[0].table.as_deref(), Some("audit_log"));
    assert!(repo.mappings().contains::<AuditEntry>());
}

#[tokio::test]
async fn test_missing_table_name_is_reported_and_connection_disposed() {
    let repo = MockRepository::new(ConnectionPersistency::PerCall);

    let err = repo
        .bulk_insert(&invoices(3), BulkOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BulkError::MissingTableName { ref operation } if operation == "insert"));
    assert_eq!(repo.log().closed, vec![1]);
}

#[tokio::test]
async fn test_cancellation_token_reaches_worker() {
    let repo = MockRepository::new(ConnectionPersistency::PerCall);
    let token = CancellationToken::new();
    token.cancel();

    let err = repo
        .bulk_merge_table(&orders_table(), BulkOptions::new().cancel_with(token))
        .await
        .unwrap_err();

    assert!(matches!(err, BulkError::Cancelled));
    assert!(repo.log().calls.is_empty());
    assert_eq!(repo.log().closed, vec![1]);
}

#[tokio::test]
async fn test_repository_timeout_applies_unless_call_sets_one() {
    let mut repo = MockRepository::new(ConnectionPersistency::PerCall);
    repo.timeout = Some(Duration::from_secs(300));

    repo.bulk_insert_table(&orders_table(), BulkOptions::new()).await.unwrap();
    repo.bulk_insert_table(
        &orders_table(),
        BulkOptions::new().timeout(Duration::from_secs(5)),
    )
    .await
    .unwrap();

    let log = repo.log();
    assert_eq!(log.calls[0].timeout, Some(Duration::from_secs(300)));
    assert_eq!(log.calls[1].timeout, Some(Duration::from_secs(5)));
}

#[tokio::test]
async fn test_delete_by_keys_resolves_entity_table() {
    let repo = MockRepository::new(ConnectionPersistency::PerCall);
    repo.mappings().register::<Invoice>("invoices");

    let deleted = repo
        .bulk_delete_by_keys::<Invoice>(
            vec![SqlValue::I64(4), SqlValue::I64(8), SqlValue::I64(15)],
            BulkOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(deleted, 3);
    let log = repo.log();
    assert_eq!(log.calls[0].operation, BulkOperation::DeleteByKey);
    assert_eq!(log.calls[0].table.as_deref(), Some("invoices"));
}

#[tokio::test]
async fn test_empty_sources_affect_zero_rows() {
    let repo = MockRepository::new(ConnectionPersistency::PerCall);
    repo.mappings().register::<Invoice>("invoices");
    let empty = DataTable::named("Orders", vec!["id".into()]);

    assert_eq!(repo.bulk_insert::<Invoice>(&[], BulkOptions::new()).await.unwrap(), 0);
    assert_eq!(repo.bulk_merge_table(&empty, BulkOptions::new()).await.unwrap(), 0);
    assert_eq!(
        repo.bulk_delete_reader(RowReader::empty(vec!["id".into()]), BulkOptions::new().table("t"))
            .await
            .unwrap(),
        0
    );
    assert_eq!(repo.log().closed, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_reader_source_streams_all_rows() {
    let repo = MockRepository::new(ConnectionPersistency::PerCall);
    let rows = (0..7).map(|i| vec![SqlValue::I32(i)]);
    let reader = RowReader::from_rows(vec!["id".into()], rows);

    let merged = repo
        .bulk_merge_reader(reader, BulkOptions::new().table("counters"))
        .await
        .unwrap();

    assert_eq!(merged, 7);
}

#[tokio::test]
async fn test_dispatch_on_keeps_caller_connection_open() {
    let repo = MockRepository::new(ConnectionPersistency::PerCall);
    let mut conn = repo.create_connection().await.unwrap();
    let table = orders_table();

    let affected = dispatch_on(
        &mut conn,
        repo.mappings(),
        BulkRequest::table(BulkOperation::Merge, &table, BulkOptions::new()),
    )
    .await
    .unwrap();

    assert_eq!(affected, 3);
    assert!(repo.log().closed.is_empty());
}

#[tokio::test]
async fn test_dispatch_without_transaction_matches_extension_methods() {
    let repo = MockRepository::new(ConnectionPersistency::PerCall);
    let table = orders_table();

    let affected = dispatch(
        &repo,
        None,
        BulkRequest::table(BulkOperation::Insert, &table, BulkOptions::new()),
    )
    .await
    .unwrap();

    assert_eq!(affected, 3);
    assert_eq!(repo.log().closed, vec![1]);
}

#[test]
fn test_blocking_calls_match_async_results() {
    let repo = MockRepository::new(ConnectionPersistency::PerCall);
    repo.mappings().register::<Invoice>("invoices");
    let log = Arc::clone(&repo.log);
    let blocking = BlockingRepository::new(repo).unwrap();

    assert_eq!(blocking.bulk_insert(&invoices(4), BulkOptions::new()).unwrap(), 4);
    assert_eq!(blocking.bulk_update_table(&orders_table(), BulkOptions::new()).unwrap(), 3);
    assert!(matches!(
        blocking.bulk_delete_table(&DataTable::new(vec!["id".into()]), BulkOptions::new()),
        Err(BulkError::MissingTableName { .. })
    ));

    let log = log.lock().unwrap();
    assert_eq!(log.created, 3);
    assert_eq!(log.closed, vec![1, 2, 3]);
    assert_eq!(log.calls[1].table.as_deref(), Some("Orders"));
}

fn outcome(result: bulkcopy::Result<u64>) -> String {
    match result {
        Ok(rows) => format!("ok {}", rows),
        Err(e) => format!("err {}", e),
    }
}

fn recorded(log: &Log) -> (usize, Vec<usize>, Vec<(BulkOperation, Option<String>, u64)>) {
    let calls = log
        .calls
        .iter()
        .map(|c| (c.operation, c.table.clone(), c.rows))
        .collect();
    (log.created, log.closed.clone(), calls)
}

#[test]
fn test_blocking_and_async_paths_agree_on_the_same_input() {
    let table = orders_table();
    let unnamed = DataTable::new(vec!["id".into()]);
    let keys = || vec![SqlValue::I64(4), SqlValue::I64(8)];

    let async_repo = MockRepository::new(ConnectionPersistency::PerCall);
    async_repo.mappings().register::<Invoice>("invoices");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let async_results: Vec<String> = runtime.block_on(async {
        vec![
            outcome(async_repo.bulk_insert(&invoices(3), BulkOptions::new()).await),
            outcome(async_repo.bulk_merge_table(&table, BulkOptions::new()).await),
            outcome(async_repo.bulk_delete_table(&unnamed, BulkOptions::new()).await),
            outcome(
                async_repo
                    .bulk_delete_by_keys::<Invoice>(keys(), BulkOptions::new())
                    .await,
            ),
        ]
    });
    drop(runtime);

    let sync_repo = MockRepository::new(ConnectionPersistency::PerCall);
    sync_repo.mappings().register::<Invoice>("invoices");
    let sync_log = Arc::clone(&sync_repo.log);
    let blocking = BlockingRepository::new(sync_repo).unwrap();
    let sync_results = vec![
        outcome(blocking.bulk_insert(&invoices(3), BulkOptions::new())),
        outcome(blocking.bulk_merge_table(&table, BulkOptions::new())),
        outcome(blocking.bulk_delete_table(&unnamed, BulkOptions::new())),
        outcome(blocking.bulk_delete_by_keys::<Invoice>(keys(), BulkOptions::new())),
    ];

    assert_eq!(async_results, sync_results);
    assert_eq!(async_results[0], "ok 3");
    assert!(async_results[2].starts_with("err "));
    assert_eq!(
        recorded(&async_repo.log()),
        recorded(&sync_log.lock().unwrap())
    );
}
