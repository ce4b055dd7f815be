//! Connection-scoped operation dispatcher.
//!
//! Every bulk call goes through [`dispatch`]: pick the working connection,
//! resolve the table name, hand the command to the connection's worker and
//! dispose the connection when this call owns it and the repository policy
//! is per-call. Worker results and errors are returned unchanged.

use tracing::{debug, warn};

use crate::core::mapping::TableMappings;
use crate::core::request::BulkRequest;
use crate::core::traits::{BulkConnection, ConnectionPersistency, Repository};
use crate::error::Result;
use crate::transaction::Transaction;

/// A connection together with who owns it.
pub enum ConnectionLease<'t, C> {
    /// Created by the dispatcher for this call.
    Owned(C),
    /// Supplied by the caller (through a transaction or directly).
    Borrowed(&'t mut C),
}

impl<'t, C: BulkConnection> ConnectionLease<'t, C> {
    pub fn connection(&mut self) -> &mut C {
        match self {
            ConnectionLease::Owned(conn) => conn,
            ConnectionLease::Borrowed(conn) => conn,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, ConnectionLease::Owned(_))
    }

    /// End the lease: dispose an owned connection under the per-call policy.
    ///
    /// Runs whatever the worker returned; a worker error always wins over a
    /// disposal error.
    pub async fn release(self, persistency: ConnectionPersistency, outcome: Result<u64>) -> Result<u64> {
        match (self, persistency) {
            (ConnectionLease::Owned(conn), ConnectionPersistency::PerCall) => {
                debug!("Disposing per-call {} connection", conn.dialect());
                match (conn.close().await, outcome) {
                    (Ok(()), outcome) => outcome,
                    (Err(close_err), Ok(_)) => Err(close_err),
                    (Err(close_err), Err(worker_err)) => {
                        warn!("Failed to dispose connection after error: {}", close_err);
                        Err(worker_err)
                    }
                }
            }
            (ConnectionLease::Owned(conn), ConnectionPersistency::Instance) => {
                debug!("Keeping instance {} connection open", conn.dialect());
                drop(conn);
                outcome
            }
            (ConnectionLease::Borrowed(_), _) => outcome,
        }
    }
}

/// Table name precedence: explicit name, then the `DataTable` name, then the
/// registry entry for the entity type.
pub fn resolve_table_name(request: &BulkRequest<'_>, mappings: &TableMappings) -> Option<String> {
    if let Some(name) = &request.options.table_name {
        return Some(name.clone());
    }
    if let Some(name) = request.source.table_name() {
        return Some(name.to_string());
    }
    request.entity.and_then(|entity| mappings.get(entity))
}

/// Run one bulk operation through `repository`.
///
/// With a transaction, its connection is used and never disposed. Without
/// one, a connection is created and disposed afterwards when the repository's
/// policy is [`ConnectionPersistency::PerCall`], on success and failure alike.
pub async fn dispatch<R: Repository>(
    repository: &R,
    transaction: Option<&mut Transaction<'_, R::Connection>>,
    request: BulkRequest<'_>,
) -> Result<u64> {
    let mut lease = match transaction {
        Some(tx) => ConnectionLease::Borrowed(tx.connection()),
        None => ConnectionLease::Owned(repository.create_connection().await?),
    };

    let table = resolve_table_name(&request, repository.mappings());
    debug!(
        "Dispatching bulk {} to {} ({} connection)",
        request.operation,
        table.as_deref().unwrap_or("<unresolved>"),
        if lease.is_owned() { "owned" } else { "borrowed" }
    );

    let cancel = request.options.cancel.clone();
    let command = request.into_command(table, repository.command_timeout());
    let outcome = lease.connection().execute_bulk(command, &cancel).await;

    lease.release(repository.persistency(), outcome).await
}

/// Run one bulk operation on a caller-owned connection.
///
/// The connection is borrowed and stays open.
pub async fn dispatch_on<C: BulkConnection>(
    connection: &mut C,
    mappings: &TableMappings,
    request: BulkRequest<'_>,
) -> Result<u64> {
    let table = resolve_table_name(&request, mappings);
    debug!(
        "Dispatching bulk {} to {} (borrowed connection)",
        request.operation,
        table.as_deref().unwrap_or("<unresolved>")
    );

    let cancel = request.options.cancel.clone();
    let command = request.into_command(table, None);
    connection.execute_bulk(command, &cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::options::BulkOptions;
    use crate::core::request::BulkOperation;
    use crate::core::rows::{BulkEntity, DataTable};
    use crate::core::value::SqlValue;

    struct Invoice;

    impl BulkEntity for Invoice {
        fn columns() -> &'static [&'static str] {
            &["id"]
        }
        fn to_row(&self) -> Vec<SqlValue> {
            vec![SqlValue::I32(1)]
        }
    }

    #[test]
    fn test_resolve_from_registry() {
        let mappings = TableMappings::new();
        mappings.register::<Invoice>("Foo");
        let rows = [Invoice];
        let request = BulkRequest::entities(BulkOperation::Insert, &rows, BulkOptions::new());
        assert_eq!(resolve_table_name(&request, &mappings).as_deref(), Some("Foo"));
    }

    #[test]
    fn test_explicit_name_beats_registry() {
        let mappings = TableMappings::new();
        mappings.register::<Invoice>("Foo");
        let rows = [Invoice];
        let request =
            BulkRequest::entities(BulkOperation::Merge, &rows, BulkOptions::new().table("Bar"));
        assert_eq!(resolve_table_name(&request, &mappings).as_deref(), Some("Bar"));
    }

    #[test]
    fn test_data_table_name_and_explicit_override() {
        let mappings = TableMappings::new();
        let table = DataTable::named("Orders", vec!["id".into()]);

        let request = BulkRequest::table(BulkOperation::Update, &table, BulkOptions::new());
        assert_eq!(resolve_table_name(&request, &mappings).as_deref(), Some("Orders"));

        let request =
            BulkRequest::table(BulkOperation::Update, &table, BulkOptions::new().table("Archive"));
        assert_eq!(resolve_table_name(&request, &mappings).as_deref(), Some("Archive"));
    }

    #[test]
    fn test_unresolvable_name_is_none() {
        let mappings = TableMappings::new();
        let table = DataTable::new(vec!["id".into()]);
        let request = BulkRequest::table(BulkOperation::Delete, &table, BulkOptions::new());
        assert_eq!(resolve_table_name(&request, &mappings), None);
    }
}
