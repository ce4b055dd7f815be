//! Typed convenience wrappers over [`dispatch`].
//!
//! Each wrapper only normalises its input into a [`BulkRequest`]; table
//! resolution, connection handling and disposal all happen in the dispatcher.

use async_trait::async_trait;

use crate::core::options::BulkOptions;
use crate::core::request::{BulkOperation, BulkRequest};
use crate::core::rows::{BulkEntity, DataTable, RowReader};
use crate::core::traits::Repository;
use crate::core::value::SqlValue;
use crate::dispatch::dispatch;
use crate::error::Result;
use crate::transaction::Transaction;

/// Bulk operations available on every [`Repository`].
#[async_trait]
pub trait BulkRepositoryExt: Repository {
    /// Run a prepared request, optionally inside a caller transaction.
    async fn bulk(
        &self,
        transaction: Option<&mut Transaction<'_, Self::Connection>>,
        request: BulkRequest<'_>,
    ) -> Result<u64>
    where
        Self: Sized,
    {
        dispatch(self, transaction, request).await
    }

    async fn bulk_insert<T: BulkEntity>(&self, entities: &[T], options: BulkOptions) -> Result<u64>
    where
        Self: Sized,
    {
        entity_op(self, BulkOperation::Insert, entities, options).await
    }

    async fn bulk_insert_table(&self, table: &DataTable, options: BulkOptions) -> Result<u64>
    where
        Self: Sized,
    {
        dispatch(self, None, BulkRequest::table(BulkOperation::Insert, table, options)).await
    }

    async fn bulk_insert_reader(&self, reader: RowReader<'_>, options: BulkOptions) -> Result<u64>
    where
        Self: Sized,
    {
        dispatch(self, None, BulkRequest::reader(BulkOperation::Insert, reader, options)).await
    }

    async fn bulk_update<T: BulkEntity>(&self, entities: &[T], options: BulkOptions) -> Result<u64>
    where
        Self: Sized,
    {
        entity_op(self, BulkOperation::Update, entities, options).await
    }

    async fn bulk_update_table(&self, table: &DataTable, options: BulkOptions) -> Result<u64>
    where
        Self: Sized,
    {
        dispatch(self, None, BulkRequest::table(BulkOperation::Update, table, options)).await
    }

    async fn bulk_update_reader(&self, reader: RowReader<'_>, options: BulkOptions) -> Result<u64>
    where
        Self: Sized,
    {
        dispatch(self, None, BulkRequest::reader(BulkOperation::Update, reader, options)).await
    }

    async fn bulk_delete<T: BulkEntity>(&self, entities: &[T], options: BulkOptions) -> Result<u64>
    where
        Self: Sized,
    {
        entity_op(self, BulkOperation::Delete, entities, options).await
    }

    async fn bulk_delete_table(&self, table: &DataTable, options: BulkOptions) -> Result<u64>
    where
        Self: Sized,
    {
        dispatch(self, None, BulkRequest::table(BulkOperation::Delete, table, options)).await
    }

    async fn bulk_delete_reader(&self, reader: RowReader<'_>, options: BulkOptions) -> Result<u64>
    where
        Self: Sized,
    {
        dispatch(self, None, BulkRequest::reader(BulkOperation::Delete, reader, options)).await
    }

    async fn bulk_merge<T: BulkEntity>(&self, entities: &[T], options: BulkOptions) -> Result<u64>
    where
        Self: Sized,
    {
        entity_op(self, BulkOperation::Merge, entities, options).await
    }

    async fn bulk_merge_table(&self, table: &DataTable, options: BulkOptions) -> Result<u64>
    where
        Self: Sized,
    {
        dispatch(self, None, BulkRequest::table(BulkOperation::Merge, table, options)).await
    }

    async fn bulk_merge_reader(&self, reader: RowReader<'_>, options: BulkOptions) -> Result<u64>
    where
        Self: Sized,
    {
        dispatch(self, None, BulkRequest::reader(BulkOperation::Merge, reader, options)).await
    }

    /// Delete rows of `T`'s table whose primary key is in `keys`.
    async fn bulk_delete_by_keys<T: BulkEntity>(
        &self,
        keys: Vec<SqlValue>,
        options: BulkOptions,
    ) -> Result<u64>
    where
        Self: Sized,
    {
        dispatch(
            self,
            None,
            BulkRequest::delete_by_keys(keys, options).with_entity::<T>(),
        )
        .await
    }
}

impl<R: Repository> BulkRepositoryExt for R {}

async fn entity_op<R: Repository, T: BulkEntity>(
    repository: &R,
    operation: BulkOperation,
    entities: &[T],
    options: BulkOptions,
) -> Result<u64> {
    dispatch(repository, None, BulkRequest::entities(operation, entities, options)).await
}
