//! Synchronous API.
//!
//! [`BlockingRepository`] wraps any [`Repository`] with a current-thread
//! tokio runtime and runs the async operations to completion. Table
//! resolution, disposal and row counts are those of the async path.
//!
//! Do not call these methods from inside an async runtime; tokio panics when
//! `block_on` is nested.

use std::future::Future;

use crate::core::options::BulkOptions;
use crate::core::request::BulkRequest;
use crate::core::rows::{BulkEntity, DataTable, RowReader};
use crate::core::traits::Repository;
use crate::core::value::SqlValue;
use crate::error::Result;
use crate::ops::BulkRepositoryExt;
use crate::transaction::Transaction;

/// Blocking front for a repository.
pub struct BlockingRepository<R> {
    inner: R,
    runtime: tokio::runtime::Runtime,
}

impl<R: Repository> BlockingRepository<R> {
    /// Wrap an existing repository.
    ///
    /// Pools created on another runtime keep their tasks there; build the
    /// repository with [`BlockingRepository::build`] instead when that runtime
    /// is not running.
    pub fn new(inner: R) -> Result<Self> {
        Ok(Self {
            inner,
            runtime: current_thread_runtime()?,
        })
    }

    /// Construct the repository on this wrapper's own runtime.
    pub fn build<F, Fut>(make: F) -> Result<Self>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let runtime = current_thread_runtime()?;
        let inner = runtime.block_on(make())?;
        Ok(Self { inner, runtime })
    }

    /// The wrapped async repository.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Run any future on this wrapper's runtime (transactions, health checks).
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn bulk(
        &self,
        transaction: Option<&mut Transaction<'_, R::Connection>>,
        request: BulkRequest<'_>,
    ) -> Result<u64> {
        self.block_on(self.inner.bulk(transaction, request))
    }

    pub fn bulk_insert<T: BulkEntity>(&self, entities: &[T], options: BulkOptions) -> Result<u64> {
        self.block_on(self.inner.bulk_insert(entities, options))
    }

    pub fn bulk_insert_table(&self, table: &DataTable, options: BulkOptions) -> Result<u64> {
        self.block_on(self.inner.bulk_insert_table(table, options))
    }

    pub fn bulk_insert_reader(&self, reader: RowReader<'_>, options: BulkOptions) -> Result<u64> {
        self.block_on(self.inner.bulk_insert_reader(reader, options))
    }

    pub fn bulk_update<T: BulkEntity>(&self, entities: &[T], options: BulkOptions) -> Result<u64> {
        self.block_on(self.inner.bulk_update(entities, options))
    }

    pub fn bulk_update_table(&self, table: &DataTable, options: BulkOptions) -> Result<u64> {
        self.block_on(self.inner.bulk_update_table(table, options))
    }

    pub fn bulk_update_reader(&self, reader: RowReader<'_>, options: BulkOptions) -> Result<u64> {
        self.block_on(self.inner.bulk_update_reader(reader, options))
    }

    pub fn bulk_delete<T: BulkEntity>(&self, entities: &[T], options: BulkOptions) -> Result<u64> {
        self.block_on(self.inner.bulk_delete(entities, options))
    }

    pub fn bulk_delete_table(&self, table: &DataTable, options: BulkOptions) -> Result<u64> {
        self.block_on(self.inner.bulk_delete_table(table, options))
    }

    pub fn bulk_delete_reader(&self, reader: RowReader<'_>, options: BulkOptions) -> Result<u64> {
        self.block_on(self.inner.bulk_delete_reader(reader, options))
    }

    pub fn bulk_merge<T: BulkEntity>(&self, entities: &[T], options: BulkOptions) -> Result<u64> {
        self.block_on(self.inner.bulk_merge(entities, options))
    }

    pub fn bulk_merge_table(&self, table: &DataTable, options: BulkOptions) -> Result<u64> {
        self.block_on(self.inner.bulk_merge_table(table, options))
    }

    pub fn bulk_merge_reader(&self, reader: RowReader<'_>, options: BulkOptions) -> Result<u64> {
        self.block_on(self.inner.bulk_merge_reader(reader, options))
    }

    pub fn bulk_delete_by_keys<T: BulkEntity>(
        &self,
        keys: Vec<SqlValue>,
        options: BulkOptions,
    ) -> Result<u64> {
        self.block_on(self.inner.bulk_delete_by_keys::<T>(keys, options))
    }
}

fn current_thread_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
