//! Caller-owned transactions.

use tracing::warn;

use crate::core::traits::BulkConnection;
use crate::error::Result;

/// A transaction on a caller-owned connection.
///
/// The transaction borrows the connection for its lifetime. Operations
/// dispatched with a transaction run on that connection and never dispose it.
pub struct Transaction<'c, C: BulkConnection> {
    conn: &'c mut C,
    active: bool,
}

impl<'c, C: BulkConnection> Transaction<'c, C> {
    /// Issue the vendor BEGIN statement on `conn`.
    pub async fn begin(conn: &'c mut C) -> Result<Self> {
        conn.begin().await?;
        Ok(Self { conn, active: true })
    }

    /// The connection this transaction runs on.
    pub fn connection(&mut self) -> &mut C {
        self.conn
    }

    pub async fn commit(mut self) -> Result<()> {
        self.active = false;
        self.conn.commit().await
    }

    pub async fn rollback(mut self) -> Result<()> {
        self.active = false;
        self.conn.rollback().await
    }
}

impl<C: BulkConnection> Drop for Transaction<'_, C> {
    fn drop(&mut self) {
        if self.active {
            warn!(
                "{} transaction dropped without commit or rollback; it stays open on the connection",
                self.conn.dialect()
            );
        }
    }
}
