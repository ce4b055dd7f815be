//! Timeout and cancellation around a worker body.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{BulkError, Result};

/// Run `work` until it finishes, `timeout` elapses or `cancel` fires.
///
/// Cancellation wins over a result that becomes ready at the same poll.
pub async fn run_guarded<T, F>(
    table: &str,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    work: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(BulkError::Cancelled);
    }

    let bounded = async {
        match timeout {
            Some(after) => match tokio::time::timeout(after, work).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Bulk operation on {} exceeded {:?}", table, after);
                    Err(BulkError::Timeout {
                        table: table.to_string(),
                        after,
                    })
                }
            },
            None => work.await,
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BulkError::Cancelled),
        result = bounded => result,
    }
}
