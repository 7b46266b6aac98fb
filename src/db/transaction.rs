//! Transaction helpers.
//!
//! Reconciliation work runs inside a serializable transaction bounded by a
//! deadline. A transaction that is dropped without `commit` (error or
//! deadline) is rolled back by SeaORM.

use crate::errors::ServiceError;
use metrics::counter;
use sea_orm::{DatabaseConnection, DatabaseTransaction, DbErr, IsolationLevel, TransactionTrait};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Opens a serializable transaction. SQLite ignores the isolation level and
/// serializes writers on its own.
pub async fn begin_serializable(db: &DatabaseConnection) -> Result<DatabaseTransaction, DbErr> {
    db.begin_with_config(Some(IsolationLevel::Serializable), None)
        .await
}

/// Runs `work` and fails with [`ServiceError::Timeout`] if it does not finish
/// within `limit`. Any transaction owned by `work` is dropped, and so rolled
/// back, when the deadline fires.
pub async fn with_deadline<T, F>(limit: Duration, label: &str, work: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => {
            counter!("topup_db.transaction.timeout", 1);
            warn!(
                operation = label,
                limit_ms = limit.as_millis() as u64,
                "transaction deadline exceeded"
            );
            Err(ServiceError::Timeout(format!(
                "{} did not complete within {:?}",
                label, limit
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn deadline_passes_through_results() {
        let ok = with_deadline(Duration::from_secs(1), "quick", async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<(), _> = with_deadline(Duration::from_secs(1), "failing", async {
            Err(ServiceError::Conflict("x".into()))
        })
        .await;
        assert_matches!(err, Err(ServiceError::Conflict(_)));
    }

    #[tokio::test]
    async fn deadline_reports_timeout() {
        let result: Result<(), _> = with_deadline(Duration::from_millis(10), "slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_matches!(result, Err(ServiceError::Timeout(msg)) if msg.starts_with("slow"));
    }
}
