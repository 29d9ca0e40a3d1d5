//! Retry-once wrapper for transient store errors.
//!
//! Connection drops and serialization failures get one immediate retry;
//! anything that still fails surfaces as `StoreUnavailable`. Non-transient
//! errors (validation, duplicates, not-found) pass through untouched.

use std::future::Future;

use tarsy_domain::error::Error;
use tarsy_domain::Result;

/// Run `op`, retrying exactly once if the first attempt fails transiently.
pub async fn with_retry<T, F, Fut>(op_name: &str, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(first) if first.is_transient() => {
            tracing::warn!(op = op_name, error = %first, "transient store error, retrying once");
            op().await.map_err(|second| {
                Error::StoreUnavailable(format!("{op_name} failed after retry: {second}"))
            })
        }
        Err(other) => Err(other),
    }
}

/// Map a sqlx error to the shared error type, classifying transience and
/// the unique-violation / foreign-key cases the callers care about.
pub fn map_sqlx_error(context: &str, err: sqlx::Error) -> Error {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            match code.as_str() {
                // unique_violation: the alert_id constraint gets its own
                // error kind; any other unique tuple is a caller bug.
                "23505" if context == "create_session" => {
                    Error::DuplicateAlert(db.message().to_string())
                }
                "23505" => Error::Validation(format!("{context}: {}", db.message())),
                // foreign_key_violation
                "23503" => Error::NotFound(format!("{context}: {}", db.message())),
                // serialization_failure, deadlock_detected
                "40001" | "40P01" => {
                    Error::StoreUnavailable(format!("{context}: {}", db.message()))
                }
                _ => Error::Other(format!("{context}: {}", db.message())),
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            Error::StoreUnavailable(format!("{context}: {err}"))
        }
        sqlx::Error::RowNotFound => Error::NotFound(context.to_string()),
        _ => Error::Other(format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn transient_error_retried_once_then_succeeds() {
        let attempts = AtomicU32::new(0);
        let result = with_retry("test_op", || async {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::StoreUnavailable("connection reset".into()))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_transient_error_becomes_store_unavailable() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry("test_op", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::Timeout("query".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_transient_error_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry("test_op", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::DuplicateAlert("a1".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::DuplicateAlert(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
