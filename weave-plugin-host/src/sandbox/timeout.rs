//! Soft timeouts for plugin code
//!
//! The future is spawned onto the runtime and awaited with a deadline. On
//! timeout the caller gets [`TimeoutError::Elapsed`] but the task keeps
//! running: its side effects may still happen later.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimeoutError {
    #[error("Operation timed out after {0:?}")]
    Elapsed(Duration),

    #[error("Task failed: {0}")]
    TaskFailed(String),
}

/// Run `fut` with a deadline, abandoning it on timeout
pub async fn execute_with_timeout<F, T>(fut: F, timeout: Duration) -> Result<T, TimeoutError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(fut);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(join_error)) => Err(TimeoutError::TaskFailed(join_error.to_string())),
        Err(_) => {
            // Dropping a JoinHandle detaches the task
            tracing::warn!(timeout = ?timeout, "Operation abandoned after timeout");
            Err(TimeoutError::Elapsed(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_completes_in_time() {
        let value = execute_with_timeout(async { 42 }, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_abandons_but_does_not_abort() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let result = execute_with_timeout(
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                flag.store(true, Ordering::SeqCst);
            },
            Duration::from_millis(10),
        )
        .await;

        assert!(matches!(result, Err(TimeoutError::Elapsed(_))));
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panicking_task_reports_failure() {
        let result = execute_with_timeout(
            async {
                panic!("boom");
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(TimeoutError::TaskFailed(_))));
    }
}
