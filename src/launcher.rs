use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::Semaphore;

use crate::error::Result;

/// Concurrent handshake ceiling used at startup.
pub const MAX_CONCURRENT_HANDSHAKES: usize = 20;

/// Runs every operation concurrently while keeping at most `limit` of
/// them active, then returns the successes and failures in arbitrary
/// order.
pub async fn run_limited<T, Fut>(ops: Vec<Fut>, limit: usize) -> (Vec<T>, Vec<anyhow::Error>)
where
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit));
    let mut handles = Vec::with_capacity(ops.len());

    for op in ops {
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| anyhow!("launcher semaphore closed"))?;
            op.await
        }));
    }

    let mut succeeded = Vec::new();
    let mut failed = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(Ok(value)) => succeeded.push(value),
            Ok(Err(e)) => failed.push(e),
            Err(e) => failed.push(anyhow!("launcher task failed: {}", e)),
        }
    }
    (succeeded, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_collects_successes_and_failures() {
        let ops: Vec<_> = (0..10)
            .map(|i| async move {
                if i % 3 == 0 {
                    Err(anyhow!("op {} failed", i))
                } else {
                    Ok(i)
                }
            })
            .collect();

        let (mut oks, errs) = run_limited(ops, 4).await;
        oks.sort_unstable();

        assert_eq!(oks, vec![1, 2, 4, 5, 7, 8]);
        assert_eq!(errs.len(), 4);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let ops: Vec<_> = (0..20)
            .map(|i| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                }
            })
            .collect();

        let (oks, errs) = run_limited(ops, 3).await;

        assert_eq!(oks.len(), 20);
        assert!(errs.is_empty());
        assert!(
            peak.load(Ordering::SeqCst) <= 3,
            "peak concurrency was {}",
            peak.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_empty_input() {
        let ops: Vec<std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send>>> = vec![];
        let (oks, errs) = run_limited(ops, 5).await;
        assert!(oks.is_empty());
        assert!(errs.is_empty());
    }
}
