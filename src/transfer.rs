use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use crate::error::{FsError, Result};

/// Bounded fan-out for chunk transfers. Tasks go into a [`JoinSet`] that
/// doubles as the result channel; at most `workers` of them run at once.
#[derive(Clone)]
pub struct TransferPool {
    semaphore: Arc<Semaphore>,
    workers: usize,
}

impl TransferPool {
    pub fn new(workers: usize) -> TransferPool {
        let workers = workers.max(1);
        TransferPool {
            semaphore: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn dispatch<T, F>(&self, tasks: &mut JoinSet<T>, task: F)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        tasks.spawn(async move {
            // The semaphore is never closed, so acquiring only waits.
            let _permit = semaphore.acquire_owned().await.ok();
            task.await
        });
    }
}

/// Wait for the next finished task, turning a panicked task into an error.
pub async fn next_result<T: 'static>(tasks: &mut JoinSet<T>) -> Option<Result<T>> {
    let joined = tasks.join_next().await?;
    Some(joined.map_err(|e| FsError::Internal(format!("transfer task failed: {e}"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = TransferPool::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();

        for i in 0..12usize {
            let running = running.clone();
            let peak = peak.clone();
            pool.dispatch(&mut tasks, async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                i
            });
        }

        let mut seen = Vec::new();
        while let Some(result) = next_result(&mut tasks).await {
            seen.push(result.unwrap());
        }
        seen.sort();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_zero_workers_rounds_up() {
        assert_eq!(TransferPool::new(0).workers(), 1);
    }
}
