//! Throttled fan-out and the hand-off point for background work.

use futures::future::{join_all, BoxFuture};
use std::future::Future;

/// Outcome of a [`for_each_bounded`] run.
#[derive(Debug)]
pub struct FanOutReport<E> {
    /// Every item that ran, whether it succeeded or not.
    pub completed: usize,
    pub failures: Vec<E>,
}

impl<E> FanOutReport<E> {
    pub fn succeeded(&self) -> usize {
        self.completed - self.failures.len()
    }
}

/// Runs `action` over every item with at most `limit` actions in flight.
///
/// Items are split into consecutive chunks of `limit`. A chunk's actions run
/// concurrently and the whole chunk is awaited before the next one starts,
/// so concurrency is bursty rather than a refilling window. A failed item
/// never stops its siblings or later chunks; failures are handed back for
/// the caller to log or drop. A `limit` of zero behaves as one.
pub async fn for_each_bounded<T, F, Fut, E>(
    items: Vec<T>,
    limit: usize,
    action: F,
) -> FanOutReport<E>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let limit = limit.max(1);
    let mut report = FanOutReport {
        completed: 0,
        failures: Vec::new(),
    };

    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        let chunk: Vec<Fut> = items.by_ref().take(limit).map(&action).collect();
        for result in join_all(chunk).await {
            report.completed += 1;
            if let Err(e) = result {
                report.failures.push(e);
            }
        }
    }

    report
}

/// Where work that must outlive the current request is sent.
pub trait TaskSpawner: Send + Sync {
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

/// Runs background work on the ambient tokio runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSpawner;

impl TaskSpawner for TokioSpawner {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_empty_input_runs_nothing() {
        let calls = AtomicUsize::new(0);
        let report = for_each_bounded(Vec::<u32>::new(), 4, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), ()>(()) }
        })
        .await;

        assert_eq!(report.completed, 0);
        assert!(report.failures.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_never_exceeds_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let report = for_each_bounded((0..23).collect(), 5, |i: u64| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1 + i % 3)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), ()>(())
            }
        })
        .await;

        assert_eq!(report.completed, 23);
        assert_eq!(report.succeeded(), 23);
        assert_eq!(peak.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_siblings() {
        let calls = AtomicUsize::new(0);
        let report = for_each_bounded((0..10).collect(), 3, |i: u32| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if i % 4 == 0 {
                    Err(format!("item {i} failed"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(report.completed, 10);
        assert_eq!(report.failures.len(), 3);
        assert_eq!(report.succeeded(), 7);
    }

    #[tokio::test]
    async fn test_limit_larger_than_input_runs_all_at_once() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let report = for_each_bounded(vec![1, 2, 3], 50, |_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), ()>(())
            }
        })
        .await;

        assert_eq!(report.completed, 3);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_limit_runs_serially() {
        let report = for_each_bounded(vec![1, 2], 0, |_| async { Ok::<(), ()>(()) }).await;
        assert_eq!(report.completed, 2);
    }
}
