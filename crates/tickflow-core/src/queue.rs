//! The time-ordered work queue contract and its background poller.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tickflow_types::error::QueueError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A queue keyed by a future timestamp. `get_next` only returns items whose
/// time has passed, and removal must be atomic: concurrent pollers must not
/// double-dequeue an item.
pub trait WorkQueue<T: Send + 'static>: Send + Sync + 'static {
    fn add(
        &self,
        item: &T,
        run_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    fn get_next(
        &self,
    ) -> impl std::future::Future<Output = Result<Option<T>, QueueError>> + Send;
}

/// Handle to a background poll loop; dropping it does not stop the loop.
#[derive(Debug)]
pub struct QueuePoller {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl QueuePoller {
    /// Request the loop to stop after its current item.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

/// Spawn a background loop that drains due items every `interval`, calling
/// `handler` once per dequeued item.
///
/// Queue errors are logged and the poll round abandoned; the loop keeps
/// running so other items still make progress.
pub fn spawn_poller<T, Q, F, Fut>(queue: Arc<Q>, interval: Duration, handler: F) -> QueuePoller
where
    T: Send + 'static,
    Q: WorkQueue<T>,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let token = CancellationToken::new();
    let loop_token = token.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = loop_token.cancelled() => break,
                _ = ticker.tick() => {
                    loop {
                        match queue.get_next().await {
                            Ok(Some(item)) => handler(item).await,
                            Ok(None) => break,
                            Err(error) => {
                                warn!(%error, "work queue poll failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
    });
    QueuePoller { token, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryWorkQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn poller_drains_due_items_and_stops() {
        let queue = Arc::new(MemoryWorkQueue::<u32>::new());
        queue.add(&1, Utc::now()).await.unwrap();
        queue.add(&2, Utc::now()).await.unwrap();
        // Far in the future; must not be delivered.
        queue
            .add(&3, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let poller = spawn_poller(Arc::clone(&queue), Duration::from_millis(5), move |item| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(item as usize, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        poller.shutdown().await;

        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(queue.get_next().await.unwrap(), None);
    }
}
