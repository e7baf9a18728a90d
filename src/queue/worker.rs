//! In-memory parallel-worker implementation of [`MessageQueue`]
//!
//! Messages are handed to a bounded pool of tokio tasks over an unbounded
//! mpsc channel. A message that fails is resubmitted to the same channel
//! after the delay computed by the configured [`RetryPolicy`], up to its
//! attempt limit; at that point it is dropped and counted as dead.
//! Construction takes no handler: messages queue up as soon as `enqueue` is
//! called, and are only dispatched once [`ParallelWorkerQueue::listen`] is
//! called with one. This lets a queue be built (and start accepting
//! deliveries) before its consumer exists — see the module docs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::warn;

use crate::retry::RetryPolicy;

use super::{Cancellation, MessageQueue, QueueHandler, QueuedMessage};

/// Counters describing queue activity, exposed for diagnostics/metrics.
#[derive(Default, Debug)]
pub struct QueueStats {
    /// Messages accepted but not yet attempted
    pub pending: AtomicU64,
    /// Messages currently being delivered
    pub running: AtomicU64,
    /// Messages that exhausted their retry budget
    pub dead: AtomicU64,
    /// Messages delivered successfully
    pub completed: AtomicU64,
}

/// A [`MessageQueue`] that spawns a bounded pool of tokio tasks and retries
/// failed deliveries with exponential backoff, entirely in memory.
pub struct ParallelWorkerQueue {
    stats: Arc<QueueStats>,
    sender: UnboundedSender<(QueuedMessage, u32)>,
    receiver: Mutex<Option<UnboundedReceiver<(QueuedMessage, u32)>>>,
    worker_count: usize,
    policy: RetryPolicy,
}

impl ParallelWorkerQueue {
    /// Create a new, handler-less queue. Pass `worker_count` = 0 for
    /// unbounded concurrency.
    pub fn new(worker_count: usize, policy: RetryPolicy) -> Self {
        let (sender, receiver) = unbounded_channel::<(QueuedMessage, u32)>();
        ParallelWorkerQueue {
            stats: Arc::new(QueueStats::default()),
            sender,
            receiver: Mutex::new(Some(receiver)),
            worker_count,
            policy,
        }
    }

    /// Snapshot of current queue counters.
    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl MessageQueue for ParallelWorkerQueue {
    async fn enqueue(&self, message: QueuedMessage) -> anyhow::Result<()> {
        self.stats.pending.fetch_add(1, Ordering::Relaxed);
        self.sender.send((message, 1))?;
        Ok(())
    }

    async fn listen(&self, handler: QueueHandler, cancel: Cancellation) {
        let Some(mut receiver) = self.receiver.lock().await.take() else {
            warn!("listen() called more than once on this queue; ignoring");
            return;
        };

        let stats = self.stats.clone();
        let policy = self.policy;
        let worker_count = self.worker_count;
        let retry_sender = self.sender.clone();
        let mut join_set: JoinSet<()> = JoinSet::new();

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = receiver.recv() => received,
            };
            let Some((message, attempt)) = received else { break };

            let handler = handler.clone();
            let stats = stats.clone();
            let retry_sender = retry_sender.clone();
            let task = async move {
                stats.pending.fetch_sub(1, Ordering::Relaxed);
                stats.running.fetch_add(1, Ordering::Relaxed);
                let outcome = handler(message.clone()).await;
                stats.running.fetch_sub(1, Ordering::Relaxed);
                match outcome {
                    Ok(()) => {
                        stats.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        if let Some(delay) = policy.delay_for(attempt + 1) {
                            warn!("message {} failed ({err:#}), retrying in {delay:?}", message.activity_id);
                            stats.pending.fetch_add(1, Ordering::Relaxed);
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                retry_sender.send((message, attempt + 1)).ok();
                            });
                        } else {
                            warn!("message {} failed permanently ({err:#})", message.activity_id);
                            stats.dead.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            };

            if worker_count > 0 {
                while join_set.len() >= worker_count {
                    join_set.join_next().await;
                }
                join_set.spawn(task);
            } else {
                tokio::spawn(task);
            }
        }
        while join_set.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use url::Url;

    fn message() -> QueuedMessage {
        let url = Url::parse("https://example.com/1").unwrap();
        QueuedMessage {
            activity_id: url.clone(),
            inbox: Url::parse("https://remote.example/inbox").unwrap(),
            body: b"{}".to_vec(),
            signed_by: url,
            signing_key: None,
            collection_sync: None,
        }
    }

    fn handler<F, Fut>(f: F) -> QueueHandler
    where
        F: Fn(QueuedMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Arc::new(move |message| Box::pin(f(message)))
    }

    #[tokio::test]
    async fn successful_delivery_is_counted() {
        let queue = Arc::new(ParallelWorkerQueue::new(4, RetryPolicy::default()));
        let listening = queue.clone();
        tokio::spawn(async move { listening.listen(handler(|_| async { Ok(()) }), Cancellation::new()).await });
        queue.enqueue(message()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.stats().completed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_then_dies() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
        };
        let attempts = Arc::new(AtomicUsize::new(0));
        let queue = Arc::new(ParallelWorkerQueue::new(4, policy));
        let listening = queue.clone();
        let counter = attempts.clone();
        tokio::spawn(async move {
            listening
                .listen(
                    handler(move |_| {
                        counter.fetch_add(1, Ordering::Relaxed);
                        async { Err(anyhow::anyhow!("unreachable")) }
                    }),
                    Cancellation::new(),
                )
                .await
        });
        queue.enqueue(message()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::Relaxed), 2);
        assert_eq!(queue.stats().dead.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cancel_stops_the_listen_loop() {
        let queue = Arc::new(ParallelWorkerQueue::new(1, RetryPolicy::default()));
        let cancel = Cancellation::new();
        let listening = queue.clone();
        let listen_cancel = cancel.clone();
        let done = tokio::spawn(async move { listening.listen(handler(|_| async { Ok(()) }), listen_cancel).await });
        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(200), done).await.unwrap().unwrap();
    }
}
