use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio::time::{Duration, Instant};

const NOTIFY_CHANNEL_CAPACITY: usize = 64;

/// Backing store for per-agent queues. Implement for any queue service.
///
/// Items are opaque serialized envelopes. No cross-queue atomicity is assumed.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Connectivity check used when the bus starts.
    async fn ping(&self) -> Result<()>;

    /// Append an item to the tail of `queue`.
    async fn push(&self, queue: &str, item: String) -> Result<()>;

    /// Wait up to `timeout` for an item on any of `queues`.
    ///
    /// Must be cancel-safe: dropping the future never loses an item.
    async fn pop_blocking(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>>;

    /// Best-effort wake signal; may be dropped.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    async fn length(&self, queue: &str) -> Result<usize>;

    async fn delete(&self, queue: &str) -> Result<()>;

    /// Release the underlying connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    notify: Notify,
    closed: AtomicBool,
}

/// In-process queue store with FIFO queues and broadcast notification channels.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueueStore {
    inner: Arc<StoreInner>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a notification channel. Messages published before
    /// subscribing are not replayed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let mut channels = self.inner.channels.lock();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(NOTIFY_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Snapshot up to `max` items from the head of `queue` without consuming them.
    /// Use `max = 0` to peek the whole queue.
    pub fn peek(&self, queue: &str, max: usize) -> Vec<String> {
        let queues = self.inner.queues.lock();
        let Some(items) = queues.get(queue) else {
            return Vec::new();
        };
        let take_count = if max == 0 { items.len() } else { max };
        items.iter().take(take_count).cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            anyhow::bail!("queue store is closed");
        }
        Ok(())
    }

    fn try_pop(&self, queues: &[String]) -> Option<(String, String)> {
        let mut state = self.inner.queues.lock();
        for queue in queues {
            if let Some(item) = state.get_mut(queue).and_then(VecDeque::pop_front) {
                return Some((queue.clone(), item));
            }
        }
        None
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn ping(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn push(&self, queue: &str, item: String) -> Result<()> {
        self.ensure_open()?;
        self.inner
            .queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(item);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn pop_blocking(
        &self,
        queues: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a push in between is not missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_open()?;
            if let Some(hit) = self.try_pop(queues) {
                return Ok(Some(hit));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some(sender) = self.inner.channels.lock().get(channel) {
            // No subscribers is fine; the signal is advisory.
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn length(&self, queue: &str) -> Result<usize> {
        self.ensure_open()?;
        Ok(self
            .inner
            .queues
            .lock()
            .get(queue)
            .map_or(0, VecDeque::len))
    }

    async fn delete(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.inner.queues.lock().remove(queue);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.channels.lock().clear();
        self.inner.notify.notify_waiters();
        Ok(())
    }
}
