//! Coalesced key/value persistence.
//!
//! Writes queued for the same key before the next flush collapse into one and
//! the last value wins. The first write into an empty queue schedules a flush
//! after [`PERSIST_DELAY`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::task::AbortHandle;

use super::StoreClient;

/// Delay between the first queued write and the flush that sends it.
pub const PERSIST_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Batch {
    pending: Vec<(String, Value)>,
    timer: Option<AbortHandle>,
}

fn lock(batch: &Mutex<Batch>) -> MutexGuard<'_, Batch> {
    batch.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Take the queued writes, leaving the queue empty and unscheduled.
fn take(batch: &Mutex<Batch>, cancel_timer: bool) -> Vec<(String, Value)> {
    let mut batch = lock(batch);
    let timer = batch.timer.take();
    if cancel_timer && let Some(timer) = timer {
        timer.abort();
    }
    std::mem::take(&mut batch.pending)
}

/// Persist each write in queue order. Failures are logged and dropped.
async fn send(client: &StoreClient, writes: Vec<(String, Value)>) -> usize {
    let mut written = 0;
    for (key, value) in writes {
        match client.persist(&key, value).await {
            Ok(_) => written += 1,
            Err(e) => tracing::warn!(key = %key, error = %e, "queued persist failed"),
        }
    }
    if written > 0 {
        tracing::debug!(written, "flushed persist queue");
    }
    written
}

/// Batches key/value writes in front of a [`StoreClient`].
#[derive(Debug)]
pub struct PersistQueue {
    client: Arc<StoreClient>,
    delay: Duration,
    batch: Arc<Mutex<Batch>>,
}

impl PersistQueue {
    pub fn new(client: Arc<StoreClient>) -> Self {
        Self { client, delay: PERSIST_DELAY, batch: Arc::default() }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Writes waiting for the next flush.
    pub fn pending_count(&self) -> usize {
        lock(&self.batch).pending.len()
    }

    /// Queue `value` under `key`, replacing any value already queued for it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut batch = lock(&self.batch);
        match batch.pending.iter_mut().find(|(queued, _)| *queued == key) {
            Some(slot) => slot.1 = value,
            None => batch.pending.push((key, value)),
        }

        if batch.timer.is_none() {
            let (client, shared, delay) = (Arc::clone(&self.client), Arc::clone(&self.batch), self.delay);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let writes = take(&shared, false);
                send(&client, writes).await;
            });
            batch.timer = Some(timer.abort_handle());
        }
    }

    /// Send everything queued now. Returns how many writes succeeded.
    pub async fn flush(&self) -> usize {
        let writes = take(&self.batch, true);
        send(&self.client, writes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KeyValueStore, MemoryKv};
    use crate::store::{RecordStore, StoreWorker};
    use serde_json::json;

    async fn queue(delay: Duration) -> (PersistQueue, Arc<StoreClient>, Arc<MemoryKv>) {
        let store = RecordStore::open_in_memory().await.unwrap();
        let mirror = Arc::new(MemoryKv::new());
        let worker = StoreWorker::new(store).with_mirror(mirror.clone(), 1024);
        let client = Arc::new(StoreClient::local(worker, Duration::from_secs(5)));
        (PersistQueue::new(Arc::clone(&client)).with_delay(delay), client, mirror)
    }

    #[tokio::test]
    async fn test_writes_to_one_key_coalesce() {
        let (queue, _, mirror) = queue(Duration::from_secs(60)).await;
        queue.enqueue("pos_profile", json!({"rev": 1}));
        queue.enqueue("pos_opening_shift", json!("SHIFT-1"));
        queue.enqueue("pos_profile", json!({"rev": 2}));
        assert_eq!(queue.pending_count(), 2);

        assert_eq!(queue.flush().await, 2);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(mirror.get("posa_pos_profile").await.unwrap().as_deref(), Some(r#"{"rev":2}"#));
        assert_eq!(mirror.get("posa_pos_opening_shift").await.unwrap().as_deref(), Some(r#""SHIFT-1""#));
    }

    #[tokio::test]
    async fn test_flush_of_empty_queue() {
        let (queue, client, _) = queue(PERSIST_DELAY).await;
        assert_eq!(queue.flush().await, 0);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_flushes_after_delay() {
        let (queue, _, mirror) = queue(Duration::from_millis(20)).await;
        queue.enqueue("pos_profile", json!({"rev": 1}));
        queue.enqueue("pos_profile", json!({"rev": 3}));

        let mut stored = None;
        for _ in 0..200 {
            stored = mirror.get("posa_pos_profile").await.unwrap();
            if stored.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stored.as_deref(), Some(r#"{"rev":3}"#));
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_write_is_dropped() {
        let (queue, _, _) = queue(Duration::from_secs(60)).await;
        queue.enqueue("", json!(1));
        queue.enqueue("pos_profile", json!({"rev": 1}));
        assert_eq!(queue.flush().await, 1);
        assert_eq!(queue.pending_count(), 0);
    }
}
