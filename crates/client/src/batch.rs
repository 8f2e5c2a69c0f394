//! Micro-batching queue.
//!
//! Coalesces concurrent loads issued within a short scheduling window
//! into one call to a batch runner, so N callers asking for N coordinates
//! within ~50 ms cost one network query. A batch also flushes early when
//! it reaches the maximum size.
//!
//! The runner returns a map of results; keys it omits resolve as dropped
//! receivers, which callers treat as a retryable failure (nothing is
//! cached for them).

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Batching parameters.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// How long to wait for more keys before flushing.
    pub flush_interval: Duration,
    /// Flush immediately once this many loads are pending.
    pub max_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(50),
            max_batch_size: 500,
        }
    }
}

/// Executes one batch of keys, returning results per key.
pub type BatchRunner<K, V> = Arc<dyn Fn(Vec<K>) -> BoxFuture<'static, HashMap<K, V>> + Send + Sync>;

/// Coalesces individual loads into batched runner calls.
pub struct BatchQueue<K, V> {
    config: BatchConfig,
    runner: BatchRunner<K, V>,
    pending: Arc<Mutex<Vec<(K, oneshot::Sender<V>)>>>,
    flush_scheduled: Arc<AtomicBool>,
}

impl<K, V> BatchQueue<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(config: BatchConfig, runner: BatchRunner<K, V>) -> Self {
        Self {
            config,
            runner,
            pending: Arc::new(Mutex::new(Vec::new())),
            flush_scheduled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enqueue a load. The receiver resolves when the batch containing
    /// this key has run; it errors if the runner produced no result for
    /// the key.
    pub fn load(&self, key: K) -> oneshot::Receiver<V> {
        let (tx, rx) = oneshot::channel();

        let at_capacity = {
            let mut pending = self.pending.lock();
            pending.push((key, tx));
            pending.len() >= self.config.max_batch_size
        };

        if at_capacity {
            self.spawn_flush();
        } else if !self.flush_scheduled.swap(true, Ordering::SeqCst) {
            let pending = Arc::clone(&self.pending);
            let runner = Arc::clone(&self.runner);
            let flush_scheduled = Arc::clone(&self.flush_scheduled);
            let interval = self.config.flush_interval;
            tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                flush_scheduled.store(false, Ordering::SeqCst);
                run_batch(pending, runner).await;
            });
        }

        rx
    }

    fn spawn_flush(&self) {
        let pending = Arc::clone(&self.pending);
        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            run_batch(pending, runner).await;
        });
    }
}

async fn run_batch<K, V>(pending: Arc<Mutex<Vec<(K, oneshot::Sender<V>)>>>, runner: BatchRunner<K, V>)
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    let drained: Vec<(K, oneshot::Sender<V>)> = std::mem::take(&mut *pending.lock());
    if drained.is_empty() {
        return;
    }

    // Several callers may wait on the same key within one window.
    let mut waiters: HashMap<K, Vec<oneshot::Sender<V>>> = HashMap::new();
    for (key, tx) in drained {
        waiters.entry(key).or_default().push(tx);
    }
    let keys: Vec<K> = waiters.keys().cloned().collect();
    debug!(batch_size = keys.len(), "running batch");

    let mut results = runner(keys).await;
    for (key, senders) in waiters {
        match results.remove(&key) {
            Some(value) => {
                for tx in senders {
                    let _ = tx.send(value.clone());
                }
            }
            // No result: drop the senders so receivers observe failure.
            None => drop(senders),
        }
    }
}
