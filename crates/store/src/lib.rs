//! Reconcile queue: coalesces requests per remote secret and runs at most one
//! pass per object at a time, with passes for different objects in parallel.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use futures::stream::{FuturesUnordered, StreamExt};
use metrics::{counter, gauge};
use rsecret_core::ObjectKey;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub fn queue_cap_from_env() -> usize {
    std::env::var("RSECRET_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1024)
}

pub fn workers_from_env() -> usize {
    std::env::var("RSECRET_WORKERS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(4)
}

/// FIFO of object keys; a key already waiting is not queued twice.
///
/// Never drops a key: its size is bounded by the number of distinct objects,
/// and producers are throttled by the bounded channel in front of it.
#[derive(Default)]
pub struct Coalescer {
    queued: FxHashSet<ObjectKey>,
    order: VecDeque<ObjectKey>,
}

impl Coalescer {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }

    /// Returns false when the key was already waiting.
    pub fn push(&mut self, key: ObjectKey) -> bool {
        if self.queued.contains(&key) {
            return false;
        }
        self.queued.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn pop(&mut self) -> Option<ObjectKey> {
        let key = self.order.pop_front()?;
        self.queued.remove(&key);
        Some(key)
    }
}

/// Delay before a failed pass is run again: `base * 2^(failures - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base: Duration::from_millis(500), max: Duration::from_secs(60) }
    }
}

impl RetryPolicy {
    pub fn delay(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << shift).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub coalesced: u64,
    /// Keys waiting for a retry after a failed pass.
    pub retrying: usize,
}

/// Handle for producers and observers of the queue.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<ObjectKey>,
    stats: Arc<ArcSwap<QueueStats>>,
    completed_rx: watch::Receiver<u64>,
}

impl QueueHandle {
    pub async fn enqueue(&self, key: ObjectKey) -> Result<()> {
        self.tx.send(key).await.map_err(|_| anyhow!("reconcile queue closed"))
    }

    pub fn sender(&self) -> mpsc::Sender<ObjectKey> { self.tx.clone() }

    pub fn stats(&self) -> Arc<QueueStats> { self.stats.load_full() }

    /// Watch the number of finished passes (successful or not).
    pub fn subscribe_completed(&self) -> watch::Receiver<u64> { self.completed_rx.clone() }
}

/// Spawn the dispatcher with the default [`RetryPolicy`].
pub fn spawn_queue<F, Fut>(cap: usize, workers: usize, handler: F) -> QueueHandle
where
    F: Fn(ObjectKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    spawn_queue_with_retry(cap, workers, RetryPolicy::default(), handler)
}

/// Spawn the dispatcher. A pass that fails is queued again after
/// `retry.delay(..)`. Dropping every [`QueueHandle`] (and sender) drains
/// pending work, abandons scheduled retries and stops it.
pub fn spawn_queue_with_retry<F, Fut>(cap: usize, workers: usize, retry: RetryPolicy, handler: F) -> QueueHandle
where
    F: Fn(ObjectKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<ObjectKey>(cap.max(1));
    let stats = Arc::new(ArcSwap::from_pointee(QueueStats::default()));
    let (completed_tx, completed_rx) = watch::channel(0u64);
    let stats_pub = Arc::clone(&stats);
    let workers = workers.max(1);

    tokio::spawn(async move {
        let mut pending = Coalescer::new();
        let mut in_flight: FxHashSet<ObjectKey> = FxHashSet::default();
        // keys requested again while a pass is running
        let mut rerun: FxHashSet<ObjectKey> = FxHashSet::default();
        let mut running = FuturesUnordered::new();
        let mut retries = FuturesUnordered::new();
        // consecutive failures per key
        let mut failures: FxHashMap<ObjectKey, u32> = FxHashMap::default();
        let mut st = QueueStats::default();
        let mut closed = false;

        loop {
            while in_flight.len() < workers {
                let Some(key) = pending.pop() else { break };
                in_flight.insert(key.clone());
                let fut = handler(key.clone());
                let task = tokio::spawn(fut);
                running.push(async move { (key, task.await) });
            }

            st.pending = pending.len() + rerun.len();
            st.in_flight = in_flight.len();
            st.retrying = retries.len();
            stats_pub.store(Arc::new(st));
            gauge!("queue_pending", st.pending as f64);

            if closed && running.is_empty() && pending.is_empty() {
                break;
            }

            tokio::select! {
                maybe = rx.recv(), if !closed => {
                    match maybe {
                        Some(key) => {
                            let fresh = if in_flight.contains(&key) {
                                rerun.insert(key)
                            } else {
                                pending.push(key)
                            };
                            if !fresh {
                                st.coalesced += 1;
                                counter!("queue_coalesced_total", 1u64);
                            }
                        }
                        None => {
                            debug!("reconcile queue closed; draining");
                            closed = true;
                        }
                    }
                }
                Some((key, joined)) = running.next(), if !running.is_empty() => {
                    in_flight.remove(&key);
                    st.completed += 1;
                    let failed = match joined {
                        Ok(Ok(())) => {
                            debug!(key = %key, "reconcile pass finished");
                            failures.remove(&key);
                            false
                        }
                        Ok(Err(e)) => {
                            warn!(key = %key, error = %e, "reconcile pass failed");
                            true
                        }
                        Err(e) => {
                            error!(key = %key, error = %e, "reconcile task aborted");
                            true
                        }
                    };
                    if failed {
                        st.failed += 1;
                        let n = failures.entry(key.clone()).or_insert(0);
                        *n += 1;
                        let delay = retry.delay(*n);
                        counter!("queue_retry_total", 1u64);
                        debug!(key = %key, attempt = *n, delay_ms = delay.as_millis() as u64, "retry scheduled");
                        let k = key.clone();
                        retries.push(async move {
                            tokio::time::sleep(delay).await;
                            k
                        });
                    }
                    if rerun.remove(&key) {
                        pending.push(key);
                    }
                    let _ = completed_tx.send(st.completed);
                }
                Some(key) = retries.next(), if !retries.is_empty() => {
                    if in_flight.contains(&key) {
                        rerun.insert(key);
                    } else {
                        pending.push(key);
                    }
                }
            }
        }
        stats_pub.store(Arc::new(st));
        info!(completed = st.completed, failed = st.failed, "reconcile queue stopped");
    });

    QueueHandle { tx, stats, completed_rx }
}
