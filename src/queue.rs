//! Backpressure intake queue (C6): bounded FIFO with drop-policy and optional rate
//! limit. Grounded on `original_source/ingest_api/mqtt/backpressure.py` and
//! `backpressure_config.py`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct BackpressureConfig {
    pub max_size: usize,
    pub rate_limit_per_sec: f64,
    pub drop_oldest: bool,
}

impl BackpressureConfig {
    pub fn from_env() -> Self {
        Self {
            max_size: crate::config::env_parse("MQTT_QUEUE_MAX_SIZE", 10_000),
            rate_limit_per_sec: crate::config::env_parse("MQTT_RATE_LIMIT_PER_SEC", 0.0),
            drop_oldest: crate::config::env_parse("MQTT_DROP_OLDEST", true),
        }
    }
}

#[derive(Debug, Default)]
pub struct QueueStats {
    pub enqueued: AtomicU64,
    pub dequeued: AtomicU64,
    pub dropped: AtomicU64,
    pub rate_limited: AtomicU64,
}

impl QueueStats {
    pub fn current_size(&self, queue_len: usize) -> usize {
        queue_len
    }

    pub fn utilization(&self, queue_len: usize, max_size: usize) -> f64 {
        if max_size == 0 {
            0.0
        } else {
            queue_len as f64 / max_size as f64 * 100.0
        }
    }
}

struct State<T> {
    items: VecDeque<T>,
    last_accepted_put: Option<Instant>,
}

pub struct BackpressureQueue<T> {
    config: BackpressureConfig,
    state: Mutex<State<T>>,
    notify: Notify,
    pub stats: QueueStats,
}

impl<T> BackpressureQueue<T> {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(config.max_size.min(1024)),
                last_accepted_put: None,
            }),
            notify: Notify::new(),
            stats: QueueStats::default(),
        }
    }

    pub async fn put(&self, item: T) -> bool {
        let mut state = self.state.lock().await;

        if self.config.rate_limit_per_sec > 0.0 {
            let min_interval = Duration::from_secs_f64(1.0 / self.config.rate_limit_per_sec);
            let now = Instant::now();
            if let Some(last) = state.last_accepted_put {
                if now.duration_since(last) < min_interval {
                    self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
            state.last_accepted_put = Some(now);
        }

        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);

        if state.items.len() >= self.config.max_size {
            if self.config.drop_oldest {
                state.items.pop_front();
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        state.items.push_back(item);
        drop(state);
        self.notify.notify_one();
        true
    }

    pub async fn get(&self, timeout: Option<Duration>) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(item) = state.items.pop_front() {
                    self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
                    return Some(item);
                }
            }
            match timeout {
                Some(d) => {
                    if tokio::time::timeout(d, self.notify.notified()).await.is_err() {
                        return None;
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    pub async fn get_batch(&self, max: usize, timeout: Option<Duration>) -> Vec<T> {
        let Some(first) = self.get(timeout).await else {
            return Vec::new();
        };
        let mut batch = vec![first];
        let mut state = self.state.lock().await;
        while batch.len() < max {
            let Some(item) = state.items.pop_front() else {
                break;
            };
            self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
            batch.push(item);
        }
        batch
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drop_oldest_keeps_most_recent_in_order() {
        let cfg = BackpressureConfig {
            max_size: 100,
            rate_limit_per_sec: 0.0,
            drop_oldest: true,
        };
        let queue = BackpressureQueue::new(cfg);
        for i in 0..150 {
            queue.put(i).await;
        }
        assert_eq!(queue.len().await, 100);
        assert_eq!(queue.stats.dropped.load(Ordering::Relaxed), 50);
        let mut drained = Vec::new();
        while let Some(item) = queue.get(Some(Duration::from_millis(10))).await {
            drained.push(item);
        }
        assert_eq!(drained, (50..150).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn drop_accounting_invariant_holds() {
        let cfg = BackpressureConfig {
            max_size: 10,
            rate_limit_per_sec: 0.0,
            drop_oldest: false,
        };
        let queue = BackpressureQueue::new(cfg);
        for i in 0..20 {
            queue.put(i).await;
        }
        for _ in 0..5 {
            queue.get(Some(Duration::from_millis(10))).await;
        }
        let enqueued = queue.stats.enqueued.load(Ordering::Relaxed);
        let dequeued = queue.stats.dequeued.load(Ordering::Relaxed);
        let dropped = queue.stats.dropped.load(Ordering::Relaxed);
        let current = queue.len().await as u64;
        assert_eq!(enqueued, dequeued + dropped + current);
    }

    #[tokio::test]
    async fn get_returns_none_on_timeout() {
        let queue: BackpressureQueue<i32> = BackpressureQueue::new(BackpressureConfig {
            max_size: 10,
            rate_limit_per_sec: 0.0,
            drop_oldest: true,
        });
        assert!(queue.get(Some(Duration::from_millis(20))).await.is_none());
    }
}
