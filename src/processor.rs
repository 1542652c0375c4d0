//! Async processor (C7): worker-pool consumer draining a C6 queue into a downstream
//! `process` callback. Grounded on
//! `original_source/ingest_api/mqtt/async_processor.py`; shape mirrors the teacher's
//! `pipeline.rs::spawn_worker` (batching background task over an `mpsc` queue).

use crate::queue::{BackpressureConfig, BackpressureQueue};
use crate::types::Reading;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const WORKER_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct AsyncProcessorConfig {
    pub enabled: bool,
    pub queue_size: usize,
    pub num_workers: usize,
}

impl AsyncProcessorConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: crate::config::env_parse("ML_MQTT_ASYNC_PROCESSING", true),
            queue_size: crate::config::env_parse("ML_MQTT_QUEUE_SIZE", 1_000),
            num_workers: crate::config::env_parse("ML_MQTT_NUM_WORKERS", 4),
        }
    }
}

#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub processed: AtomicU64,
    pub errors: AtomicU64,
}

pub struct AsyncProcessor {
    queue: Arc<BackpressureQueue<Reading>>,
    stopping: Arc<AtomicBool>,
    pub stats: Arc<ProcessorStats>,
    workers: Vec<JoinHandle<()>>,
}

impl AsyncProcessor {
    /// Spawn `num_workers` tasks draining `queue` through `process`. `process` must be
    /// cheaply cloneable (an `Arc`-wrapped closure or a handle type) since each worker
    /// owns its own copy.
    pub fn start<F, Fut>(config: AsyncProcessorConfig, process: F) -> Self
    where
        F: Fn(Reading) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let queue = Arc::new(BackpressureQueue::new(BackpressureConfig {
            max_size: config.queue_size,
            rate_limit_per_sec: 0.0,
            drop_oldest: true,
        }));
        let stopping = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(ProcessorStats::default());
        let process = Arc::new(process);

        let mut workers = Vec::with_capacity(config.num_workers);
        for worker_id in 0..config.num_workers {
            let queue = queue.clone();
            let stopping = stopping.clone();
            let stats = stats.clone();
            let process = process.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let item = queue.get(Some(WORKER_POLL_TIMEOUT)).await;
                    match item {
                        Some(reading) => match process(reading).await {
                            Ok(()) => {
                                stats.processed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) => {
                                stats.errors.fetch_add(1, Ordering::Relaxed);
                                tracing::error!(worker_id, error = %err, "worker processing failed");
                            }
                        },
                        None => {
                            if stopping.load(Ordering::Relaxed) {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        Self {
            queue,
            stopping,
            stats,
            workers,
        }
    }

    /// Never blocks; returns false on queue-full so the bus callback is never stalled.
    pub async fn enqueue(&self, reading: Reading) -> bool {
        self.queue.put(reading).await
    }

    /// Mark stop, optionally drain, then join workers with a 5s deadline.
    pub async fn stop(mut self, drain: bool) {
        if drain {
            while self.queue.len().await > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        self.stopping.store(true, Ordering::Relaxed);
        for handle in self.workers.drain(..) {
            let _ = tokio::time::timeout(JOIN_TIMEOUT, handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_reading() -> Reading {
        Reading {
            sensor_id: Some(1),
            device_uuid: Uuid::new_v4(),
            sensor_uuid: Uuid::new_v4(),
            sensor_type: Some("temperature".into()),
            value: 22.0,
            device_ts: None,
            ingested_ts: chrono::Utc::now(),
            sequence: None,
        }
    }

    #[tokio::test]
    async fn enqueue_never_blocks_on_full_queue() {
        let processed = Arc::new(AtomicU64::new(0));
        let processed_clone = processed.clone();
        let processor = AsyncProcessor::start(
            AsyncProcessorConfig {
                enabled: true,
                queue_size: 2,
                num_workers: 1,
            },
            move |_reading| {
                let processed_clone = processed_clone.clone();
                async move {
                    processed_clone.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
            },
        );
        for _ in 0..10 {
            processor.enqueue(sample_reading()).await;
        }
        processor.stop(true).await;
        assert!(processed.load(Ordering::Relaxed) > 0);
    }
}
