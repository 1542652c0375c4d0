//! In-memory reading broker (C8): single-producer/single-consumer fan-out from ingest
//! to analytics, non-blocking publish with silent drop on full. Grounded on
//! `original_source/ml_service/in_memory_broker.py` and `reading_broker.py`.
//!
//! Open Question (c): the grounding source has no visible drop counter on silent-drop;
//! this implementation adds one (`BrokerStats::dropped`) without changing observable
//! behavior on the happy path.

use crate::types::Reading;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SUBSCRIBE_POLL_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_CAPACITY: usize = 100_000;

#[derive(Debug, Default)]
pub struct BrokerStats {
    pub published: AtomicU64,
    pub dropped: AtomicU64,
}

pub struct InMemoryReadingBroker {
    tx: mpsc::Sender<Reading>,
    rx: tokio::sync::Mutex<Option<mpsc::Receiver<Reading>>>,
    stopped: Arc<AtomicBool>,
    pub stats: Arc<BrokerStats>,
}

impl InMemoryReadingBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(Some(rx)),
            stopped: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(BrokerStats::default()),
        }
    }

    /// Non-blocking publish; silently drops (incrementing `stats.dropped`) on full.
    pub fn publish(&self, reading: Reading) {
        match self.tx.try_send(reading) {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    /// Blocking loop polling with a 500ms timeout; exits after `stop()` and drain.
    pub async fn subscribe(&self, mut handler: impl FnMut(Reading)) {
        let mut rx = match self.rx.lock().await.take() {
            Some(rx) => rx,
            None => return, // already subscribed elsewhere
        };
        loop {
            match tokio::time::timeout(SUBSCRIBE_POLL_TIMEOUT, rx.recv()).await {
                Ok(Some(reading)) => handler(reading),
                Ok(None) => break,
                Err(_) => {
                    if self.stopped.load(Ordering::Relaxed) {
                        // Drain whatever remains without further waiting.
                        while let Ok(reading) = rx.try_recv() {
                            handler(reading);
                        }
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn sample_reading() -> Reading {
        Reading {
            sensor_id: Some(1),
            device_uuid: Uuid::new_v4(),
            sensor_uuid: Uuid::new_v4(),
            sensor_type: None,
            value: 1.0,
            device_ts: None,
            ingested_ts: chrono::Utc::now(),
            sequence: None,
        }
    }

    #[tokio::test]
    async fn publish_beyond_capacity_drops_silently_with_counter() {
        let broker = InMemoryReadingBroker::new(2);
        for _ in 0..5 {
            broker.publish(sample_reading());
        }
        assert_eq!(broker.stats.published.load(Ordering::Relaxed), 2);
        assert_eq!(broker.stats.dropped.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn subscribe_drains_then_exits_after_stop() {
        let broker = Arc::new(InMemoryReadingBroker::new(10));
        for _ in 0..3 {
            broker.publish(sample_reading());
        }
        broker.stop();
        let received = Arc::new(Mutex::new(0));
        let received_clone = received.clone();
        broker
            .subscribe(move |_| {
                *received_clone.lock().unwrap() += 1;
            })
            .await;
        assert_eq!(*received.lock().unwrap(), 3);
    }
}
