//! Ingestion timing monitor (C5): per-sensor lag/delta/sequence stats and a global
//! health verdict. Grounded on `original_source/ingest_api/metrics/timing_stats.py`
//! and `metrics/service.py`'s `_assess_health`.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

const SAMPLE_CAP: usize = 100;
const LAG_WARN_MS: f64 = 200.0;
const OUT_OF_ORDER_FAIL_RATE: f64 = 0.01;

#[derive(Debug, Clone, Default)]
pub struct SensorTimingStats {
    pub last_sensor_ts: Option<DateTime<Utc>>,
    pub last_ingested_ts: Option<DateTime<Utc>>,
    pub last_sequence: Option<u64>,
    pub total_readings: u64,
    pub out_of_order: u64,
    pub delta_ms: VecDeque<f64>,
    pub lag_ms: VecDeque<f64>,
    pub expected_interval_ms: f64,
    pub tolerance_ms: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SampleAggregate {
    pub min: f64,
    pub mean: f64,
    pub max: f64,
    pub std_dev: f64,
}

fn aggregate(samples: &VecDeque<f64>) -> SampleAggregate {
    if samples.is_empty() {
        return SampleAggregate::default();
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let std_dev = if samples.len() <= 1 {
        0.0
    } else {
        (samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
    };
    SampleAggregate { min, mean, max, std_dev }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone)]
pub struct RecordResult {
    pub out_of_order: bool,
    pub within_tolerance: Option<bool>,
    pub lag_ms: Option<f64>,
}

pub struct TimingMonitor {
    expected_interval_ms: f64,
    tolerance_ms: f64,
    per_sensor: Mutex<HashMap<i64, SensorTimingStats>>,
}

impl TimingMonitor {
    pub fn new(expected_interval_ms: f64, tolerance_ms: f64) -> Self {
        Self {
            expected_interval_ms,
            tolerance_ms,
            per_sensor: Mutex::new(HashMap::new()),
        }
    }

    pub async fn record_reading(
        &self,
        sensor_id: i64,
        ingested_ts: DateTime<Utc>,
        sensor_ts: Option<DateTime<Utc>>,
        sequence: Option<u64>,
    ) -> RecordResult {
        let mut guard = self.per_sensor.lock().await;
        let stats = guard.entry(sensor_id).or_insert_with(|| SensorTimingStats {
            expected_interval_ms: self.expected_interval_ms,
            tolerance_ms: self.tolerance_ms,
            ..Default::default()
        });

        let mut lag_ms = None;
        if let Some(sensor_ts) = sensor_ts {
            let lag = (ingested_ts - sensor_ts).num_milliseconds() as f64;
            push_capped(&mut stats.lag_ms, lag);
            lag_ms = Some(lag);
            if lag > LAG_WARN_MS {
                tracing::warn!(sensor_id, lag_ms = lag, "ingestion lag exceeds threshold");
            }
        }

        let mut within_tolerance = None;
        if let (Some(sensor_ts), Some(last)) = (sensor_ts, stats.last_sensor_ts) {
            let delta = (sensor_ts - last).num_milliseconds() as f64;
            push_capped(&mut stats.delta_ms, delta);
            within_tolerance = Some((delta - stats.expected_interval_ms).abs() <= stats.tolerance_ms);
        }

        let mut out_of_order = false;
        if let (Some(seq), Some(last_seq)) = (sequence, stats.last_sequence) {
            if seq <= last_seq {
                stats.out_of_order += 1;
                out_of_order = true;
            }
        }

        if let Some(sensor_ts) = sensor_ts {
            stats.last_sensor_ts = Some(sensor_ts);
        }
        stats.last_ingested_ts = Some(ingested_ts);
        if let Some(seq) = sequence {
            stats.last_sequence = Some(seq);
        }
        stats.total_readings += 1;

        RecordResult {
            out_of_order,
            within_tolerance,
            lag_ms,
        }
    }

    pub async fn snapshot(&self, sensor_id: Option<i64>) -> HashMap<i64, SensorTimingStats> {
        let guard = self.per_sensor.lock().await;
        match sensor_id {
            Some(id) => guard
                .get(&id)
                .map(|stats| HashMap::from([(id, stats.clone())]))
                .unwrap_or_default(),
            None => guard.clone(),
        }
    }

    pub async fn health(&self) -> (HealthVerdict, Vec<String>) {
        let guard = self.per_sensor.lock().await;
        let mut reasons = Vec::new();
        let mut max_lag = 0.0f64;
        let mut total_readings = 0u64;
        let mut total_out_of_order = 0u64;

        for stats in guard.values() {
            let lag_agg = aggregate(&stats.lag_ms);
            max_lag = max_lag.max(lag_agg.max);
            total_readings += stats.total_readings;
            total_out_of_order += stats.out_of_order;
        }

        let out_of_order_rate = if total_readings == 0 {
            0.0
        } else {
            total_out_of_order as f64 / total_readings as f64
        };

        if out_of_order_rate > OUT_OF_ORDER_FAIL_RATE {
            reasons.push(format!("out-of-order rate {out_of_order_rate:.4} exceeds 1%"));
            return (HealthVerdict::Fail, reasons);
        }
        if max_lag > LAG_WARN_MS {
            reasons.push(format!("max lag {max_lag:.1}ms exceeds {LAG_WARN_MS}ms"));
            return (HealthVerdict::Warn, reasons);
        }
        (HealthVerdict::Pass, reasons)
    }
}

fn push_capped(deque: &mut VecDeque<f64>, value: f64) {
    deque.push_back(value);
    while deque.len() > SAMPLE_CAP {
        deque.pop_front();
    }
}

pub fn sample_aggregate(samples: &VecDeque<f64>) -> SampleAggregate {
    aggregate(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn out_of_order_increments_but_never_fatal() {
        let monitor = TimingMonitor::new(1000.0, 100.0);
        let now = Utc::now();
        let r1 = monitor.record_reading(1, now, Some(now), Some(10)).await;
        assert!(!r1.out_of_order);
        let r2 = monitor
            .record_reading(1, now + chrono::Duration::seconds(1), Some(now), Some(9))
            .await;
        assert!(r2.out_of_order);
        let (verdict, _) = monitor.health().await;
        assert_eq!(verdict, HealthVerdict::Pass);
    }

    #[tokio::test]
    async fn high_lag_produces_warn_verdict() {
        let monitor = TimingMonitor::new(1000.0, 100.0);
        let now = Utc::now();
        let sensor_ts = now - chrono::Duration::milliseconds(500);
        monitor.record_reading(1, now, Some(sensor_ts), None).await;
        let (verdict, reasons) = monitor.health().await;
        assert_eq!(verdict, HealthVerdict::Warn);
        assert!(!reasons.is_empty());
    }
}
