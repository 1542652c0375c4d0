//! Delta-spike detector (C4): z-score plus sign-change oscillation over a rolling
//! per-sensor value history. Grounded on
//! `original_source/ingest_api/delta_spike_detector.py`.
//!
//! Open Question (b): `z` is computed as `(|current_delta| - mean) / stdev` of the
//! *absolute* deltas. This is not a textbook z-score, but it is exactly what the
//! grounding source computes, and spec §9 directs us to reproduce it as-is.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

pub const DEFAULT_WINDOW_SIZE: usize = 20;
pub const Z_THRESHOLD: f64 = 3.0;
pub const OSCILLATION_THRESHOLD: f64 = 0.7;
pub const MIN_SAMPLES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpikeSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct SpikeResult {
    pub is_spike: bool,
    pub z_score: f64,
    pub oscillation_ratio: f64,
    pub severity: SpikeSeverity,
    pub reason: String,
}

struct Sample {
    value: f64,
    #[allow(dead_code)]
    ts: DateTime<Utc>,
}

pub struct DeltaSpikeDetector {
    window_size: usize,
    z_threshold: f64,
    oscillation_threshold: f64,
    per_sensor: Mutex<HashMap<i64, VecDeque<Sample>>>,
}

impl DeltaSpikeDetector {
    pub fn new(window_size: usize, z_threshold: f64, oscillation_threshold: f64) -> Self {
        Self {
            window_size,
            z_threshold,
            oscillation_threshold,
            per_sensor: Mutex::new(HashMap::new()),
        }
    }

    /// Seed a sensor's cache on cold start from a bounded persistence read (Q-RECENT).
    pub async fn seed_cache(&self, sensor_id: i64, history: Vec<(f64, DateTime<Utc>)>) {
        let mut guard = self.per_sensor.lock().await;
        let deque = guard.entry(sensor_id).or_default();
        for (value, ts) in history.into_iter().filter(|(v, _)| v.is_finite()) {
            deque.push_back(Sample { value, ts });
        }
        while deque.len() > 2 * self.window_size {
            deque.pop_front();
        }
    }

    /// Evaluate a new value against the sensor's history. Does **not** mutate the
    /// cache; call `update_cache` explicitly after persistence succeeds.
    pub async fn detect_spike(&self, sensor_id: i64, value: f64) -> Option<SpikeResult> {
        let guard = self.per_sensor.lock().await;
        let Some(deque) = guard.get(&sensor_id) else {
            return None;
        };
        if deque.len() < MIN_SAMPLES {
            return None;
        }

        let values: Vec<f64> = deque.iter().map(|s| s.value).collect();
        let abs_deltas: Vec<f64> = values.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
        let signed_deltas: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();

        let n = abs_deltas.len() as f64;
        let mean = abs_deltas.iter().sum::<f64>() / n;
        let mut std_dev = if abs_deltas.len() >= 2 {
            // Bessel-corrected sample standard deviation.
            let variance = abs_deltas.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1.0);
            variance.sqrt()
        } else {
            0.01
        };
        std_dev = std_dev.max(0.001);

        let last_value = *values.last().unwrap();
        let current_delta = value - last_value;
        let z = (current_delta.abs() - mean) / std_dev;

        let oscillation_ratio = if signed_deltas.len() >= 2 {
            let flips = signed_deltas
                .windows(2)
                .filter(|w| w[0] * w[1] < 0.0)
                .count();
            flips as f64 / signed_deltas.len() as f64
        } else {
            0.0
        };

        let is_spike = z > self.z_threshold || oscillation_ratio > self.oscillation_threshold;
        if !is_spike {
            return None;
        }

        let severity = if z > 2.0 * self.z_threshold {
            SpikeSeverity::Critical
        } else {
            SpikeSeverity::Warning
        };
        let reason = if z > self.z_threshold {
            format!("z={z:.3} exceeds threshold={0:.3}", self.z_threshold)
        } else {
            format!(
                "oscillation={oscillation_ratio:.3} exceeds threshold={0:.3}",
                self.oscillation_threshold
            )
        };

        Some(SpikeResult {
            is_spike,
            z_score: z,
            oscillation_ratio,
            severity,
            reason,
        })
    }

    /// Explicit post-persistence cache update; trims to `2 * window_size`.
    pub async fn update_cache(&self, sensor_id: i64, value: f64, ts: DateTime<Utc>) {
        let mut guard = self.per_sensor.lock().await;
        let deque = guard.entry(sensor_id).or_default();
        deque.push_back(Sample { value, ts });
        while deque.len() > 2 * self.window_size {
            deque.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn warm_up_returns_none_below_min_samples() {
        let detector = DeltaSpikeDetector::new(DEFAULT_WINDOW_SIZE, Z_THRESHOLD, OSCILLATION_THRESHOLD);
        let now = Utc::now();
        for i in 0..4 {
            detector.update_cache(1, 50.0 + i as f64 * 0.01, now).await;
        }
        assert!(detector.detect_spike(1, 70.0).await.is_none());
    }

    #[tokio::test]
    async fn stable_history_then_spike_flags_critical() {
        let detector = DeltaSpikeDetector::new(DEFAULT_WINDOW_SIZE, Z_THRESHOLD, OSCILLATION_THRESHOLD);
        let now = Utc::now();
        for i in 0..20 {
            let jitter = if i % 2 == 0 { 0.05 } else { -0.05 };
            detector.update_cache(1, 50.0 + jitter, now).await;
        }
        let result = detector.detect_spike(1, 70.0).await.expect("spike expected");
        assert!(result.is_spike);
        assert!(result.z_score >= 100.0 || result.z_score > Z_THRESHOLD);
        assert_eq!(result.severity, SpikeSeverity::Critical);
    }

    #[tokio::test]
    async fn stable_history_flags_spike_above_the_stdev_floor() {
        let detector = DeltaSpikeDetector::new(DEFAULT_WINDOW_SIZE, Z_THRESHOLD, OSCILLATION_THRESHOLD);
        let now = Utc::now();
        for _ in 0..20 {
            detector.update_cache(1, 50.0, now).await;
        }
        // zero-variance history clamps std_dev to the 0.001 floor, so even a 0.01 delta
        // is 10 sigma out; this is not a spurious trigger, it's the floor working as
        // designed against a perfectly flat signal.
        let result = detector.detect_spike(1, 50.01).await.expect("spike expected");
        assert!(result.is_spike);
        assert_eq!(result.severity, SpikeSeverity::Critical);
    }

    #[tokio::test]
    async fn stable_history_no_spike_within_the_stdev_floor() {
        let detector = DeltaSpikeDetector::new(DEFAULT_WINDOW_SIZE, Z_THRESHOLD, OSCILLATION_THRESHOLD);
        let now = Utc::now();
        for _ in 0..20 {
            detector.update_cache(1, 50.0, now).await;
        }
        // delta of 0.0001 against the 0.001-floored std_dev gives z=0.1, well under threshold.
        assert!(detector.detect_spike(1, 50.0001).await.is_none());
    }
}
