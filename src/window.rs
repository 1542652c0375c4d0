//! Sliding-window buffer (C3): per-sensor ring of recent (ts, value) with multi-window
//! aggregates. Grounded on `original_source/ml_service/sliding_window_buffer.py`.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

pub const DEFAULT_MAX_HORIZON_SECONDS: i64 = 10;
pub const DEFAULT_WINDOW_SECONDS: &[i64] = &[1, 5, 10];

#[derive(Debug, Clone, Copy)]
struct Point {
    ts: DateTime<Utc>,
    value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: f64,
    pub count: usize,
    pub last: f64,
    pub trend_slope: f64,
}

pub struct SlidingWindowBuffer {
    max_horizon_seconds: i64,
    window_seconds: Vec<i64>,
    per_sensor: Mutex<HashMap<i64, VecDeque<Point>>>,
}

impl SlidingWindowBuffer {
    pub fn new(max_horizon_seconds: i64, window_seconds: Vec<i64>) -> Self {
        Self {
            max_horizon_seconds,
            window_seconds,
            per_sensor: Mutex::new(HashMap::new()),
        }
    }

    /// Append a reading, trim to `max_horizon_seconds`, and return stats keyed `"w{n}"`.
    pub async fn add_reading(
        &self,
        sensor_id: i64,
        ts: DateTime<Utc>,
        value: f64,
    ) -> HashMap<String, WindowStats> {
        let mut guard = self.per_sensor.lock().await;
        let deque = guard.entry(sensor_id).or_default();
        deque.push_back(Point { ts, value });

        let cutoff = ts - chrono::Duration::seconds(self.max_horizon_seconds);
        while let Some(front) = deque.front() {
            if front.ts < cutoff {
                deque.pop_front();
            } else {
                break;
            }
        }

        let mut out = HashMap::new();
        for &window_seconds in &self.window_seconds {
            let window_cutoff = ts - chrono::Duration::seconds(window_seconds);
            let points: Vec<Point> = deque.iter().copied().filter(|p| p.ts >= window_cutoff).collect();
            if points.is_empty() {
                continue;
            }
            out.insert(format!("w{window_seconds}"), compute_stats(&points));
        }
        out
    }
}

fn compute_stats(points: &[Point]) -> WindowStats {
    let n = points.len() as f64;
    let sum: f64 = points.iter().map(|p| p.value).sum();
    let mean = sum / n;
    let min = points.iter().map(|p| p.value).fold(f64::INFINITY, f64::min);
    let max = points.iter().map(|p| p.value).fold(f64::NEG_INFINITY, f64::max);
    let std_dev = if points.len() <= 1 {
        0.0
    } else {
        let variance: f64 = points.iter().map(|p| (p.value - mean).powi(2)).sum::<f64>() / n;
        variance.sqrt()
    };
    let last = points.last().unwrap().value;
    let trend_slope = if points.len() <= 1 {
        0.0
    } else {
        let first = points.first().unwrap();
        let last_point = points.last().unwrap();
        let dt = (last_point.ts - first.ts).num_milliseconds() as f64 / 1000.0;
        (last_point.value - first.value) / dt.max(1e-3)
    };
    WindowStats {
        mean,
        min,
        max,
        std_dev,
        count: points.len(),
        last,
        trend_slope,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_point_has_zero_std_dev_and_slope() {
        let buf = SlidingWindowBuffer::new(DEFAULT_MAX_HORIZON_SECONDS, DEFAULT_WINDOW_SECONDS.to_vec());
        let now = Utc::now();
        let stats = buf.add_reading(1, now, 50.0).await;
        let w = stats.get("w1").expect("w1 present");
        assert_eq!(w.std_dev, 0.0);
        assert_eq!(w.trend_slope, 0.0);
        assert_eq!(w.count, 1);
    }

    #[tokio::test]
    async fn trims_entries_older_than_max_horizon() {
        let buf = SlidingWindowBuffer::new(2, vec![1, 2]);
        let t0 = Utc::now();
        buf.add_reading(1, t0, 10.0).await;
        buf.add_reading(1, t0 + chrono::Duration::seconds(3), 20.0).await;
        let guard = buf.per_sensor.lock().await;
        let deque = guard.get(&1).unwrap();
        assert_eq!(deque.len(), 1);
        assert_eq!(deque.front().unwrap().value, 20.0);
    }

    #[tokio::test]
    async fn empty_windows_are_omitted() {
        let buf = SlidingWindowBuffer::new(10, vec![1, 5, 10]);
        let t0 = Utc::now();
        buf.add_reading(1, t0, 10.0).await;
        let stats = buf.add_reading(1, t0 + chrono::Duration::seconds(8), 20.0).await;
        assert!(!stats.contains_key("w1"));
        assert!(stats.contains_key("w10"));
    }
}
