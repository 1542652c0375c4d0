//! Batch predictor (C9): moving-average baseline and clamped linear regression.
//! Grounded on `original_source/ml/baseline.py` (`predict_moving_average`),
//! `ml_service/trainers/regression_trainer.py` (`predict_future_value_clamped`),
//! `ml_service/config/ml_config.py` (RegressionConfig defaults), and
//! `regression_model.py`'s `compute_trend`.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy)]
pub struct RegressionConfig {
    pub window_points: usize,
    pub min_points: usize,
    pub horizon_minutes: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
    pub ridge_alpha: f64,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            window_points: 500,
            min_points: 20,
            horizon_minutes: 10.0,
            min_confidence: 0.2,
            max_confidence: 0.95,
            ridge_alpha: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone)]
pub struct ForecastResult {
    pub predicted_value: f64,
    pub confidence: f64,
    pub trend: Option<Trend>,
}

/// Moving-average baseline over the last `window` values. Requires >= 2 values.
pub fn predict_moving_average(values: &[f64], window: usize) -> Option<ForecastResult> {
    if values.len() < 2 {
        return None;
    }
    let start = values.len().saturating_sub(window);
    let slice = &values[start..];
    let predicted_value = slice.iter().sum::<f64>() / slice.len() as f64;
    let confidence = (slice.len() as f64 / window as f64).min(1.0);
    Some(ForecastResult {
        predicted_value,
        confidence,
        trend: None,
    })
}

/// Ordinary least squares fit of y = a + b*t (t in minutes since `series[0].0`).
/// Returns (intercept, slope, r_squared).
fn fit_ols(series: &[(f64, f64)]) -> Option<(f64, f64, f64)> {
    let n = series.len() as f64;
    if n < 2.0 {
        return None;
    }
    let sum_t: f64 = series.iter().map(|(t, _)| t).sum();
    let sum_y: f64 = series.iter().map(|(_, y)| y).sum();
    let sum_tt: f64 = series.iter().map(|(t, _)| t * t).sum();
    let sum_ty: f64 = series.iter().map(|(t, y)| t * y).sum();

    let denom = n * sum_tt - sum_t * sum_t;
    if denom.abs() < 1e-12 {
        return None;
    }
    let b = (n * sum_ty - sum_t * sum_y) / denom;
    let a = (sum_y - b * sum_t) / n;

    let mean_y = sum_y / n;
    let ss_tot: f64 = series.iter().map(|(_, y)| (y - mean_y).powi(2)).sum();
    let ss_res: f64 = series.iter().map(|(t, y)| (y - (a + b * t)).powi(2)).sum();
    let r_squared = if ss_tot.abs() < 1e-12 { 0.0 } else { 1.0 - ss_res / ss_tot };

    Some((a, b, r_squared))
}

/// Ridge regression (L2-penalized OLS) fit, alpha penalizing the slope term.
fn fit_ridge(series: &[(f64, f64)], alpha: f64) -> Option<(f64, f64, f64)> {
    let n = series.len() as f64;
    if n < 2.0 {
        return None;
    }
    let sum_t: f64 = series.iter().map(|(t, _)| t).sum();
    let sum_y: f64 = series.iter().map(|(_, y)| y).sum();
    let sum_tt: f64 = series.iter().map(|(t, _)| t * t).sum();
    let sum_ty: f64 = series.iter().map(|(t, y)| t * y).sum();

    let denom = n * (sum_tt + alpha) - sum_t * sum_t;
    if denom.abs() < 1e-12 {
        return None;
    }
    let b = (n * sum_ty - sum_t * sum_y) / denom;
    let a = (sum_y - b * sum_t) / n;

    let mean_y = sum_y / n;
    let ss_tot: f64 = series.iter().map(|(_, y)| (y - mean_y).powi(2)).sum();
    let ss_res: f64 = series.iter().map(|(t, y)| (y - (a + b * t)).powi(2)).sum();
    let r_squared = if ss_tot.abs() < 1e-12 { 0.0 } else { 1.0 - ss_res / ss_tot };

    Some((a, b, r_squared))
}

pub fn compute_trend(slope_per_minute: f64) -> Trend {
    const EPSILON: f64 = 1e-6;
    if slope_per_minute > EPSILON {
        Trend::Up
    } else if slope_per_minute < -EPSILON {
        Trend::Down
    } else {
        Trend::Stable
    }
}

/// Clamp bounds: the intersection of a change-based envelope around `last_value` and a
/// range-based envelope around the series' observed min/max (spec §4.9).
fn clamp_bounds(last_value: f64, series_min: f64, series_max: f64) -> (f64, f64) {
    let max_delta = (last_value.abs() * 0.5).max(1.0);
    let change_bounds = (last_value - max_delta, last_value + max_delta);
    let margin = (0.25 * (series_max - series_min)).max(1.0);
    let range_bounds = (series_min - margin, series_max + margin);

    let low = change_bounds.0.max(range_bounds.0);
    let high = change_bounds.1.min(range_bounds.1);
    if low <= high {
        (low, high)
    } else {
        (high, low)
    }
}

/// Clamped linear regression forecast. `use_ridge` selects ridge (alpha=cfg.ridge_alpha)
/// over plain OLS. Requires at least `cfg.min_points` over the last `cfg.window_points`.
pub fn predict_regression(
    readings: &[(DateTime<Utc>, f64)],
    cfg: &RegressionConfig,
    use_ridge: bool,
) -> Option<ForecastResult> {
    if readings.len() < cfg.min_points {
        return None;
    }
    let start = readings.len().saturating_sub(cfg.window_points);
    let window = &readings[start..];
    let first_ts = window[0].0;
    let series: Vec<(f64, f64)> = window
        .iter()
        .map(|(ts, v)| ((*ts - first_ts).num_milliseconds() as f64 / 60_000.0, *v))
        .collect();

    let (a, b, r_squared) = if use_ridge {
        fit_ridge(&series, cfg.ridge_alpha)?
    } else {
        fit_ols(&series)?
    };

    let last_value = window.last().unwrap().1;
    let series_min = window.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min);
    let series_max = window.iter().map(|(_, v)| *v).fold(f64::NEG_INFINITY, f64::max);

    let t_last = series.last().unwrap().0;
    let y_raw = a + b * (t_last + cfg.horizon_minutes);

    let (low, high) = clamp_bounds(last_value, series_min, series_max);
    let predicted_value = y_raw.clamp(low, high);

    let confidence = r_squared.clamp(cfg.min_confidence, cfg.max_confidence);

    Some(ForecastResult {
        predicted_value,
        confidence,
        trend: Some(compute_trend(b)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn moving_average_requires_two_values() {
        assert!(predict_moving_average(&[1.0], 60).is_none());
        let result = predict_moving_average(&[10.0, 20.0, 30.0], 60).unwrap();
        assert!((result.predicted_value - 20.0).abs() < 1e-9);
    }

    #[test]
    fn moving_average_confidence_caps_at_one() {
        let values: Vec<f64> = (0..100).map(|v| v as f64).collect();
        let result = predict_moving_average(&values, 60).unwrap();
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn clamp_bound_never_exceeds_p10_envelope() {
        let last_value = 50.0;
        let series_min = 40.0;
        let series_max = 60.0;
        let (low, high) = clamp_bounds(last_value, series_min, series_max);
        let max_allowed = (last_value.abs() * 0.5).max(1.0) + (series_max - series_min) * 0.25 + 1.0;
        assert!(high - last_value <= max_allowed + 1e-9);
        assert!(last_value - low <= max_allowed + 1e-9);
    }

    #[test]
    fn regression_requires_min_points() {
        let now = Utc::now();
        let readings: Vec<(DateTime<Utc>, f64)> =
            (0..5).map(|i| (now + Duration::minutes(i), 10.0 + i as f64)).collect();
        let cfg = RegressionConfig::default();
        assert!(predict_regression(&readings, &cfg, false).is_none());
    }

    #[test]
    fn regression_on_linear_series_predicts_increasing_trend() {
        let now = Utc::now();
        let readings: Vec<(DateTime<Utc>, f64)> =
            (0..30).map(|i| (now + Duration::minutes(i), 10.0 + i as f64 * 0.5)).collect();
        let cfg = RegressionConfig::default();
        let result = predict_regression(&readings, &cfg, false).expect("forecast");
        assert_eq!(result.trend, Some(Trend::Up));
        assert!(result.confidence >= cfg.min_confidence);
    }

    #[test]
    fn compute_trend_classifies_stable_for_near_zero_slope() {
        assert_eq!(compute_trend(0.0), Trend::Stable);
        assert_eq!(compute_trend(1.0), Trend::Up);
        assert_eq!(compute_trend(-1.0), Trend::Down);
    }
}
