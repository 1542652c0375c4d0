//! Numeric guards (C1): finiteness, physical limits, timestamp skew, sensor-id validity.
//!
//! Grounded on `original_source/ingest_api/common/guards.py` (PHYSICAL_LIMITS,
//! ValidationResult, validate_reading_value/validate_timestamp/validate_sensor_id).

use crate::types::{PipelineOutcome, Reading};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

pub const MAX_FUTURE_SECONDS: i64 = 300;
pub const MAX_PAST_DAYS: i64 = 30;

fn physical_limits(sensor_type: &str) -> Option<(f64, f64)> {
    match sensor_type {
        "temperature" => Some((-100.0, 500.0)),
        "humidity" => Some((0.0, 100.0)),
        "pressure" => Some((0.0, 2000.0)),
        "air_quality" => Some((0.0, 10_000.0)),
        "voltage" => Some((0.0, 1000.0)),
        "power" => Some((0.0, 1_000_000.0)),
        "pH" => Some((0.0, 14.0)),
        _ => None,
    }
}

/// Sensor types whose physical rest state never reads an honest zero; a zero reading
/// for one of these is annotated (never rejected) per `suspicious_readings.py`.
fn zero_is_suspicious(sensor_type: &str) -> bool {
    matches!(sensor_type, "voltage" | "pressure")
}

/// Guard a single reading's value against NaN/Inf and the sensor type's physical range.
pub fn validate_reading_value(value: f64, sensor_type: Option<&str>) -> PipelineOutcome<()> {
    if value.is_nan() {
        return PipelineOutcome::Rejected {
            reason: "VALUE_IS_NAN",
            details: json!({ "value": "NaN" }),
        };
    }
    if value.is_infinite() {
        return PipelineOutcome::Rejected {
            reason: "VALUE_IS_INFINITE",
            details: json!({ "value": value.is_sign_positive() }),
        };
    }
    if let Some(sensor_type) = sensor_type {
        if let Some((lo, hi)) = physical_limits(sensor_type) {
            if value < lo || value > hi {
                return PipelineOutcome::Rejected {
                    reason: "VALUE_OUTSIDE_PHYSICAL_LIMITS",
                    details: json!({ "value": value, "min": lo, "max": hi, "sensor_type": sensor_type }),
                };
            }
        }
        if value == 0.0 && zero_is_suspicious(sensor_type) {
            tracing::warn!(sensor_type, "SUSPICIOUS_ZERO_VALUE");
        }
    }
    PipelineOutcome::Ok(())
}

pub fn validate_timestamp(device_ts: Option<DateTime<Utc>>, reference: DateTime<Utc>) -> PipelineOutcome<()> {
    let Some(ts) = device_ts else {
        return PipelineOutcome::Ok(());
    };
    let delta = ts - reference;
    if delta > Duration::seconds(MAX_FUTURE_SECONDS) {
        return PipelineOutcome::Rejected {
            reason: "TIMESTAMP_TOO_FAR_FUTURE",
            details: json!({ "device_ts": ts.to_rfc3339(), "max_future_seconds": MAX_FUTURE_SECONDS }),
        };
    }
    if reference - ts > Duration::days(MAX_PAST_DAYS) {
        return PipelineOutcome::Rejected {
            reason: "TIMESTAMP_TOO_FAR_PAST",
            details: json!({ "device_ts": ts.to_rfc3339(), "max_past_days": MAX_PAST_DAYS }),
        };
    }
    PipelineOutcome::Ok(())
}

pub fn validate_sensor_id(sensor_id: Option<i64>) -> PipelineOutcome<()> {
    match sensor_id {
        Some(id) if id > 0 => PipelineOutcome::Ok(()),
        Some(id) => PipelineOutcome::Rejected {
            reason: "INVALID_SENSOR_ID",
            details: json!({ "sensor_id": id }),
        },
        None => PipelineOutcome::Rejected {
            reason: "INVALID_SENSOR_ID",
            details: json!({ "sensor_id": null }),
        },
    }
}

/// Run all three guards in fixed order; first failure short-circuits.
pub fn guard_reading(reading: &Reading, reference: DateTime<Utc>) -> PipelineOutcome<()> {
    if let outcome @ PipelineOutcome::Rejected { .. } =
        validate_reading_value(reading.value, reading.sensor_type.as_deref())
    {
        return outcome;
    }
    if let outcome @ PipelineOutcome::Rejected { .. } = validate_timestamp(reading.device_ts, reference) {
        return outcome;
    }
    if let outcome @ PipelineOutcome::Rejected { .. } = validate_sensor_id(reading.sensor_id) {
        return outcome;
    }
    PipelineOutcome::Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_nan_and_infinite() {
        assert!(matches!(
            validate_reading_value(f64::NAN, None),
            PipelineOutcome::Rejected { reason: "VALUE_IS_NAN", .. }
        ));
        assert!(matches!(
            validate_reading_value(f64::INFINITY, None),
            PipelineOutcome::Rejected { reason: "VALUE_IS_INFINITE", .. }
        ));
        assert!(matches!(
            validate_reading_value(f64::NEG_INFINITY, None),
            PipelineOutcome::Rejected { reason: "VALUE_IS_INFINITE", .. }
        ));
    }

    #[test]
    fn rejects_out_of_physical_range() {
        assert!(matches!(
            validate_reading_value(150.0, Some("humidity")),
            PipelineOutcome::Rejected { reason: "VALUE_OUTSIDE_PHYSICAL_LIMITS", .. }
        ));
    }

    #[test]
    fn unknown_sensor_type_skips_range_check() {
        assert!(validate_reading_value(1e9, Some("unknown_widget")).is_ok());
    }

    #[test]
    fn accepts_value_within_limits() {
        assert!(validate_reading_value(22.5, Some("temperature")).is_ok());
    }

    #[test]
    fn null_timestamp_passes() {
        assert!(validate_timestamp(None, Utc::now()).is_ok());
    }

    #[test]
    fn rejects_future_timestamp() {
        let now = Utc::now();
        let ts = now + Duration::seconds(MAX_FUTURE_SECONDS + 1);
        assert!(matches!(
            validate_timestamp(Some(ts), now),
            PipelineOutcome::Rejected { reason: "TIMESTAMP_TOO_FAR_FUTURE", .. }
        ));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let now = Utc::now();
        let ts = now - Duration::days(MAX_PAST_DAYS + 1);
        assert!(matches!(
            validate_timestamp(Some(ts), now),
            PipelineOutcome::Rejected { reason: "TIMESTAMP_TOO_FAR_PAST", .. }
        ));
    }

    #[test]
    fn rejects_non_positive_sensor_id() {
        assert!(matches!(
            validate_sensor_id(Some(0)),
            PipelineOutcome::Rejected { reason: "INVALID_SENSOR_ID", .. }
        ));
        assert!(matches!(
            validate_sensor_id(None),
            PipelineOutcome::Rejected { reason: "INVALID_SENSOR_ID", .. }
        ));
    }
}
