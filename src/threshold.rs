//! Threshold evaluator (C10): rule match + dedupe-windowed event emission. Grounded on
//! `original_source/jobs/ml_batch_runner.py`'s `_eval_pred_threshold_and_create_event`
//! and `_should_dedupe_event`.
//!
//! Open Question (a): `equal_to` is deliberately a literal `f64 ==` comparison, matching
//! the grounding source exactly. Do not "fix" this with an epsilon.

use crate::types::{Condition, Event, EventStatus, EventType, Prediction, ThresholdRule, PRED_THRESHOLD_BREACH};
use serde_json::json;

pub fn violates(rule: &ThresholdRule, predicted: f64) -> bool {
    match rule.condition {
        Condition::GreaterThan => rule.value_min.is_some_and(|min| predicted > min),
        Condition::LessThan => rule.value_min.is_some_and(|min| predicted < min),
        Condition::OutOfRange => {
            let below = rule.value_min.is_some_and(|min| predicted < min);
            let above = rule.value_max.is_some_and(|max| predicted > max);
            below || above
        }
        // Literal equality, preserved per Open Question (a).
        Condition::EqualTo => rule.value_min.is_some_and(|min| predicted == min),
    }
}

/// Build the event to emit for a confirmed threshold breach. Caller is responsible for
/// the dedup check (Q-RECENT-EVENT) before calling this.
pub fn build_event(device_id: i64, rule: &ThresholdRule, prediction: &Prediction) -> Event {
    let event_type: EventType = rule.severity.into();
    let title = format!("{} threshold breached", rule.name);
    let message = format!(
        "predicted value {:.5} breached rule #{} ({})",
        prediction.predicted_value, rule.id, rule.name
    );
    let payload = json!({
        "threshold_id": rule.id,
        "condition_type": rule.condition,
        "threshold_value_min": rule.value_min,
        "threshold_value_max": rule.value_max,
        "predicted_value": prediction.predicted_value,
    });

    Event {
        device_id,
        sensor_id: rule.sensor_id,
        prediction_id: Some(prediction.id),
        event_type,
        event_code: PRED_THRESHOLD_BREACH.to_string(),
        title,
        message,
        status: EventStatus::Active,
        created_at: prediction.predicted_at,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rule(condition: Condition, value_min: Option<f64>, value_max: Option<f64>) -> ThresholdRule {
        ThresholdRule {
            id: 1,
            sensor_id: 7,
            condition,
            value_min,
            value_max,
            severity: crate::types::Severity::Warning,
            name: "test-rule".into(),
            is_active: true,
        }
    }

    #[test]
    fn greater_than_violates_above_min() {
        let r = rule(Condition::GreaterThan, Some(30.0), None);
        assert!(violates(&r, 35.0));
        assert!(!violates(&r, 25.0));
    }

    #[test]
    fn out_of_range_requires_both_bounds() {
        let r = rule(Condition::OutOfRange, Some(10.0), Some(20.0));
        assert!(violates(&r, 5.0));
        assert!(violates(&r, 25.0));
        assert!(!violates(&r, 15.0));
    }

    #[test]
    fn equal_to_uses_literal_float_equality() {
        let r = rule(Condition::EqualTo, Some(42.0), None);
        assert!(violates(&r, 42.0));
        assert!(!violates(&r, 42.0000001));
    }

    #[test]
    fn build_event_cites_predicted_value_and_rule_id() {
        let r = rule(Condition::GreaterThan, Some(30.0), None);
        let prediction = Prediction {
            id: 99,
            model_id: 1,
            sensor_id: 7,
            predicted_value: 35.0,
            confidence: 0.8,
            predicted_at: Utc::now(),
            target_timestamp: Utc::now(),
            is_anomaly: None,
            anomaly_score: None,
            explanation: None,
        };
        let event = build_event(1, &r, &prediction);
        assert!(event.message.contains("35.00000"));
        assert!(event.message.contains("#1"));
        assert_eq!(event.event_code, PRED_THRESHOLD_BREACH);
    }
}
