use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

/// A single sensor sample as it arrives from the bus, before identity resolution.
#[derive(Debug, Clone)]
pub struct Reading {
    pub sensor_id: Option<i64>,
    pub device_uuid: Uuid,
    pub sensor_uuid: Uuid,
    pub sensor_type: Option<String>,
    pub value: f64,
    pub device_ts: Option<DateTime<Utc>>,
    pub ingested_ts: DateTime<Utc>,
    pub sequence: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    GreaterThan,
    LessThan,
    OutOfRange,
    EqualTo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
    Notice,
}

#[derive(Debug, Clone)]
pub struct ThresholdRule {
    pub id: i64,
    pub sensor_id: i64,
    pub condition: Condition,
    pub value_min: Option<f64>,
    pub value_max: Option<f64>,
    pub severity: Severity,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Watermark {
    pub sensor_id: i64,
    pub last_reading_id: i64,
    pub last_processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Prediction {
    pub id: i64,
    pub model_id: i64,
    pub sensor_id: i64,
    pub predicted_value: f64,
    pub confidence: f64,
    pub predicted_at: DateTime<Utc>,
    pub target_timestamp: DateTime<Utc>,
    pub is_anomaly: Option<bool>,
    pub anomaly_score: Option<f64>,
    pub explanation: Option<Json>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Critical,
    Warning,
    Notice,
}

impl From<Severity> for EventType {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Critical => EventType::Critical,
            Severity::Warning => EventType::Warning,
            Severity::Notice => EventType::Notice,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Active,
    Acknowledged,
    Resolved,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub device_id: i64,
    pub sensor_id: i64,
    pub prediction_id: Option<i64>,
    pub event_type: EventType,
    pub event_code: String,
    pub title: String,
    pub message: String,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub payload: Json,
}

pub const PRED_THRESHOLD_BREACH: &str = "PRED_THRESHOLD_BREACH";

/// The explicit result sum type replacing exception-driven control flow (spec §9).
#[derive(Debug)]
pub enum PipelineOutcome<T> {
    Ok(T),
    Rejected { reason: &'static str, details: Json },
    TransientError(anyhow::Error),
    Fatal(anyhow::Error),
}

impl<T> PipelineOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, PipelineOutcome::Ok(_))
    }
}
