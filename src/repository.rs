//! Sensor repository (C11): every Q-* persistence operation named in spec §6, plus the
//! watermark lifecycle. Grounded on
//! `original_source/ml_service/repository/sensor_repository.py` and
//! `jobs/ml_batch_runner.py`'s watermark helpers for the domain shape; the sqlx call
//! idiom (`query(...).bind(...).fetch_optional/fetch_one`, `try_get`,
//! `pool.begin()/tx.commit()`) is reused verbatim from the teacher's `ingest/db.rs`.

use crate::types::{Condition, Event, EventStatus, Severity, ThresholdRule, Watermark};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

pub struct SensorRepository {
    pool: PgPool,
}

fn round5(value: f64) -> f64 {
    (value * 100_000.0).round() / 100_000.0
}

impl SensorRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Q-RECENT: most recent `limit` (value, ts) rows for a sensor, descending ts.
    pub async fn recent_readings(&self, sensor_id: i64, limit: i64) -> anyhow::Result<Vec<(f64, DateTime<Utc>)>> {
        let rows = sqlx::query("SELECT value, ts FROM readings WHERE sensor_id = $1 ORDER BY ts DESC LIMIT $2")
            .bind(sensor_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| Ok((row.try_get::<f64, _>("value")?, row.try_get::<DateTime<Utc>, _>("ts")?)))
            .collect()
    }

    /// Q-COUNT-RECENT: count of readings within the last `hours` hours.
    pub async fn count_recent(&self, sensor_id: i64, hours: i64) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "SELECT count(*) AS n FROM readings WHERE sensor_id = $1 AND ts >= now() - ($2 || ' hours')::interval",
        )
        .bind(sensor_id)
        .bind(hours.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    /// Q-INSERT-READING: persist a validated, resolved reading. Values are rounded to 5
    /// decimal places to match persistence precision (spec §4.11). Returns the row id.
    pub async fn insert_reading(
        &self,
        sensor_id: i64,
        value: f64,
        device_ts: Option<DateTime<Utc>>,
        ingested_ts: DateTime<Utc>,
        sequence: Option<i64>,
    ) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "INSERT INTO readings (sensor_id, value, device_ts, ts, sequence) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(sensor_id)
        .bind(round5(value))
        .bind(device_ts)
        .bind(ingested_ts)
        .bind(sequence)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("id")?)
    }

    /// Q-ACTIVE-SENSORS: sensor ids with is_active = true (supplemental, §6).
    pub async fn active_sensors(&self) -> anyhow::Result<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM sensors WHERE is_active = true")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|row| Ok(row.try_get::<i64, _>("id")?)).collect()
    }

    /// Q-DEVICE-ID: the device id owning a sensor.
    pub async fn device_id_for_sensor(&self, sensor_id: i64) -> anyhow::Result<Option<i64>> {
        let row = sqlx::query("SELECT device_id FROM sensors WHERE id = $1")
            .bind(sensor_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get::<i64, _>("device_id")).transpose()?)
    }

    /// Q-MAX-READING-ID: highest persisted reading id for a sensor, used for cold-start
    /// watermark advancement.
    pub async fn max_reading_id(&self, sensor_id: i64) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT coalesce(max(id), 0) AS max_id FROM readings WHERE sensor_id = $1")
            .bind(sensor_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("max_id")?)
    }

    /// Q-WATERMARK-GET: current watermark, created lazily if absent (advanced to the
    /// current max reading id so cold start does not loop on an empty window).
    pub async fn get_or_create_watermark(&self, sensor_id: i64) -> anyhow::Result<Watermark> {
        if let Some(row) = sqlx::query("SELECT sensor_id, last_reading_id, last_processed_at FROM watermarks WHERE sensor_id = $1")
            .bind(sensor_id)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(Watermark {
                sensor_id: row.try_get("sensor_id")?,
                last_reading_id: row.try_get("last_reading_id")?,
                last_processed_at: row.try_get("last_processed_at")?,
            });
        }

        let last_reading_id = self.max_reading_id(sensor_id).await?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO watermarks (sensor_id, last_reading_id, last_processed_at) VALUES ($1, $2, $3) \
             ON CONFLICT (sensor_id) DO NOTHING",
        )
        .bind(sensor_id)
        .bind(last_reading_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Watermark {
            sensor_id,
            last_reading_id,
            last_processed_at: now,
        })
    }

    /// Q-WATERMARK-UPSERT: advance the watermark. Invariant (P8): never decreases.
    pub async fn advance_watermark(&self, sensor_id: i64, last_reading_id: i64) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO watermarks (sensor_id, last_reading_id, last_processed_at) VALUES ($1, $2, now()) \
             ON CONFLICT (sensor_id) DO UPDATE SET \
               last_reading_id = GREATEST(watermarks.last_reading_id, excluded.last_reading_id), \
               last_processed_at = excluded.last_processed_at",
        )
        .bind(sensor_id)
        .bind(last_reading_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Readings since the watermark, ascending by id (the batch path's read cursor).
    pub async fn readings_since_watermark(
        &self,
        sensor_id: i64,
        last_reading_id: i64,
    ) -> anyhow::Result<Vec<(i64, f64, DateTime<Utc>)>> {
        let rows = sqlx::query(
            "SELECT id, value, ts FROM readings WHERE sensor_id = $1 AND id > $2 ORDER BY id ASC",
        )
        .bind(sensor_id)
        .bind(last_reading_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok((
                    row.try_get::<i64, _>("id")?,
                    row.try_get::<f64, _>("value")?,
                    row.try_get::<DateTime<Utc>, _>("ts")?,
                ))
            })
            .collect()
    }

    /// Q-WARNING-THRESHOLD: first active threshold with severity=warning, condition=out_of_range.
    pub async fn warning_threshold(&self, sensor_id: i64) -> anyhow::Result<Option<ThresholdRule>> {
        self.threshold_query(
            "SELECT id, sensor_id, condition, value_min, value_max, severity, name, is_active \
             FROM threshold_rules WHERE sensor_id = $1 AND is_active = true \
               AND severity = 'warning' AND condition = 'out_of_range' \
             ORDER BY id LIMIT 1",
            sensor_id,
        )
        .await
    }

    /// Q-ACTIVE-THRESHOLD: first active threshold (any condition) ordered by id.
    pub async fn active_threshold(&self, sensor_id: i64) -> anyhow::Result<Option<ThresholdRule>> {
        self.threshold_query(
            "SELECT id, sensor_id, condition, value_min, value_max, severity, name, is_active \
             FROM threshold_rules WHERE sensor_id = $1 AND is_active = true ORDER BY id LIMIT 1",
            sensor_id,
        )
        .await
    }

    async fn threshold_query(&self, sql: &str, sensor_id: i64) -> anyhow::Result<Option<ThresholdRule>> {
        let row = sqlx::query(sql).bind(sensor_id).fetch_optional(&self.pool).await?;
        let Some(row) = row else { return Ok(None) };
        let condition: String = row.try_get("condition")?;
        let severity: String = row.try_get("severity")?;
        Ok(Some(ThresholdRule {
            id: row.try_get("id")?,
            sensor_id: row.try_get("sensor_id")?,
            condition: parse_condition(&condition),
            value_min: row.try_get("value_min")?,
            value_max: row.try_get("value_max")?,
            severity: parse_severity(&severity),
            name: row.try_get("name")?,
            is_active: row.try_get("is_active")?,
        }))
    }

    /// Q-ACTIVE-MODEL: most recent active model row, or insert a baseline row and
    /// return its id.
    pub async fn active_model_id(&self, sensor_id: i64) -> anyhow::Result<i64> {
        if let Some(row) = sqlx::query(
            "SELECT id FROM models WHERE sensor_id = $1 AND is_active = true ORDER BY created_at DESC LIMIT 1",
        )
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok(row.try_get::<i64, _>("id")?);
        }

        let row = sqlx::query(
            "INSERT INTO models (sensor_id, model_type, is_active, created_at) \
             VALUES ($1, 'moving_average', true, now()) RETURNING id",
        )
        .bind(sensor_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("id")?)
    }

    /// Q-INSERT-PREDICTION: persist a prediction, returns the inserted id.
    pub async fn insert_prediction(
        &self,
        model_id: i64,
        sensor_id: i64,
        predicted_value: f64,
        confidence: f64,
        target_timestamp: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "INSERT INTO predictions (model_id, sensor_id, predicted_value, confidence, predicted_at, target_timestamp) \
             VALUES ($1, $2, $3, $4, now(), $5) RETURNING id",
        )
        .bind(model_id)
        .bind(sensor_id)
        .bind(round5(predicted_value))
        .bind(confidence)
        .bind(target_timestamp)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("id")?)
    }

    /// Q-RECENT-EVENT: existence check for dedup within `minutes` of now.
    pub async fn has_recent_event(&self, sensor_id: i64, event_code: &str, minutes: i64) -> anyhow::Result<bool> {
        let row = sqlx::query(
            "SELECT exists( \
                SELECT 1 FROM events WHERE sensor_id = $1 AND event_code = $2 \
                  AND status IN ('active', 'acknowledged') \
                  AND created_at >= now() - ($3 || ' minutes')::interval \
             ) AS hit",
        )
        .bind(sensor_id)
        .bind(event_code)
        .bind(minutes.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<bool, _>("hit")?)
    }

    /// Q-INSERT-EVENT: emit the full event row.
    pub async fn insert_event(&self, event: &Event) -> anyhow::Result<i64> {
        let event_type = serde_json::to_value(event.event_type)?;
        let status = match event.status {
            EventStatus::Active => "active",
            EventStatus::Acknowledged => "acknowledged",
            EventStatus::Resolved => "resolved",
        };
        let row = sqlx::query(
            "INSERT INTO events (device_id, sensor_id, prediction_id, event_type, event_code, title, message, status, created_at, payload) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
        )
        .bind(event.device_id)
        .bind(event.sensor_id)
        .bind(event.prediction_id)
        .bind(event_type.as_str().unwrap_or("notice"))
        .bind(&event.event_code)
        .bind(&event.title)
        .bind(&event.message)
        .bind(status)
        .bind(event.created_at)
        .bind(&event.payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("id")?)
    }

    /// Transactional boundary for one batch pass on a single sensor: persist the
    /// prediction, optionally emit an event, and advance the watermark atomically.
    pub async fn commit_batch_pass(
        &self,
        sensor_id: i64,
        new_last_reading_id: i64,
        prediction_row: Option<(i64, f64, f64, DateTime<Utc>)>,
        event: Option<&Event>,
    ) -> anyhow::Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;
        let mut prediction_id = None;

        if let Some((model_id, predicted_value, confidence, target_timestamp)) = prediction_row {
            let row = sqlx::query(
                "INSERT INTO predictions (model_id, sensor_id, predicted_value, confidence, predicted_at, target_timestamp) \
                 VALUES ($1, $2, $3, $4, now(), $5) RETURNING id",
            )
            .bind(model_id)
            .bind(sensor_id)
            .bind(round5(predicted_value))
            .bind(confidence)
            .bind(target_timestamp)
            .fetch_one(&mut *tx)
            .await?;
            prediction_id = Some(row.try_get::<i64, _>("id")?);
        }

        if let Some(event) = event {
            let status = match event.status {
                EventStatus::Active => "active",
                EventStatus::Acknowledged => "acknowledged",
                EventStatus::Resolved => "resolved",
            };
            let event_type = serde_json::to_value(event.event_type)?;
            sqlx::query(
                "INSERT INTO events (device_id, sensor_id, prediction_id, event_type, event_code, title, message, status, created_at, payload) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(event.device_id)
            .bind(event.sensor_id)
            .bind(prediction_id.or(event.prediction_id))
            .bind(event_type.as_str().unwrap_or("notice"))
            .bind(&event.event_code)
            .bind(&event.title)
            .bind(&event.message)
            .bind(status)
            .bind(event.created_at)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO watermarks (sensor_id, last_reading_id, last_processed_at) VALUES ($1, $2, now()) \
             ON CONFLICT (sensor_id) DO UPDATE SET \
               last_reading_id = GREATEST(watermarks.last_reading_id, excluded.last_reading_id), \
               last_processed_at = excluded.last_processed_at",
        )
        .bind(sensor_id)
        .bind(new_last_reading_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(prediction_id)
    }
}

fn parse_condition(raw: &str) -> Condition {
    match raw {
        "greater_than" => Condition::GreaterThan,
        "less_than" => Condition::LessThan,
        "out_of_range" => Condition::OutOfRange,
        _ => Condition::EqualTo,
    }
}

fn parse_severity(raw: &str) -> Severity {
    match raw {
        "critical" => Severity::Critical,
        "notice" => Severity::Notice,
        _ => Severity::Warning,
    }
}

#[cfg(test)]
mod tests {
    use super::round5;

    #[test]
    fn round5_matches_persistence_precision() {
        assert_eq!(round5(1.0000049), 1.00000);
        assert_eq!(round5(1.0000051), 1.00001);
    }
}
