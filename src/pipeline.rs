//! Hot-path orchestrator: C7 worker hands a `Reading` here, which wires C2 resolver →
//! C1 guards → C11 persist → C5 timing → C3 window → C4 spike → C8 broker publish, in
//! the fixed order spec §2 names. Grounded on the teacher's `pipeline.rs::spawn_worker`
//! shape (an atomics `*Stats` struct alongside the orchestration function).

use crate::broker::InMemoryReadingBroker;
use crate::guards::guard_reading;
use crate::repository::SensorRepository;
use crate::resolver::IdentityResolver;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::spike::DeltaSpikeDetector;
use crate::timing::TimingMonitor;
use crate::types::{PipelineOutcome, Reading};
use crate::window::SlidingWindowBuffer;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub received: AtomicU64,
    pub persisted: AtomicU64,
    pub rejected: AtomicU64,
    pub spikes_detected: AtomicU64,
    pub errors: AtomicU64,
}

pub struct PipelineContext {
    pub repository: Arc<SensorRepository>,
    pub resolver: Arc<IdentityResolver>,
    pub window: Arc<SlidingWindowBuffer>,
    pub spike_detector: Arc<DeltaSpikeDetector>,
    pub timing: Arc<TimingMonitor>,
    pub broker: Arc<InMemoryReadingBroker>,
    pub retry: RetryConfig,
    pub stats: Arc<PipelineStats>,
}

/// Structured warn-log for a reading that could not be persisted, per spec §7's
/// dead-letter policy: ingestion persistence failures are never silently dropped.
fn dead_letter(reading: &Reading, err: &anyhow::Error) {
    tracing::warn!(
        sensor_id = ?reading.sensor_id,
        device_uuid = %reading.device_uuid,
        sensor_uuid = %reading.sensor_uuid,
        sequence = ?reading.sequence,
        error = %err,
        "DEAD_LETTER: reading could not be persisted"
    );
}

fn map_unit_rejection(outcome: PipelineOutcome<()>) -> PipelineOutcome<i64> {
    match outcome {
        PipelineOutcome::Rejected { reason, details } => PipelineOutcome::Rejected { reason, details },
        PipelineOutcome::TransientError(err) => PipelineOutcome::TransientError(err),
        PipelineOutcome::Fatal(err) => PipelineOutcome::Fatal(err),
        PipelineOutcome::Ok(()) => unreachable!("guard_reading only ever returns Ok or Rejected"),
    }
}

/// Run one reading through the hot path. Returns the persisted reading id on success.
pub async fn process_reading(ctx: &PipelineContext, mut reading: Reading) -> PipelineOutcome<i64> {
    ctx.stats.received.fetch_add(1, Ordering::Relaxed);

    if reading.sensor_id.is_none() {
        match ctx.resolver.resolve(reading.device_uuid, reading.sensor_uuid).await {
            Ok(id) => reading.sensor_id = id,
            Err(err) => {
                ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
                return PipelineOutcome::TransientError(err);
            }
        }
    }

    if let outcome @ PipelineOutcome::Rejected { .. } = guard_reading(&reading, Utc::now()) {
        ctx.stats.rejected.fetch_add(1, Ordering::Relaxed);
        if let PipelineOutcome::Rejected { reason, details } = &outcome {
            tracing::warn!(reason, %details, sensor_id = ?reading.sensor_id, "reading rejected by guards");
        }
        return map_unit_rejection(outcome);
    }

    let Some(sensor_id) = reading.sensor_id else {
        ctx.stats.rejected.fetch_add(1, Ordering::Relaxed);
        return PipelineOutcome::Rejected {
            reason: "UNRESOLVED_SENSOR_ID",
            details: serde_json::json!({
                "device_uuid": reading.device_uuid,
                "sensor_uuid": reading.sensor_uuid,
            }),
        };
    }

    let sequence = reading.sequence.and_then(|s| i64::try_from(s).ok());
    let value = reading.value;
    let device_ts = reading.device_ts;
    let ingested_ts = reading.ingested_ts;
    let repository = ctx.repository.clone();

    let persisted = retry_with_backoff(&ctx.retry, || {
        let repository = repository.clone();
        async move { repository.insert_reading(sensor_id, value, device_ts, ingested_ts, sequence).await }
    })
    .await;

    let reading_id = match persisted {
        Ok(id) => id,
        Err(err) => {
            dead_letter(&reading, &err);
            ctx.stats.errors.fetch_add(1, Ordering::Relaxed);
            return PipelineOutcome::TransientError(err);
        }
    };
    ctx.stats.persisted.fetch_add(1, Ordering::Relaxed);

    ctx.timing
        .record_reading(sensor_id, reading.ingested_ts, reading.device_ts, reading.sequence)
        .await;

    let window_ts = reading.device_ts.unwrap_or(reading.ingested_ts);
    ctx.window.add_reading(sensor_id, window_ts, reading.value).await;

    if let Some(result) = ctx.spike_detector.detect_spike(sensor_id, reading.value).await {
        ctx.stats.spikes_detected.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            sensor_id,
            z_score = result.z_score,
            oscillation_ratio = result.oscillation_ratio,
            severity = ?result.severity,
            reason = %result.reason,
            "delta spike detected"
        );
    }
    ctx.spike_detector.update_cache(sensor_id, reading.value, window_ts).await;

    ctx.broker.publish(reading);

    PipelineOutcome::Ok(reading_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_does_not_panic_on_missing_sensor_id() {
        let reading = Reading {
            sensor_id: None,
            device_uuid: uuid::Uuid::new_v4(),
            sensor_uuid: uuid::Uuid::new_v4(),
            sensor_type: None,
            value: 1.0,
            device_ts: None,
            ingested_ts: Utc::now(),
            sequence: None,
        };
        dead_letter(&reading, &anyhow::anyhow!("boom"));
    }
}
