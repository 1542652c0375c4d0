//! MQTT bus listener, replacing the teacher's `mqtt.rs`/`telemetry.rs` pair: reconnect
//! loop over `rumqttc::EventLoop`, wire payload parsed into a `Reading` via simd-json,
//! handed to C6's backpressure queue. The bus callback itself must never block (spec
//! §5) — `queue.put` is the only suspension point here, and it never waits unbounded.
//!
//! Topic shape: `{prefix}/{device_uuid}/{sensor_uuid}/telemetry`. Grounded on the
//! teacher's `apps/telemetry-sidecar/src/mqtt.rs` (reconnect loop, subscribe-then-poll
//! shape) and `telemetry.rs` (borrowed-payload simd-json parsing), generalized from a
//! single "metric" wire shape to this domain's `Reading`.

use crate::config::Config;
use crate::processor::AsyncProcessor;
use crate::types::Reading;
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Deserialize;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct BorrowedReading<'a> {
    value: f64,
    #[serde(default, borrow)]
    device_ts: Option<BorrowedTimestamp<'a>>,
    #[serde(default, borrow)]
    sensor_type: Option<&'a str>,
    #[serde(default)]
    sequence: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BorrowedTimestamp<'a> {
    Str(&'a str),
    Int(i64),
    Float(f64),
}

impl<'a> BorrowedTimestamp<'a> {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            BorrowedTimestamp::Str(s) => {
                DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
            }
            BorrowedTimestamp::Int(ms) => millis_to_dt(*ms),
            BorrowedTimestamp::Float(ts) => millis_to_dt((*ts * 1000.0) as i64),
        }
    }
}

fn millis_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    let secs = ms / 1000;
    let nanos = ((ms % 1000) * 1_000_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

/// Parse one publish into a `Reading`. Returns `None` for topics outside the telemetry
/// shape or a malformed device/sensor uuid segment (logged, never fatal to the loop).
pub fn parse_reading_payload(topic_prefix: &str, topic: &str, payload: &mut [u8]) -> Result<Option<Reading>> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 4 || parts[0] != topic_prefix || parts[3] != "telemetry" {
        return Ok(None);
    }
    let Some(device_uuid) = Uuid::parse_str(parts[1].trim()).ok() else {
        return Ok(None);
    };
    let Some(sensor_uuid) = Uuid::parse_str(parts[2].trim()).ok() else {
        return Ok(None);
    };

    let borrowed: BorrowedReading = simd_json::from_slice(payload)?;
    let ingested_ts = Utc::now();
    let device_ts = borrowed.device_ts.as_ref().and_then(|t| t.to_datetime());

    Ok(Some(Reading {
        sensor_id: None,
        device_uuid,
        sensor_uuid,
        sensor_type: borrowed.sensor_type.map(str::to_string),
        value: borrowed.value,
        device_ts,
        ingested_ts,
        sequence: borrowed.sequence,
    }))
}

/// Reconnecting listener loop: subscribes to the telemetry wildcard and hands every
/// parsed reading to the C7 async processor (C6's intake queue). Runs until the
/// process is torn down; a dropped connection is logged and retried rather than
/// propagated.
pub async fn run_listener(config: Config, processor: Arc<AsyncProcessor>) -> Result<()> {
    let telemetry_filter = format!("{}/+/+/telemetry", config.mqtt_topic_prefix);

    loop {
        let mut mqttoptions = MqttOptions::new(config.mqtt_client_id.clone(), config.mqtt_host.clone(), config.mqtt_port);
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(username.clone(), config.mqtt_password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);

        if let Err(err) = client.subscribe(telemetry_filter.clone(), QoS::AtLeastOnce).await {
            tracing::warn!(error = %err, "failed to subscribe to telemetry feed; retrying");
            sleep(Duration::from_secs(2)).await;
            continue;
        }
        tracing::info!(topic = %telemetry_filter, "subscribed to telemetry feed");

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let mut payload = publish.payload.to_vec();
                    match parse_reading_payload(&config.mqtt_topic_prefix, &publish.topic, &mut payload) {
                        Ok(Some(reading)) => {
                            if !processor.enqueue(reading).await {
                                tracing::debug!(topic = %publish.topic, "reading dropped at intake queue");
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::warn!(error = %err, topic = %publish.topic, "failed to decode telemetry payload");
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_telemetry_topic() {
        let device = Uuid::new_v4();
        let sensor = Uuid::new_v4();
        let topic = format!("telemetry/{device}/{sensor}/telemetry");
        let mut payload = format!(r#"{{"value": 22.5, "sensor_type": "temperature", "sequence": 7}}"#).into_bytes();
        let reading = parse_reading_payload("telemetry", &topic, &mut payload).unwrap().unwrap();
        assert_eq!(reading.device_uuid, device);
        assert_eq!(reading.sensor_uuid, sensor);
        assert_eq!(reading.value, 22.5);
        assert_eq!(reading.sequence, Some(7));
        assert_eq!(reading.sensor_type.as_deref(), Some("temperature"));
    }

    #[test]
    fn ignores_topics_outside_telemetry_shape() {
        let mut payload = b"{}".to_vec();
        assert!(parse_reading_payload("telemetry", "telemetry/abc/status", &mut payload)
            .unwrap()
            .is_none());
    }

    #[test]
    fn ignores_malformed_uuid_segment() {
        let mut payload = br#"{"value": 1.0}"#.to_vec();
        assert!(parse_reading_payload("telemetry", "telemetry/not-a-uuid/also-not/telemetry", &mut payload)
            .unwrap()
            .is_none());
    }
}
