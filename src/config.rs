//! `Config::from_env()` idiom, grounded on the teacher's `config.rs`: a single explicit
//! configuration record populated by `dotenvy::dotenv().ok()` plus
//! `env::var(...).ok().and_then(|v| v.parse().ok())`. The teacher's farm-dashboard
//! setup-config JSON override layer (`SetupConfigOverrides`/`apply_setup_overrides`) is
//! dropped entirely — see DESIGN.md; nothing in spec §6/§9 calls for a file-based
//! override mechanism on top of the environment.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Read `key` from the environment, falling back to `default` on absence or a parse
/// failure. Shared by every component's own `from_env()` (C6's `BackpressureConfig`,
/// C7's `AsyncProcessorConfig`, and this file).
pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,

    pub sensor_map_ttl_seconds: i64,

    pub mqtt_queue_max_size: usize,
    pub mqtt_rate_limit_per_sec: f64,
    pub mqtt_drop_oldest: bool,

    pub ml_mqtt_async_processing: bool,
    pub ml_mqtt_queue_size: usize,
    pub ml_mqtt_num_workers: usize,

    pub broker_queue_capacity: usize,

    pub ai_explainer_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("DATABASE_URL is required")?;
        let database_url = normalize_database_url(database_url);

        let database_max_connections = env_parse("DATABASE_MAX_CONNECTIONS", 10);

        let mqtt_host = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let mqtt_port = env_parse("MQTT_PORT", 1883);
        let mqtt_username = env::var("MQTT_USERNAME").ok();
        let mqtt_password = env::var("MQTT_PASSWORD").ok();
        let mqtt_topic_prefix = env::var("MQTT_TOPIC_PREFIX").unwrap_or_else(|_| "telemetry".to_string());
        let mqtt_keepalive_secs = env_parse("MQTT_KEEPALIVE_SECS", 30);
        let mqtt_client_id =
            env::var("MQTT_CLIENT_ID").unwrap_or_else(|_| format!("telemetry-core-{}", std::process::id()));

        let sensor_map_ttl_seconds = env_parse("SENSOR_MAP_TTL_SECONDS", 300);

        let mqtt_queue_max_size = env_parse("MQTT_QUEUE_MAX_SIZE", 10_000);
        let mqtt_rate_limit_per_sec = env_parse("MQTT_RATE_LIMIT_PER_SEC", 0.0);
        let mqtt_drop_oldest = env_parse("MQTT_DROP_OLDEST", true);

        let ml_mqtt_async_processing = env_parse("ML_MQTT_ASYNC_PROCESSING", true);
        let ml_mqtt_queue_size = env_parse("ML_MQTT_QUEUE_SIZE", 1_000);
        let ml_mqtt_num_workers = env_parse("ML_MQTT_NUM_WORKERS", 4);

        let broker_queue_capacity = env_parse("BROKER_QUEUE_CAPACITY", 100_000);

        let ai_explainer_url =
            env::var("AI_EXPLAINER_URL").unwrap_or_else(|_| "http://localhost:8003".to_string());

        Ok(Self {
            database_url,
            database_max_connections,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_topic_prefix,
            mqtt_keepalive_secs,
            mqtt_client_id,
            sensor_map_ttl_seconds,
            mqtt_queue_max_size,
            mqtt_rate_limit_per_sec,
            mqtt_drop_oldest,
            ml_mqtt_async_processing,
            ml_mqtt_queue_size,
            ml_mqtt_num_workers,
            broker_queue_capacity,
            ai_explainer_url,
        })
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_to_default_on_missing_key() {
        let value: u32 = env_parse("TELEMETRY_CORE_DOES_NOT_EXIST", 42);
        assert_eq!(value, 42);
    }

    #[test]
    fn env_parse_falls_back_to_default_on_bad_value() {
        env::set_var("TELEMETRY_CORE_TEST_BAD_INT", "not-a-number");
        let value: u32 = env_parse("TELEMETRY_CORE_TEST_BAD_INT", 7);
        assert_eq!(value, 7);
        env::remove_var("TELEMETRY_CORE_TEST_BAD_INT");
    }

    #[test]
    fn normalize_database_url_rewrites_driver_schemes() {
        assert_eq!(
            normalize_database_url("postgresql+asyncpg://u:p@host/db".to_string()),
            "postgresql://u:p@host/db"
        );
        assert_eq!(
            normalize_database_url("postgresql://u:p@host/db".to_string()),
            "postgresql://u:p@host/db"
        );
    }
}
