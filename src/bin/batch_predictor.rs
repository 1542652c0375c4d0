//! Admin CLI for the batch predictor + threshold evaluator (the batch path named in
//! SPEC_FULL.md §2's data-flow sentence: for each active sensor, read since watermark,
//! forecast, persist, evaluate thresholds, advance watermark). Grounded on
//! `original_source/jobs/ml_batch_runner.py::main()` for the pass shape and
//! `core-server-rs/src/cli.rs`'s `#[derive(Parser)]` idiom for the flags.

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use telemetry_core::config::Config;
use telemetry_core::predictor::{predict_moving_average, predict_regression, RegressionConfig};
use telemetry_core::repository::SensorRepository;
use telemetry_core::threshold::{build_event, violates};
use tokio::time::{sleep, Duration};

#[derive(Parser, Debug, Clone)]
#[command(name = "batch-predictor", version, about = "Per-sensor batch forecast and threshold evaluation pass")]
struct Args {
    /// Number of trailing readings fed to the moving-average baseline.
    #[arg(long, default_value_t = 60)]
    window: usize,

    /// Forecast horizon in minutes ahead of the most recent reading.
    #[arg(long, default_value_t = 10.0)]
    horizon_minutes: f64,

    /// Dedup window for PRED_THRESHOLD_BREACH events, in minutes.
    #[arg(long, default_value_t = 10)]
    dedupe_minutes: i64,

    /// Seconds to sleep between passes. Ignored when `--once` is set.
    #[arg(long, default_value_t = 60)]
    sleep_seconds: u64,

    /// Run a single pass over all active sensors, then exit.
    #[arg(long, default_value_t = false)]
    once: bool,
}

fn init_tracing() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,telemetry_core=info".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

/// Run one batch pass over every active sensor. Never returns `Err` for a single
/// sensor's failure — those are logged and skipped so one bad sensor can't stall the
/// pass (spec §7's "never let one malformed input halt the pipeline" policy, carried
/// from the hot path into the batch path).
async fn run_pass(repository: &SensorRepository, args: &Args) -> Result<()> {
    let sensor_ids = repository.active_sensors().await?;
    tracing::info!(count = sensor_ids.len(), "starting batch pass");

    for sensor_id in sensor_ids {
        if let Err(err) = run_sensor_pass(repository, sensor_id, args).await {
            tracing::warn!(sensor_id, error = %err, "batch pass failed for sensor, skipping");
        }
    }
    Ok(())
}

async fn run_sensor_pass(repository: &SensorRepository, sensor_id: i64, args: &Args) -> Result<()> {
    let watermark = repository.get_or_create_watermark(sensor_id).await?;
    let readings = repository
        .readings_since_watermark(sensor_id, watermark.last_reading_id)
        .await?;

    if readings.is_empty() {
        tracing::debug!(sensor_id, "no new readings since watermark, skipping");
        return Ok(());
    }

    let new_last_reading_id = readings.last().map(|(id, _, _)| *id).unwrap_or(watermark.last_reading_id);
    let values: Vec<f64> = readings.iter().map(|(_, v, _)| *v).collect();
    let series: Vec<_> = readings.iter().map(|(_, v, ts)| (*ts, *v)).collect();

    let regression_cfg = RegressionConfig {
        horizon_minutes: args.horizon_minutes,
        ..RegressionConfig::default()
    };
    let forecast = predict_regression(&series, &regression_cfg, false)
        .or_else(|| predict_moving_average(&values, args.window));

    let Some(forecast) = forecast else {
        tracing::debug!(sensor_id, count = readings.len(), "insufficient history for a forecast, advancing watermark");
        repository.commit_batch_pass(sensor_id, new_last_reading_id, None, None).await?;
        return Ok(());
    };

    let target_timestamp = Utc::now() + chrono::Duration::minutes(args.horizon_minutes as i64);
    let model_id = repository.active_model_id(sensor_id).await?;

    let rule = repository.active_threshold(sensor_id).await?;
    let Some(rule) = rule else {
        repository
            .commit_batch_pass(
                sensor_id,
                new_last_reading_id,
                Some((model_id, forecast.predicted_value, forecast.confidence, target_timestamp)),
                None,
            )
            .await?;
        return Ok(());
    };

    if !violates(&rule, forecast.predicted_value) {
        repository
            .commit_batch_pass(
                sensor_id,
                new_last_reading_id,
                Some((model_id, forecast.predicted_value, forecast.confidence, target_timestamp)),
                None,
            )
            .await?;
        return Ok(());
    }

    use telemetry_core::types::{Prediction, PRED_THRESHOLD_BREACH};
    if repository
        .has_recent_event(sensor_id, PRED_THRESHOLD_BREACH, args.dedupe_minutes)
        .await?
    {
        tracing::debug!(sensor_id, "threshold breach deduped within window, skipping event");
        repository
            .commit_batch_pass(
                sensor_id,
                new_last_reading_id,
                Some((model_id, forecast.predicted_value, forecast.confidence, target_timestamp)),
                None,
            )
            .await?;
        return Ok(());
    }

    let Some(device_id) = repository.device_id_for_sensor(sensor_id).await? else {
        tracing::warn!(sensor_id, "sensor has no owning device, skipping event emission");
        repository
            .commit_batch_pass(
                sensor_id,
                new_last_reading_id,
                Some((model_id, forecast.predicted_value, forecast.confidence, target_timestamp)),
                None,
            )
            .await?;
        return Ok(());
    };

    let prediction = Prediction {
        id: 0,
        model_id,
        sensor_id,
        predicted_value: forecast.predicted_value,
        confidence: forecast.confidence,
        predicted_at: Utc::now(),
        target_timestamp,
        is_anomaly: None,
        anomaly_score: None,
        explanation: None,
    };
    let event = build_event(device_id, &rule, &prediction);

    repository
        .commit_batch_pass(
            sensor_id,
            new_last_reading_id,
            Some((model_id, forecast.predicted_value, forecast.confidence, target_timestamp)),
            Some(&event),
        )
        .await?;
    tracing::info!(sensor_id, rule_id = rule.id, predicted_value = forecast.predicted_value, "threshold breach event emitted");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = Config::from_env()?;
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    let repository = SensorRepository::new(pool);

    loop {
        run_pass(&repository, &args).await?;
        if args.once {
            break;
        }
        sleep(Duration::from_secs(args.sleep_seconds)).await;
    }

    Ok(())
}
