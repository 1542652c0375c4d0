use anyhow::Result;
use telemetry_core::broker::InMemoryReadingBroker;
use telemetry_core::bus;
use telemetry_core::config::Config;
use telemetry_core::pipeline::{process_reading, PipelineContext, PipelineStats};
use telemetry_core::processor::{AsyncProcessor, AsyncProcessorConfig};
use telemetry_core::repository::SensorRepository;
use telemetry_core::resolver::{self, IdentityResolver};
use telemetry_core::retry::RetryConfig;
use telemetry_core::spike::{self, DeltaSpikeDetector};
use telemetry_core::timing::TimingMonitor;
use telemetry_core::types::PipelineOutcome;
use telemetry_core::window::{self, SlidingWindowBuffer};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,telemetry_core=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(true);
    tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()?;
    Ok(())
}

/// Wait briefly for the bus task's processor handle to be dropped so the sole
/// remaining `Arc` can be unwrapped and consumed by `stop(drain)`.
async fn reclaim_processor(mut processor: Arc<AsyncProcessor>) -> Option<AsyncProcessor> {
    for _ in 0..20 {
        match Arc::try_unwrap(processor) {
            Ok(inner) => return Some(inner),
            Err(arc) => {
                processor = arc;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    tracing::warn!("processor still referenced at shutdown; skipping graceful drain");
    None
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    let repository = Arc::new(SensorRepository::new(pool.clone()));
    let resolver = Arc::new(IdentityResolver::new(
        pool.clone(),
        resolver::DEFAULT_CAPACITY,
        config.sensor_map_ttl_seconds,
    ));
    let window = Arc::new(SlidingWindowBuffer::new(
        window::DEFAULT_MAX_HORIZON_SECONDS,
        window::DEFAULT_WINDOW_SECONDS.to_vec(),
    ));
    let spike_detector = Arc::new(DeltaSpikeDetector::new(
        spike::DEFAULT_WINDOW_SIZE,
        spike::Z_THRESHOLD,
        spike::OSCILLATION_THRESHOLD,
    ));
    let timing = Arc::new(TimingMonitor::new(1000.0, 200.0));
    let broker = Arc::new(InMemoryReadingBroker::new(config.broker_queue_capacity));

    let pipeline_ctx = Arc::new(PipelineContext {
        repository: repository.clone(),
        resolver: resolver.clone(),
        window: window.clone(),
        spike_detector: spike_detector.clone(),
        timing: timing.clone(),
        broker: broker.clone(),
        retry: RetryConfig::default(),
        stats: Arc::new(PipelineStats::default()),
    });

    let processor_ctx = pipeline_ctx.clone();
    let processor = Arc::new(AsyncProcessor::start(AsyncProcessorConfig::from_env(), move |reading| {
        let ctx = processor_ctx.clone();
        async move {
            match process_reading(&ctx, reading).await {
                PipelineOutcome::Ok(_) | PipelineOutcome::Rejected { .. } => Ok(()),
                PipelineOutcome::TransientError(err) | PipelineOutcome::Fatal(err) => Err(err),
            }
        }
    }));

    let bus_handle = {
        let config = config.clone();
        let processor = processor.clone();
        tokio::spawn(async move {
            if let Err(err) = bus::run_listener(config, processor).await {
                tracing::error!(error = %err, "bus listener exited");
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        res = &bus_handle => {
            if let Err(err) = res {
                tracing::error!(error = %err, "bus task panicked");
            }
        }
    }

    bus_handle.abort();
    let _ = bus_handle.await;
    broker.stop();
    if let Some(processor) = reclaim_processor(processor).await {
        processor.stop(true).await;
    }

    Ok(())
}
