use anyhow::{Context, Result};
use camview::config::{self, Config};
use camview::{
    Clock, ImageCodec, IntervalWaiter, Orchestrator, OrchestratorSettings, PromotionPipeline,
    PurgeManager, Scanner, StatsEngine, SystemClock, WebStorage,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    init_logging(&config.logging)?;

    info!(
        service = %config.service.name,
        incoming = %config.paths.incoming_root.display(),
        storage_root = %config.paths.storage_root,
        backend = %config.storage.backend,
        "Starting camview"
    );

    if config.service.metrics_enabled {
        init_metrics(config.service.metrics_port)?;
    }

    // Storage misconfiguration is fatal: nothing can be published without it
    let mut storage = WebStorage::new();
    storage
        .initialize(&config.storage.backend, &config.storage.s3)
        .await
        .context("Failed to initialize web storage")?;
    let storage = Arc::new(storage);

    let cameras = config.cameras().context("Invalid camera configuration")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stats = Arc::new(StatsEngine::new(
        &config.paths.stats_dir,
        &config.paths.incoming_root,
        clock.clone(),
    ));

    let pipeline = PromotionPipeline::new(
        storage.clone(),
        config.paths.storage_root.clone(),
        config.work_dir(),
        config.service.name.clone(),
        cameras,
        Arc::new(ImageCodec::new(&config.derivatives)),
        stats.clone(),
        clock.clone(),
    );
    let purge = PurgeManager::new(
        &config.paths.incoming_root,
        storage,
        config.paths.storage_root.clone(),
        config.retention.retain_days,
        clock.clone(),
    );
    let scanner = Scanner::new(
        &config.paths.incoming_root,
        config.aging_threshold(),
        clock.clone(),
    );

    let orchestrator = Orchestrator::new(
        scanner,
        pipeline,
        purge,
        stats,
        clock,
        Arc::new(IntervalWaiter::new(config.poll_interval())),
        OrchestratorSettings {
            retain_days: config.retention.retain_days,
            exit_when_idle: config.schedule.exit_when_idle,
            promotion_concurrency: config.schedule.promotion_concurrency,
        },
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    let summary = orchestrator.run(shutdown).await;

    info!(
        cycles = summary.cycles,
        promoted = summary.promoted + summary.today_promoted,
        failed = summary.failed,
        purged = summary.purged,
        "camview stopped"
    );

    Ok(())
}

/// Initialize tracing with the configured level and format
fn init_logging(config: &config::LoggingConfig) -> Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("camview={}", level).parse()?)
        .add_directive("aws_config=warn".parse()?)
        .add_directive("aws_smithy_runtime=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
