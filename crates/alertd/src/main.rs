//! Alert Daemon - Main Entry Point

use alert_model::{system_clock, CancellationToken, Handler};
use alert_scheduler::{ManagerConfig, Processor, ProcessorManager};
use alertd::{build_pipeline, init_logging, CommandSource, Settings};
use alerting::LogNotifier;
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

/// Alert daemon CLI
#[derive(Parser)]
#[command(name = "alertd")]
#[command(about = "Scheduled checks with alert deduplication and grouping", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file path
    #[arg(short, long, env = "ALERTD_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    init_logging(&settings.logging);

    info!("=== alertd v{} ===", env!("CARGO_PKG_VERSION"));

    let clock = system_clock();
    let notifier: Arc<dyn Handler> = Arc::new(LogNotifier);

    let manager = Arc::new(ProcessorManager::new(
        ManagerConfig {
            workers: settings.scheduler.workers,
            retry_interval: settings.scheduler.retry_interval,
        },
        clock.clone(),
    ));

    if settings.checks.is_empty() {
        warn!("No checks configured, nothing will be evaluated");
    }
    let mut pipelines: Vec<Arc<dyn Handler>> = Vec::with_capacity(settings.checks.len());
    for check in settings.checks {
        info!("Scheduling check {} every {:?}", check.name, check.interval);
        let id = check.name.clone();
        let pipeline: Arc<dyn Handler> =
            build_pipeline(&settings.pipeline, &id, clock.clone())(notifier.clone());
        let source = Arc::new(CommandSource::new(check, clock.clone()));
        manager.add_processor(Processor::new(id, source, pipeline.clone()));
        pipelines.push(pipeline);
    }

    let cancel = CancellationToken::new();
    let runner = tokio::spawn({
        let manager = manager.clone();
        let cancel = cancel.clone();
        async move { manager.run(cancel).await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    manager.close();
    cancel.cancel();
    runner.await.context("Processor manager task failed")?;

    for pipeline in &pipelines {
        pipeline.shutdown().await;
    }
    info!("alertd stopped");
    Ok(())
}
