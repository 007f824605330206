//! Runs one pipeline per configured change source, delivering to the configured workflows.

use cdcflow_config::load_config;
use cdcflow_config::shared::RunnerConfig;
use cdcflow_telemetry::metrics::init_metrics;
use cdcflow_telemetry::tracing::init_tracing;
use tracing::{error, info};

use crate::core::start_runner;

mod core;

fn main() -> anyhow::Result<()> {
    let config = load_config::<RunnerConfig>()?;
    config.validate()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"), config.project_ref.clone())?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config))?;

    Ok(())
}

async fn async_main(config: RunnerConfig) -> anyhow::Result<()> {
    // The exporter spawns its listener on the current runtime.
    init_metrics(config.project_ref.as_deref())?;

    info!(
        pipelines = config.pipelines.len(),
        workflows = config.workflows.len(),
        "starting cdcflow runner"
    );

    if let Err(err) = start_runner(config).await {
        error!("{err}");
        return Err(err);
    }

    info!("cdcflow runner stopped");

    Ok(())
}
