use cdcflow::configuration::memory::MemoryConfigurationStore;
use cdcflow::delivery::http::HttpEndpointClient;
use cdcflow::error::FlowError;
use cdcflow::migrations::apply_migrations;
use cdcflow::pipeline::Pipeline;
use cdcflow::source::postgres::PgChangeLogSource;
use cdcflow::store::StateStore;
use cdcflow::store::memory::MemoryStore;
use cdcflow::store::postgres::PostgresStore;
use cdcflow::transform::TransformerRegistry;
use cdcflow_config::shared::{RunnerConfig, StateStoreConfig};
use futures::future::join_all;
use tracing::{error, info, warn};

type RunnerPipeline<S> =
    Pipeline<PgChangeLogSource, S, MemoryConfigurationStore, HttpEndpointClient>;

pub async fn start_runner(config: RunnerConfig) -> anyhow::Result<()> {
    match &config.state_store {
        StateStoreConfig::Memory => {
            warn!("using the in-memory state store, checkpoints and outbox are lost on exit");

            run_pipelines(&config, MemoryStore::new()).await
        }
        StateStoreConfig::Postgres { connection } => {
            apply_migrations(connection).await?;

            run_pipelines(&config, PostgresStore::new(connection)).await
        }
    }
}

async fn run_pipelines<S: StateStore>(config: &RunnerConfig, store: S) -> anyhow::Result<()> {
    let registry = TransformerRegistry::from_config(&config.transformers);
    let config_store = MemoryConfigurationStore::new(config.workflows.clone())?;
    let client = HttpEndpointClient::new()?;

    let mut pipelines: Vec<RunnerPipeline<S>> = Vec::with_capacity(config.pipelines.len());
    for entry in &config.pipelines {
        let source_id = entry.pipeline.source_id.clone();
        let source = PgChangeLogSource::new(source_id, &entry.source);

        let mut pipeline = Pipeline::new(
            entry.pipeline.clone(),
            source,
            store.clone(),
            config_store.clone(),
            registry.clone(),
            client.clone(),
        );

        if let Err(err) = pipeline.start().await {
            // Pipelines already running must not be left behind.
            shutdown_all(&pipelines);
            for started in pipelines {
                let _ = started.wait().await;
            }

            return Err(err.into());
        }

        pipelines.push(pipeline);
    }

    let shutdown_txs: Vec<_> = pipelines.iter().map(Pipeline::shutdown_tx).collect();
    let shutdown_handle = tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl+c: {err:?}");
            return;
        }

        info!("ctrl+c received, shutting down pipelines");
        for shutdown_tx in shutdown_txs {
            shutdown_tx.shutdown();
        }
    });

    let results = join_all(pipelines.into_iter().map(Pipeline::wait)).await;

    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    let errors: Vec<FlowError> = results.into_iter().filter_map(Result::err).collect();
    if !errors.is_empty() {
        return Err(FlowError::from(errors).into());
    }

    Ok(())
}

fn shutdown_all<S: StateStore>(pipelines: &[RunnerPipeline<S>]) {
    for pipeline in pipelines {
        pipeline.shutdown();
    }
}
