use cdcflow_config::shared::PgConnectionConfig;
use sqlx::{Executor, postgres::PgPoolOptions};
use tracing::info;

use crate::error::FlowResult;

/// Applies the `cdcflow` schema migrations.
///
/// The schema is created first and used as `search_path`, so the `_sqlx_migrations`
/// bookkeeping table lives next to the pipeline tables instead of in `public`.
pub async fn apply_migrations(connection_config: &PgConnectionConfig) -> FlowResult<()> {
    let options = connection_config.connect_options();

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("create schema if not exists cdcflow;").await?;
                conn.execute("set search_path = 'cdcflow';").await?;

                Ok(())
            })
        })
        .connect_with(options)
        .await?;

    info!("applying cdcflow migrations");

    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("cdcflow migrations successfully applied");

    Ok(())
}
