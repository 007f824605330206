use cdcflow_config::shared::{PgConnectionConfig, TlsConfig};
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tracing::warn;
use uuid::Uuid;

use crate::migrations::apply_migrations;

/// Connection parameters of the local test server, with a unique database name.
///
/// Configuration is read from environment variables:
/// - `TESTS_DATABASE_HOST`: Postgres server hostname, tests needing Postgres are skipped
///   when it is not set
/// - `TESTS_DATABASE_PORT`: Postgres server port (required with the host)
/// - `TESTS_DATABASE_USERNAME`: Database user (required with the host)
/// - `TESTS_DATABASE_PASSWORD`: Database password (optional)
fn local_pg_connection_config() -> Option<PgConnectionConfig> {
    let host = std::env::var("TESTS_DATABASE_HOST").ok()?;

    Some(PgConnectionConfig {
        host,
        port: std::env::var("TESTS_DATABASE_PORT")
            .expect("TESTS_DATABASE_PORT must be set")
            .parse()
            .expect("TESTS_DATABASE_PORT must be a valid port number"),
        name: Uuid::new_v4().to_string(),
        username: std::env::var("TESTS_DATABASE_USERNAME")
            .expect("TESTS_DATABASE_USERNAME must be set"),
        password: std::env::var("TESTS_DATABASE_PASSWORD")
            .ok()
            .map(Into::into),
        tls: TlsConfig {
            trusted_root_certs: String::new(),
            enabled: false,
        },
        max_connections: 5,
    })
}

fn maintenance_config(config: &PgConnectionConfig) -> PgConnectionConfig {
    PgConnectionConfig {
        name: "postgres".to_string(),
        ..config.clone()
    }
}

/// Database created for a single test, with the `cdcflow` migrations applied.
#[derive(Debug)]
pub struct TestDatabase {
    pub config: PgConnectionConfig,
    pub pool: PgPool,
}

impl TestDatabase {
    /// Creates a uniquely named database, or returns `None` when no test server is configured.
    ///
    /// # Panics
    ///
    /// Panics if the database cannot be created or migrated.
    pub async fn spawn() -> Option<Self> {
        let Some(config) = local_pg_connection_config() else {
            warn!("TESTS_DATABASE_HOST is not set, skipping test needing Postgres");
            return None;
        };

        let mut connection = PgConnection::connect_with(&maintenance_config(&config).connect_options())
            .await
            .expect("Failed to connect to Postgres");
        connection
            .execute(&*format!(r#"create database "{}";"#, config.name))
            .await
            .expect("Failed to create database");

        apply_migrations(&config)
            .await
            .expect("Failed to apply cdcflow migrations");

        let pool = PgPool::connect_with(config.connect_options())
            .await
            .expect("Failed to connect to the test database");

        Some(Self { config, pool })
    }

    /// Creates `table` with an `id bigint primary key` column and attaches the change capture
    /// trigger to it.
    pub async fn create_captured_table(&self, table: &str) {
        self.pool
            .execute(&*format!(
                "create table public.{table} (id bigint primary key, note text); \
                 create trigger {table}_capture after insert or update or delete \
                 on public.{table} for each row execute function cdcflow.capture_change();"
            ))
            .await
            .expect("Failed to create captured table");
    }

    /// Closes the pool and drops the database. Failures are only logged.
    pub async fn drop_database(self) {
        self.pool.close().await;

        let mut connection =
            match PgConnection::connect_with(&maintenance_config(&self.config).connect_options())
                .await
            {
                Ok(connection) => connection,
                Err(err) => {
                    warn!(error = %err, "failed to connect to Postgres for cleanup");
                    return;
                }
            };

        let name = &self.config.name;
        if let Err(err) = connection
            .execute(&*format!(
                "select pg_terminate_backend(pid) from pg_stat_activity \
                 where datname = '{name}' and pid <> pg_backend_pid();"
            ))
            .await
        {
            warn!(database = %name, error = %err, "failed to terminate connections");
        }

        if let Err(err) = connection
            .execute(&*format!(r#"drop database if exists "{name}";"#))
            .await
        {
            warn!(database = %name, error = %err, "failed to drop database");
        }
    }
}
