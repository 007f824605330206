use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::SerializableSecretString;
use crate::shared::ValidationError;

const fn default_max_connections() -> u32 {
    5
}

/// Connection settings for a Postgres database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PgConnectionConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    /// Redacted in debug output.
    pub password: Option<SerializableSecretString>,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl PgConnectionConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.tls.validate()
    }

    /// sqlx options for the configured database, ignoring any `.pgpass` file.
    ///
    /// With TLS enabled the server certificate must chain to `tls.trusted_root_certs`,
    /// otherwise TLS is only used when the server offers it.
    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new_without_pgpass()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.username);

        let options = match &self.password {
            Some(password) => options.password(password.expose_secret()),
            None => options,
        };

        if self.tls.enabled {
            options
                .ssl_mode(PgSslMode::VerifyFull)
                .ssl_root_cert_from_pem(self.tls.trusted_root_certs.as_bytes().to_vec())
        } else {
            options.ssl_mode(PgSslMode::Prefer)
        }
    }
}

/// TLS settings for Postgres connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TlsConfig {
    /// PEM-encoded trusted root certificates.
    pub trusted_root_certs: String,
    pub enabled: bool,
}

impl TlsConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled && self.trusted_root_certs.is_empty() {
            return Err(ValidationError::MissingTrustedRootCerts);
        }

        Ok(())
    }
}
