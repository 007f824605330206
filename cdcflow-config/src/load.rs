use std::io;
use std::path::{Path, PathBuf};

use config::builder::{ConfigBuilder, DefaultState};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory containing configuration files relative to the working directory.
const CONFIGURATION_DIR: &str = "configuration";

/// Environment variable overriding [`CONFIGURATION_DIR`].
const CONFIGURATION_DIR_ENV_NAME: &str = "CDCFLOW_CONFIG_DIR";

const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Prefix for environment variable overrides, e.g. `APP_STATE_STORE__TYPE`.
const ENV_PREFIX: &str = "APP";

const ENV_PREFIX_SEPARATOR: &str = "_";

const ENV_SEPARATOR: &str = "__";

const LIST_SEPARATOR: &str = ",";

/// Implemented by top level configuration structures.
pub trait Config {
    /// Keys whose environment variable values are split on `,` into lists.
    const LIST_PARSE_KEYS: &'static [&'static str];
}

/// Errors raised while loading configuration files and overrides.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    #[error("no `{stem}` configuration file in `{directory}`, expected one of: {}", CONFIG_FILE_EXTENSIONS.join(", "))]
    ConfigurationFileMissing { stem: String, directory: PathBuf },

    #[error("configuration file `{path}` is invalid: {source}")]
    ConfigurationFileLoad {
        path: PathBuf,
        source: config::ConfigError,
    },

    #[error("failed to build configuration: {0}")]
    Builder(#[source] config::ConfigError),

    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[source] config::ConfigError),

    #[error("failed to determine runtime environment: {0}")]
    Environment(#[source] io::Error),
}

/// Loads configuration for the environment selected by `APP_ENVIRONMENT`.
///
/// The directory is `$CDCFLOW_CONFIG_DIR` when set, otherwise `./configuration`.
/// See [`load_config_from`] for the layering rules.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let directory = match std::env::var_os(CONFIGURATION_DIR_ENV_NAME) {
        Some(directory) => PathBuf::from(directory),
        None => std::env::current_dir()
            .map_err(LoadConfigError::CurrentDir)?
            .join(CONFIGURATION_DIR),
    };
    let environment = Environment::load().map_err(LoadConfigError::Environment)?;

    load_config_from(&directory, environment)
}

/// Loads `base.(yaml|yml|json)` from `directory`, layers `{environment}.(yaml|yml|json)` over it
/// when present and finally applies `APP_`-prefixed environment variables.
///
/// Nested keys use double underscores (`APP_OUTBOX_RELAY__BATCH_SIZE`). The base file is
/// mandatory while the environment file is optional.
pub fn load_config_from<T>(directory: &Path, environment: Environment) -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(
            directory.to_path_buf(),
        ));
    }

    let base_file = configuration_file(directory, "base").ok_or_else(|| {
        LoadConfigError::ConfigurationFileMissing {
            stem: "base".to_string(),
            directory: directory.to_path_buf(),
        }
    })?;
    let mut builder = with_file(config::Config::builder(), &base_file)?;

    // Only the base file is mandatory.
    if let Some(environment_file) = configuration_file(directory, environment.as_str()) {
        builder = with_file(builder, &environment_file)?;
    }

    let mut overrides = config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR);
    if !T::LIST_PARSE_KEYS.is_empty() {
        overrides = T::LIST_PARSE_KEYS.iter().fold(
            overrides.try_parsing(true).list_separator(LIST_SEPARATOR),
            |overrides, key| overrides.with_list_parse_key(key),
        );
    }

    builder
        .add_source(overrides)
        .build()
        .map_err(LoadConfigError::Builder)?
        .try_deserialize::<T>()
        .map_err(LoadConfigError::Deserialization)
}

/// First existing `{stem}.{extension}` in `directory`.
fn configuration_file(directory: &Path, stem: &str) -> Option<PathBuf> {
    CONFIG_FILE_EXTENSIONS
        .iter()
        .map(|extension| directory.join(format!("{stem}.{extension}")))
        .find(|path| path.is_file())
}

/// Adds `path` to `builder`, failing early so errors name the offending file.
fn with_file(
    builder: ConfigBuilder<DefaultState>,
    path: &Path,
) -> Result<ConfigBuilder<DefaultState>, LoadConfigError> {
    let builder = builder.add_source(config::File::from(path));
    if let Err(source) = builder.build_cloned() {
        return Err(LoadConfigError::ConfigurationFileLoad {
            path: path.to_path_buf(),
            source,
        });
    }

    Ok(builder)
}
