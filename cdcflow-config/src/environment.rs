use std::fmt;
use std::io;
use std::str::FromStr;

/// Selects the environment; production is assumed when unset.
const APP_ENVIRONMENT_ENV_NAME: &str = "APP_ENVIRONMENT";

/// Deployment environment of a cdcflow process.
///
/// Picks the configuration file layered over `base` and the log output: JSON files for
/// production and staging, console output for development.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Prod,
    Staging,
    Dev,
}

impl Environment {
    const ALL: [Environment; 3] = [Self::Prod, Self::Staging, Self::Dev];

    pub fn load() -> io::Result<Environment> {
        match std::env::var(APP_ENVIRONMENT_ENV_NAME) {
            Ok(name) => name.parse(),
            Err(_) => Ok(Self::Prod),
        }
    }

    /// Name used in `APP_ENVIRONMENT` and in configuration file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prod => "prod",
            Self::Staging => "staging",
            Self::Dev => "dev",
        }
    }

    /// Whether the process serves real traffic.
    pub fn is_prod(&self) -> bool {
        !matches!(self, Self::Dev)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = io::Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let name = name.trim().to_ascii_lowercase();

        Self::ALL
            .into_iter()
            .find(|environment| environment.as_str() == name)
            .ok_or_else(|| {
                let supported: Vec<_> = Self::ALL.iter().map(Environment::as_str).collect();
                io::Error::other(format!(
                    "unsupported environment `{name}`, expected one of {}",
                    supported.join(", ")
                ))
            })
    }
}
