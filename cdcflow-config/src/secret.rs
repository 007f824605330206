use std::fmt;
use std::ops::Deref;

use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize, Serializer};

/// A password or token read from configuration.
///
/// `Debug` never prints the value. Serializing exposes it, so configuration holding one
/// must only be written back to a trusted location.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct SerializableSecretString(Secret<String>);

impl Deref for SerializableSecretString {
    type Target = Secret<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for SerializableSecretString {
    fn from(value: String) -> Self {
        Self(Secret::new(value))
    }
}

impl Serialize for SerializableSecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.expose_secret().serialize(serializer)
    }
}

impl fmt::Debug for SerializableSecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SerializableSecretString([REDACTED])")
    }
}
