use serde::{Deserialize, Serialize};

/// A transformer the runner registers under a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformerConfig {
    /// Forwards the change event envelope unchanged.
    Passthrough,
    /// Runs `program` once per event, writing the envelope as JSON to stdin and reading
    /// the payload as JSON from stdout.
    Process {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}
