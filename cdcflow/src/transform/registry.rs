use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use cdcflow_config::shared::{BUILTIN_PASSTHROUGH, TransformerConfig};

use crate::bail;
use crate::error::{ErrorKind, FlowResult};
use crate::transform::process::ProcessTransformer;
use crate::transform::{PassthroughTransformer, Transformer};

/// Name of the built-in [`PassthroughTransformer`].
pub const PASSTHROUGH_TRANSFORMER: &str = BUILTIN_PASSTHROUGH;

/// Transformers available to workflows, by `transformer_ref`.
#[derive(Debug, Clone, Default)]
pub struct TransformerRegistry {
    transformers: HashMap<String, Arc<dyn Transformer>>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry containing the built-in transformers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(PASSTHROUGH_TRANSFORMER, Arc::new(PassthroughTransformer));
        registry
    }

    /// Builds a registry from the runner configuration, on top of the built-ins.
    pub fn from_config(transformers: &BTreeMap<String, TransformerConfig>) -> Self {
        let mut registry = Self::with_builtins();
        for (name, config) in transformers {
            let transformer: Arc<dyn Transformer> = match config {
                TransformerConfig::Passthrough => Arc::new(PassthroughTransformer),
                TransformerConfig::Process { program, args } => {
                    Arc::new(ProcessTransformer::new(program.clone(), args.clone()))
                }
            };
            registry.register(name.clone(), transformer);
        }

        registry
    }

    /// Registers `transformer` under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, transformer: Arc<dyn Transformer>) {
        self.transformers.insert(name.into(), transformer);
    }

    pub fn get(&self, name: &str) -> FlowResult<Arc<dyn Transformer>> {
        match self.transformers.get(name) {
            Some(transformer) => Ok(transformer.clone()),
            None => bail!(
                ErrorKind::TransformerNotFound,
                "Transformer is not registered",
                format!("no transformer named `{name}`")
            ),
        }
    }
}
