//! Data types shared by the pipeline stages.

mod checkpoint;
mod dead_letter;
mod event;
mod health;
mod task;

pub use cdcflow_config::shared::{SourceId, WorkflowId};
pub use checkpoint::*;
pub use dead_letter::*;
pub use event::*;
pub use health::*;
pub use task::*;
